//! Shared scripted exchange double for pipeline integration tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::json;

use spreadscan::mexc::{
    BookTickerRow, DepthPayload, ExchangeInfo, ExchangeSymbol, MarketApi, MexcHttpError, TickerRow,
};

pub struct MockApi {
    pub catalog: Vec<ExchangeSymbol>,
    pub defaults: Vec<String>,
    pub tickers: Vec<TickerRow>,
    pub books: Vec<BookTickerRow>,
    pub depth: HashMap<String, DepthPayload>,
    pub calls: AtomicU64,
}

impl MockApi {
    /// Two liquid symbols that pass every spread and depth criterion.
    pub fn healthy(symbols: &[&str]) -> Self {
        let catalog = symbols
            .iter()
            .map(|symbol| ExchangeSymbol {
                symbol: Some(symbol.to_string()),
                quote_asset: Some("USDT".to_string()),
                status: Some(json!("1")),
            })
            .collect();
        let tickers = symbols
            .iter()
            .map(|symbol| TickerRow {
                symbol: Some(symbol.to_string()),
                quote_volume: Some(json!("500000")),
                volume: Some(json!("5000")),
                count: Some(json!(1000)),
                last_price: None,
            })
            .collect();
        let books = symbols
            .iter()
            .map(|symbol| BookTickerRow {
                symbol: Some(symbol.to_string()),
                bid_price: Some(json!("100.0")),
                bid_qty: Some(json!("50.0")),
                ask_price: Some(json!("100.1")),
                ask_qty: Some(json!("50.0")),
            })
            .collect();
        let depth = symbols
            .iter()
            .map(|symbol| {
                (
                    symbol.to_string(),
                    DepthPayload {
                        bids: vec![
                            vec![json!("100.0"), json!("50.0")],
                            vec![json!("99.9"), json!("50.0")],
                        ],
                        asks: vec![
                            vec![json!("100.1"), json!("50.0")],
                            vec![json!("100.2"), json!("50.0")],
                        ],
                    },
                )
            })
            .collect();

        Self {
            catalog,
            defaults: symbols.iter().map(|s| s.to_string()).collect(),
            tickers,
            books,
            depth,
            calls: AtomicU64::new(0),
        }
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn bump(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl MarketApi for MockApi {
    async fn get_exchange_info(&self) -> Result<ExchangeInfo, MexcHttpError> {
        self.bump();
        Ok(ExchangeInfo {
            symbols: self.catalog.clone(),
        })
    }

    async fn get_default_symbols(&self) -> Result<Vec<String>, MexcHttpError> {
        self.bump();
        Ok(self.defaults.clone())
    }

    async fn get_ticker_24hr(&self) -> Result<Vec<TickerRow>, MexcHttpError> {
        self.bump();
        Ok(self.tickers.clone())
    }

    async fn get_book_ticker(&self) -> Result<Vec<BookTickerRow>, MexcHttpError> {
        self.bump();
        Ok(self.books.clone())
    }

    async fn get_book_ticker_symbol(&self, symbol: &str) -> Result<BookTickerRow, MexcHttpError> {
        self.bump();
        self.books
            .iter()
            .find(|row| row.symbol.as_deref() == Some(symbol))
            .cloned()
            .ok_or_else(|| MexcHttpError::fatal("Unknown symbol", Some(400), None))
    }

    async fn get_depth(&self, symbol: &str, _limit: u32) -> Result<DepthPayload, MexcHttpError> {
        self.bump();
        self.depth
            .get(symbol)
            .cloned()
            .ok_or_else(|| MexcHttpError::fatal("Unknown symbol", Some(400), None))
    }
}
