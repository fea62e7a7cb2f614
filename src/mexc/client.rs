//! Rate-limited exchange REST client.
//!
//! Every attempt (including retries) takes a token from the shared bucket
//! first. Outcomes are classified per attempt:
//!
//! | outcome               | retried?        | reason label       |
//! |-----------------------|-----------------|--------------------|
//! | 2xx, decodable JSON   | no              | -                  |
//! | 2xx, decode failure   | yes (budget 2)  | `invalid_json`     |
//! | 429                   | yes             | `rate_limited`     |
//! | 403                   | yes             | `waf_limited`      |
//! | 5xx                   | yes             | `server_error`     |
//! | other 4xx             | no (fatal)      | -                  |
//! | connection error      | yes             | `connection_error` |
//! | timeout               | yes             | `timeout`          |
//!
//! The transport is a narrow seam so tests can script status sequences
//! without a socket.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::MexcConfig;
use crate::mexc::errors::MexcHttpError;
use crate::mexc::ratelimit::TokenBucket;

// =============================================================================
// TRANSPORT SEAM
// =============================================================================

#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

#[derive(Debug, Clone)]
pub enum TransportError {
    Timeout(String),
    Connection(String),
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(&self, url: &str, params: &[(String, String)]) -> Result<RawResponse, TransportError>;
}

struct ReqwestTransport {
    client: reqwest::Client,
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, url: &str, params: &[(String, String)]) -> Result<RawResponse, TransportError> {
        let response = self
            .client
            .get(url)
            .query(params)
            .send()
            .await
            .map_err(classify_reqwest_error)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(classify_reqwest_error)?;
        Ok(RawResponse { status, body })
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(err.to_string())
    } else {
        TransportError::Connection(err.to_string())
    }
}

// =============================================================================
// METRICS
// =============================================================================

/// Request/retry/latency counters owned by the client; the orchestrator
/// rolls a snapshot into `metrics.json` after each stage.
#[derive(Default)]
pub struct MexcMetrics {
    requests: Mutex<HashMap<(String, String), u64>>,
    retries: Mutex<HashMap<(String, String), u64>>,
    latencies: Mutex<HashMap<String, Vec<f64>>>,
}

#[derive(Debug, Clone, Default)]
pub struct HttpMetricsSnapshot {
    pub requests_total: HashMap<(String, String), u64>,
    pub retries_total: HashMap<(String, String), u64>,
    pub latency_ms: HashMap<String, Vec<f64>>,
}

impl MexcMetrics {
    pub fn record_request(&self, endpoint: &str, status: &str, latency_ms: f64) {
        *self
            .requests
            .lock()
            .entry((endpoint.to_string(), status.to_string()))
            .or_insert(0) += 1;
        self.latencies
            .lock()
            .entry(endpoint.to_string())
            .or_default()
            .push(latency_ms);
    }

    pub fn record_retry(&self, endpoint: &str, reason: &str) {
        *self
            .retries
            .lock()
            .entry((endpoint.to_string(), reason.to_string()))
            .or_insert(0) += 1;
    }

    pub fn request_count(&self, endpoint: &str, status: &str) -> u64 {
        self.requests
            .lock()
            .get(&(endpoint.to_string(), status.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn retry_count(&self, endpoint: &str, reason: &str) -> u64 {
        self.retries
            .lock()
            .get(&(endpoint.to_string(), reason.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn requests_total(&self) -> u64 {
        self.requests.lock().values().sum()
    }

    pub fn snapshot(&self) -> HttpMetricsSnapshot {
        HttpMetricsSnapshot {
            requests_total: self.requests.lock().clone(),
            retries_total: self.retries.lock().clone(),
            latency_ms: self.latencies.lock().clone(),
        }
    }
}

// =============================================================================
// TYPED PAYLOADS
// =============================================================================

/// Catalog row from `exchangeInfo`. Status arrives as `"1"` or `"TRADING"`
/// depending on the API revision; kept raw.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExchangeSymbol {
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(rename = "quoteAsset", default)]
    pub quote_asset: Option<String>,
    #[serde(default)]
    pub status: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExchangeInfo {
    #[serde(default)]
    pub symbols: Vec<ExchangeSymbol>,
}

/// 24h ticker row. Numeric fields stay raw until the stage boundary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TickerRow {
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(rename = "quoteVolume", default)]
    pub quote_volume: Option<Value>,
    #[serde(default)]
    pub volume: Option<Value>,
    #[serde(default)]
    pub count: Option<Value>,
    #[serde(rename = "lastPrice", default)]
    pub last_price: Option<Value>,
}

/// Best bid/ask row from `ticker/bookTicker`. Values stay raw so the spread
/// sampler can append exactly what arrived on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BookTickerRow {
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(rename = "bidPrice", alias = "bid", default)]
    pub bid_price: Option<Value>,
    #[serde(rename = "bidQty", default)]
    pub bid_qty: Option<Value>,
    #[serde(rename = "askPrice", alias = "ask", default)]
    pub ask_price: Option<Value>,
    #[serde(rename = "askQty", default)]
    pub ask_qty: Option<Value>,
}

/// Order-book snapshot; levels are `[price, qty, ...]` arrays of raw values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DepthPayload {
    #[serde(default)]
    pub bids: Vec<Vec<Value>>,
    #[serde(default)]
    pub asks: Vec<Vec<Value>>,
}

// =============================================================================
// API SURFACE
// =============================================================================

/// Typed GET operations the pipeline stages consume. Implemented by the
/// real client and by scripted test doubles.
#[async_trait]
pub trait MarketApi: Send + Sync {
    async fn get_exchange_info(&self) -> Result<ExchangeInfo, MexcHttpError>;
    async fn get_default_symbols(&self) -> Result<Vec<String>, MexcHttpError>;
    async fn get_ticker_24hr(&self) -> Result<Vec<TickerRow>, MexcHttpError>;
    async fn get_book_ticker(&self) -> Result<Vec<BookTickerRow>, MexcHttpError>;
    async fn get_book_ticker_symbol(&self, symbol: &str) -> Result<BookTickerRow, MexcHttpError>;
    async fn get_depth(&self, symbol: &str, limit: u32) -> Result<DepthPayload, MexcHttpError>;
}

// =============================================================================
// CLIENT
// =============================================================================

pub struct MexcClient {
    config: MexcConfig,
    transport: Box<dyn HttpTransport>,
    bucket: TokenBucket,
    metrics: Arc<MexcMetrics>,
}

impl MexcClient {
    pub fn new(config: MexcConfig) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs_f64(config.timeout_s);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .build()?;
        Ok(Self::with_transport(config, Box::new(ReqwestTransport { client })))
    }

    /// Build a client over an injected transport (tests, replay).
    pub fn with_transport(config: MexcConfig, transport: Box<dyn HttpTransport>) -> Self {
        let bucket = TokenBucket::new(config.max_rps);
        Self {
            config,
            transport,
            bucket,
            metrics: Arc::new(MexcMetrics::default()),
        }
    }

    pub fn metrics(&self) -> Arc<MexcMetrics> {
        Arc::clone(&self.metrics)
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), endpoint)
    }

    async fn request(
        &self,
        endpoint: &'static str,
        params: &[(String, String)],
    ) -> Result<Value, MexcHttpError> {
        let max_retries = self.config.max_retries;
        let json_retry_budget = max_retries.min(2);
        let mut json_retry_count = 0u32;
        let url = self.url(endpoint);

        for attempt in 1..=max_retries + 1 {
            self.bucket.acquire().await;
            let start = Instant::now();

            let response = match self.transport.get(&url, params).await {
                Ok(response) => response,
                Err(TransportError::Timeout(message)) => {
                    let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
                    self.metrics.record_request(endpoint, "timeout", latency_ms);
                    warn!(endpoint, attempt, "request timed out");
                    if attempt <= max_retries {
                        self.metrics.record_retry(endpoint, "timeout");
                        self.backoff_sleep(attempt).await;
                        continue;
                    }
                    return Err(MexcHttpError::transient(
                        format!("Request timed out: {message}"),
                        None,
                        None,
                    ));
                }
                Err(TransportError::Connection(message)) => {
                    let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
                    self.metrics.record_request(endpoint, "connection_error", latency_ms);
                    warn!(endpoint, attempt, error = %message, "connection failed");
                    if attempt <= max_retries {
                        self.metrics.record_retry(endpoint, "connection_error");
                        self.backoff_sleep(attempt).await;
                        continue;
                    }
                    return Err(MexcHttpError::transient(
                        format!("Request failed: {message}"),
                        None,
                        None,
                    ));
                }
            };

            let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
            let status = response.status;
            self.metrics
                .record_request(endpoint, &status.to_string(), latency_ms);
            debug!(endpoint, status, attempt, latency_ms, "http request");

            match status {
                429 => {
                    warn!(endpoint, attempt, "rate limit response; backing off");
                    if attempt <= max_retries {
                        self.metrics.record_retry(endpoint, "rate_limited");
                        self.backoff_sleep(attempt).await;
                        continue;
                    }
                    return Err(MexcHttpError::rate_limited(
                        "Rate limit exceeded",
                        Some(429),
                        Some(response.body),
                    ));
                }
                403 => {
                    warn!(endpoint, attempt, "WAF limit response; reduce request rate");
                    if attempt <= max_retries {
                        self.metrics.record_retry(endpoint, "waf_limited");
                        self.backoff_sleep(attempt).await;
                        continue;
                    }
                    return Err(MexcHttpError::waf_limited(
                        "WAF limit exceeded",
                        Some(403),
                        Some(response.body),
                    ));
                }
                s if s >= 500 => {
                    warn!(endpoint, status = s, attempt, "server error; backing off");
                    if attempt <= max_retries {
                        self.metrics.record_retry(endpoint, "server_error");
                        self.backoff_sleep(attempt).await;
                        continue;
                    }
                    return Err(MexcHttpError::transient(
                        "Server error",
                        Some(s),
                        Some(response.body),
                    ));
                }
                s if s >= 400 => {
                    return Err(MexcHttpError::fatal("HTTP error", Some(s), Some(response.body)));
                }
                _ => match serde_json::from_str::<Value>(&response.body) {
                    Ok(payload) => return Ok(payload),
                    Err(err) => {
                        json_retry_count += 1;
                        if attempt <= max_retries && json_retry_count <= json_retry_budget {
                            self.metrics.record_retry(endpoint, "invalid_json");
                            self.backoff_sleep(attempt).await;
                            continue;
                        }
                        return Err(MexcHttpError::transient(
                            format!("Invalid JSON response: {err}"),
                            Some(status),
                            Some(response.body),
                        ));
                    }
                },
            }
        }

        Err(MexcHttpError::transient("Request failed after retries", None, None))
    }

    async fn backoff_sleep(&self, attempt: u32) {
        let base = self.config.backoff_base_s;
        let capped = (base * 2f64.powi(attempt as i32 - 1)).min(self.config.backoff_max_s);
        let jitter = if base > 0.0 {
            rand::thread_rng().gen_range(0.0..base)
        } else {
            0.0
        };
        let sleep_s = (capped + jitter).min(self.config.backoff_max_s);
        if sleep_s > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(sleep_s)).await;
        }
    }

    fn coerce_symbol_list(payload: &Value) -> Option<Vec<String>> {
        match payload {
            Value::Array(items) => {
                if items.iter().all(|item| item.is_string()) {
                    return Some(
                        items
                            .iter()
                            .filter_map(|item| item.as_str().map(str::to_string))
                            .collect(),
                    );
                }
                if items.iter().all(|item| item.is_object()) {
                    let symbols: Vec<String> = items
                        .iter()
                        .filter_map(|item| item.get("symbol").and_then(Value::as_str))
                        .map(str::to_string)
                        .collect();
                    return if symbols.is_empty() { None } else { Some(symbols) };
                }
                None
            }
            Value::Object(map) => {
                for key in ["data", "symbols", "defaultSymbols"] {
                    if let Some(value) = map.get(key) {
                        if value.is_array() {
                            return Self::coerce_symbol_list(value);
                        }
                    }
                }
                None
            }
            _ => None,
        }
    }
}

#[async_trait]
impl MarketApi for MexcClient {
    async fn get_exchange_info(&self) -> Result<ExchangeInfo, MexcHttpError> {
        let payload = self.request("/api/v3/exchangeInfo", &[]).await?;
        if !payload.is_object() {
            return Err(MexcHttpError::fatal(
                "exchangeInfo response must be an object",
                None,
                None,
            ));
        }
        serde_json::from_value(payload)
            .map_err(|err| MexcHttpError::fatal(format!("exchangeInfo malformed: {err}"), None, None))
    }

    async fn get_default_symbols(&self) -> Result<Vec<String>, MexcHttpError> {
        let payload = self.request("/api/v3/defaultSymbols", &[]).await?;
        Self::coerce_symbol_list(&payload).ok_or_else(|| {
            MexcHttpError::fatal("defaultSymbols response must be a list of strings", None, None)
        })
    }

    async fn get_ticker_24hr(&self) -> Result<Vec<TickerRow>, MexcHttpError> {
        let payload = self.request("/api/v3/ticker/24hr", &[]).await?;
        if !payload.is_array() {
            return Err(MexcHttpError::fatal(
                "ticker/24hr response must be a list of objects",
                None,
                None,
            ));
        }
        serde_json::from_value(payload)
            .map_err(|err| MexcHttpError::fatal(format!("ticker/24hr malformed: {err}"), None, None))
    }

    async fn get_book_ticker(&self) -> Result<Vec<BookTickerRow>, MexcHttpError> {
        let payload = self.request("/api/v3/ticker/bookTicker", &[]).await?;
        if !payload.is_array() {
            return Err(MexcHttpError::fatal(
                "bookTicker response must be a list of objects",
                None,
                None,
            ));
        }
        serde_json::from_value(payload)
            .map_err(|err| MexcHttpError::fatal(format!("bookTicker malformed: {err}"), None, None))
    }

    async fn get_book_ticker_symbol(&self, symbol: &str) -> Result<BookTickerRow, MexcHttpError> {
        let params = [("symbol".to_string(), symbol.to_string())];
        let payload = self.request("/api/v3/ticker/bookTicker", &params).await?;
        if !payload.is_object() {
            return Err(MexcHttpError::fatal(
                "bookTicker symbol response must be an object",
                None,
                None,
            ));
        }
        serde_json::from_value(payload)
            .map_err(|err| MexcHttpError::fatal(format!("bookTicker malformed: {err}"), None, None))
    }

    async fn get_depth(&self, symbol: &str, limit: u32) -> Result<DepthPayload, MexcHttpError> {
        let params = [
            ("symbol".to_string(), symbol.to_string()),
            ("limit".to_string(), limit.to_string()),
        ];
        let payload = self.request("/api/v3/depth", &params).await?;
        if !payload.is_object() {
            return Err(MexcHttpError::fatal("depth response must be an object", None, None));
        }
        serde_json::from_value(payload)
            .map_err(|err| MexcHttpError::fatal(format!("depth malformed: {err}"), None, None))
    }
}

// =============================================================================
// TESTS
// =============================================================================
