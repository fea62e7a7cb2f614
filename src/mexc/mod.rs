//! Exchange REST access: rate-limited client, retry policy, error taxonomy.

pub mod client;
pub mod errors;
pub mod ratelimit;

pub use client::{
    BookTickerRow, DepthPayload, ExchangeInfo, ExchangeSymbol, HttpMetricsSnapshot, HttpTransport,
    MarketApi, MexcClient, MexcMetrics, RawResponse, TickerRow, TransportError,
};
pub use errors::MexcHttpError;
pub use ratelimit::TokenBucket;
