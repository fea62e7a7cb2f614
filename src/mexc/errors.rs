//! HTTP error taxonomy for the exchange client.
//!
//! Four variants drive the retry policy: `RateLimited` (429), `WafLimited`
//! (403), `Transient` (timeouts, connection failures, 5xx, undecodable
//! success bodies) and `Fatal` (remaining 4xx and malformed payloads).

use std::fmt;

/// Payload shared by every error variant.
#[derive(Debug, Clone, Default)]
pub struct ErrorDetails {
    pub message: String,
    pub status_code: Option<u16>,
    pub response_text: Option<String>,
}

#[derive(Debug, Clone)]
pub enum MexcHttpError {
    RateLimited(ErrorDetails),
    WafLimited(ErrorDetails),
    Transient(ErrorDetails),
    Fatal(ErrorDetails),
}

impl MexcHttpError {
    pub fn rate_limited(message: impl Into<String>, status: Option<u16>, text: Option<String>) -> Self {
        Self::RateLimited(ErrorDetails {
            message: message.into(),
            status_code: status,
            response_text: text,
        })
    }

    pub fn waf_limited(message: impl Into<String>, status: Option<u16>, text: Option<String>) -> Self {
        Self::WafLimited(ErrorDetails {
            message: message.into(),
            status_code: status,
            response_text: text,
        })
    }

    pub fn transient(message: impl Into<String>, status: Option<u16>, text: Option<String>) -> Self {
        Self::Transient(ErrorDetails {
            message: message.into(),
            status_code: status,
            response_text: text,
        })
    }

    pub fn fatal(message: impl Into<String>, status: Option<u16>, text: Option<String>) -> Self {
        Self::Fatal(ErrorDetails {
            message: message.into(),
            status_code: status,
            response_text: text,
        })
    }

    pub fn details(&self) -> &ErrorDetails {
        match self {
            Self::RateLimited(d) | Self::WafLimited(d) | Self::Transient(d) | Self::Fatal(d) => d,
        }
    }

    /// Stable name used in state records and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RateLimited(_) => "RateLimitedError",
            Self::WafLimited(_) => "WafLimitedError",
            Self::Transient(_) => "TransientHttpError",
            Self::Fatal(_) => "FatalHttpError",
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

impl fmt::Display for MexcHttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = self.details();
        write!(f, "{}", d.message)?;
        if let Some(status) = d.status_code {
            write!(f, " | status={}", status)?;
        }
        if let Some(text) = &d.response_text {
            if !text.is_empty() {
                write!(f, " | response={}", text)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for MexcHttpError {}
