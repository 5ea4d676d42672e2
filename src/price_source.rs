// Common capability implemented by every upstream price client.

use async_trait::async_trait;
use std::fmt;

use crate::store::TokenConfig;

/// Why an upstream quote attempt produced no price. Clients always return
/// one of these instead of propagating transport errors upward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuoteError {
    /// Network, DNS or TLS failure.
    Transport,
    /// Non-2xx HTTP status.
    Status(u16),
    /// Malformed body or missing fields.
    Schema,
    /// Price outside the plausibility or cross-check band.
    Anomaly,
    /// Active proxy pool is empty and direct egress failed.
    NoProxy,
    /// Persistent store failure.
    Store,
    /// Per-request or per-task deadline expired.
    Deadline,
}

impl fmt::Display for QuoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuoteError::Transport => write!(f, "transport error"),
            QuoteError::Status(code) => write!(f, "HTTP {}", code),
            QuoteError::Schema => write!(f, "malformed response"),
            QuoteError::Anomaly => write!(f, "implausible price"),
            QuoteError::NoProxy => write!(f, "no proxy available"),
            QuoteError::Store => write!(f, "store error"),
            QuoteError::Deadline => write!(f, "deadline expired"),
        }
    }
}

pub type QuoteResult = Result<f64, QuoteError>;

/// A DEX price adapter: one USD(T) price per token per call.
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// DEX identifier as used on the wire and in spread_history.
    fn name(&self) -> &'static str;

    /// Fetch the current token price in USDT. Returns a `QuoteError`
    /// instead of panicking or bubbling transport failures.
    async fn fetch_price(&self, token: &TokenConfig) -> QuoteResult;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(QuoteError::Status(502).to_string(), "HTTP 502");
        assert_eq!(QuoteError::NoProxy.to_string(), "no proxy available");
    }
}
