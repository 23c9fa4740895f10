//! Gateway error types.
//!
//! The provider signals its cache-block ceiling through error text; that
//! text is matched exactly once, here, and converted into the typed
//! [`GatewayError::CacheOverflow`] variant. Everything downstream matches
//! on the variant.

use thiserror::Error;

/// Error text the provider returns when too many blocks carry cache markers.
const CACHE_OVERFLOW_MARKER: &str = "maximum of 4 blocks with cache_control";

/// Errors from the completion API.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The completion call exceeded its deadline.
    #[error("completion call timed out after {duration_secs}s")]
    Timeout { duration_secs: u64 },

    /// Non-2xx HTTP response.
    #[error("completion API returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// The request carried more cache-marked blocks than the provider
    /// accepts per request.
    #[error("cache-marked block ceiling exceeded")]
    CacheOverflow,

    /// Network-level failure before a response arrived.
    #[error("transport failure: {reason}")]
    Transport { reason: String },

    /// Response arrived but did not parse into the expected shape.
    #[error("malformed response: {reason}")]
    MalformedResponse { reason: String },

    /// No API key available at construction time.
    #[error("API key missing: set {var}")]
    MissingApiKey { var: String },
}

impl GatewayError {
    /// Classify a non-2xx response, promoting the provider's cache-ceiling
    /// condition to its typed variant.
    pub fn classify_http(status: u16, body: String) -> Self {
        if body.contains(CACHE_OVERFLOW_MARKER) {
            GatewayError::CacheOverflow
        } else {
            GatewayError::Http { status, body }
        }
    }

    pub fn is_cache_overflow(&self) -> bool {
        matches!(self, GatewayError::CacheOverflow)
    }
}
