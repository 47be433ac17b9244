use std::time::Duration;
use thiserror::Error;

/// Errors generated by a [`MarketConnector`](crate::connector::MarketConnector) while talking to
/// the upstream venue.
///
/// Clonable so that a single failed fetch can be handed to every coalesced waiter.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Error)]
pub enum ConnectorError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("venue responded with status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("failed to deserialise venue response: {0}")]
    Deserialise(String),

    #[error("missing API credentials required for: {0}")]
    Credentials(&'static str),

    #[error("unsupported by connector: {0}")]
    Unsupported(&'static str),
}

impl From<reqwest::Error> for ConnectorError {
    fn from(error: reqwest::Error) -> Self {
        match error.status() {
            Some(status) => Self::Status {
                status: status.as_u16(),
                message: error.to_string(),
            },
            None if error.is_decode() => Self::Deserialise(error.to_string()),
            None => Self::Http(error.to_string()),
        }
    }
}

impl From<serde_json::Error> for ConnectorError {
    fn from(error: serde_json::Error) -> Self {
        Self::Deserialise(error.to_string())
    }
}

/// All errors generated by the [`DataCache`](crate::cache::DataCache).
#[derive(Debug, Clone, Eq, PartialEq, Hash, Error)]
pub enum CacheError {
    #[error("no MarketConnector attached, required for: {0}")]
    ConnectorMissing(&'static str),

    #[error("upstream fetch failed for {key}: {source}")]
    Upstream { key: String, source: ConnectorError },

    #[error("upstream returned an invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("upstream fetch for {key} timed out after {timeout:?}")]
    Timeout { key: String, timeout: Duration },

    #[error("fetch task for {key} aborted: {reason}")]
    Aborted { key: String, reason: String },
}

impl CacheError {
    /// Determine if a later access may succeed where this one failed.
    ///
    /// A missing connector is a wiring problem and will fail identically until one is attached.
    #[allow(clippy::match_like_matches_macro)]
    pub fn is_retryable(&self) -> bool {
        match self {
            CacheError::ConnectorMissing(_) => false,
            CacheError::Upstream { source, .. } => !matches!(
                source,
                ConnectorError::Credentials(_) | ConnectorError::Unsupported(_)
            ),
            _ => true,
        }
    }
}
