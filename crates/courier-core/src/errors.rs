use std::time::Duration;

/// Failure of a single send attempt through the external transport.
///
/// Every variant counts toward a queue entry's `attempts`.
#[derive(Clone, Debug, thiserror::Error)]
pub enum SendError {
    #[error("send timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("provider rejected message ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

impl SendError {
    /// Whether a later attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Network(_) | Self::Unavailable(_) => true,
            Self::Rejected { status, .. } => *status == 429 || *status >= 500,
        }
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Network(_) => "network_error",
            Self::Rejected { .. } => "rejected",
            Self::Unavailable(_) => "unavailable",
        }
    }

    pub fn from_status(status: u16, body: String) -> Self {
        Self::Rejected { status, body }
    }
}
