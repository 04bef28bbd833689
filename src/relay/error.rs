use std::time::Duration;
use thiserror::Error;

/// Failures talking to the tunnel relay.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("{action} request failed: {source}")]
    Http {
        action: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{action} rejected by relay: {message}")]
    Rejected {
        action: &'static str,
        message: String,
    },

    /// The relay accepted the tunnel, so it may be live, but its id is unknown.
    #[error("relay accepted a tunnel on port {port} but its id is unknown: {detail}")]
    LookupFailed { port: u16, detail: String },

    #[error("{action} timed out after {}ms", .after.as_millis())]
    Timeout {
        action: &'static str,
        after: Duration,
    },

    #[error("unreadable {action} response: {detail}")]
    Decode {
        action: &'static str,
        detail: String,
    },

    #[error("relay unavailable: {0}")]
    Unavailable(String),
}

impl RelayError {
    pub fn is_timeout(&self) -> bool {
        match self {
            RelayError::Timeout { .. } => true,
            RelayError::Http { source, .. } => source.is_timeout(),
            _ => false,
        }
    }

    /// Whether the relay certainly did not create the tunnel. Any other
    /// registration failure may have left a live tunnel behind.
    pub fn is_rejection(&self) -> bool {
        match self {
            RelayError::Rejected { .. } | RelayError::Unavailable(_) => true,
            RelayError::Http { source, .. } => source.is_connect(),
            _ => false,
        }
    }
}
