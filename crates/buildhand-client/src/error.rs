//! Error types for the control-plane client.

use thiserror::Error;

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors that can occur when talking to the control plane.
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP transport failed
    #[error("http request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The API returned an error status code
    #[error("api error (status {status}): {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Error message from the API
        message: String,
    },

    /// The response body could not be decoded
    #[error("failed to decode response: {0}")]
    Decode(String),

    /// The resource does not exist
    #[error("not found: {0}")]
    NotFound(String),
}

impl ClientError {
    /// Creates an API error from status code and message.
    #[must_use]
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// True when retrying the call may succeed: transport failures,
    /// server errors and throttling.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Request(e) => !e.is_builder() && !e.is_decode(),
            Self::Api { status, .. } => *status >= 500 || *status == 429,
            Self::Decode(_) | Self::NotFound(_) => false,
        }
    }

    /// True when the resource does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_)) || matches!(self, Self::Api { status: 404, .. })
    }
}
