//! Error types for the blog API.

use thiserror::Error;

/// Errors returned by a posts API call.
///
/// The `Display` text is shown to the user as-is, so it carries the remote
/// service's own message whenever one is available.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// The API key was rejected.
    #[error("Mataroa rejected the API key (HTTP {status}): {message}")]
    Unauthorized { status: u16, message: String },

    /// No post with the given slug.
    #[error("Post not found: {0}")]
    NotFound(String),

    /// Any other non-success answer, including `{"ok": false}` bodies.
    #[error("Mataroa returned HTTP {status}: {message}")]
    Status { status: u16, message: String },

    /// The request never got an answer (DNS, TLS, timeout, ...).
    #[error("Network error: {0}")]
    Network(String),

    /// The answer could not be understood.
    #[error("Unexpected response from Mataroa: {0}")]
    InvalidResponse(String),

    /// The slug would produce an invalid request path.
    #[error("Invalid slug: {0}")]
    InvalidSlug(String),
}

/// Result type for API operations.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ApiError::InvalidResponse(e.to_string())
        } else {
            ApiError::Network(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        ApiError::InvalidResponse(e.to_string())
    }
}
