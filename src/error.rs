//! Error types for the Turnstile admission core.

use thiserror::Error;

use crate::ratelimit::QuotaHeaders;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum AdmissionError {
    /// A request was denied by a policy. The message is the policy's
    /// user-facing text and is safe to return to clients.
    #[error("{message}")]
    RateLimitExceeded {
        /// Name of the policy that denied the request
        policy: String,
        /// Policy-specific denial message
        message: String,
        /// Quota metadata to attach to the rejection
        quota: QuotaHeaders,
    },

    /// The window store backend could not be reached
    #[error("Window store unavailable: {0}")]
    StoreUnavailable(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, AdmissionError>;
