//! Error types for context-vault.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ContextError>;

/// Error taxonomy for the context store.
///
/// The HTTP boundary maps variants to statuses by exhaustive match:
/// `Validation` is 400, `Auth` is 401, `NotFound` is 404, everything else is a
/// generic 500 with a correlation id. Client-facing variants carry the exact
/// message returned in the response body; the rest carry internal detail that
/// is logged but never leaks to the caller.
#[derive(Error, Debug)]
pub enum ContextError {
    /// Bad input shape or unparseable payload (400)
    #[error("{0}")]
    Validation(String),

    /// Missing, invalid, or expired credential (401)
    #[error("{0}")]
    Auth(String),

    /// Absent context or version (404)
    #[error("{0}")]
    NotFound(String),

    /// Backing store failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Encryption or decryption failure
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata database error
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Outbound HTTP failure (client side only)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Catch-all internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
