//! Error types for memovault.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// No finished entry exists for the requested key.
    #[error("key not found: {0}")]
    NotFound(String),

    /// Another process owns the running row for this key. Never retried
    /// by the store; the caller decides what to do.
    #[error("computation {0} is being computed in another process")]
    ComputedElsewhere(String),

    /// A config value cannot be canonically encoded.
    #[error("invalid config value: {0}")]
    InvalidConfig(String),

    /// A computation body failed. This is the form joiners of an in-flight
    /// computation receive; the executing thread gets the original error.
    #[error("computation '{name}' failed: {message}")]
    ComputationFailed { name: String, message: String },

    /// Invalid parameter schema at registration time.
    #[error("invalid computation definition: {0}")]
    Definition(String),

    /// Arguments do not bind against the declared parameter schema.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
