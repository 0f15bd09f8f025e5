//! Error types for knowledge-base cache operations
//!
//! Storage and parsing faults are recovered locally wherever a fallback
//! exists (treat as miss, rebuild the index, retry later). Only
//! configuration errors are meant to stop the process at startup.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for cache operations
#[derive(Error, Debug)]
pub enum KbError {
    /// No cached entry and no remote fallback produced one
    #[error("Not found: {library}/{topic}")]
    NotFound { library: String, topic: String },

    /// The remote documentation source failed or could not be reached
    #[error("Remote source unavailable: {0}")]
    RemoteUnavailable(String),

    /// The circuit breaker rejected the call without invoking it
    #[error("Circuit open: remote calls suspended for another {retry_after_secs}s")]
    CircuitOpen { retry_after_secs: u64 },

    /// Operation timeout
    #[error("Operation timed out after {timeout_ms}ms: {context}")]
    Timeout { timeout_ms: u64, context: String },

    /// An on-disk entry could not be parsed
    #[error("Corrupt cache entry {path:?}: {reason}")]
    CorruptEntry { path: PathBuf, reason: String },

    /// The cache index disagrees with the entries on disk
    #[error("Index inconsistency: {0}")]
    IndexInconsistency(String),

    /// Configuration error (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/Deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(String),
}

impl KbError {
    /// Whether the error should count against the circuit breaker
    pub fn is_remote_failure(&self) -> bool {
        matches!(
            self,
            KbError::RemoteUnavailable(_) | KbError::Timeout { .. } | KbError::Other(_)
        )
    }
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, KbError>;

impl From<String> for KbError {
    fn from(s: String) -> Self {
        KbError::Other(s)
    }
}

impl From<&str> for KbError {
    fn from(s: &str) -> Self {
        KbError::Other(s.to_string())
    }
}
