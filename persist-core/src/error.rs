/*!
Error types for the Persist core engine.
*/

use std::time::Duration;
use thiserror::Error;

/// Result type used throughout the Persist core.
pub type Result<T> = std::result::Result<T, PersistError>;

/// Errors that can occur while persisting or rehydrating state.
#[derive(Error, Debug)]
pub enum PersistError {
    /// I/O errors during file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid persistor configuration or misuse of the engine API
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A substate could not be encoded for storage
    #[error("Serialization error for key \"{key}\": {message}")]
    Serialization { key: String, message: String },

    /// A transformer failed for a key
    #[error("Transform error for key \"{key}\": {message}")]
    Transform { key: String, message: String },

    /// A single key failed to deserialize or transform during rehydration
    #[error("Rehydrate error for key \"{key}\": {message}")]
    Rehydrate { key: String, message: String },

    /// Integrity check failures
    #[error("Integrity check failed: expected hash {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    /// Invalid stored record format
    #[error("Invalid record format: {0}")]
    InvalidFormat(String),

    /// Storage adapter errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// A storage call did not complete within the configured write timeout
    #[error("Storage write for \"{key}\" timed out after {after:?}")]
    Timeout { key: String, after: Duration },

    /// The persistor stopped after a fatal error
    #[error("Persistor halted: {0}")]
    Halted(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
}

impl PersistError {
    /// Create a new configuration error
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a new storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new invalid format error
    pub fn invalid_format<S: Into<String>>(msg: S) -> Self {
        Self::InvalidFormat(msg.into())
    }

    /// Create a new serialization error for a key
    pub fn serialization<K: Into<String>, S: Into<String>>(key: K, msg: S) -> Self {
        Self::Serialization {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create a new transform error for a key
    pub fn transform<K: Into<String>, S: Into<String>>(key: K, msg: S) -> Self {
        Self::Transform {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create a new rehydrate error for a key
    pub fn rehydrate<K: Into<String>, S: Into<String>>(key: K, msg: S) -> Self {
        Self::Rehydrate {
            key: key.into(),
            message: msg.into(),
        }
    }
}
