//! Storage error types.
//!
//! - `Serialization`: a record failed to encode or decode
//! - `Corrupted`: a sealed record failed authentication under the store key
//! - `Io`: the underlying database failed

use thiserror::Error;

/// Errors that can occur during key store operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Record did not authenticate under the store key
    #[error("corrupted record in {table}")]
    Corrupted {
        /// Table holding the record
        table: &'static str,
    },

    /// I/O error (file system, database, entropy source)
    #[error("I/O error: {0}")]
    Io(String),
}

impl StorageError {
    /// Returns true if retrying the operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}
