//! CLI errors.

use std::{io, path::PathBuf};

use hushline_core::{EngineError, StorageError};
use thiserror::Error;

/// Errors surfaced by `hushline` commands.
#[derive(Error, Debug)]
pub enum CliError {
    /// Engine operation failed
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Key store could not be opened
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Reading or writing a file failed
    #[error("{path}: {source}")]
    File {
        /// File involved
        path: PathBuf,
        /// Underlying error
        source: io::Error,
    },

    /// Store key file is not 32 hex-encoded bytes
    #[error("{path}: not a store key (expected 64 hex characters)")]
    InvalidKeyFile {
        /// File involved
        path: PathBuf,
    },

    /// Writing command output failed
    #[error("output: {0}")]
    Output(#[from] io::Error),

    /// Key upload could not be encoded
    #[error("encoding failed: {0}")]
    Encode(String),
}

impl CliError {
    pub(crate) fn file(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| Self::File { path, source }
    }
}
