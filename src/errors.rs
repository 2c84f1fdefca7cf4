use thiserror::Error;

use crate::storage::BackendKind;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Dump failed: {0}")]
    Dump(String),

    #[error("Dump exceeded the configured timeout of {0} seconds")]
    DumpTimeout(u64),

    #[error("Storage operation failed on {backend}: {message}")]
    Storage { backend: BackendKind, message: String },

    #[error("Listing artifacts failed on {backend}: {message}")]
    Listing { backend: BackendKind, message: String },

    #[error("Restore operation failed: {0}")]
    Restore(String),

    #[error("No artifact matches restore target '{0}'")]
    ArtifactNotFound(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AppError {
    pub fn config(message: impl Into<String>) -> Self {
        AppError::Config(message.into())
    }

    /// Flattens an `anyhow` chain into a storage error tagged with the backend.
    pub fn storage(backend: BackendKind, err: anyhow::Error) -> Self {
        AppError::Storage {
            backend,
            message: format!("{:#}", err),
        }
    }

    pub fn listing(backend: BackendKind, err: anyhow::Error) -> Self {
        AppError::Listing {
            backend,
            message: format!("{:#}", err),
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
