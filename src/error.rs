//! Error types for VDC operations

use thiserror::Error;

/// Main error type for VDC operations
#[derive(Error, Debug)]
pub enum VdcError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid VDC format: {0}")]
    InvalidFormat(String),

    #[error("Unsupported VDC version: {0}")]
    UnsupportedVersion(u32),

    #[error("Invalid dimensions: {0}")]
    InvalidDimensions(String),

    #[error("Invalid region: {0}")]
    InvalidRegion(String),

    #[error("Storage backend error: {0}")]
    StorageBackend(String),

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid state: {0}")]
    State(String),

    #[error("Cache exhausted: {0}")]
    CacheExhausted(String),

    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Specialized Result type for VDC operations
pub type Result<T> = std::result::Result<T, VdcError>;

impl From<bincode::Error> for VdcError {
    fn from(err: bincode::Error) -> Self {
        VdcError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for VdcError {
    fn from(err: serde_json::Error) -> Self {
        VdcError::Serialization(err.to_string())
    }
}
