//! Error types for the transfer engine and the manifest resolver

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised synchronously by engine entry points. No record is created.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Destination already in use: {}", .0.display())]
    DestinationInUse(PathBuf),

    #[error("Invalid filename: {0:?}")]
    InvalidFilename(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Terminal failure of a started transfer, delivered after the record exists
#[derive(Error, Debug)]
pub enum TransferError {
    /// User- or resolver-initiated cancellation, never surfaced
    #[error("Transfer cancelled")]
    Cancelled,

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("HTTP error: {0}")]
    HttpStatus(reqwest::StatusCode),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Moving the finished payload into the storage directory failed
    #[error("Failed to store downloaded file: {0}")]
    Persistence(#[source] std::io::Error),
}

impl TransferError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Errors from resolving an install URL into a running transfer
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Invalid manifest URL")]
    InvalidManifestUrl,

    #[error("Failed to fetch manifest: {0}")]
    ManifestFetchFailed(#[source] reqwest::Error),

    #[error("Manifest is empty")]
    ManifestEmpty,

    #[error("No package URL found in manifest")]
    NoPackageUrlFound,

    #[error("Not a package URL: {0}")]
    InvalidFileType(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
