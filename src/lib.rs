//! Concurrent IPA package downloader.
//!
//! [`download::TransferEngine`] tracks any number of simultaneous package
//! transfers and persists finished ones into a storage directory.
//! [`manifest::ManifestResolver`] turns `itms-services` install links into
//! transfers by reading the manifest they point at.

pub mod config;
pub mod download;
pub mod error;
pub mod manifest;
pub mod util;

pub use download::{EngineConfig, TransferEngine, TransferRecord, TransferState};
pub use error::{EngineError, ResolveError, TransferError};
pub use manifest::{ManifestResolver, ResolvedTransfer};
