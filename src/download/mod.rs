//! Module for downloading packages over HTTP(S)
//!
//! This module provides the transfer engine that tracks concurrent package
//! downloads, the transport that performs them, and the storage directory
//! the finished files end up in.

mod engine;
mod http;
mod link;
mod models;
mod storage;

// Re-export the public API
pub use engine::{DEFAULT_FAILURE_BUFFER, EngineConfig, TransferEngine};
pub use http::{FetchEvent, FetchHandle, HttpTransport, Transport, build_client};
pub use link::{INSTALL_SCHEME, LinkKind, classify_link, is_install_url, is_package_url};
pub use models::{TransferFailure, TransferRecord, TransferSnapshot, TransferState};
