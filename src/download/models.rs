//! Data structures for the transfer engine
//!
//! This file contains the core data types shared by the engine, the transport
//! layer and observers: the transfer record with its state machine, snapshots
//! and failure notices.

use serde::{Deserialize, Serialize};
use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};
use ulid::Ulid;

use crate::error::TransferError;
use crate::util::format_bytes;

/// Lifecycle state of a transfer
///
/// A record only ever moves forward: `Pending -> Active -> Finished`. Failed or
/// cancelled transfers are removed instead of getting a terminal state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransferState {
    /// Created, waiting for the first progress event
    #[default]
    Pending,
    /// The transport has reported progress at least once
    Active,
    /// Payload persisted in the storage directory
    Finished,
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Active => write!(f, "Active"),
            Self::Finished => write!(f, "Finished"),
        }
    }
}

/// One package retrieval, tracked from creation to completion or removal
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferRecord {
    pub id: Ulid,
    /// Display name, the destination file's base name
    pub title: String,
    pub source_url: String,
    /// Final on-disk location, fixed at creation
    pub destination_path: PathBuf,
    pub state: TransferState,
    /// 0.0 to 1.0, only meaningful once the record is active
    pub progress_fraction: f64,
    pub bytes_transferred: u64,
    /// 0 while the content length is unknown
    pub bytes_total: u64,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl TransferRecord {
    /// Creates a pending record for a transfer that is about to start
    pub fn pending(source_url: impl Into<String>, destination_path: impl Into<PathBuf>) -> Self {
        let destination_path = destination_path.into();
        Self {
            id: Ulid::new(),
            title: title_for(&destination_path),
            source_url: source_url.into(),
            destination_path,
            state: TransferState::Pending,
            progress_fraction: 0.0,
            bytes_transferred: 0,
            bytes_total: 0,
            created_at: chrono::Utc::now(),
        }
    }

    /// Synthesizes a finished record for a package found in the storage directory
    pub fn discovered(path: impl Into<PathBuf>, size: u64) -> Self {
        let path = path.into();
        let mut record = Self::pending(path.display().to_string(), path);
        record.state = TransferState::Finished;
        record.progress_fraction = 1.0;
        record.bytes_transferred = size;
        record.bytes_total = size;
        record
    }

    pub fn is_finished(&self) -> bool {
        self.state == TransferState::Finished
    }

    /// Applies a transport progress report.
    ///
    /// Promotes a pending record to active. The fraction never decreases and
    /// `bytes_transferred` never exceeds a known total. Returns `false` when the
    /// record is already finished and the report was ignored.
    pub fn apply_progress(&mut self, transferred: u64, total: u64) -> bool {
        if self.is_finished() {
            return false;
        }

        // A server that sends more than it announced grows the total
        let total = if total > 0 { total.max(transferred) } else { 0 };
        let fraction = if total > 0 {
            transferred as f64 / total as f64
        } else {
            0.0
        };

        self.progress_fraction = match self.state {
            TransferState::Active => self.progress_fraction.max(fraction),
            _ => fraction,
        };
        self.state = TransferState::Active;
        self.bytes_transferred = transferred;
        self.bytes_total = total;
        true
    }

    /// Marks the record finished with the final on-disk size
    pub fn finish(&mut self, size: u64) {
        self.state = TransferState::Finished;
        self.progress_fraction = 1.0;
        self.bytes_transferred = size;
        self.bytes_total = size;
    }

    /// Human readable size of a finished transfer
    pub fn size_text(&self) -> String {
        format_bytes(self.bytes_total)
    }

    /// Progress line shown under an unfinished transfer, e.g. `1.0 MiB / 2.0 MiB (50%)`
    pub fn progress_text(&self) -> String {
        format!(
            "{} / {} ({}%)",
            format_bytes(self.bytes_transferred),
            format_bytes(self.bytes_total),
            (self.progress_fraction * 100.0) as u32
        )
    }
}

fn title_for(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Consistent view of the tracked records, split the way a UI lists them
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransferSnapshot {
    pub active: Vec<TransferRecord>,
    pub finished: Vec<TransferRecord>,
}

impl TransferSnapshot {
    /// Partitions records, keeping their most-recent-first order
    pub fn from_records(records: &[TransferRecord]) -> Self {
        let (finished, active): (Vec<_>, Vec<_>) =
            records.iter().cloned().partition(|r| r.is_finished());
        Self { active, finished }
    }

    pub fn len(&self) -> usize {
        self.active.len() + self.finished.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A post-start failure that has to reach the user
#[derive(Debug, Clone)]
pub struct TransferFailure {
    pub id: Ulid,
    pub title: String,
    pub error: Arc<TransferError>,
}

impl fmt::Display for TransferFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.title, self.error)
    }
}
