//! Transfer engine
//!
//! Owns the collection of transfer records and every running fetch. Each
//! transfer gets one driver task that consumes its [`FetchHandle`] events in
//! order, so progress, completion and failure of a single transfer are never
//! processed concurrently. All mutations of the record collection go through a
//! single mutex and are published to observers before the lock is released.

use std::{
    collections::{HashMap, HashSet},
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Level, debug, error, info, span, trace, warn};
use ulid::Ulid;
use url::Url;

use super::http::{FetchEvent, FetchHandle, Transport};
use super::link;
use super::models::{TransferFailure, TransferRecord, TransferSnapshot};
use super::storage;
use crate::config::CollisionPolicy;
use crate::error::{EngineError, ResolveError, Result, TransferError};
use crate::util::filename_from_url;

/// Failure notices a [`TransferEngine::failures`] receiver can fall behind by
pub const DEFAULT_FAILURE_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Where finished packages live
    pub storage_dir: PathBuf,
    /// Where the transport writes partial payloads
    pub staging_dir: PathBuf,
    pub collision_policy: CollisionPolicy,
    /// Capacity of the failure channel, at least 1
    pub failure_buffer: usize,
}

impl EngineConfig {
    pub fn new(storage_dir: impl Into<PathBuf>) -> Self {
        let storage_dir = storage_dir.into();
        Self {
            staging_dir: storage_dir.join(".staging"),
            storage_dir,
            collision_policy: CollisionPolicy::default(),
            failure_buffer: DEFAULT_FAILURE_BUFFER,
        }
    }
}

#[derive(Debug, Default)]
struct EngineState {
    /// Most recent first
    records: Vec<TransferRecord>,
    tokens: HashMap<Ulid, CancellationToken>,
    /// Destinations of transfers whose driver task is still running
    reserved: HashSet<PathBuf>,
    /// Transfers whose payload is being moved into storage
    finalizing: HashSet<Ulid>,
}

impl EngineState {
    fn position_unfinished(&self, id: &Ulid) -> Option<usize> {
        self.records
            .iter()
            .position(|r| r.id == *id && !r.is_finished())
    }

    /// Held by a record or by a running driver. Never touches the filesystem.
    fn is_tracked(&self, path: &Path) -> bool {
        self.reserved.contains(path) || self.records.iter().any(|r| r.destination_path == path)
    }
}

struct EngineInner {
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    state: Mutex<EngineState>,
    records_tx: watch::Sender<Vec<TransferRecord>>,
    failures_tx: broadcast::Sender<TransferFailure>,
}

/// Cheaply cloneable handle to the engine
#[derive(Clone)]
pub struct TransferEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for TransferEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferEngine")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl TransferEngine {
    /// Creates the engine and reconciles it with the storage directory
    pub fn new(config: EngineConfig, transport: impl Transport) -> Result<Self> {
        Self::with_transport(config, Arc::new(transport))
    }

    pub fn with_transport(config: EngineConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let (records_tx, _) = watch::channel(Vec::new());
        let (failures_tx, _) = broadcast::channel(config.failure_buffer.max(1));

        let engine = Self {
            inner: Arc::new(EngineInner {
                config,
                transport,
                state: Mutex::new(EngineState::default()),
                records_tx,
                failures_tx,
            }),
        };

        let discovered = engine.reconcile()?;
        info!(
            storage = ?engine.storage_dir(),
            discovered = discovered,
            "Transfer engine ready"
        );
        Ok(engine)
    }

    pub fn storage_dir(&self) -> &Path {
        &self.inner.config.storage_dir
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Pushes the current records to observers. Called with the lock held so
    /// publications follow mutation order.
    fn publish(&self, state: &EngineState) {
        self.inner.records_tx.send_replace(state.records.clone());
    }

    fn report_failure(&self, id: Ulid, title: String, error: TransferError) {
        if error.is_cancellation() {
            debug!(id = %id, "Transfer cancelled");
            return;
        }

        error!(id = %id, title = %title, error = %error, "Transfer failed");
        // No subscribers is fine, the error has been logged
        let _ = self.inner.failures_tx.send(TransferFailure {
            id,
            title,
            error: Arc::new(error),
        });
    }

    pub fn is_package_url(&self, url: &Url) -> bool {
        link::is_package_url(url)
    }

    /// Starts fetching `url` into `storage_dir/filename`.
    ///
    /// The new record is pending and placed first in the collection. The
    /// destination may be renamed according to the collision policy.
    pub fn start(&self, url: &str, filename: &str) -> Result<Ulid> {
        self.start_named(url, filename).map(|(id, _)| id)
    }

    /// Like [`TransferEngine::start`], also returning the filename actually used
    pub fn start_named(&self, url: &str, filename: &str) -> Result<(Ulid, String)> {
        validate_filename(filename)?;
        let url = Url::parse(url)?;

        let storage_dir = &self.inner.config.storage_dir;
        // Paths found on disk, checked with the lock released
        let mut on_disk = HashSet::new();

        let (mut state, destination) = loop {
            let candidate = {
                let state = self.lock();
                let is_taken = |p: &Path| state.is_tracked(p) || on_disk.contains(p);
                match self.inner.config.collision_policy {
                    CollisionPolicy::Reject => {
                        let candidate = storage_dir.join(filename);
                        if is_taken(&candidate) {
                            warn!(path = ?candidate, "Refusing to start transfer, destination in use");
                            return Err(EngineError::DestinationInUse(candidate));
                        }
                        candidate
                    }
                    CollisionPolicy::Rename => {
                        storage::free_destination(storage_dir, filename, is_taken)
                    }
                }
            };

            if candidate.exists() {
                on_disk.insert(candidate);
                continue;
            }

            let state = self.lock();
            if !state.is_tracked(&candidate) {
                break (state, candidate);
            }
            trace!(path = ?candidate, "Destination claimed concurrently, choosing again");
        };

        let record = TransferRecord::pending(url.as_str(), &destination);
        let id = record.id;
        let title = record.title.clone();
        info!(id = %id, url = %url, path = ?destination, "Starting transfer");

        let handle = self.inner.transport.begin(&url);
        state.tokens.insert(id, handle.cancellation_token());
        state.reserved.insert(destination.clone());
        state.records.insert(0, record);
        self.publish(&state);
        drop(state);

        let transfer_span = span!(Level::DEBUG, "transfer", id = %id);
        tokio::spawn(
            self.clone()
                .drive(id, destination, handle)
                .instrument(transfer_span),
        );

        Ok((id, title))
    }

    /// Starts a direct package link, naming the file after the URL's last segment
    pub fn start_package_url(&self, url: &Url) -> Result<(Ulid, String), ResolveError> {
        if !self.is_package_url(url) {
            return Err(ResolveError::InvalidFileType(url.to_string()));
        }
        let filename = filename_from_url(url);
        Ok(self.start_named(url.as_str(), &filename)?)
    }

    async fn drive(self, id: Ulid, destination: PathBuf, mut handle: FetchHandle) {
        let mut terminated = false;

        while let Some(event) = handle.next_event().await {
            let terminal = event.is_terminal();
            match event {
                FetchEvent::Progress { transferred, total } => {
                    self.on_progress(id, transferred, total)
                }
                FetchEvent::Completed(temp_path) => self.on_completed(id, &temp_path).await,
                FetchEvent::Failed(error) => self.on_failed(id, error),
            }
            if terminal {
                terminated = true;
                break;
            }
        }

        if !terminated {
            self.on_failed(
                id,
                TransferError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "Transport ended without a result",
                )),
            );
        }

        let mut state = self.lock();
        state.reserved.remove(&destination);
        state.tokens.remove(&id);
        trace!("Transfer driver finished");
    }

    /// Cancels a pending or active transfer and drops its record right away.
    ///
    /// Returns `false` if there was nothing to cancel.
    pub fn cancel(&self, id: &Ulid) -> bool {
        let mut state = self.lock();
        let Some(index) = state.position_unfinished(id) else {
            warn!(id = %id, "Attempted to cancel non-existent transfer");
            return false;
        };

        state.records.remove(index);
        if let Some(token) = state.tokens.remove(id) {
            token.cancel();
        }
        self.publish(&state);
        info!(id = %id, "Transfer cancelled and removed");
        true
    }

    /// Removes a transfer. Finished transfers have their stored file deleted,
    /// unfinished ones are cancelled.
    pub fn remove(&self, id: &Ulid) -> Result<bool> {
        let mut state = self.lock();
        let Some(index) = state.records.iter().position(|r| r.id == *id) else {
            return Ok(false);
        };
        if !state.records[index].is_finished() {
            drop(state);
            return Ok(self.cancel(id));
        }

        let record = state.records.remove(index);
        self.publish(&state);
        drop(state);

        match std::fs::remove_file(&record.destination_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(id = %id, path = ?record.destination_path, "Removed finished transfer");
        Ok(true)
    }

    /// Applies a progress report from the transport.
    ///
    /// Reports for unknown, finished or finalizing transfers are ignored.
    pub fn on_progress(&self, id: Ulid, transferred: u64, total: u64) {
        let mut state = self.lock();
        if state.finalizing.contains(&id) {
            trace!(id = %id, "Ignoring progress for finalizing transfer");
            return;
        }
        let Some(index) = state.position_unfinished(&id) else {
            trace!(id = %id, "Ignoring progress for unknown transfer");
            return;
        };

        if state.records[index].apply_progress(transferred, total) {
            trace!(id = %id, bytes = transferred, total = total, "Transfer progress");
            self.publish(&state);
        }
    }

    /// Moves a fully fetched payload into storage and finishes the record.
    ///
    /// If the move fails the transfer is lost: the record is removed and the
    /// failure reported.
    pub async fn on_completed(&self, id: Ulid, temp_path: &Path) {
        let destination = {
            let mut state = self.lock();
            let index = state
                .position_unfinished(&id)
                .filter(|_| !state.finalizing.contains(&id));
            index.map(|index| {
                state.finalizing.insert(id);
                state.records[index].destination_path.clone()
            })
        };

        let Some(destination) = destination else {
            debug!(id = %id, path = ?temp_path, "Discarding payload for unknown transfer");
            discard(temp_path).await;
            return;
        };

        let result = async {
            storage::ensure_dir(&self.inner.config.storage_dir)?;
            storage::move_into_place(temp_path, &destination).await?;
            Ok::<_, io::Error>(tokio::fs::metadata(&destination).await?.len())
        }
        .await;

        let (leftover, failure) = {
            let mut state = self.lock();
            state.finalizing.remove(&id);

            match (result, state.position_unfinished(&id)) {
                (Ok(size), Some(index)) => {
                    state.records[index].finish(size);
                    state.tokens.remove(&id);
                    self.publish(&state);
                    info!(id = %id, path = ?destination, bytes = size, "Transfer finished");
                    (None, None)
                }
                (Ok(_), None) => {
                    debug!(id = %id, path = ?destination, "Removing payload of cancelled transfer");
                    (Some(destination), None)
                }
                (Err(e), Some(index)) => {
                    let record = state.records.remove(index);
                    state.tokens.remove(&id);
                    self.publish(&state);
                    (Some(temp_path.to_path_buf()), Some((record, e)))
                }
                (Err(e), None) => {
                    warn!(id = %id, error = %e, "Failed to store payload of cancelled transfer");
                    (Some(temp_path.to_path_buf()), None)
                }
            }
        };

        if let Some(path) = leftover {
            discard(&path).await;
        }
        if let Some((record, e)) = failure {
            self.report_failure(record.id, record.title, TransferError::Persistence(e));
        }
    }

    /// Removes a transfer after a terminal transport error. Anything but a
    /// cancellation is reported through [`TransferEngine::failures`].
    pub fn on_failed(&self, id: Ulid, error: TransferError) {
        let mut state = self.lock();
        if state.finalizing.contains(&id) {
            trace!(id = %id, "Ignoring failure for finalizing transfer");
            return;
        }
        let Some(index) = state.position_unfinished(&id) else {
            trace!(id = %id, error = %error, "Ignoring failure for unknown transfer");
            return;
        };

        let record = state.records.remove(index);
        state.tokens.remove(&id);
        self.publish(&state);
        drop(state);

        self.report_failure(record.id, record.title, error);
    }

    /// Synchronizes the tracked records with the storage directory.
    ///
    /// Unfinished records are kept. Finished records are rebuilt from the
    /// package files on disk, keeping their ids when the file is still there.
    /// Returns the number of finished records.
    pub fn reconcile(&self) -> Result<usize> {
        let storage_dir = &self.inner.config.storage_dir;
        storage::ensure_dir(storage_dir)?;

        // The directory is read without the lock. Records that finish while
        // it is read are not in `scanned` and are kept as they are.
        let scanned: HashSet<Ulid> = self
            .lock()
            .records
            .iter()
            .filter(|r| r.is_finished())
            .map(|r| r.id)
            .collect();
        let packages = storage::scan_packages(storage_dir)?;

        let mut state = self.lock();
        let mut previous: HashMap<PathBuf, TransferRecord> = HashMap::new();
        state.records.retain(|record| {
            if record.is_finished() && scanned.contains(&record.id) {
                previous.insert(record.destination_path.clone(), record.clone());
                false
            } else {
                true
            }
        });

        for (path, size) in packages {
            if state.is_tracked(&path) {
                trace!(path = ?path, "Package belongs to a tracked transfer");
                continue;
            }

            let record = match previous.remove(&path) {
                Some(mut record) => {
                    record.finish(size);
                    record
                }
                None => {
                    debug!(path = ?path, bytes = size, "Discovered package in storage");
                    TransferRecord::discovered(path, size)
                }
            };
            state.records.push(record);
        }

        self.publish(&state);
        Ok(state.records.iter().filter(|r| r.is_finished()).count())
    }

    /// All records, most recent first
    pub fn records(&self) -> Vec<TransferRecord> {
        self.lock().records.clone()
    }

    pub fn get(&self, id: &Ulid) -> Option<TransferRecord> {
        self.lock().records.iter().find(|r| r.id == *id).cloned()
    }

    pub fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot::from_records(&self.lock().records)
    }

    /// Receiver that sees the full record list after every change
    pub fn subscribe(&self) -> watch::Receiver<Vec<TransferRecord>> {
        self.inner.records_tx.subscribe()
    }

    /// Receiver for post-start failures that should be shown to the user.
    ///
    /// Holds up to [`EngineConfig::failure_buffer`] unread notices. A receiver
    /// that falls further behind gets `RecvError::Lagged` with the number of
    /// notices it missed, every failure is also logged at error level.
    pub fn failures(&self) -> broadcast::Receiver<TransferFailure> {
        self.inner.failures_tx.subscribe()
    }

    /// Waits until the transfer finishes. Returns `None` if it was removed
    /// instead (failed or cancelled) or never existed.
    pub async fn wait_until_done(&self, id: &Ulid) -> Option<TransferRecord> {
        let mut rx = self.subscribe();
        loop {
            let record = rx.borrow_and_update().iter().find(|r| r.id == *id).cloned();
            match record {
                Some(record) if record.is_finished() => return Some(record),
                Some(_) => {}
                None => return None,
            }

            if rx.changed().await.is_err() {
                return None;
            }
        }
    }
}

async fn discard(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = ?path, error = %e, "Failed to remove file"),
    }
}

/// Filenames must name a single entry inside the storage directory
fn validate_filename(filename: &str) -> Result<()> {
    let trimmed = filename.trim();
    if trimmed.is_empty()
        || trimmed == "."
        || trimmed == ".."
        || filename.contains(['/', '\\', '\0'])
    {
        return Err(EngineError::InvalidFilename(filename.to_string()));
    }
    Ok(())
}
