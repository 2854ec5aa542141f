//! Periodic checkpointing and recovery
//!
//! A checkpoint captures everything needed to resume processing: the keyed
//! state snapshot, the watermark, and the source positions to seek back to.
//! Files are written with a checksum header, staged to a temp file and then
//! atomically renamed, so a crash mid-write never leaves a readable but
//! partial checkpoint. Recovery walks checkpoints newest-first and skips any
//! that fail validation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::store::StateSnapshot;
use crate::error::{StateError, StateResult};
use crate::watermark::Watermark;

const CHECKPOINT_EXTENSION: &str = "ckpt";
const CHECKSUM_HEADER_LEN: usize = 8;

/// A source partition position to resume consumption from.
///
/// `offset` is the next offset to read, not the last one processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePosition {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// Everything a checkpoint needs from the running pipeline, captured at one
/// point in time.
///
/// Implementors must capture source positions no later than keyed state:
/// replaying from an older position only re-applies work, while positions
/// ahead of the state would lose events.
#[async_trait]
pub trait CheckpointSource: Send + Sync {
    async fn capture(&self) -> CapturedState;
}

/// The pipeline-side payload of one checkpoint
#[derive(Debug, Clone, Default)]
pub struct CapturedState {
    pub watermark: Watermark,
    pub positions: Vec<SourcePosition>,
    pub state: StateSnapshot,
}

/// A complete, persistable checkpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: u64,
    pub created_at: DateTime<Utc>,
    pub watermark: Watermark,
    pub positions: Vec<SourcePosition>,
    pub state: StateSnapshot,
}

impl Checkpoint {
    pub fn new(checkpoint_id: u64, captured: CapturedState) -> Self {
        Self {
            checkpoint_id,
            created_at: Utc::now(),
            watermark: captured.watermark,
            positions: captured.positions,
            state: captured.state,
        }
    }

    fn file_name(checkpoint_id: u64) -> String {
        // zero-padded so lexical order is id order
        format!("checkpoint-{checkpoint_id:020}.{CHECKPOINT_EXTENSION}")
    }
}

fn payload_checksum(payload: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    hasher.write(payload);
    hasher.finish()
}

/// Filesystem persistence for checkpoints with a bounded retention window
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    retain: usize,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, retain: usize) -> Self {
        Self {
            dir: dir.into(),
            retain: retain.max(1),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist a checkpoint: checksum header plus bincode payload, staged to
    /// a temp file and renamed into place.
    pub async fn save(&self, checkpoint: &Checkpoint) -> StateResult<PathBuf> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StateError::CheckpointFailed {
                checkpoint_id: checkpoint.checkpoint_id,
                reason: format!("failed to create checkpoint directory: {e}"),
            })?;

        let payload =
            bincode::serialize(checkpoint).map_err(|e| StateError::SerializationFailed {
                reason: e.to_string(),
            })?;

        let mut bytes = Vec::with_capacity(CHECKSUM_HEADER_LEN + payload.len());
        bytes.extend_from_slice(&payload_checksum(&payload).to_le_bytes());
        bytes.extend_from_slice(&payload);

        let final_path = self.dir.join(Checkpoint::file_name(checkpoint.checkpoint_id));
        let tmp_path = final_path.with_extension("tmp");

        tokio::fs::write(&tmp_path, &bytes).await.map_err(|e| {
            StateError::CheckpointFailed {
                checkpoint_id: checkpoint.checkpoint_id,
                reason: format!("failed to write {}: {e}", tmp_path.display()),
            }
        })?;
        tokio::fs::rename(&tmp_path, &final_path).await.map_err(|e| {
            StateError::CheckpointFailed {
                checkpoint_id: checkpoint.checkpoint_id,
                reason: format!("failed to rename into place: {e}"),
            }
        })?;

        info!(
            checkpoint_id = checkpoint.checkpoint_id,
            bytes = bytes.len(),
            keys = checkpoint.state.key_count(),
            open_windows = checkpoint.state.open_window_count(),
            "checkpoint persisted"
        );

        self.apply_retention().await?;
        Ok(final_path)
    }

    /// Load and validate one checkpoint file
    pub async fn load(&self, path: &Path) -> StateResult<Checkpoint> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| StateError::RestoreFailed {
                reason: format!("failed to read {}: {e}", path.display()),
            })?;

        if bytes.len() < CHECKSUM_HEADER_LEN {
            return Err(StateError::Corrupt {
                path: path.display().to_string(),
                reason: "file shorter than checksum header".to_string(),
            });
        }

        let (header, payload) = bytes.split_at(CHECKSUM_HEADER_LEN);
        let mut stored = [0u8; CHECKSUM_HEADER_LEN];
        stored.copy_from_slice(header);
        let stored = u64::from_le_bytes(stored);

        let actual = payload_checksum(payload);
        if stored != actual {
            return Err(StateError::Corrupt {
                path: path.display().to_string(),
                reason: format!("checksum mismatch: stored {stored:x}, computed {actual:x}"),
            });
        }

        bincode::deserialize(payload).map_err(|e| StateError::Corrupt {
            path: path.display().to_string(),
            reason: format!("undecodable payload: {e}"),
        })
    }

    /// Checkpoint files present on disk, ascending by checkpoint id
    pub async fn list(&self) -> StateResult<Vec<PathBuf>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StateError::StorageError {
                    details: format!("failed to read {}: {e}", self.dir.display()),
                })
            }
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| {
            StateError::StorageError {
                details: format!("failed to read directory entry: {e}"),
            }
        })? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) == Some(CHECKPOINT_EXTENSION) {
                paths.push(path);
            }
        }

        paths.sort();
        Ok(paths)
    }

    /// Load the most recent valid checkpoint, skipping corrupt files.
    ///
    /// Returns `Ok(None)` when no checkpoint exists at all; processing then
    /// starts fresh.
    pub async fn restore_latest(&self) -> StateResult<Option<Checkpoint>> {
        let paths = self.list().await?;
        for path in paths.iter().rev() {
            match self.load(path).await {
                Ok(checkpoint) => {
                    info!(
                        checkpoint_id = checkpoint.checkpoint_id,
                        path = %path.display(),
                        "restoring from checkpoint"
                    );
                    return Ok(Some(checkpoint));
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unusable checkpoint");
                }
            }
        }
        Ok(None)
    }

    async fn apply_retention(&self) -> StateResult<()> {
        let paths = self.list().await?;
        if paths.len() <= self.retain {
            return Ok(());
        }
        for path in &paths[..paths.len() - self.retain] {
            debug!(path = %path.display(), "removing expired checkpoint");
            if let Err(e) = tokio::fs::remove_file(path).await {
                warn!(path = %path.display(), error = %e, "failed to remove expired checkpoint");
            }
        }
        Ok(())
    }
}

/// Coordinator phase, visible for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointPhase {
    Idle,
    Snapshotting,
    Persisting,
}

/// Counters for checkpoint activity
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckpointStats {
    pub completed: u64,
    pub failed: u64,
    pub last_checkpoint_id: Option<u64>,
    pub last_duration_ms: Option<u64>,
}

/// Drives periodic checkpoints against a [`CheckpointSource`].
///
/// A background task ticks at the configured interval; each tick moves the
/// coordinator through snapshotting and persisting and back to idle. A
/// failed checkpoint is logged and counted, never fatal, and the next tick
/// retries. Shutdown takes one final checkpoint before the task exits.
pub struct CheckpointCoordinator {
    source: Arc<dyn CheckpointSource>,
    store: Arc<CheckpointStore>,
    interval: Duration,
    next_id: Arc<AtomicU64>,
    phase: Arc<RwLock<CheckpointPhase>>,
    stats: Arc<RwLock<CheckpointStats>>,
    task_handle: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
}

impl CheckpointCoordinator {
    /// `first_id` seeds the monotonic counter; pass one past the restored
    /// checkpoint's id, or 1 on a fresh start.
    pub fn new(
        source: Arc<dyn CheckpointSource>,
        store: Arc<CheckpointStore>,
        interval: Duration,
        first_id: u64,
    ) -> Self {
        Self {
            source,
            store,
            interval,
            next_id: Arc::new(AtomicU64::new(first_id.max(1))),
            phase: Arc::new(RwLock::new(CheckpointPhase::Idle)),
            stats: Arc::new(RwLock::new(CheckpointStats::default())),
            task_handle: Mutex::new(None),
            shutdown_tx: Mutex::new(None),
        }
    }

    /// Spawn the periodic checkpoint task
    pub async fn start(&self) -> StateResult<()> {
        let mut handle_guard = self.task_handle.lock().await;
        if handle_guard.is_some() {
            warn!("checkpoint coordinator already started");
            return Ok(());
        }

        info!(interval_ms = self.interval.as_millis() as u64, "starting checkpoint coordinator");

        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();
        *self.shutdown_tx.lock().await = Some(shutdown_tx);

        let source = Arc::clone(&self.source);
        let store = Arc::clone(&self.store);
        let next_id = Arc::clone(&self.next_id);
        let phase = Arc::clone(&self.phase);
        let stats = Arc::clone(&self.stats);
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // consume the immediate first tick
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) =
                            Self::run_once(&source, &store, &next_id, &phase, &stats).await
                        {
                            error!(error = %e, "checkpoint failed");
                        }
                    }
                    _ = &mut shutdown_rx => {
                        info!("checkpoint coordinator shutting down, taking final checkpoint");
                        if let Err(e) =
                            Self::run_once(&source, &store, &next_id, &phase, &stats).await
                        {
                            error!(error = %e, "final checkpoint failed");
                        }
                        break;
                    }
                }
            }
        });

        *handle_guard = Some(handle);
        Ok(())
    }

    /// Take a checkpoint now, outside the timer
    pub async fn trigger(&self) -> StateResult<u64> {
        Self::run_once(
            &self.source,
            &self.store,
            &self.next_id,
            &self.phase,
            &self.stats,
        )
        .await
    }

    async fn run_once(
        source: &Arc<dyn CheckpointSource>,
        store: &Arc<CheckpointStore>,
        next_id: &Arc<AtomicU64>,
        phase: &Arc<RwLock<CheckpointPhase>>,
        stats: &Arc<RwLock<CheckpointStats>>,
    ) -> StateResult<u64> {
        let started = std::time::Instant::now();
        let checkpoint_id = next_id.fetch_add(1, Ordering::SeqCst);
        debug!(checkpoint_id, "checkpoint starting");

        *phase.write().await = CheckpointPhase::Snapshotting;
        let captured = source.capture().await;

        *phase.write().await = CheckpointPhase::Persisting;
        let checkpoint = Checkpoint::new(checkpoint_id, captured);
        let result = store.save(&checkpoint).await;
        *phase.write().await = CheckpointPhase::Idle;

        let mut stats_guard = stats.write().await;
        match result {
            Ok(_) => {
                stats_guard.completed += 1;
                stats_guard.last_checkpoint_id = Some(checkpoint_id);
                stats_guard.last_duration_ms = Some(started.elapsed().as_millis() as u64);
                Ok(checkpoint_id)
            }
            Err(e) => {
                stats_guard.failed += 1;
                Err(e)
            }
        }
    }

    pub async fn phase(&self) -> CheckpointPhase {
        *self.phase.read().await
    }

    pub async fn stats(&self) -> CheckpointStats {
        *self.stats.read().await
    }

    /// Stop the periodic task after a final checkpoint
    pub async fn shutdown(&self) -> StateResult<()> {
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.task_handle.lock().await.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "checkpoint task panicked");
            }
        }
        Ok(())
    }
}
