//! # Exploration Persistence
//!
//! Durable projection of engine state.
//!
//! ## Pieces
//!
//! 1. [`PersistenceScheduler`] decides *when* to save: every `batch_size`
//!    validations, plus one final flush at session teardown.
//! 2. [`ExplorationSnapshot`] is *what* gets saved: the complete validated
//!    set, never a delta, so overlapping writes are last-write-wins.
//! 3. [`SnapshotStore`] is the storage contract: an upsert keyed by
//!    `(user_id, city)`. [`MemorySnapshotStore`] is always available;
//!    `SqliteSnapshotStore` needs the `persistence` feature.
//! 4. [`SnapshotWriter`] drains snapshots into a store on a background
//!    thread. Submitting never blocks, and a failed write never touches
//!    in-memory coverage state.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use serde::{Deserialize, Serialize};

#[cfg(feature = "persistence")]
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{CoverageError, Result};

// ============================================================================
// Types
// ============================================================================

/// Full-state snapshot of one user's exploration of one city.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplorationSnapshot {
    pub user_id: String,
    pub city: String,
    pub validated_way_ids: BTreeSet<i64>,
    pub total_ways: u32,
    pub unlocked_badge_ids: BTreeSet<String>,
}

impl ExplorationSnapshot {
    /// Restore input that seeds a new session from this snapshot.
    pub fn to_restore(&self) -> RestoreSnapshot {
        RestoreSnapshot {
            validated_way_ids: self.validated_way_ids.iter().copied().collect(),
            unlocked_badge_ids: self.unlocked_badge_ids.iter().cloned().collect(),
        }
    }
}

/// Saved state applied once at session start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct RestoreSnapshot {
    pub validated_way_ids: Vec<i64>,
    pub unlocked_badge_ids: Vec<String>,
}

// ============================================================================
// Scheduler
// ============================================================================

/// Batches snapshot saves by validated-set growth.
#[derive(Debug, Clone)]
pub struct PersistenceScheduler {
    batch_size: usize,
    last_saved_count: usize,
}

impl PersistenceScheduler {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            last_saved_count: 0,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn last_saved_count(&self) -> usize {
        self.last_saved_count
    }

    /// Record `count` as already durable (e.g. it was just restored).
    pub fn mark_saved(&mut self, count: usize) {
        self.last_saved_count = count;
    }

    /// Called after a validation. Returns true when a save is due.
    pub fn on_validation(&mut self, validated_count: usize) -> bool {
        if validated_count.saturating_sub(self.last_saved_count) >= self.batch_size {
            self.last_saved_count = validated_count;
            return true;
        }
        false
    }

    /// Called at session teardown. Returns true when anything validated
    /// since the last save would otherwise be lost.
    pub fn on_teardown(&mut self, validated_count: usize) -> bool {
        if validated_count > self.last_saved_count {
            self.last_saved_count = validated_count;
            return true;
        }
        false
    }
}

// ============================================================================
// Storage contract
// ============================================================================

/// Upsert-by-key storage for exploration snapshots.
///
/// Implementations must overwrite the whole record for `(user_id, city)`.
pub trait SnapshotStore: Send {
    fn upsert(&self, snapshot: &ExplorationSnapshot) -> Result<()>;

    fn load(&self, user_id: &str, city: &str) -> Result<Option<ExplorationSnapshot>>;
}

/// In-process store. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct MemorySnapshotStore {
    records: Arc<Mutex<HashMap<(String, String), ExplorationSnapshot>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn upsert(&self, snapshot: &ExplorationSnapshot) -> Result<()> {
        let mut records = self.records.lock().map_err(|_| CoverageError::PersistenceError {
            message: "memory store lock poisoned".to_string(),
        })?;
        records.insert(
            (snapshot.user_id.clone(), snapshot.city.clone()),
            snapshot.clone(),
        );
        Ok(())
    }

    fn load(&self, user_id: &str, city: &str) -> Result<Option<ExplorationSnapshot>> {
        let records = self.records.lock().map_err(|_| CoverageError::PersistenceError {
            message: "memory store lock poisoned".to_string(),
        })?;
        Ok(records
            .get(&(user_id.to_string(), city.to_string()))
            .cloned())
    }
}

// ============================================================================
// SQLite store
// ============================================================================

/// SQLite-backed snapshot store. Id sets are stored as MessagePack blobs.
#[cfg(feature = "persistence")]
pub struct SqliteSnapshotStore {
    db: Connection,
}

#[cfg(feature = "persistence")]
impl SqliteSnapshotStore {
    /// Open (or create) a store at `db_path`.
    pub fn new(db_path: &str) -> Result<Self> {
        let db = Connection::open(db_path)?;
        Self::init_schema(&db)?;
        log::info!("[SnapshotStore] Opened {}", db_path);
        Ok(Self { db })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::new(":memory:")
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS explorations (
                user_id TEXT NOT NULL,
                city TEXT NOT NULL,
                validated_way_ids BLOB NOT NULL,
                validated_count INTEGER NOT NULL,
                total_ways INTEGER NOT NULL,
                unlocked_badge_ids BLOB NOT NULL,
                updated_at INTEGER DEFAULT (strftime('%s', 'now')),
                PRIMARY KEY (user_id, city)
            );
        "#,
        )?;
        Ok(())
    }

    /// Number of stored explorations.
    pub fn count(&self) -> Result<u32> {
        let count: i64 = self
            .db
            .query_row("SELECT COUNT(*) FROM explorations", [], |row| row.get(0))?;
        Ok(count as u32)
    }
}

#[cfg(feature = "persistence")]
impl SnapshotStore for SqliteSnapshotStore {
    fn upsert(&self, snapshot: &ExplorationSnapshot) -> Result<()> {
        let way_ids = rmp_serde::to_vec(&snapshot.validated_way_ids)?;
        let badge_ids = rmp_serde::to_vec(&snapshot.unlocked_badge_ids)?;

        self.db.execute(
            "INSERT INTO explorations
                (user_id, city, validated_way_ids, validated_count, total_ways, unlocked_badge_ids)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id, city) DO UPDATE SET
                validated_way_ids = excluded.validated_way_ids,
                validated_count = excluded.validated_count,
                total_ways = excluded.total_ways,
                unlocked_badge_ids = excluded.unlocked_badge_ids,
                updated_at = strftime('%s', 'now')",
            params![
                snapshot.user_id,
                snapshot.city,
                way_ids,
                snapshot.validated_way_ids.len() as i64,
                snapshot.total_ways as i64,
                badge_ids,
            ],
        )?;
        Ok(())
    }

    fn load(&self, user_id: &str, city: &str) -> Result<Option<ExplorationSnapshot>> {
        let row: Option<(Vec<u8>, i64, Vec<u8>)> = self
            .db
            .query_row(
                "SELECT validated_way_ids, total_ways, unlocked_badge_ids
                 FROM explorations WHERE user_id = ? AND city = ?",
                params![user_id, city],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((way_blob, total_ways, badge_blob)) = row else {
            return Ok(None);
        };

        Ok(Some(ExplorationSnapshot {
            user_id: user_id.to_string(),
            city: city.to_string(),
            validated_way_ids: rmp_serde::from_slice(&way_blob)?,
            total_ways: total_ways as u32,
            unlocked_badge_ids: rmp_serde::from_slice(&badge_blob)?,
        }))
    }
}

// ============================================================================
// Background writer
// ============================================================================

/// Fire-and-forget snapshot writer backed by a worker thread.
pub struct SnapshotWriter {
    sender: Option<mpsc::Sender<ExplorationSnapshot>>,
    handle: Option<thread::JoinHandle<()>>,
    written: Arc<AtomicU32>,
    failures: Arc<AtomicU32>,
}

impl SnapshotWriter {
    /// Move `store` onto a worker thread and start draining submissions.
    pub fn spawn<S: SnapshotStore + 'static>(store: S) -> Self {
        let (tx, rx) = mpsc::channel::<ExplorationSnapshot>();
        let written = Arc::new(AtomicU32::new(0));
        let failures = Arc::new(AtomicU32::new(0));
        let written_worker = Arc::clone(&written);
        let failures_worker = Arc::clone(&failures);

        let handle = thread::spawn(move || {
            for snapshot in rx {
                match store.upsert(&snapshot) {
                    Ok(()) => {
                        written_worker.fetch_add(1, Ordering::SeqCst);
                        log::debug!(
                            "[SnapshotWriter] Saved {}/{}: {} validated",
                            snapshot.user_id,
                            snapshot.city,
                            snapshot.validated_way_ids.len()
                        );
                    }
                    Err(e) => {
                        failures_worker.fetch_add(1, Ordering::SeqCst);
                        log::error!(
                            "[SnapshotWriter] Save failed for {}/{}: {}",
                            snapshot.user_id,
                            snapshot.city,
                            e
                        );
                    }
                }
            }
        });

        Self {
            sender: Some(tx),
            handle: Some(handle),
            written,
            failures,
        }
    }

    /// Queue a snapshot for writing. Returns false if the worker is gone.
    pub fn submit(&self, snapshot: ExplorationSnapshot) -> bool {
        match &self.sender {
            Some(tx) => tx.send(snapshot).is_ok(),
            None => false,
        }
    }

    /// Snapshots written successfully so far.
    pub fn written(&self) -> u32 {
        self.written.load(Ordering::SeqCst)
    }

    /// Snapshots the store rejected so far.
    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    /// Drain everything already submitted, then stop the worker.
    pub fn shutdown(&mut self) {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("[SnapshotWriter] Worker thread panicked");
            }
        }
    }
}

impl Drop for SnapshotWriter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Tests
// ============================================================================
