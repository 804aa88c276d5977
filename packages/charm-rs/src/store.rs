//! The snapshot store: object state and pending notices for one unit.
//!
//! # The Contract
//!
//! 1. **Exclusive for the whole invocation.** Opening a store takes the unit's lock and
//!    holds it until commit or rollback. A second invocation waits (bounded) instead of
//!    reading half-committed state.
//!
//! 2. **Buffered writes.** `save`, `delete`, `append_notice` and `remove_notice` only
//!    touch memory. Reads see those buffered writes.
//!
//! 3. **One flush.** [`SnapshotStore::commit`] hands every change to the backend as a
//!    single [`CommitBatch`], applied in one transaction.
//!
//! 4. **Nothing on failure.** Rolling back, dropping the store, or the process dying
//!    leaves the backend exactly as it was when the store was opened.
//!
//! Backends implement [`StateBackend`]; the SQLite file backend lives in
//! [`crate::sqlite`], an in-memory backend for tests in [`testing`].

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use tracing::debug;

use crate::error::StoreError;
use crate::handle::Handle;
use crate::notice::{Appended, Notice, NoticeDraft, NoticeLog, NoticeRow};
use crate::snapshot::Snapshot;
use crate::sqlite::SqliteBackend;

// =============================================================================
// Backend
// =============================================================================

/// Everything one invocation changed, flushed as one unit.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CommitBatch {
    /// Snapshot writes: `Some(payload)` upserts, `None` deletes.
    pub snapshots: Vec<(String, Option<Vec<u8>>)>,
    /// Sequence numbers of stored notices to delete.
    pub removed_notices: Vec<u64>,
    /// New notices, ascending.
    pub added_notices: Vec<NoticeRow>,
}

impl CommitBatch {
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty() && self.removed_notices.is_empty() && self.added_notices.is_empty()
    }
}

/// Durable storage behind a [`SnapshotStore`].
///
/// A backend is opened already holding the unit's exclusive lock. It must keep the
/// lock until [`StateBackend::apply`] or [`StateBackend::rollback`] returns.
pub trait StateBackend {
    /// Human-readable location, used in errors and logs.
    fn location(&self) -> String;

    /// Stored payload for a handle path.
    fn load(&self, handle: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// All stored notice rows, ascending by sequence.
    fn notices(&self) -> Result<Vec<NoticeRow>, StoreError>;

    /// The highest notice sequence ever issued (0 if none).
    fn last_sequence(&self) -> Result<u64, StoreError>;

    /// Apply the batch atomically and release the lock.
    fn apply(&mut self, batch: CommitBatch) -> Result<(), StoreError>;

    /// Discard everything and release the lock.
    fn rollback(&mut self) -> Result<(), StoreError>;
}

// =============================================================================
// Snapshot Store
// =============================================================================

/// Summary of a successful commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitReport {
    /// Snapshots upserted.
    pub snapshots_written: usize,
    /// Snapshots deleted.
    pub snapshots_deleted: usize,
    /// Notices created this invocation.
    pub notices_added: usize,
    /// Stored notices removed this invocation.
    pub notices_removed: usize,
    /// Notices still pending after the commit.
    pub notices_pending: usize,
}

/// Buffered, transactional view of one unit's state.
pub struct SnapshotStore {
    backend: Box<dyn StateBackend>,
    writes: BTreeMap<Handle, Option<Vec<u8>>>,
    notices: NoticeLog,
}

impl SnapshotStore {
    /// Open the SQLite state file at `path`, waiting at most `lock_timeout` for the lock.
    pub fn open(path: impl AsRef<Path>, lock_timeout: Duration) -> Result<Self, StoreError> {
        Self::with_backend(Box::new(SqliteBackend::open(path, lock_timeout)?))
    }

    /// Wrap an already-locked backend.
    pub fn with_backend(backend: Box<dyn StateBackend>) -> Result<Self, StoreError> {
        let location = backend.location();
        let stored = backend
            .notices()?
            .into_iter()
            .map(|row| row.decode(&location))
            .collect::<Result<Vec<_>, _>>()?;
        let last_issued = backend.last_sequence()?;

        debug!(
            store = %location,
            pending_notices = stored.len(),
            last_sequence = last_issued,
            "state store opened"
        );

        Ok(Self {
            backend,
            writes: BTreeMap::new(),
            notices: NoticeLog::new(stored, last_issued),
        })
    }

    /// Where the state lives.
    pub fn location(&self) -> String {
        self.backend.location()
    }

    /// Buffer a snapshot write.
    pub fn save(&mut self, handle: &Handle, snapshot: &Snapshot) {
        self.writes.insert(handle.clone(), Some(snapshot.to_bytes()));
    }

    /// Buffer raw, already-encoded bytes.
    pub(crate) fn save_bytes(&mut self, handle: &Handle, bytes: Vec<u8>) {
        self.writes.insert(handle.clone(), Some(bytes));
    }

    /// Load a snapshot. `Ok(None)` means the handle has never been saved.
    pub fn load(&self, handle: &Handle) -> Result<Option<Snapshot>, StoreError> {
        self.load_bytes(handle)?
            .map(|bytes| self.decode(handle, &bytes))
            .transpose()
    }

    /// Raw stored bytes, buffered writes first.
    pub(crate) fn load_bytes(&self, handle: &Handle) -> Result<Option<Vec<u8>>, StoreError> {
        match self.writes.get(handle) {
            Some(buffered) => Ok(buffered.clone()),
            None => self.backend.load(&handle.to_string()),
        }
    }

    pub(crate) fn decode(&self, handle: &Handle, bytes: &[u8]) -> Result<Snapshot, StoreError> {
        Snapshot::from_bytes(bytes).map_err(|e| StoreError::Corruption {
            path: self.location(),
            reason: format!("snapshot {handle}: {e}"),
        })
    }

    /// Buffer a snapshot deletion.
    pub fn delete(&mut self, handle: &Handle) {
        self.writes.insert(handle.clone(), None);
    }

    /// Record a deferred event. Identical pending notices are not duplicated.
    pub fn append_notice(&mut self, draft: NoticeDraft) -> Appended {
        self.notices.append(draft)
    }

    /// Pending notices, ascending by sequence.
    pub fn list_notices(&self) -> Vec<Notice> {
        self.notices.list()
    }

    /// Drop a pending notice. Returns false if it was not pending.
    pub fn remove_notice(&mut self, sequence: u64) -> bool {
        self.notices.remove(sequence)
    }

    /// Flush every buffered change in one transaction and release the lock.
    pub fn commit(mut self) -> Result<CommitReport, StoreError> {
        let mut report = CommitReport {
            notices_added: self.notices.added().len(),
            notices_removed: self.notices.removed().count(),
            notices_pending: self.notices.len(),
            ..CommitReport::default()
        };

        let mut batch = CommitBatch {
            removed_notices: self.notices.removed().collect(),
            added_notices: self
                .notices
                .added()
                .into_iter()
                .map(NoticeRow::encode)
                .collect(),
            ..CommitBatch::default()
        };
        for (handle, write) in std::mem::take(&mut self.writes) {
            match write {
                Some(_) => report.snapshots_written += 1,
                None => report.snapshots_deleted += 1,
            }
            batch.snapshots.push((handle.to_string(), write));
        }

        self.backend.apply(batch)?;
        Ok(report)
    }

    /// Discard every buffered change and release the lock.
    pub fn rollback(mut self) -> Result<(), StoreError> {
        self.writes.clear();
        self.backend.rollback()
    }
}

impl std::fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStore")
            .field("location", &self.backend.location())
            .field("buffered_writes", &self.writes.len())
            .field("pending_notices", &self.notices.len())
            .finish()
    }
}

// =============================================================================
// In-Memory Backend (for testing)
// =============================================================================

/// In-memory backend whose state outlives any one store, for simulating invocations.
#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use super::*;
    use std::sync::{Arc, Mutex, MutexGuard};

    #[derive(Debug, Default)]
    struct Shared {
        snapshots: BTreeMap<String, Vec<u8>>,
        notices: BTreeMap<u64, NoticeRow>,
        last_sequence: u64,
        locked: bool,
    }

    /// Handle to the shared state. Clones see the same data.
    #[derive(Debug, Clone, Default)]
    pub struct MemoryState {
        shared: Arc<Mutex<Shared>>,
    }

    impl MemoryState {
        pub fn new() -> Self {
            Self::default()
        }

        fn lock(&self) -> MutexGuard<'_, Shared> {
            self.shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
        }

        /// Take the unit lock, as an invocation start would.
        pub fn open(&self) -> Result<MemoryBackend, StoreError> {
            let mut shared = self.lock();
            if shared.locked {
                return Err(StoreError::LockTimeout {
                    path: "memory".into(),
                    waited: Duration::ZERO,
                });
            }
            shared.locked = true;
            Ok(MemoryBackend {
                state: self.clone(),
                open: true,
            })
        }

        /// Committed payload for a handle path.
        pub fn snapshot_bytes(&self, handle: &str) -> Option<Vec<u8>> {
            self.lock().snapshots.get(handle).cloned()
        }

        /// Committed notice rows, ascending.
        pub fn notice_rows(&self) -> Vec<NoticeRow> {
            self.lock().notices.values().cloned().collect()
        }

        /// True while an invocation holds the lock.
        pub fn is_locked(&self) -> bool {
            self.lock().locked
        }
    }

    /// One invocation's view of a [`MemoryState`].
    #[derive(Debug)]
    pub struct MemoryBackend {
        state: MemoryState,
        open: bool,
    }

    impl MemoryBackend {
        fn ensure_open(&self) -> Result<(), StoreError> {
            if self.open {
                Ok(())
            } else {
                Err(StoreError::Closed)
            }
        }

        fn release(&mut self) {
            if self.open {
                self.open = false;
                self.state.lock().locked = false;
            }
        }
    }

    impl StateBackend for MemoryBackend {
        fn location(&self) -> String {
            "memory".to_string()
        }

        fn load(&self, handle: &str) -> Result<Option<Vec<u8>>, StoreError> {
            self.ensure_open()?;
            Ok(self.state.snapshot_bytes(handle))
        }

        fn notices(&self) -> Result<Vec<NoticeRow>, StoreError> {
            self.ensure_open()?;
            Ok(self.state.notice_rows())
        }

        fn last_sequence(&self) -> Result<u64, StoreError> {
            self.ensure_open()?;
            Ok(self.state.lock().last_sequence)
        }

        fn apply(&mut self, batch: CommitBatch) -> Result<(), StoreError> {
            self.ensure_open()?;
            {
                let mut shared = self.state.lock();
                for (handle, write) in batch.snapshots {
                    match write {
                        Some(bytes) => shared.snapshots.insert(handle, bytes),
                        None => shared.snapshots.remove(&handle),
                    };
                }
                for sequence in batch.removed_notices {
                    shared.notices.remove(&sequence);
                }
                for row in batch.added_notices {
                    shared.last_sequence = shared.last_sequence.max(row.sequence);
                    shared.notices.insert(row.sequence, row);
                }
            }
            self.release();
            Ok(())
        }

        fn rollback(&mut self) -> Result<(), StoreError> {
            self.ensure_open()?;
            self.release();
            Ok(())
        }
    }

    impl Drop for MemoryBackend {
        fn drop(&mut self) {
            self.release();
        }
    }
}
