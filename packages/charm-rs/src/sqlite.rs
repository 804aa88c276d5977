//! SQLite state file.
//!
//! One file per unit, two tables:
//!
//! ```sql
//! snapshots(handle TEXT PRIMARY KEY, payload BLOB NOT NULL)
//! notices(sequence INTEGER PRIMARY KEY AUTOINCREMENT, source TEXT, observer TEXT,
//!         handler TEXT, payload BLOB)
//! ```
//!
//! Opening the backend starts an `EXCLUSIVE` transaction. SQLite's busy handler waits
//! up to the lock timeout for another invocation to finish; the transaction then holds
//! the file lock until [`StateBackend::apply`] commits or the backend rolls back.
//! `AUTOINCREMENT` keeps `sqlite_sequence` at the highest sequence ever inserted, which
//! is how sequence numbers survive the removal of the newest notice.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::notice::NoticeRow;
use crate::store::{CommitBatch, StateBackend};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS snapshots (
        handle TEXT PRIMARY KEY,
        payload BLOB NOT NULL
    );

    CREATE TABLE IF NOT EXISTS notices (
        sequence INTEGER PRIMARY KEY AUTOINCREMENT,
        source TEXT NOT NULL,
        observer TEXT NOT NULL,
        handler TEXT NOT NULL,
        payload BLOB NOT NULL
    );
"#;

/// A locked SQLite state file.
pub struct SqliteBackend {
    conn: Connection,
    path: PathBuf,
    open: bool,
}

impl SqliteBackend {
    /// Open (creating if needed), lock and validate the state file.
    pub fn open(path: impl AsRef<Path>, lock_timeout: Duration) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let location = path.display().to_string();
        let fail = |e| classify(&location, lock_timeout, e);

        let conn = Connection::open(&path).map_err(fail)?;
        conn.busy_timeout(lock_timeout).map_err(fail)?;
        conn.execute_batch("BEGIN EXCLUSIVE").map_err(fail)?;

        let backend = Self {
            conn,
            path,
            open: true,
        };
        backend.validate().map_err(fail)?;
        backend.conn.execute_batch(SCHEMA).map_err(fail)?;

        debug!(store = %location, "state file locked");
        Ok(backend)
    }

    fn validate(&self) -> Result<(), rusqlite::Error> {
        let verdict: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get(0))?;
        if verdict == "ok" {
            Ok(())
        } else {
            Err(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CORRUPT),
                Some(verdict),
            ))
        }
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.open {
            Ok(())
        } else {
            Err(StoreError::Closed)
        }
    }

    fn write(&self, batch: CommitBatch) -> Result<(), rusqlite::Error> {
        {
            let mut upsert = self.conn.prepare_cached(
                "INSERT INTO snapshots (handle, payload) VALUES (?1, ?2)
                 ON CONFLICT(handle) DO UPDATE SET payload = excluded.payload",
            )?;
            let mut delete = self
                .conn
                .prepare_cached("DELETE FROM snapshots WHERE handle = ?1")?;
            for (handle, write) in &batch.snapshots {
                match write {
                    Some(payload) => upsert.execute(params![handle, payload])?,
                    None => delete.execute(params![handle])?,
                };
            }
        }

        {
            let mut remove = self
                .conn
                .prepare_cached("DELETE FROM notices WHERE sequence = ?1")?;
            for sequence in &batch.removed_notices {
                remove.execute(params![to_sql_sequence(*sequence)?])?;
            }

            let mut insert = self.conn.prepare_cached(
                "INSERT INTO notices (sequence, source, observer, handler, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for row in &batch.added_notices {
                insert.execute(params![
                    to_sql_sequence(row.sequence)?,
                    row.source,
                    row.observer,
                    row.handler,
                    row.payload,
                ])?;
            }
        }

        self.conn.execute_batch("COMMIT")
    }
}

impl StateBackend for SqliteBackend {
    fn location(&self) -> String {
        self.path.display().to_string()
    }

    fn load(&self, handle: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.ensure_open()?;
        self.conn
            .query_row(
                "SELECT payload FROM snapshots WHERE handle = ?1",
                params![handle],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| classify(&self.location(), Duration::ZERO, e))
    }

    fn notices(&self) -> Result<Vec<NoticeRow>, StoreError> {
        self.ensure_open()?;
        let read = || -> Result<Vec<NoticeRow>, rusqlite::Error> {
            let mut stmt = self.conn.prepare(
                "SELECT sequence, source, observer, handler, payload
                 FROM notices ORDER BY sequence ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(NoticeRow {
                    sequence: from_sql_sequence(row.get(0)?)?,
                    source: row.get(1)?,
                    observer: row.get(2)?,
                    handler: row.get(3)?,
                    payload: row.get(4)?,
                })
            })?;
            rows.collect()
        };
        read().map_err(|e| classify(&self.location(), Duration::ZERO, e))
    }

    fn last_sequence(&self) -> Result<u64, StoreError> {
        self.ensure_open()?;
        let seq: Option<i64> = self
            .conn
            .query_row(
                "SELECT seq FROM sqlite_sequence WHERE name = 'notices'",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| classify(&self.location(), Duration::ZERO, e))?;
        Ok(seq.map_or(0, |s| s.max(0) as u64))
    }

    fn apply(&mut self, batch: CommitBatch) -> Result<(), StoreError> {
        self.ensure_open()?;
        let result = self.write(batch);
        if result.is_err() {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!(store = %self.location(), error = %e, "rollback after failed commit also failed");
            }
        }
        self.open = false;
        result.map_err(|e| classify(&self.location(), Duration::ZERO, e))
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.open = false;
        self.conn
            .execute_batch("ROLLBACK")
            .map_err(|e| classify(&self.location(), Duration::ZERO, e))
    }
}

impl Drop for SqliteBackend {
    fn drop(&mut self) {
        if self.open {
            self.open = false;
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!(store = %self.location(), error = %e, "rollback on drop failed");
            }
        }
    }
}

impl std::fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend")
            .field("path", &self.path)
            .field("open", &self.open)
            .finish()
    }
}

fn to_sql_sequence(sequence: u64) -> Result<i64, rusqlite::Error> {
    i64::try_from(sequence).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn from_sql_sequence(raw: i64) -> Result<u64, rusqlite::Error> {
    u64::try_from(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Integer, Box::new(e))
    })
}

/// Map a SQLite failure onto the store's error categories.
fn classify(location: &str, waited: Duration, err: rusqlite::Error) -> StoreError {
    match err.sqlite_error_code() {
        Some(ErrorCode::NotADatabase) | Some(ErrorCode::DatabaseCorrupt) => StoreError::Corruption {
            path: location.to_string(),
            reason: err.to_string(),
        },
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => StoreError::LockTimeout {
            path: location.to_string(),
            waited,
        },
        _ => match err {
            rusqlite::Error::FromSqlConversionFailure(..) | rusqlite::Error::InvalidColumnType(..) => {
                StoreError::Corruption {
                    path: location.to_string(),
                    reason: err.to_string(),
                }
            }
            other => StoreError::Backend(other),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TIMEOUT: Duration = Duration::from_millis(50);

    fn state_file(dir: &TempDir) -> PathBuf {
        dir.path().join(".unit-state.db")
    }

    fn row(sequence: u64) -> NoticeRow {
        NoticeRow {
            sequence,
            source: "Unit".into(),
            observer: "Unit".into(),
            handler: "on_install".into(),
            payload: br#"{"data":{},"kind":"install"}"#.to_vec(),
        }
    }

    #[test]
    fn test_fresh_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let backend = SqliteBackend::open(state_file(&dir), TIMEOUT).unwrap();
        assert_eq!(backend.load("Unit").unwrap(), None);
        assert!(backend.notices().unwrap().is_empty());
        assert_eq!(backend.last_sequence().unwrap(), 0);
    }

    #[test]
    fn test_apply_persists_across_opens() {
        let dir = TempDir::new().unwrap();
        let mut backend = SqliteBackend::open(state_file(&dir), TIMEOUT).unwrap();
        backend
            .apply(CommitBatch {
                snapshots: vec![("Unit".into(), Some(br#"{"count":1}"#.to_vec()))],
                removed_notices: vec![],
                added_notices: vec![row(1), row(2)],
            })
            .unwrap();

        let mut backend = SqliteBackend::open(state_file(&dir), TIMEOUT).unwrap();
        assert_eq!(backend.load("Unit").unwrap(), Some(br#"{"count":1}"#.to_vec()));
        let seqs: Vec<u64> = backend.notices().unwrap().iter().map(|r| r.sequence).collect();
        assert_eq!(seqs, vec![1, 2]);

        backend
            .apply(CommitBatch {
                snapshots: vec![("Unit".into(), Some(br#"{"count":2}"#.to_vec()))],
                removed_notices: vec![2],
                added_notices: vec![],
            })
            .unwrap();

        let backend = SqliteBackend::open(state_file(&dir), TIMEOUT).unwrap();
        assert_eq!(backend.load("Unit").unwrap(), Some(br#"{"count":2}"#.to_vec()));
        assert_eq!(backend.notices().unwrap().len(), 1);
        // The removed notice was the newest one; its number stays used.
        assert_eq!(backend.last_sequence().unwrap(), 2);
    }

    #[test]
    fn test_rollback_leaves_file_untouched() {
        let dir = TempDir::new().unwrap();
        let mut backend = SqliteBackend::open(state_file(&dir), TIMEOUT).unwrap();
        backend
            .apply(CommitBatch {
                snapshots: vec![("Unit".into(), Some(b"{}".to_vec()))],
                ..CommitBatch::default()
            })
            .unwrap();

        {
            let backend = SqliteBackend::open(state_file(&dir), TIMEOUT).unwrap();
            backend
                .conn
                .execute("DELETE FROM snapshots", [])
                .unwrap();
            // Dropped without commit.
        }

        let backend = SqliteBackend::open(state_file(&dir), TIMEOUT).unwrap();
        assert_eq!(backend.load("Unit").unwrap(), Some(b"{}".to_vec()));
    }

    #[test]
    fn test_delete_snapshot() {
        let dir = TempDir::new().unwrap();
        let mut backend = SqliteBackend::open(state_file(&dir), TIMEOUT).unwrap();
        backend
            .apply(CommitBatch {
                snapshots: vec![("Unit".into(), Some(b"{}".to_vec()))],
                ..CommitBatch::default()
            })
            .unwrap();

        let mut backend = SqliteBackend::open(state_file(&dir), TIMEOUT).unwrap();
        backend
            .apply(CommitBatch {
                snapshots: vec![("Unit".into(), None)],
                ..CommitBatch::default()
            })
            .unwrap();

        let backend = SqliteBackend::open(state_file(&dir), TIMEOUT).unwrap();
        assert_eq!(backend.load("Unit").unwrap(), None);
    }

    #[test]
    fn test_second_opener_times_out() {
        let dir = TempDir::new().unwrap();
        let _holder = SqliteBackend::open(state_file(&dir), TIMEOUT).unwrap();
        let err = SqliteBackend::open(state_file(&dir), TIMEOUT).unwrap_err();
        match err {
            StoreError::LockTimeout { waited, .. } => assert_eq!(waited, TIMEOUT),
            other => panic!("expected LockTimeout, got {other:?}"),
        }
    }

    #[test]
    fn test_lock_released_after_commit() {
        let dir = TempDir::new().unwrap();
        let mut first = SqliteBackend::open(state_file(&dir), TIMEOUT).unwrap();
        first.apply(CommitBatch::default()).unwrap();
        assert!(SqliteBackend::open(state_file(&dir), TIMEOUT).is_ok());
    }

    #[test]
    fn test_garbage_file_is_corruption() {
        let dir = TempDir::new().unwrap();
        let path = state_file(&dir);
        std::fs::write(&path, "this is not a database ".repeat(64)).unwrap();
        let err = SqliteBackend::open(&path, TIMEOUT).unwrap_err();
        assert!(err.is_corruption(), "expected corruption, got {err:?}");
    }

    #[test]
    fn test_closed_backend_rejects_calls() {
        let dir = TempDir::new().unwrap();
        let mut backend = SqliteBackend::open(state_file(&dir), TIMEOUT).unwrap();
        backend.rollback().unwrap();
        assert!(matches!(backend.load("Unit"), Err(StoreError::Closed)));
        assert!(matches!(
            backend.apply(CommitBatch::default()),
            Err(StoreError::Closed)
        ));
    }
}
