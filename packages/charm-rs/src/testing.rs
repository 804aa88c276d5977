//! Testing utilities for charms built on this crate.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! charm = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Simulating Invocations
//!
//! A [`TestUnit`] is one unit's durable state kept in memory. Each call to
//! [`TestUnit::invoke`] is one process invocation: fresh framework, fresh objects,
//! same stored state.
//!
//! ```ignore
//! let unit = TestUnit::new();
//! unit.invoke("config_changed", Snapshot::new(), |fw| MyCharm::build_tree(fw))?;
//! unit.invoke("update_status", Snapshot::new(), |fw| MyCharm::build_tree(fw))?;
//!
//! assert_eq!(unit.stored_notices().len(), 0);
//! ```
//!
//! # Recording Calls
//!
//! A [`CallLog`] is a cloneable recorder for asserting handler order across
//! invocations.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::Result;

use crate::dispatch::{dispatch, Trigger};
use crate::framework::Framework;
use crate::handle::Handle;
use crate::notice::Notice;
use crate::snapshot::Snapshot;
use crate::store::testing::MemoryState;
use crate::store::{CommitReport, SnapshotStore};

/// One unit's durable state, shared across simulated invocations.
#[derive(Debug, Clone, Default)]
pub struct TestUnit {
    state: MemoryState,
}

impl TestUnit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start an invocation by hand. The unit stays locked until the framework
    /// commits, aborts, or is dropped.
    pub fn open(&self) -> Result<Framework> {
        let store = SnapshotStore::with_backend(Box::new(self.state.open()?))?;
        Ok(Framework::new(store)?)
    }

    /// Run one full invocation: build, replay, emit `kind`, commit.
    pub fn invoke<F>(&self, kind: &str, data: Snapshot, build: F) -> Result<CommitReport>
    where
        F: FnOnce(&mut Framework) -> Result<Handle>,
    {
        let store = SnapshotStore::with_backend(Box::new(self.state.open()?))?;
        dispatch(store, &Trigger::new(kind, data), build)
    }

    /// Committed snapshot of `handle`.
    ///
    /// # Panics
    ///
    /// Panics if the stored bytes do not decode.
    pub fn stored_snapshot(&self, handle: &Handle) -> Option<Snapshot> {
        self.state
            .snapshot_bytes(&handle.to_string())
            .map(|bytes| Snapshot::from_bytes(&bytes).expect("stored snapshot decodes"))
    }

    /// Committed notices, ascending.
    ///
    /// # Panics
    ///
    /// Panics if a stored row does not decode.
    pub fn stored_notices(&self) -> Vec<Notice> {
        self.state
            .notice_rows()
            .into_iter()
            .map(|row| row.decode("memory").expect("stored notice decodes"))
            .collect()
    }

    /// True while an invocation holds the unit.
    pub fn is_locked(&self) -> bool {
        self.state.is_locked()
    }

    /// The underlying in-memory state.
    pub fn state(&self) -> &MemoryState {
        &self.state
    }
}

/// Ordered recorder of handler calls. Clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    entries: Rc<RefCell<Vec<String>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: impl Into<String>) {
        self.entries.borrow_mut().push(entry.into());
    }

    /// Everything recorded so far, in order.
    pub fn entries(&self) -> Vec<String> {
        self.entries.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// How many times `entry` was recorded.
    pub fn count(&self, entry: &str) -> usize {
        self.entries.borrow().iter().filter(|e| *e == entry).count()
    }

    pub fn clear(&self) {
        self.entries.borrow_mut().clear();
    }

    /// Assert the log is exactly `expected`.
    ///
    /// # Panics
    ///
    /// Panics with both sequences if they differ.
    pub fn assert_sequence(&self, expected: &[&str]) {
        let actual = self.entries();
        assert_eq!(
            actual, expected,
            "call sequence mismatch\n  expected: {expected:?}\n  actual:   {actual:?}"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::HandlerContext;
    use crate::event::{EventInstance, Outcome};
    use crate::object::Object;

    struct Probe {
        handle: Handle,
        log: CallLog,
    }

    impl Object for Probe {
        fn handle(&self) -> &Handle {
            &self.handle
        }

        fn events(&self) -> &'static [&'static str] {
            &["install"]
        }
    }

    fn build(fw: &mut Framework, log: &CallLog) -> Result<Handle> {
        let log = log.clone();
        let probe = fw.construct(Handle::root("Probe")?, move |handle, _| Ok(Probe { handle, log }))?;
        let handle = probe.borrow().handle.clone();
        fw.observe(&handle, "install", &probe, "on_install", |p: &mut Probe, e: &EventInstance, _: &mut HandlerContext<'_>| {
            p.log.record(e.kind());
            Ok(Outcome::Deferred)
        })?;
        Ok(handle)
    }

    #[test]
    fn test_invoke_commits_between_calls() {
        let unit = TestUnit::new();
        let log = CallLog::new();

        unit.invoke("install", Snapshot::new(), |fw| build(fw, &log)).unwrap();
        assert_eq!(unit.stored_notices().len(), 1);
        assert!(!unit.is_locked());

        // Replayed (and deferred again) before the new trigger, which dedupes.
        unit.invoke("install", Snapshot::new(), |fw| build(fw, &log)).unwrap();
        log.assert_sequence(&["install", "install", "install"]);
        assert_eq!(unit.stored_notices().len(), 1);
    }

    #[test]
    fn test_open_holds_lock_until_commit() {
        let unit = TestUnit::new();
        let fw = unit.open().unwrap();
        assert!(unit.is_locked());
        assert!(unit.open().is_err());
        fw.commit().unwrap();
        assert!(!unit.is_locked());
    }

    #[test]
    fn test_call_log_shares_entries() {
        let log = CallLog::new();
        let other = log.clone();
        other.record("a");
        log.record("b");
        other.record("a");
        assert_eq!(log.len(), 3);
        assert_eq!(log.count("a"), 2);
        log.assert_sequence(&["a", "b", "a"]);
        other.clear();
        assert!(log.is_empty());
    }

    #[test]
    #[should_panic(expected = "call sequence mismatch")]
    fn test_assert_sequence_reports_mismatch() {
        let log = CallLog::new();
        log.record("a");
        log.assert_sequence(&["b"]);
    }
}
