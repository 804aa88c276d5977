//! Durable records of deferred events.
//!
//! A [`Notice`] is what a deferred event becomes once the handler that received it
//! decides to postpone the work. Notices carry a global sequence number; replay always
//! walks them in ascending sequence order, whatever their source, kind, or observer.
//!
//! The [`NoticeLog`] is the in-memory working copy of the notice table for one
//! invocation. It starts as the rows loaded from the store, and tracks what was added
//! and removed so the commit can flush exactly that difference.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::handle::Handle;
use crate::snapshot::Snapshot;

/// A deferred event awaiting replay.
#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
    /// Global, monotonically increasing position in the log.
    pub sequence: u64,
    /// Object the event was emitted on.
    pub source: Handle,
    /// Event kind.
    pub kind: String,
    /// Object whose handler deferred the event.
    pub observer: Handle,
    /// Name of that handler.
    pub handler: String,
    /// Event data.
    pub data: Snapshot,
}

impl Notice {
    fn matches(&self, draft: &NoticeDraft) -> bool {
        self.source == draft.source
            && self.kind == draft.kind
            && self.observer == draft.observer
            && self.handler == draft.handler
            && self.data == draft.data
    }
}

/// A notice that has not been given a sequence number yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NoticeDraft {
    pub source: Handle,
    pub kind: String,
    pub observer: Handle,
    pub handler: String,
    pub data: Snapshot,
}

/// Result of [`NoticeLog::append`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Appended {
    /// A new notice was created with this sequence number.
    New(u64),
    /// An identical notice is already pending under this sequence number.
    Existing(u64),
}

impl Appended {
    pub fn sequence(self) -> u64 {
        match self {
            Appended::New(seq) | Appended::Existing(seq) => seq,
        }
    }
}

// =============================================================================
// Stored Row
// =============================================================================

/// A notice as stored: one row of the `notices` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoticeRow {
    pub sequence: u64,
    pub source: String,
    pub observer: String,
    pub handler: String,
    pub payload: Vec<u8>,
}

/// Event kind and data, encoded together into the row payload.
#[derive(Serialize, Deserialize)]
struct NoticePayload {
    data: Snapshot,
    kind: String,
}

impl NoticeRow {
    /// Decode a stored row. Undecodable rows mean the store is corrupt.
    pub fn decode(self, path: &str) -> Result<Notice, StoreError> {
        let corrupt = |what: String| StoreError::Corruption {
            path: path.to_string(),
            reason: format!("notice {}: {}", self.sequence, what),
        };

        let source = self
            .source
            .parse()
            .map_err(|e| corrupt(format!("bad source handle: {e}")))?;
        let observer = self
            .observer
            .parse()
            .map_err(|e| corrupt(format!("bad observer handle: {e}")))?;
        let payload: NoticePayload = serde_json::from_slice(&self.payload)
            .map_err(|e| corrupt(format!("bad payload: {e}")))?;

        Ok(Notice {
            sequence: self.sequence,
            source,
            kind: payload.kind,
            observer,
            handler: self.handler,
            data: payload.data,
        })
    }

    /// Encode a notice for storage.
    pub fn encode(notice: &Notice) -> Self {
        let payload = NoticePayload {
            data: notice.data.clone(),
            kind: notice.kind.clone(),
        };
        Self {
            sequence: notice.sequence,
            source: notice.source.to_string(),
            observer: notice.observer.to_string(),
            handler: notice.handler.clone(),
            // Snapshot and String values always serialize.
            payload: serde_json::to_vec(&payload).unwrap_or_default(),
        }
    }
}

// =============================================================================
// Notice Log
// =============================================================================

/// Working copy of the pending notices for one invocation.
#[derive(Debug, Default)]
pub struct NoticeLog {
    pending: BTreeMap<u64, Notice>,
    added: BTreeSet<u64>,
    removed: BTreeSet<u64>,
    next_sequence: u64,
}

impl NoticeLog {
    /// Start from the stored notices.
    ///
    /// `last_issued` is the highest sequence ever handed out, including for notices
    /// that have since been removed, so numbers are never reused.
    pub fn new(stored: Vec<Notice>, last_issued: u64) -> Self {
        let highest = stored.iter().map(|n| n.sequence).max().unwrap_or(0);
        Self {
            pending: stored.into_iter().map(|n| (n.sequence, n)).collect(),
            added: BTreeSet::new(),
            removed: BTreeSet::new(),
            next_sequence: highest.max(last_issued) + 1,
        }
    }

    /// Add a notice, unless an identical one is already pending.
    pub fn append(&mut self, draft: NoticeDraft) -> Appended {
        if let Some(existing) = self.pending.values().find(|n| n.matches(&draft)) {
            return Appended::Existing(existing.sequence);
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.pending.insert(
            sequence,
            Notice {
                sequence,
                source: draft.source,
                kind: draft.kind,
                observer: draft.observer,
                handler: draft.handler,
                data: draft.data,
            },
        );
        self.added.insert(sequence);
        Appended::New(sequence)
    }

    /// Pending notices in ascending sequence order.
    pub fn list(&self) -> Vec<Notice> {
        self.pending.values().cloned().collect()
    }

    pub fn get(&self, sequence: u64) -> Option<&Notice> {
        self.pending.get(&sequence)
    }

    /// Remove a pending notice. Returns false if it was not pending.
    pub fn remove(&mut self, sequence: u64) -> bool {
        if self.pending.remove(&sequence).is_none() {
            return false;
        }
        // A notice added and removed in the same invocation never reaches the store.
        if !self.added.remove(&sequence) {
            self.removed.insert(sequence);
        }
        true
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Notices created during this invocation, ascending.
    pub fn added(&self) -> Vec<&Notice> {
        self.added
            .iter()
            .filter_map(|seq| self.pending.get(seq))
            .collect()
    }

    /// Stored notices removed during this invocation, ascending.
    pub fn removed(&self) -> impl Iterator<Item = u64> + '_ {
        self.removed.iter().copied()
    }

    /// True if nothing needs to be flushed.
    pub fn is_unchanged(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(kind: &str, n: i64) -> NoticeDraft {
        let unit = Handle::root("Unit").unwrap();
        NoticeDraft {
            source: unit.clone(),
            kind: kind.to_string(),
            observer: unit,
            handler: format!("on_{kind}"),
            data: Snapshot::new().with("n", n),
        }
    }

    fn stored(sequence: u64) -> Notice {
        let d = draft("config_changed", sequence as i64);
        Notice {
            sequence,
            source: d.source,
            kind: d.kind,
            observer: d.observer,
            handler: d.handler,
            data: d.data,
        }
    }

    #[test]
    fn test_sequences_continue_after_stored() {
        let mut log = NoticeLog::new(vec![stored(3), stored(7)], 7);
        assert_eq!(log.append(draft("install", 1)), Appended::New(8));
        assert_eq!(log.append(draft("install", 2)), Appended::New(9));
    }

    #[test]
    fn test_sequences_never_reused_after_removal() {
        // Notice 12 was the highest ever issued but has been removed since.
        let mut log = NoticeLog::new(vec![stored(3)], 12);
        assert_eq!(log.append(draft("install", 1)).sequence(), 13);
    }

    #[test]
    fn test_identical_draft_is_not_appended_twice() {
        let mut log = NoticeLog::new(Vec::new(), 0);
        let first = log.append(draft("install", 1));
        let second = log.append(draft("install", 1));
        assert_eq!(first, Appended::New(1));
        assert_eq!(second, Appended::Existing(1));
        assert_eq!(log.len(), 1);

        // Different data is a different event.
        assert_eq!(log.append(draft("install", 2)), Appended::New(2));
    }

    #[test]
    fn test_list_is_ascending() {
        let mut log = NoticeLog::new(vec![stored(9), stored(2), stored(5)], 9);
        log.append(draft("start", 0));
        let order: Vec<u64> = log.list().iter().map(|n| n.sequence).collect();
        assert_eq!(order, vec![2, 5, 9, 10]);
    }

    #[test]
    fn test_remove_tracks_only_stored_notices() {
        let mut log = NoticeLog::new(vec![stored(1)], 1);
        let added = log.append(draft("start", 0)).sequence();

        assert!(log.remove(1));
        assert!(log.remove(added));
        assert!(!log.remove(1));

        assert_eq!(log.removed().collect::<Vec<_>>(), vec![1]);
        assert!(log.added().is_empty());
        assert!(log.is_empty());
    }

    #[test]
    fn test_row_round_trip() {
        let notice = stored(4);
        let row = NoticeRow::encode(&notice);
        assert_eq!(row.source, "Unit");
        let decoded = row.decode("state.db").unwrap();
        assert_eq!(decoded, notice);
    }

    #[test]
    fn test_undecodable_row_is_corruption() {
        let row = NoticeRow {
            sequence: 1,
            source: "Unit//bad".into(),
            observer: "Unit".into(),
            handler: "on_install".into(),
            payload: br#"{"data":{},"kind":"install"}"#.to_vec(),
        };
        let err = row.decode("state.db").unwrap_err();
        assert!(err.is_corruption());

        let row = NoticeRow {
            sequence: 2,
            source: "Unit".into(),
            observer: "Unit".into(),
            handler: "on_install".into(),
            payload: b"not json".to_vec(),
        };
        assert!(row.decode("state.db").unwrap_err().is_corruption());
    }
}
