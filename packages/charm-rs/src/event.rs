//! Event instances and their lifecycle.
//!
//! Every delivery of an event to one handler gets its own [`EventInstance`]. The bus
//! moves it through [`EventState`]:
//!
//! ```text
//! Created ──► Dispatching ──► Handled
//!                  │
//!                  └────────► Deferred ──► Pending ──► Dispatching (next invocation)
//! ```
//!
//! There is no failed state. A handler error aborts the whole invocation, and the
//! store rolls back to where it was before.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::handle::Handle;
use crate::snapshot::Snapshot;

/// Identifies one event instance within an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(pub u64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Random identifier of one process invocation, attached to every log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvocationId(pub Uuid);

impl InvocationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for InvocationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a handler decided to do with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The work is done.
    Handled,
    /// Postpone: the event is stored as a notice and re-delivered next invocation.
    Deferred,
}

// =============================================================================
// Lifecycle
// =============================================================================

/// Lifecycle state of an [`EventInstance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventState {
    /// Built, not yet delivered.
    Created,
    /// A handler is running.
    Dispatching,
    /// The handler finished the work.
    Handled,
    /// The handler postponed the work.
    Deferred,
    /// Stored as a notice, waiting for replay.
    Pending,
}

impl EventState {
    /// Whether `self -> next` is a legal move.
    pub fn can_transition_to(self, next: EventState) -> bool {
        use EventState::*;
        matches!(
            (self, next),
            (Created, Dispatching)
                | (Dispatching, Handled)
                | (Dispatching, Deferred)
                | (Deferred, Pending)
                | (Pending, Dispatching)
        )
    }

    /// True once a delivery has finished.
    pub fn is_settled(self) -> bool {
        matches!(self, EventState::Handled | EventState::Deferred)
    }
}

impl fmt::Display for EventState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventState::Created => "created",
            EventState::Dispatching => "dispatching",
            EventState::Handled => "handled",
            EventState::Deferred => "deferred",
            EventState::Pending => "pending",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Event Instance
// =============================================================================

/// One delivery of an event to one handler.
#[derive(Debug, Clone, PartialEq)]
pub struct EventInstance {
    id: EventId,
    kind: String,
    source: Handle,
    data: Snapshot,
    state: EventState,
    notice: Option<u64>,
    deferred_by: Option<(Handle, String)>,
}

impl EventInstance {
    /// A freshly emitted event.
    pub(crate) fn new(id: EventId, source: Handle, kind: &str, data: Snapshot) -> Self {
        Self {
            id,
            kind: kind.to_string(),
            source,
            data,
            state: EventState::Created,
            notice: None,
            deferred_by: None,
        }
    }

    /// An event rebuilt from a stored notice, in the pending state.
    pub(crate) fn replayed(
        id: EventId,
        notice: u64,
        source: Handle,
        kind: &str,
        data: Snapshot,
        observer: Handle,
        handler: &str,
    ) -> Self {
        Self {
            id,
            kind: kind.to_string(),
            source,
            data,
            state: EventState::Pending,
            notice: Some(notice),
            deferred_by: Some((observer, handler.to_string())),
        }
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Handle of the object the event was emitted on.
    pub fn source(&self) -> &Handle {
        &self.source
    }

    pub fn data(&self) -> &Snapshot {
        &self.data
    }

    pub fn state(&self) -> EventState {
        self.state
    }

    /// Sequence of the notice this event was replayed from.
    pub fn notice(&self) -> Option<u64> {
        self.notice
    }

    /// True if this delivery is a replay of a deferred event.
    pub fn is_replay(&self) -> bool {
        self.notice.is_some()
    }

    /// Observer and handler that deferred this event in an earlier invocation.
    pub fn deferred_by(&self) -> Option<(&Handle, &str)> {
        self.deferred_by.as_ref().map(|(h, name)| (h, name.as_str()))
    }

    /// Move to `next`. Returns false, leaving the state unchanged, if the move is illegal.
    pub(crate) fn transition(&mut self, next: EventState) -> bool {
        if self.state.can_transition_to(next) {
            self.state = next;
            true
        } else {
            false
        }
    }
}

impl fmt::Display for EventInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} on {}", self.id, self.kind, self.source)
    }
}
