//! Structured error types for the framework.
//!
//! Three layers, matching how far a failure can travel:
//!
//! - [`AddressError`]: a handle is malformed or cannot be placed in the tree.
//! - [`StoreError`]: the state file is unusable or a flush failed.
//! - [`FrameworkError`]: everything the framework itself rejects (double observation,
//!   deferral outside a handler, unknown sources), wrapping the two above.
//!
//! # The Abort Rule
//!
//! Handler code returns `anyhow::Result`. The bus never catches those errors: they travel
//! up to the invocation boundary and the invocation aborts without committing. Framework
//! errors are converted into `anyhow::Error` on the way and remain downcastable, so the
//! boundary can still pick the right exit code.
//!
//! ```ignore
//! match charm::dispatch(store, trigger, build) {
//!     Ok(report) => tracing::info!(?report, "committed"),
//!     Err(err) => std::process::exit(charm::exit_code_for(&err)),
//! }
//! ```

use std::time::Duration;

use thiserror::Error;

use crate::event::EventId;
use crate::handle::Handle;

// =============================================================================
// Exit Codes
// =============================================================================

/// The invocation committed.
pub const EXIT_COMMITTED: i32 = 0;
/// The invocation aborted (handler failure, programming error, or panic). Nothing committed.
pub const EXIT_ABORTED: i32 = 1;
/// The state file is corrupt. Requires operator intervention.
pub const EXIT_STORE_CORRUPT: i32 = 2;
/// Another invocation held the state file lock for longer than the configured timeout.
pub const EXIT_LOCK_TIMEOUT: i32 = 3;

// =============================================================================
// Address Error
// =============================================================================

/// A handle is malformed, or would be ambiguous in the object tree.
///
/// Always a programming error. Never recovered from.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    /// The rendered path has no segments.
    #[error("handle path is empty")]
    Empty,

    /// A segment kind is empty or contains a reserved character.
    #[error("invalid kind {kind:?}: {reason}")]
    InvalidKind {
        /// The rejected kind.
        kind: String,
        /// What is wrong with it.
        reason: &'static str,
    },

    /// A segment key is empty or contains the path separator.
    #[error("invalid key {key:?}: {reason}")]
    InvalidKey {
        /// The rejected key.
        key: String,
        /// What is wrong with it.
        reason: &'static str,
    },

    /// A path segment does not have the shape `Kind` or `Kind[key]`.
    #[error("malformed segment {segment:?} in handle {path:?}")]
    Malformed {
        /// The whole path being parsed.
        path: String,
        /// The offending segment.
        segment: String,
    },

    /// Another object already lives at this handle.
    #[error("handle {handle} is already taken by another object")]
    Ambiguous {
        /// The contested handle.
        handle: Handle,
    },

    /// The object's parent has not been constructed.
    #[error("parent of {handle} is not in the object tree")]
    MissingParent {
        /// The handle whose parent is missing.
        handle: Handle,
    },
}

// =============================================================================
// Store Error
// =============================================================================

/// Errors from the snapshot store.
///
/// [`StoreError::Corruption`] is fatal and must surface to the operator: the store is
/// never reset to make an invocation succeed.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The state file failed to open or validate.
    #[error("state store {path} is corrupt: {reason}")]
    Corruption {
        /// Location of the state file.
        path: String,
        /// What failed.
        reason: String,
    },

    /// Another invocation held the file lock for longer than we were willing to wait.
    #[error("gave up after {waited:?} waiting for the lock on state store {path}")]
    LockTimeout {
        /// Location of the state file.
        path: String,
        /// The configured wait bound.
        waited: Duration,
    },

    /// The store was already committed or rolled back.
    #[error("state store transaction is already closed")]
    Closed,

    /// Any other backend failure (IO, full disk, ...).
    #[error("state store backend error: {0}")]
    Backend(#[from] rusqlite::Error),
}

impl StoreError {
    /// Exit code reported to the orchestrator for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            StoreError::Corruption { .. } => EXIT_STORE_CORRUPT,
            StoreError::LockTimeout { .. } => EXIT_LOCK_TIMEOUT,
            StoreError::Closed | StoreError::Backend(_) => EXIT_ABORTED,
        }
    }

    /// Returns true if the state file needs operator intervention.
    pub fn is_corruption(&self) -> bool {
        matches!(self, StoreError::Corruption { .. })
    }
}

// =============================================================================
// Framework Error
// =============================================================================

/// Errors raised by the framework itself.
///
/// Handler failures are *not* represented here; they stay `anyhow::Error`.
#[derive(Debug, Error)]
pub enum FrameworkError {
    /// A handle problem.
    #[error(transparent)]
    Address(#[from] AddressError),

    /// A store problem.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The exact same observation was registered twice in one invocation.
    #[error("{observer} already observes {kind} on {emitter} with handler {handler}")]
    DuplicateObservation {
        /// Source of the observed event.
        emitter: Handle,
        /// Event kind.
        kind: String,
        /// Observing object.
        observer: Handle,
        /// Handler name.
        handler: String,
    },

    /// `defer` was called for an event that is not being handled right now by that handler.
    #[error("event {event} cannot be deferred by {observer}::{handler}: not inside that handler")]
    DeferOutsideHandler {
        /// The event the caller tried to defer.
        event: EventId,
        /// Claimed observer.
        observer: Handle,
        /// Claimed handler name.
        handler: String,
    },

    /// Framework lifecycle events are never deferrable.
    #[error("{kind} on {emitter} cannot be deferred")]
    CannotDefer {
        /// Event source.
        emitter: Handle,
        /// Event kind.
        kind: String,
    },

    /// No object lives at this handle.
    #[error("no object at {handle}")]
    UnknownObject {
        /// The handle that was looked up.
        handle: Handle,
    },

    /// The observer passed to `observe` was not constructed in this invocation's tree.
    #[error("observer {handler} of {kind} on {emitter} is not in the object tree")]
    ObserverNotInTree {
        /// Event source.
        emitter: Handle,
        /// Event kind.
        kind: String,
        /// Handler name.
        handler: String,
    },

    /// The source object does not declare this event kind.
    #[error("{emitter} does not emit {kind}")]
    UnknownEvent {
        /// Event source.
        emitter: Handle,
        /// Undeclared kind.
        kind: String,
    },

    /// The object is mutably borrowed by a running handler.
    #[error("object {handle} is busy in a running handler")]
    ObjectBusy {
        /// The borrowed object.
        handle: Handle,
    },

    /// Handlers kept emitting events from inside handlers.
    #[error("dispatch nested deeper than {limit} levels while emitting {kind} on {emitter}")]
    DispatchDepthExceeded {
        /// The nesting limit.
        limit: usize,
        /// Source of the event that crossed the limit.
        emitter: Handle,
        /// Its kind.
        kind: String,
    },
}

impl FrameworkError {
    /// Exit code reported to the orchestrator for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            FrameworkError::Store(e) => e.exit_code(),
            _ => EXIT_ABORTED,
        }
    }
}

/// Pick the exit code for an error that aborted an invocation.
///
/// Walks the error chain looking for a framework or store error; anything else (a
/// handler's own error) is a plain abort.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<FrameworkError>() {
            return e.exit_code();
        }
        if let Some(e) = cause.downcast_ref::<StoreError>() {
            return e.exit_code();
        }
    }
    EXIT_ABORTED
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corruption_maps_to_operator_exit_code() {
        let err = StoreError::Corruption {
            path: "/var/lib/unit/.unit-state.db".into(),
            reason: "file is not a database".into(),
        };
        assert!(err.is_corruption());
        assert_eq!(err.exit_code(), EXIT_STORE_CORRUPT);
        assert!(err.to_string().contains("corrupt"));
    }

    #[test]
    fn test_lock_timeout_exit_code() {
        let err = StoreError::LockTimeout {
            path: "state.db".into(),
            waited: Duration::from_secs(5),
        };
        assert_eq!(err.exit_code(), EXIT_LOCK_TIMEOUT);
        assert!(!err.is_corruption());
    }

    #[test]
    fn test_framework_error_delegates_store_exit_code() {
        let err = FrameworkError::from(StoreError::Corruption {
            path: "state.db".into(),
            reason: "bad page".into(),
        });
        assert_eq!(err.exit_code(), EXIT_STORE_CORRUPT);

        let err = FrameworkError::UnknownObject {
            handle: Handle::root("Unit").unwrap(),
        };
        assert_eq!(err.exit_code(), EXIT_ABORTED);
    }

    #[test]
    fn test_exit_code_for_downcasts_through_anyhow() {
        let err: anyhow::Error = FrameworkError::from(StoreError::LockTimeout {
            path: "state.db".into(),
            waited: Duration::from_millis(10),
        })
        .into();
        assert_eq!(exit_code_for(&err), EXIT_LOCK_TIMEOUT);

        let wrapped = err.context("opening state store");
        assert_eq!(exit_code_for(&wrapped), EXIT_LOCK_TIMEOUT);

        let handler_failure = anyhow::anyhow!("workload refused to start");
        assert_eq!(exit_code_for(&handler_failure), EXIT_ABORTED);
    }

    #[test]
    fn test_duplicate_observation_display() {
        let unit = Handle::root("Unit").unwrap();
        let err = FrameworkError::DuplicateObservation {
            emitter: unit.clone(),
            kind: "install".into(),
            observer: unit,
            handler: "on_install".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("already observes install"));
        assert!(msg.contains("on_install"));
    }
}
