//! # Charm
//!
//! A durable, single-invocation event framework for orchestration agents.
//!
//! The orchestrator starts a fresh process for every lifecycle event. Each process
//! rebuilds the charm's objects from stored snapshots, replays the work earlier
//! invocations postponed, dispatches the new event, and commits everything it
//! changed in one transaction before it exits.
//!
//! ## Architecture
//!
//! ```text
//! run() / dispatch()
//!     │
//!     ▼ SnapshotStore::open()          (exclusive lock on the state file)
//! Framework
//!     │
//!     ├─► construct()  ◄── stored snapshots
//!     ├─► observe()    ──► EventBus: (source, kind) → [(observer, handler)]
//!     │
//!     ├─► reemit()     ◄── pending notices, ascending sequence
//!     │       └─► handler ─► Handled  → notice removed
//!     │                   └► Deferred → notice kept
//!     │
//!     ├─► emit(trigger)
//!     │       └─► handler ─► Handled
//!     │                   └► Deferred → new notice
//!     │
//!     └─► commit()     ──► pre_commit, commit, snapshots + notices in one transaction
//! ```
//!
//! ## Key Invariants
//!
//! 1. **All or nothing** - an invocation commits every change, or none
//! 2. **FIFO replay** - pending notices are delivered oldest first, before the trigger
//! 3. **At-least-once** - a deferred event is re-delivered until a handler finishes it
//! 4. **Stable identity** - a handle names the same object in every invocation
//! 5. **No globals** - the framework is an explicit value, one per invocation
//!
//! ## Example
//!
//! ```ignore
//! use charm::{Charm, EventInstance, Framework, Handle, HandlerContext, Object, Outcome, Snapshot};
//!
//! struct Counter {
//!     handle: Handle,
//!     count: u64,
//! }
//!
//! impl Object for Counter {
//!     fn handle(&self) -> &Handle {
//!         &self.handle
//!     }
//!     fn events(&self) -> &'static [&'static str] {
//!         &["config_changed"]
//!     }
//!     fn snapshot(&self) -> Snapshot {
//!         Snapshot::new().with("count", self.count)
//!     }
//! }
//!
//! impl Counter {
//!     fn on_config_changed(&mut self, _: &EventInstance, _: &mut HandlerContext<'_>) -> anyhow::Result<Outcome> {
//!         self.count += 1;
//!         Ok(Outcome::Handled)
//!     }
//! }
//!
//! impl Charm for Counter {
//!     fn build(fw: &mut Framework) -> anyhow::Result<Rc<RefCell<Self>>> {
//!         let root = fw.construct(Handle::root("Counter")?, |handle, snapshot| {
//!             Ok(Counter { handle, count: snapshot.get("count")?.unwrap_or(0) })
//!         })?;
//!         let handle = root.borrow().handle().clone();
//!         fw.observe(&handle, "config_changed", &root, "on_config_changed", Counter::on_config_changed)?;
//!         Ok(root)
//!     }
//! }
//!
//! fn main() {
//!     std::process::exit(charm::run_from_env::<Counter>());
//! }
//! ```
//!
//! ## What This Is Not
//!
//! - A general pub/sub bus: events live within one process invocation
//! - Exactly-once delivery: handlers must tolerate re-delivery
//! - A network transport

// Core modules
mod bus;
mod config;
mod dispatch;
mod error;
mod event;
mod framework;
mod handle;
mod notice;
mod object;
mod snapshot;
mod telemetry;

// Storage
pub mod sqlite;
pub mod store;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Stress tests (test-only)
#[cfg(test)]
mod stress_tests;

// Re-export addressing
pub use handle::{child_handle, Handle, Segment, SEPARATOR};

// Re-export state types
pub use notice::{Appended, Notice, NoticeDraft, NoticeRow};
pub use snapshot::Snapshot;
pub use store::{CommitReport, SnapshotStore, StateBackend};

// Re-export object and event types
pub use event::{EventId, EventInstance, EventState, InvocationId, Outcome};
pub use object::{FrameworkEvents, Object, ObjectTree, COMMIT, FRAMEWORK_KIND, PRE_COMMIT};

// Re-export bus and framework
pub use bus::{EventBus, HandlerContext, Registration};
pub use framework::{Framework, ReplayReport, MAX_DISPATCH_DEPTH};

// Re-export entry points
pub use config::{event_from_dispatch_path, run_from_env, RunConfig, DEFAULT_STATE_PATH};
pub use dispatch::{dispatch, run, run_with_timeout, Charm, Trigger, DEFAULT_LOCK_TIMEOUT};
pub use telemetry::init_tracing;

// Re-export error types
pub use error::{
    exit_code_for, AddressError, FrameworkError, StoreError, EXIT_ABORTED, EXIT_COMMITTED,
    EXIT_LOCK_TIMEOUT, EXIT_STORE_CORRUPT,
};
