//! One invocation, start to finish.
//!
//! [`dispatch`] runs the whole cycle over an opened store:
//!
//! 1. build the object tree and register observers,
//! 2. replay pending notices,
//! 3. emit the triggering event,
//! 4. commit.
//!
//! Any error along the way aborts: the store rolls back and the error is returned.
//! [`run`] wraps `dispatch` for a process entry point. It opens the state file,
//! catches panics from charm code, and turns the result into an exit code.

use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info};

use crate::error::{exit_code_for, EXIT_ABORTED, EXIT_COMMITTED};
use crate::framework::Framework;
use crate::handle::Handle;
use crate::object::Object;
use crate::snapshot::Snapshot;
use crate::store::{CommitReport, SnapshotStore};

/// How long to wait for another invocation to release the state file by default.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// A charm: the root object of the tree, and the code that builds the rest of it.
///
/// ```ignore
/// impl Charm for MyCharm {
///     fn build(fw: &mut Framework) -> anyhow::Result<Rc<RefCell<Self>>> {
///         let root = fw.construct(Handle::root("MyCharm")?, MyCharm::restored)?;
///         let handle = root.borrow().handle().clone();
///         fw.observe(&handle, "config_changed", &root, "on_config_changed", MyCharm::on_config_changed)?;
///         Ok(root)
///     }
/// }
/// ```
pub trait Charm: Object + Sized {
    /// Construct every object and register every observer.
    fn build(fw: &mut Framework) -> anyhow::Result<Rc<RefCell<Self>>>;

    /// The object the orchestrator's event should be emitted on. Defaults to the
    /// charm root.
    fn event_source(&self, kind: &str, data: &Snapshot) -> Handle {
        let _ = (kind, data);
        self.handle().clone()
    }
}

/// The event that started this invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Trigger {
    pub kind: String,
    pub data: Snapshot,
}

impl Trigger {
    pub fn new(kind: impl Into<String>, data: Snapshot) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }
}

/// Run one invocation over `store`.
///
/// `build` constructs the tree and registers observers, then returns the handle the
/// trigger is emitted on. A trigger kind that the source does not declare is not an
/// error: nothing observes it, but replay and commit still happen.
pub fn dispatch<F>(store: SnapshotStore, trigger: &Trigger, build: F) -> anyhow::Result<CommitReport>
where
    F: FnOnce(&mut Framework) -> anyhow::Result<Handle>,
{
    let mut fw = Framework::new(store)?;
    let source = build(&mut fw).context("building object tree")?;

    fw.reemit()?;

    if fw.declares(&source, &trigger.kind) {
        fw.emit(&source, &trigger.kind, trigger.data.clone())?;
    } else {
        info!(kind = %trigger.kind, %source, "event not declared by its source, nothing to dispatch");
    }

    fw.commit()
}

/// Run charm `C` for one orchestrator event and return the process exit code.
pub fn run<C: Charm>(event_kind: &str, event_data: Snapshot, store_path: impl AsRef<Path>) -> i32 {
    run_with_timeout::<C>(event_kind, event_data, store_path, DEFAULT_LOCK_TIMEOUT)
}

/// [`run`] with an explicit lock timeout.
pub fn run_with_timeout<C: Charm>(
    event_kind: &str,
    event_data: Snapshot,
    store_path: impl AsRef<Path>,
    lock_timeout: Duration,
) -> i32 {
    let store_path = store_path.as_ref();
    let store = match SnapshotStore::open(store_path, lock_timeout) {
        Ok(store) => store,
        Err(e) => {
            error!(store = %store_path.display(), error = %e, "could not open state store");
            return e.exit_code();
        }
    };

    let trigger = Trigger::new(event_kind, event_data);
    let result = catch_unwind(AssertUnwindSafe(|| {
        dispatch(store, &trigger, |fw| {
            let charm = C::build(fw)?;
            let source = charm
                .try_borrow()
                .context("charm root is borrowed after build")?
                .event_source(&trigger.kind, &trigger.data);
            Ok(source)
        })
    }));

    match result {
        Ok(Ok(report)) => {
            info!(kind = %trigger.kind, ?report, "invocation finished");
            EXIT_COMMITTED
        }
        Ok(Err(e)) => {
            let code = exit_code_for(&e);
            error!(kind = %trigger.kind, error = ?e, exit_code = code, "invocation aborted");
            code
        }
        Err(panic_info) => {
            let panic_msg = extract_panic_message(&panic_info);
            error!(kind = %trigger.kind, panic = %panic_msg, "charm panicked");
            EXIT_ABORTED
        }
    }
}

fn extract_panic_message(panic_info: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
