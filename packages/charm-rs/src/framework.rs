//! The per-invocation framework: object tree, observers, replay and commit.
//!
//! One [`Framework`] exists per process invocation. It is an explicit value, never a
//! global, so any number of simulated invocations can run in one test process.
//!
//! # Invocation Lifecycle
//!
//! ```text
//! open store ─► construct objects ─► observe ─► reemit ─► emit trigger ─► commit
//!                                                                    └──► abort
//! ```
//!
//! - `construct` feeds each object its stored snapshot.
//! - `reemit` delivers every pending notice to the handler that deferred it, oldest
//!   first, before the triggering event.
//! - `commit` emits `pre_commit` and `commit` on the framework object, collects
//!   snapshots, and flushes them with the notice log in one transaction.
//! - Any error aborts: nothing is written.
//!
//! # Delivery Order
//!
//! Observers run in registration order. An event emitted from inside a handler is
//! dispatched depth-first as soon as that handler returns, before the remaining
//! observers of the outer event.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, error, info, info_span, warn, Span};

use crate::bus::{EventBus, HandlerContext, QueuedEmit, Registration};
use crate::error::FrameworkError;
use crate::event::{EventInstance, EventState, InvocationId, Outcome};
use crate::handle::Handle;
use crate::notice::{Appended, Notice, NoticeDraft};
use crate::object::{FrameworkEvents, Object, ObjectTree, COMMIT, PRE_COMMIT};
use crate::snapshot::Snapshot;
use crate::store::{CommitReport, SnapshotStore};

/// How deeply handlers may nest emissions before dispatch gives up.
pub const MAX_DISPATCH_DEPTH: usize = 64;

/// What [`Framework::reemit`] did with the pending notices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Delivered and handled; removed from the log.
    pub handled: usize,
    /// Delivered and deferred again; kept under the same sequence.
    pub redeferred: usize,
    /// Observer, source or handler no longer exists; removed without delivery.
    pub dropped: usize,
}

impl ReplayReport {
    pub fn total(&self) -> usize {
        self.handled + self.redeferred + self.dropped
    }
}

/// Everything one invocation works with.
pub struct Framework {
    invocation: InvocationId,
    span: Span,
    store: SnapshotStore,
    tree: ObjectTree,
    bus: EventBus,
    framework_handle: Handle,
}

impl Framework {
    /// Start an invocation over an opened (and locked) store.
    pub fn new(store: SnapshotStore) -> Result<Self, FrameworkError> {
        let invocation = InvocationId::new();
        let span = info_span!("invocation", %invocation, store = %store.location());

        let events = FrameworkEvents::new()?;
        let framework_handle = events.handle().clone();
        let mut tree = ObjectTree::new();
        tree.insert(Rc::new(RefCell::new(events)), None)?;

        Ok(Self {
            invocation,
            span,
            store,
            tree,
            bus: EventBus::new(),
            framework_handle,
        })
    }

    pub fn invocation(&self) -> InvocationId {
        self.invocation
    }

    /// Source of the `pre_commit` and `commit` events.
    pub fn framework_handle(&self) -> &Handle {
        &self.framework_handle
    }

    pub fn tree(&self) -> &ObjectTree {
        &self.tree
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    // =========================================================================
    // Objects
    // =========================================================================

    /// Build an object at `handle` from its stored snapshot (empty if never stored)
    /// and add it to the tree.
    ///
    /// The parent must already be constructed, and the handle must be free.
    pub fn construct<O, F>(&mut self, handle: Handle, build: F) -> anyhow::Result<Rc<RefCell<O>>>
    where
        O: Object,
        F: FnOnce(Handle, Snapshot) -> anyhow::Result<O>,
    {
        let span = self.span.clone();
        let _enter = span.enter();

        self.tree.check_vacant(&handle).map_err(FrameworkError::from)?;
        let loaded = self.store.load_bytes(&handle).map_err(FrameworkError::from)?;
        let snapshot = match &loaded {
            Some(bytes) => self.store.decode(&handle, bytes).map_err(FrameworkError::from)?,
            None => Snapshot::new(),
        };

        let object = build(handle.clone(), snapshot)?;
        if object.handle() != &handle {
            anyhow::bail!(
                "object built for {} reports handle {}",
                handle,
                object.handle()
            );
        }

        debug!(%handle, restored = loaded.is_some(), "object constructed");
        let object = Rc::new(RefCell::new(object));
        self.tree
            .insert(object.clone(), loaded)
            .map_err(FrameworkError::from)?;
        Ok(object)
    }

    /// Typed access to a constructed object.
    pub fn object<T: Object>(&self, handle: &Handle) -> Option<Rc<RefCell<T>>> {
        self.tree.get(handle)
    }

    /// Whether the object at `handle` exists and declares `kind`.
    pub fn declares(&self, handle: &Handle, kind: &str) -> bool {
        self.tree.declares(handle, kind).unwrap_or(false)
    }

    /// Current state of `handle`: the live object's snapshot, or the stored one.
    pub fn snapshot_of(&self, handle: &Handle) -> anyhow::Result<Option<Snapshot>> {
        if let Some(object) = self.tree.get_dyn(handle) {
            let object = object.try_borrow().map_err(|_| FrameworkError::ObjectBusy {
                handle: handle.clone(),
            })?;
            return Ok(Some(object.snapshot()));
        }
        Ok(self.store.load(handle).map_err(FrameworkError::from)?)
    }

    /// Replace the live state of the object at `handle`.
    pub fn restore(&mut self, handle: &Handle, snapshot: Snapshot) -> anyhow::Result<()> {
        let object = self
            .tree
            .get_dyn(handle)
            .ok_or_else(|| FrameworkError::UnknownObject {
                handle: handle.clone(),
            })?;
        let mut object = object.try_borrow_mut().map_err(|_| FrameworkError::ObjectBusy {
            handle: handle.clone(),
        })?;
        object.restore(snapshot)
    }

    /// Delete the stored snapshot of `handle` at commit. A live object at that handle
    /// is no longer persisted in this invocation.
    pub fn drop_snapshot(&mut self, handle: &Handle) {
        self.store.delete(handle);
        self.tree.stop_persisting(handle);
        debug!(parent: &self.span, %handle, "snapshot dropped");
    }

    // =========================================================================
    // Observation & Emission
    // =========================================================================

    /// Register `handler` (named `name`) of `observer` for `kind` events on `source`.
    pub fn observe<O, F>(
        &mut self,
        source: &Handle,
        kind: &str,
        observer: &Rc<RefCell<O>>,
        name: &str,
        handler: F,
    ) -> Result<(), FrameworkError>
    where
        O: Object,
        F: Fn(&mut O, &EventInstance, &mut HandlerContext<'_>) -> anyhow::Result<Outcome> + 'static,
    {
        self.check_emittable(source, kind)?;

        let observer_handle =
            self.tree
                .handle_of(observer)
                .ok_or_else(|| FrameworkError::ObserverNotInTree {
                    emitter: source.clone(),
                    kind: kind.to_string(),
                    handler: name.to_string(),
                })?;

        self.bus
            .register(source, kind, &observer_handle, observer, name, handler)?;
        debug!(
            parent: &self.span,
            %source,
            kind,
            observer = %observer_handle,
            handler = name,
            "observer registered"
        );
        Ok(())
    }

    /// Deliver `kind` on `source` to every observer, in registration order.
    pub fn emit(&mut self, source: &Handle, kind: &str, data: Snapshot) -> anyhow::Result<()> {
        let span = self.span.clone();
        let _enter = span.enter();

        self.check_emittable(source, kind)?;
        self.dispatch(source, kind, data, 0)
    }

    fn check_emittable(&self, source: &Handle, kind: &str) -> Result<(), FrameworkError> {
        match self.tree.declares(source, kind) {
            None => Err(FrameworkError::UnknownObject {
                handle: source.clone(),
            }),
            Some(false) => Err(FrameworkError::UnknownEvent {
                emitter: source.clone(),
                kind: kind.to_string(),
            }),
            Some(true) => Ok(()),
        }
    }

    fn dispatch(
        &mut self,
        source: &Handle,
        kind: &str,
        data: Snapshot,
        depth: usize,
    ) -> anyhow::Result<()> {
        if depth >= MAX_DISPATCH_DEPTH {
            return Err(FrameworkError::DispatchDepthExceeded {
                limit: MAX_DISPATCH_DEPTH,
                emitter: source.clone(),
                kind: kind.to_string(),
            }
            .into());
        }

        let subscribers = self.bus.subscribers(source, kind);
        if subscribers.is_empty() {
            debug!(%source, kind, "no observers");
            return Ok(());
        }

        for registration in subscribers {
            let id = self.bus.next_event_id();
            let mut event = EventInstance::new(id, source.clone(), kind, data.clone());
            let (outcome, emitted) = self.deliver(&mut event, &registration)?;
            if outcome == Outcome::Deferred {
                self.record_deferral(&mut event, &registration)?;
            }
            self.dispatch_emitted(emitted, depth)?;
        }
        Ok(())
    }

    fn dispatch_emitted(&mut self, emitted: Vec<QueuedEmit>, depth: usize) -> anyhow::Result<()> {
        for queued in emitted {
            self.check_emittable(&queued.source, &queued.kind)?;
            self.dispatch(&queued.source, &queued.kind, queued.data, depth + 1)?;
        }
        Ok(())
    }

    /// Run one handler on one event instance.
    fn deliver(
        &mut self,
        event: &mut EventInstance,
        registration: &Registration,
    ) -> anyhow::Result<(Outcome, Vec<QueuedEmit>)> {
        event.transition(EventState::Dispatching);
        debug!(
            event = %event.id(),
            kind = event.kind(),
            source = %event.source(),
            observer = %registration.observer(),
            handler = registration.handler(),
            replay = event.is_replay(),
            "delivering event"
        );

        let mut ctx = HandlerContext::new(
            &self.tree,
            self.invocation,
            event.id(),
            registration.observer(),
            registration.handler(),
        );
        let result = registration.call(event, &mut ctx);
        let (defer_requested, emitted) = ctx.finish();

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(
                    event = %event.id(),
                    kind = event.kind(),
                    observer = %registration.observer(),
                    handler = registration.handler(),
                    error = ?e,
                    "handler failed"
                );
                return Err(e);
            }
        };

        let outcome = if defer_requested {
            Outcome::Deferred
        } else {
            outcome
        };
        event.transition(match outcome {
            Outcome::Handled => EventState::Handled,
            Outcome::Deferred => EventState::Deferred,
        });
        Ok((outcome, emitted))
    }

    /// Turn a freshly deferred event into a pending notice.
    fn record_deferral(
        &mut self,
        event: &mut EventInstance,
        registration: &Registration,
    ) -> Result<(), FrameworkError> {
        if event.source() == &self.framework_handle {
            return Err(FrameworkError::CannotDefer {
                emitter: event.source().clone(),
                kind: event.kind().to_string(),
            });
        }

        let appended = self.store.append_notice(NoticeDraft {
            source: event.source().clone(),
            kind: event.kind().to_string(),
            observer: registration.observer().clone(),
            handler: registration.handler().to_string(),
            data: event.data().clone(),
        });
        event.transition(EventState::Pending);

        match appended {
            Appended::New(sequence) => info!(
                sequence,
                kind = event.kind(),
                source = %event.source(),
                observer = %registration.observer(),
                handler = registration.handler(),
                "event deferred"
            ),
            Appended::Existing(sequence) => debug!(
                sequence,
                kind = event.kind(),
                "identical notice already pending"
            ),
        }
        Ok(())
    }

    // =========================================================================
    // Replay
    // =========================================================================

    /// Deliver every pending notice to the handler that deferred it, in ascending
    /// sequence order.
    ///
    /// Handled notices are removed; re-deferred ones stay under their sequence.
    /// Notices whose observer, source or handler no longer exists are dropped with
    /// a warning. Notices deferred during replay wait for the next invocation.
    pub fn reemit(&mut self) -> anyhow::Result<ReplayReport> {
        let span = self.span.clone();
        let _enter = span.enter();

        let mut report = ReplayReport::default();
        for notice in self.store.list_notices() {
            let Some(registration) = self.replay_target(&notice) else {
                self.store.remove_notice(notice.sequence);
                report.dropped += 1;
                continue;
            };

            let id = self.bus.next_event_id();
            let mut event = EventInstance::replayed(
                id,
                notice.sequence,
                notice.source.clone(),
                &notice.kind,
                notice.data.clone(),
                notice.observer.clone(),
                &notice.handler,
            );
            let (outcome, emitted) = self.deliver(&mut event, &registration)?;
            match outcome {
                Outcome::Handled => {
                    self.store.remove_notice(notice.sequence);
                    report.handled += 1;
                    debug!(sequence = notice.sequence, kind = %notice.kind, "notice handled");
                }
                Outcome::Deferred => {
                    event.transition(EventState::Pending);
                    report.redeferred += 1;
                    debug!(sequence = notice.sequence, kind = %notice.kind, "notice deferred again");
                }
            }
            self.dispatch_emitted(emitted, 0)?;
        }

        if report.total() > 0 {
            info!(
                handled = report.handled,
                redeferred = report.redeferred,
                dropped = report.dropped,
                "replayed pending notices"
            );
        }
        Ok(report)
    }

    fn replay_target(&self, notice: &Notice) -> Option<Registration> {
        let reason = if !self.tree.contains(&notice.observer) {
            "observer no longer exists"
        } else if !self.tree.contains(&notice.source) {
            "source no longer exists"
        } else {
            match self
                .bus
                .find(&notice.source, &notice.kind, &notice.observer, &notice.handler)
            {
                Some(registration) => return Some(registration),
                None => "handler no longer registered",
            }
        };

        warn!(
            sequence = notice.sequence,
            kind = %notice.kind,
            source = %notice.source,
            observer = %notice.observer,
            handler = %notice.handler,
            reason,
            "dropping orphaned notice"
        );
        None
    }

    /// Notices pending right now, ascending.
    pub fn pending_notices(&self) -> Vec<Notice> {
        self.store.list_notices()
    }

    // =========================================================================
    // Commit
    // =========================================================================

    /// Finish the invocation: emit `pre_commit` and `commit`, collect snapshots, and
    /// flush everything in one transaction.
    pub fn commit(mut self) -> anyhow::Result<CommitReport> {
        let span = self.span.clone();
        let _enter = span.enter();

        let framework = self.framework_handle.clone();
        self.dispatch(&framework, PRE_COMMIT, Snapshot::new(), 0)?;
        self.dispatch(&framework, COMMIT, Snapshot::new(), 0)?;
        self.collect_snapshots()?;

        let report = self.store.commit().map_err(FrameworkError::from)?;
        info!(
            snapshots_written = report.snapshots_written,
            snapshots_deleted = report.snapshots_deleted,
            notices_added = report.notices_added,
            notices_removed = report.notices_removed,
            notices_pending = report.notices_pending,
            "invocation committed"
        );
        Ok(report)
    }

    /// Buffer the snapshot of every object whose state differs from what was loaded.
    fn collect_snapshots(&mut self) -> Result<(), FrameworkError> {
        let mut writes = Vec::new();
        for handle in self.tree.handles() {
            if !self.tree.persists(handle) {
                continue;
            }
            let Some(object) = self.tree.get_dyn(handle) else {
                continue;
            };
            let snapshot = object
                .try_borrow()
                .map_err(|_| FrameworkError::ObjectBusy {
                    handle: handle.clone(),
                })?
                .snapshot();

            let bytes = snapshot.to_bytes();
            match self.tree.loaded(handle) {
                Some(loaded) if loaded == bytes.as_slice() => continue,
                None if snapshot.is_empty() => continue,
                _ => writes.push((handle.clone(), bytes)),
            }
        }

        for (handle, bytes) in writes {
            debug!(%handle, "snapshot changed");
            self.store.save_bytes(&handle, bytes);
        }
        Ok(())
    }

    /// Discard everything this invocation did.
    pub fn abort(self) -> anyhow::Result<()> {
        warn!(parent: &self.span, "invocation aborted, rolling back");
        self.store.rollback().map_err(FrameworkError::from)?;
        Ok(())
    }
}

impl std::fmt::Debug for Framework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framework")
            .field("invocation", &self.invocation)
            .field("store", &self.store)
            .field("objects", &self.tree)
            .field("bus", &self.bus)
            .finish()
    }
}
