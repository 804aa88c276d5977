//! Observer registry and handler context.
//!
//! The bus maps `(source, kind)` to an ordered list of [`Registration`]s. Each
//! registration carries a type-erased handler that upgrades a weak reference to its
//! observer, borrows it mutably, and calls the typed handler function.
//!
//! # Guarantees
//!
//! - **Registration order**: observers of one `(source, kind)` run in the order they
//!   were registered.
//! - **One registration per observation**: the same `(source, kind, observer, handler)`
//!   cannot be registered twice.
//! - **Rebuilt every invocation**: nothing here is persisted. Replay finds a
//!   notice's handler by looking the observation up again.
//!
//! Dispatch itself lives on [`crate::Framework`], which owns the bus, the object tree,
//! and the store.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::FrameworkError;
use crate::event::{EventId, EventInstance, InvocationId, Outcome};
use crate::handle::Handle;
use crate::object::{Object, ObjectTree};
use crate::snapshot::Snapshot;

/// Handler with its observer type erased.
pub(crate) type ErasedHandler =
    Rc<dyn Fn(&EventInstance, &mut HandlerContext<'_>) -> anyhow::Result<Outcome>>;

/// One observer of one `(source, kind)`.
#[derive(Clone)]
pub struct Registration {
    observer: Handle,
    handler: String,
    call: ErasedHandler,
}

impl Registration {
    pub fn observer(&self) -> &Handle {
        &self.observer
    }

    pub fn handler(&self) -> &str {
        &self.handler
    }

    pub(crate) fn call(
        &self,
        event: &EventInstance,
        ctx: &mut HandlerContext<'_>,
    ) -> anyhow::Result<Outcome> {
        (self.call)(event, ctx)
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("observer", &self.observer)
            .field("handler", &self.handler)
            .finish()
    }
}

// =============================================================================
// Event Bus
// =============================================================================

/// Registry of observations for one invocation.
#[derive(Default)]
pub struct EventBus {
    routes: HashMap<(Handle, String), Vec<Registration>>,
    next_event: u64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` as the handler named `name` of `observer`, which lives at
    /// `observer_handle`, for `kind` on `source`.
    ///
    /// Callers check that the source exists and declares `kind`, and resolve the
    /// observer's handle through the tree.
    pub(crate) fn register<O, F>(
        &mut self,
        source: &Handle,
        kind: &str,
        observer_handle: &Handle,
        observer: &Rc<RefCell<O>>,
        name: &str,
        handler: F,
    ) -> Result<(), FrameworkError>
    where
        O: Object,
        F: Fn(&mut O, &EventInstance, &mut HandlerContext<'_>) -> anyhow::Result<Outcome> + 'static,
    {
        let observer_handle = observer_handle.clone();
        let route = self
            .routes
            .entry((source.clone(), kind.to_string()))
            .or_default();
        if route
            .iter()
            .any(|r| r.observer == observer_handle && r.handler == name)
        {
            return Err(FrameworkError::DuplicateObservation {
                emitter: source.clone(),
                kind: kind.to_string(),
                observer: observer_handle,
                handler: name.to_string(),
            });
        }

        let weak = Rc::downgrade(observer);
        let target = observer_handle.clone();
        let call: ErasedHandler = Rc::new(
            move |event: &EventInstance, ctx: &mut HandlerContext<'_>| -> anyhow::Result<Outcome> {
                let rc = weak.upgrade().ok_or_else(|| FrameworkError::UnknownObject {
                    handle: target.clone(),
                })?;
                let mut guard = rc.try_borrow_mut().map_err(|_| FrameworkError::ObjectBusy {
                    handle: target.clone(),
                })?;
                handler(&mut *guard, event, ctx)
            },
        );

        route.push(Registration {
            observer: observer_handle,
            handler: name.to_string(),
            call,
        });
        Ok(())
    }

    /// Observers of `kind` on `source`, in registration order.
    pub fn subscribers(&self, source: &Handle, kind: &str) -> Vec<Registration> {
        self.routes
            .get(&(source.clone(), kind.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// The registration a notice was deferred by, if it still exists.
    pub fn find(
        &self,
        source: &Handle,
        kind: &str,
        observer: &Handle,
        handler: &str,
    ) -> Option<Registration> {
        self.routes
            .get(&(source.clone(), kind.to_string()))?
            .iter()
            .find(|r| &r.observer == observer && r.handler == handler)
            .cloned()
    }

    /// Number of registrations across all routes.
    pub fn len(&self) -> usize {
        self.routes.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn next_event_id(&mut self) -> EventId {
        self.next_event += 1;
        EventId(self.next_event)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("registrations", &self.len())
            .field("events_issued", &self.next_event)
            .finish()
    }
}

// =============================================================================
// Handler Context
// =============================================================================

/// An event emitted from inside a handler, dispatched once the handler returns.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct QueuedEmit {
    pub source: Handle,
    pub kind: String,
    pub data: Snapshot,
}

/// What a running handler can do besides mutating its own object.
pub struct HandlerContext<'a> {
    tree: &'a ObjectTree,
    invocation: InvocationId,
    event: EventId,
    observer: Handle,
    handler: String,
    defer_requested: bool,
    emitted: Vec<QueuedEmit>,
}

impl<'a> HandlerContext<'a> {
    pub(crate) fn new(
        tree: &'a ObjectTree,
        invocation: InvocationId,
        event: EventId,
        observer: &Handle,
        handler: &str,
    ) -> Self {
        Self {
            tree,
            invocation,
            event,
            observer: observer.clone(),
            handler: handler.to_string(),
            defer_requested: false,
            emitted: Vec::new(),
        }
    }

    pub fn invocation(&self) -> InvocationId {
        self.invocation
    }

    /// Handle of the object whose handler is running.
    pub fn observer(&self) -> &Handle {
        &self.observer
    }

    /// Name of the running handler.
    pub fn handler(&self) -> &str {
        &self.handler
    }

    /// Emit an event. It is dispatched to its observers as soon as this handler
    /// returns, before any remaining observers of the current event.
    pub fn emit(&mut self, source: &Handle, kind: &str, data: Snapshot) {
        self.emitted.push(QueuedEmit {
            source: source.clone(),
            kind: kind.to_string(),
            data,
        });
    }

    /// Defer `event`. Equivalent to returning [`Outcome::Deferred`].
    ///
    /// Fails unless `event` is the exact instance this handler is processing.
    pub fn defer(&mut self, event: &EventInstance) -> Result<(), FrameworkError> {
        let observer = self.observer.clone();
        let handler = self.handler.clone();
        self.defer_as(event, &observer, &handler)
    }

    /// Defer `event` on behalf of `observer`'s handler `handler`.
    ///
    /// Only the running delivery can be deferred: the event instance, the observer and
    /// the handler name must all match it, or this fails with
    /// [`FrameworkError::DeferOutsideHandler`].
    pub fn defer_as(
        &mut self,
        event: &EventInstance,
        observer: &Handle,
        handler: &str,
    ) -> Result<(), FrameworkError> {
        if event.id() != self.event || observer != &self.observer || handler != self.handler {
            return Err(FrameworkError::DeferOutsideHandler {
                event: event.id(),
                observer: observer.clone(),
                handler: handler.to_string(),
            });
        }
        self.defer_requested = true;
        Ok(())
    }

    /// Another object of the tree, by handle and type.
    ///
    /// The handler's own observer is already mutably borrowed; borrowing it again
    /// through this reference fails.
    pub fn object<T: Object>(&self, handle: &Handle) -> Option<Rc<RefCell<T>>> {
        self.tree.get(handle)
    }

    /// Whether an object lives at `handle`.
    pub fn contains(&self, handle: &Handle) -> bool {
        self.tree.contains(handle)
    }

    pub(crate) fn finish(self) -> (bool, Vec<QueuedEmit>) {
        (self.defer_requested, self.emitted)
    }
}

impl std::fmt::Debug for HandlerContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerContext")
            .field("event", &self.event)
            .field("observer", &self.observer)
            .field("handler", &self.handler)
            .field("defer_requested", &self.defer_requested)
            .field("emitted", &self.emitted.len())
            .finish()
    }
}
