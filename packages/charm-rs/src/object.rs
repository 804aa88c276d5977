//! Observable objects and the tree that owns them.
//!
//! Every stateful component of a charm is an [`Object`]: it has a [`Handle`], may
//! declare event kinds it emits, and can be snapshotted and restored. The framework
//! keeps all objects of one invocation in an [`ObjectTree`] keyed by handle.
//!
//! # Ownership
//!
//! The tree owns every object through `Rc<RefCell<_>>`. Objects never hold references
//! to each other; a child refers to its parent by handle and resolves it through the
//! framework when needed. Handlers keep only weak references to their observer, so
//! the tree is the sole owner and nothing outlives the invocation.

use std::any::Any;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::error::AddressError;
use crate::handle::Handle;
use crate::snapshot::Snapshot;

/// Kind of the framework's own root object.
pub const FRAMEWORK_KIND: &str = "framework";
/// Emitted on the framework object right before snapshots are collected.
pub const PRE_COMMIT: &str = "pre_commit";
/// Emitted on the framework object after `pre_commit`, still before snapshots.
pub const COMMIT: &str = "commit";

/// A stateful node in the object tree.
///
/// ```ignore
/// struct Unit {
///     handle: Handle,
///     count: u64,
/// }
///
/// impl Object for Unit {
///     fn handle(&self) -> &Handle {
///         &self.handle
///     }
///
///     fn events(&self) -> &'static [&'static str] {
///         &["install", "config_changed"]
///     }
///
///     fn snapshot(&self) -> Snapshot {
///         Snapshot::new().with("count", self.count)
///     }
///
///     fn restore(&mut self, snapshot: Snapshot) -> anyhow::Result<()> {
///         self.count = snapshot.get("count")?.unwrap_or(0);
///         Ok(())
///     }
/// }
/// ```
pub trait Object: Any {
    /// Where this object lives.
    fn handle(&self) -> &Handle;

    /// Event kinds this object can be the source of.
    fn events(&self) -> &'static [&'static str] {
        &[]
    }

    /// Persistent state, collected at commit.
    fn snapshot(&self) -> Snapshot {
        Snapshot::new()
    }

    /// Replace in-memory state with `snapshot`.
    fn restore(&mut self, snapshot: Snapshot) -> anyhow::Result<()> {
        let _ = snapshot;
        Ok(())
    }
}

/// Source of the framework lifecycle events. Holds no state.
#[derive(Debug)]
pub struct FrameworkEvents {
    handle: Handle,
}

impl FrameworkEvents {
    pub(crate) fn new() -> Result<Self, AddressError> {
        Ok(Self {
            handle: Handle::root(FRAMEWORK_KIND)?,
        })
    }
}

impl Object for FrameworkEvents {
    fn handle(&self) -> &Handle {
        &self.handle
    }

    fn events(&self) -> &'static [&'static str] {
        &[PRE_COMMIT, COMMIT]
    }
}

// =============================================================================
// Tree
// =============================================================================

struct Node {
    parent: Option<Handle>,
    object: Rc<RefCell<dyn Object>>,
    typed: Rc<dyn Any>,
    events: &'static [&'static str],
    /// Bytes loaded from the store at construction, `None` if never stored.
    loaded: Option<Vec<u8>>,
    /// Cleared by `Framework::drop_snapshot`; the commit then leaves the row deleted.
    persist: bool,
}

/// All live objects of one invocation, by handle.
#[derive(Default)]
pub struct ObjectTree {
    nodes: BTreeMap<Handle, Node>,
}

impl ObjectTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check that `handle` can be added: free, and with its parent already present.
    pub fn check_vacant(&self, handle: &Handle) -> Result<(), AddressError> {
        if self.nodes.contains_key(handle) {
            return Err(AddressError::Ambiguous {
                handle: handle.clone(),
            });
        }
        if let Some(parent) = handle.parent() {
            if !self.nodes.contains_key(&parent) {
                return Err(AddressError::MissingParent {
                    handle: handle.clone(),
                });
            }
        }
        Ok(())
    }

    /// Add an object under its own handle.
    pub fn insert<O: Object>(
        &mut self,
        object: Rc<RefCell<O>>,
        loaded: Option<Vec<u8>>,
    ) -> Result<(), AddressError> {
        let (handle, events) = {
            let inner = object.borrow();
            (inner.handle().clone(), inner.events())
        };
        self.check_vacant(&handle)?;

        let erased: Rc<RefCell<dyn Object>> = object.clone();
        let typed: Rc<dyn Any> = object;
        self.nodes.insert(
            handle.clone(),
            Node {
                parent: handle.parent(),
                object: erased,
                typed,
                events,
                loaded,
                persist: true,
            },
        );
        Ok(())
    }

    pub fn contains(&self, handle: &Handle) -> bool {
        self.nodes.contains_key(handle)
    }

    /// Typed access to an object. `None` if absent or of another type.
    pub fn get<T: Object>(&self, handle: &Handle) -> Option<Rc<RefCell<T>>> {
        let node = self.nodes.get(handle)?;
        Rc::downcast::<RefCell<T>>(node.typed.clone()).ok()
    }

    /// Handle under which this exact object lives in the tree. Does not borrow it.
    pub fn handle_of<O: Object>(&self, object: &Rc<RefCell<O>>) -> Option<Handle> {
        let target = Rc::as_ptr(object) as *const ();
        self.nodes
            .iter()
            .find(|(_, node)| Rc::as_ptr(&node.typed) as *const () == target)
            .map(|(handle, _)| handle.clone())
    }

    /// Type-erased access to an object.
    pub fn get_dyn(&self, handle: &Handle) -> Option<Rc<RefCell<dyn Object>>> {
        self.nodes.get(handle).map(|node| node.object.clone())
    }

    /// Whether the object at `handle` declares `kind`. `None` if there is no such object.
    pub fn declares(&self, handle: &Handle, kind: &str) -> Option<bool> {
        self.nodes
            .get(handle)
            .map(|node| node.events.iter().any(|declared| *declared == kind))
    }

    /// Handle of the parent of the object at `handle`.
    pub fn parent_of(&self, handle: &Handle) -> Option<&Handle> {
        self.nodes.get(handle)?.parent.as_ref()
    }

    /// Handles of the direct children of `handle`, in order.
    pub fn children_of(&self, handle: &Handle) -> Vec<Handle> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.parent.as_ref() == Some(handle))
            .map(|(h, _)| h.clone())
            .collect()
    }

    /// Every handle, parents before children.
    pub fn handles(&self) -> impl Iterator<Item = &Handle> {
        self.nodes.keys()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn loaded(&self, handle: &Handle) -> Option<&[u8]> {
        self.nodes.get(handle)?.loaded.as_deref()
    }

    pub(crate) fn persists(&self, handle: &Handle) -> bool {
        self.nodes.get(handle).is_some_and(|node| node.persist)
    }

    pub(crate) fn stop_persisting(&mut self, handle: &Handle) {
        if let Some(node) = self.nodes.get_mut(handle) {
            node.persist = false;
            node.loaded = None;
        }
    }
}

impl std::fmt::Debug for ObjectTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.nodes.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Thing {
        handle: Handle,
        value: u32,
    }

    impl Object for Thing {
        fn handle(&self) -> &Handle {
            &self.handle
        }

        fn events(&self) -> &'static [&'static str] {
            &["changed"]
        }

        fn snapshot(&self) -> Snapshot {
            Snapshot::new().with("value", self.value)
        }
    }

    struct Other {
        handle: Handle,
    }

    impl Object for Other {
        fn handle(&self) -> &Handle {
            &self.handle
        }
    }

    fn thing(path: &str) -> Rc<RefCell<Thing>> {
        Rc::new(RefCell::new(Thing {
            handle: path.parse().unwrap(),
            value: 0,
        }))
    }

    #[test]
    fn test_insert_and_typed_get() {
        let mut tree = ObjectTree::new();
        let unit = thing("Unit");
        tree.insert(unit.clone(), None).unwrap();

        let found = tree.get::<Thing>(&"Unit".parse().unwrap()).unwrap();
        assert!(Rc::ptr_eq(&found, &unit));
        found.borrow_mut().value = 5;
        assert_eq!(unit.borrow().value, 5);
    }

    #[test]
    fn test_get_with_wrong_type_is_none() {
        let mut tree = ObjectTree::new();
        tree.insert(thing("Unit"), None).unwrap();
        assert!(tree.get::<Other>(&"Unit".parse().unwrap()).is_none());
        assert!(tree.get_dyn(&"Unit".parse().unwrap()).is_some());
    }

    #[test]
    fn test_duplicate_handle_is_ambiguous() {
        let mut tree = ObjectTree::new();
        tree.insert(thing("Unit"), None).unwrap();
        let err = tree.insert(thing("Unit"), None).unwrap_err();
        assert!(matches!(err, AddressError::Ambiguous { .. }));
    }

    #[test]
    fn test_child_requires_parent() {
        let mut tree = ObjectTree::new();
        let err = tree.insert(thing("Unit/Relation[db:1]"), None).unwrap_err();
        assert!(matches!(err, AddressError::MissingParent { .. }));

        tree.insert(thing("Unit"), None).unwrap();
        tree.insert(thing("Unit/Relation[db:1]"), None).unwrap();
        tree.insert(thing("Unit/Relation[db:2]"), None).unwrap();

        let unit: Handle = "Unit".parse().unwrap();
        assert_eq!(tree.children_of(&unit).len(), 2);
        assert_eq!(
            tree.parent_of(&"Unit/Relation[db:1]".parse().unwrap()),
            Some(&unit)
        );
    }

    #[test]
    fn test_handle_of_finds_borrowed_object() {
        let mut tree = ObjectTree::new();
        let unit = thing("Unit");
        tree.insert(unit.clone(), None).unwrap();

        let _held = unit.borrow_mut();
        assert_eq!(tree.handle_of(&unit), Some("Unit".parse().unwrap()));
        assert_eq!(tree.handle_of(&thing("Unit")), None);
    }

    #[test]
    fn test_declares() {
        let mut tree = ObjectTree::new();
        tree.insert(thing("Unit"), None).unwrap();
        let unit: Handle = "Unit".parse().unwrap();
        assert_eq!(tree.declares(&unit, "changed"), Some(true));
        assert_eq!(tree.declares(&unit, "install"), Some(false));
        assert_eq!(tree.declares(&"Nope".parse().unwrap(), "changed"), None);
    }

    #[test]
    fn test_framework_events_object() {
        let fw = FrameworkEvents::new().unwrap();
        assert_eq!(fw.handle().to_string(), "framework");
        assert_eq!(fw.events(), &[PRE_COMMIT, COMMIT]);
        assert!(fw.snapshot().is_empty());
    }

    #[test]
    fn test_stop_persisting_clears_loaded() {
        let mut tree = ObjectTree::new();
        tree.insert(thing("Unit"), Some(b"{}".to_vec())).unwrap();
        let unit: Handle = "Unit".parse().unwrap();
        assert_eq!(tree.loaded(&unit), Some(&b"{}"[..]));
        assert!(tree.persists(&unit));
        tree.stop_persisting(&unit);
        assert!(!tree.persists(&unit));
        assert_eq!(tree.loaded(&unit), None);
    }
}
