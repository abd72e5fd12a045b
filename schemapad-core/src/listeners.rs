//! Single-threaded callback registry.
//!
//! Every event source in the workspace (buffer content changes, editor
//! selections, room awareness and updates, roster changes) keeps one
//! [`Listeners`] per event kind. Callbacks are `Rc`-shared and the list is
//! snapshotted before dispatch, so a callback may subscribe or unsubscribe
//! while the event is being delivered.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Handle returned by `subscribe`, unique across all registries in the
/// process so one `remove_listener` can serve several event kinds.
pub type ListenerId = u64;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

type Callback<E> = Rc<dyn Fn(&E)>;

pub struct Listeners<E: ?Sized> {
    callbacks: RefCell<Vec<(ListenerId, Callback<E>)>>,
}

impl<E: ?Sized> Listeners<E> {
    pub fn new() -> Self {
        Self {
            callbacks: RefCell::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, callback: impl Fn(&E) + 'static) -> ListenerId {
        self.subscribe_rc(Rc::new(callback))
    }

    /// Register an already boxed callback (trait-object boundaries hand
    /// these over).
    pub fn subscribe_boxed(&self, callback: Box<dyn Fn(&E)>) -> ListenerId {
        self.subscribe_rc(Rc::from(callback))
    }

    fn subscribe_rc(&self, callback: Callback<E>) -> ListenerId {
        let id = NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed);
        self.callbacks.borrow_mut().push((id, callback));
        id
    }

    /// Returns `true` if the id was registered here.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut callbacks = self.callbacks.borrow_mut();
        let before = callbacks.len();
        callbacks.retain(|(cb_id, _)| *cb_id != id);
        callbacks.len() != before
    }

    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Callback<E>> = self
            .callbacks
            .borrow()
            .iter()
            .map(|(_, cb)| Rc::clone(cb))
            .collect();
        for callback in snapshot {
            callback(event);
        }
    }

    pub fn len(&self) -> usize {
        self.callbacks.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.borrow().is_empty()
    }

    pub fn clear(&self) {
        self.callbacks.borrow_mut().clear();
    }
}

impl<E: ?Sized> Default for Listeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: ?Sized> fmt::Debug for Listeners<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.len())
            .finish()
    }
}
