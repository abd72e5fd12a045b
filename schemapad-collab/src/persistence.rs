//! Debounced, leader-elected saving of the shared document.
//!
//! Every committed update of the replicated text pushes a flush deadline
//! `debounce` into the future, but never past `max_wait` after the first
//! update of the burst. When the deadline fires, only the peer with the
//! smallest client id writes, and only if the session holds an edit
//! credential. A newer flush aborts the one still in flight.

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::rc::{Rc, Weak};

use schemapad_core::ReplicatedText;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use yrs::Subscription;

use crate::config::PersistenceConfig;
use crate::error::CollabResult;
use crate::protocol::ClientId;
use crate::storage::{DocumentStore, SchemaPatch};
use crate::transport::Room;

/// Whether `local` is the elected writer among `peers`. The local id
/// counts as connected even when `peers` omits it.
pub fn is_leader(local: ClientId, peers: &BTreeSet<ClientId>) -> bool {
    peers.iter().all(|peer| local <= *peer)
}

/// A write that has been spawned and not yet observed to finish.
struct SaveTask {
    generation: u64,
    handle: JoinHandle<()>,
}

struct SavingCounter {
    count: Cell<usize>,
    tx: watch::Sender<bool>,
}

impl SavingCounter {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            count: Cell::new(0),
            tx,
        }
    }

    fn publish(&self) {
        self.tx.send_replace(self.count.get() > 0);
    }
}

/// Held by a save task for its whole life, including cancellation.
struct SavingGuard(Rc<SavingCounter>);

impl SavingGuard {
    fn new(counter: Rc<SavingCounter>) -> Self {
        counter.count.set(counter.count.get() + 1);
        counter.publish();
        Self(counter)
    }
}

impl Drop for SavingGuard {
    fn drop(&mut self) {
        let count = self.0.count.get().saturating_sub(1);
        self.0.count.set(count);
        self.0.publish();
    }
}

struct PersistInner<S> {
    text: ReplicatedText,
    store: Rc<S>,
    room: Rc<dyn Room>,
    config: PersistenceConfig,
    credential: RefCell<Option<String>>,
    title: RefCell<String>,
    timer: RefCell<Option<JoinHandle<()>>>,
    burst_started: Cell<Option<Instant>>,
    in_flight: RefCell<Option<SaveTask>>,
    generation: Cell<u64>,
    saving: Rc<SavingCounter>,
    subscription: RefCell<Option<Subscription>>,
}

/// Saves the replicated text through a [`DocumentStore`].
///
/// Must live inside a `tokio::task::LocalSet`. Dropping the coordinator
/// disposes it.
pub struct PersistenceCoordinator<S: DocumentStore + 'static> {
    inner: Rc<PersistInner<S>>,
}

impl<S: DocumentStore + 'static> PersistenceCoordinator<S> {
    /// Start observing `text`. Without a credential the coordinator
    /// schedules flushes but never writes.
    pub fn attach(
        text: ReplicatedText,
        room: Rc<dyn Room>,
        store: Rc<S>,
        config: PersistenceConfig,
        credential: Option<String>,
        title: impl Into<String>,
    ) -> CollabResult<Self> {
        let inner = Rc::new(PersistInner {
            text,
            store,
            room,
            config,
            credential: RefCell::new(credential),
            title: RefCell::new(title.into()),
            timer: RefCell::new(None),
            burst_started: Cell::new(None),
            in_flight: RefCell::new(None),
            generation: Cell::new(0),
            saving: Rc::new(SavingCounter::new()),
            subscription: RefCell::new(None),
        });

        let weak = Rc::downgrade(&inner);
        let subscription = inner.text.observe_updates(move |_origin, _update| {
            if let Some(inner) = weak.upgrade() {
                PersistInner::schedule(&inner);
            }
        })?;
        *inner.subscription.borrow_mut() = Some(subscription);

        Ok(Self { inner })
    }

    /// Cancel the pending deadline and flush right away. Returns whether a
    /// write was started.
    pub fn flush_now(&self) -> bool {
        if let Some(timer) = self.inner.timer.take() {
            timer.abort();
        }
        PersistInner::flush(&self.inner)
    }

    pub fn is_saving(&self) -> bool {
        self.inner.saving.count.get() > 0
    }

    /// Follows [`PersistenceCoordinator::is_saving`].
    pub fn saving_indicator(&self) -> watch::Receiver<bool> {
        self.inner.saving.tx.subscribe()
    }

    /// Save tasks not yet finished or torn down.
    pub fn in_flight_count(&self) -> usize {
        self.inner.saving.count.get()
    }

    pub fn has_pending_flush(&self) -> bool {
        self.inner.timer.borrow().is_some()
    }

    pub fn title(&self) -> String {
        self.inner.title.borrow().clone()
    }

    /// Title written by the next flush.
    pub fn set_title(&self, title: impl Into<String>) {
        *self.inner.title.borrow_mut() = title.into();
    }

    pub fn credential(&self) -> Option<String> {
        self.inner.credential.borrow().clone()
    }

    pub fn set_credential(&self, credential: Option<String>) {
        *self.inner.credential.borrow_mut() = credential;
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.subscription.borrow().is_none()
    }

    /// Stop observing and drop the pending deadline. A write already in
    /// flight runs to completion.
    pub fn dispose(&self) {
        let inner = &self.inner;
        if inner.subscription.take().is_none() {
            return;
        }
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        inner.burst_started.set(None);
        log::debug!("persistence disposed");
    }
}

impl<S: DocumentStore + 'static> Drop for PersistenceCoordinator<S> {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl<S: DocumentStore + 'static> PersistInner<S> {
    fn schedule(this: &Rc<Self>) {
        let now = Instant::now();
        let started = this.burst_started.get().unwrap_or(now);
        this.burst_started.set(Some(started));
        let deadline = (now + this.config.debounce()).min(started + this.config.max_wait());

        if let Some(timer) = this.timer.take() {
            timer.abort();
        }
        let weak: Weak<Self> = Rc::downgrade(this);
        let handle = tokio::task::spawn_local(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = weak.upgrade() {
                inner.timer.take();
                Self::flush(&inner);
            }
        });
        *this.timer.borrow_mut() = Some(handle);
    }

    fn flush(this: &Rc<Self>) -> bool {
        this.burst_started.set(None);

        let Some(credential) = this.credential.borrow().clone() else {
            log::trace!("flush skipped: read-only session");
            return false;
        };
        let local = this.room.client_id();
        if !is_leader(local, &this.room.peer_ids()) {
            log::trace!("flush skipped: {local} is not the leader");
            return false;
        }
        let Some((sdl, snapshot)) = this
            .text
            .with_read(|txn| (this.text.text_in(txn), this.text.snapshot_in(txn)))
        else {
            log::warn!("flush skipped: document is mid-transaction");
            return false;
        };

        if let Some(previous) = this.in_flight.take() {
            log::debug!("preempting save #{}", previous.generation);
            previous.handle.abort();
        }

        let generation = this.generation.get() + 1;
        this.generation.set(generation);
        let patch = SchemaPatch {
            title: Some(this.title.borrow().clone()),
            sdl: Some(sdl),
            snapshot: Some(snapshot),
        };
        let guard = SavingGuard::new(this.saving.clone());
        let store = this.store.clone();
        let weak = Rc::downgrade(this);
        let handle = tokio::task::spawn_local(async move {
            let _guard = guard;
            match store.update(&credential, patch).await {
                Ok(true) => log::debug!("save #{generation} written"),
                Ok(false) => log::warn!("save #{generation}: no document for credential"),
                Err(e) => log::warn!("save #{generation} failed: {e}"),
            }
            if let Some(inner) = weak.upgrade() {
                let mut slot = inner.in_flight.borrow_mut();
                if slot.as_ref().is_some_and(|task| task.generation == generation) {
                    slot.take();
                }
            }
        });
        *this.in_flight.borrow_mut() = Some(SaveTask { generation, handle });
        true
    }
}
