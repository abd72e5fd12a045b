//! In-process room transport.
//!
//! Every room is a tokio broadcast channel carrying pre-encoded
//! [`SyncMessage`]s. Each connected [`LocalRoom`] owns a receiver drained
//! by a pump task, so a message is always handled on a later tick than
//! the one that sent it and no handler runs inside the sender's
//! transaction.
//!
//! ```text
//! LocalRoom A ──send──► broadcast::Sender ──► pump(B) ──► LocalRoom B
//!                              │
//!                              └────────────► pump(C) ──► LocalRoom C
//! ```
//!
//! Joining runs a two-step handshake: the newcomer broadcasts its full
//! state (SyncStep1), every peer merges it and answers with its own full
//! state addressed to the newcomer (SyncStep2). A receiver that lags
//! behind the channel capacity drops its backlog and repeats the
//! handshake.
//!
//! All of this is single-threaded: rooms must be used inside a
//! `tokio::task::LocalSet`.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::{Rc, Weak};
use std::sync::Arc;

use schemapad_core::{ListenerId, Listeners};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::protocol::{
    AwarenessUpdate, ClientId, MessageType, PeerState, ProtocolError, SyncMessage,
};
use crate::transport::{AwarenessChange, ChangeOrigin, Room, StateProvider, Transport};

/// Counters for one room channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub lagged_receivers: u64,
    pub active_peers: usize,
}

/// The channel shared by all members of one room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    members: RefCell<BTreeSet<ClientId>>,
    // ids held by joined rooms, connected or not
    reserved: RefCell<BTreeSet<ClientId>>,
    capacity: usize,
    messages_sent: Cell<u64>,
    lagged_receivers: Cell<u64>,
}

impl BroadcastGroup {
    /// `capacity` bounds how many messages a receiver may fall behind
    /// before it lags.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            members: RefCell::new(BTreeSet::new()),
            reserved: RefCell::new(BTreeSet::new()),
            capacity,
            messages_sent: Cell::new(0),
            lagged_receivers: Cell::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }

    /// Encode and fan out a message. Returns the number of receivers,
    /// the sender's own included.
    pub fn send(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let encoded = Arc::new(msg.encode()?);
        Ok(self.send_raw(encoded))
    }

    pub fn send_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.messages_sent.set(self.messages_sent.get() + 1);
        count
    }

    pub fn add_member(&self, client_id: ClientId) -> bool {
        self.members.borrow_mut().insert(client_id)
    }

    pub fn remove_member(&self, client_id: ClientId) -> bool {
        self.members.borrow_mut().remove(&client_id)
    }

    pub fn has_member(&self, client_id: ClientId) -> bool {
        self.members.borrow().contains(&client_id)
    }

    pub fn member_count(&self) -> usize {
        self.members.borrow().len()
    }

    /// Claim a client id for a joined room. `false` if it is already held.
    pub fn reserve(&self, client_id: ClientId) -> bool {
        self.reserved.borrow_mut().insert(client_id)
    }

    pub fn release(&self, client_id: ClientId) -> bool {
        self.reserved.borrow_mut().remove(&client_id)
    }

    pub fn is_reserved(&self, client_id: ClientId) -> bool {
        self.reserved.borrow().contains(&client_id)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.get(),
            lagged_receivers: self.lagged_receivers.get(),
            active_peers: self.member_count(),
        }
    }

    fn record_lag(&self) {
        self.lagged_receivers.set(self.lagged_receivers.get() + 1);
    }
}

// ───────────────────────────────────────────────────────────────────
// Hub
// ───────────────────────────────────────────────────────────────────

/// Maps room names to broadcast groups.
pub struct LocalHub {
    rooms: RefCell<HashMap<String, Rc<BroadcastGroup>>>,
    capacity: usize,
}

impl LocalHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: RefCell::new(HashMap::new()),
            capacity,
        }
    }

    pub fn group(&self, room_id: &str) -> Rc<BroadcastGroup> {
        self.rooms
            .borrow_mut()
            .entry(room_id.to_string())
            .or_insert_with(|| Rc::new(BroadcastGroup::new(self.capacity)))
            .clone()
    }

    /// Join with a chosen client id. Leader election picks the lowest id,
    /// so tests use this to fix the outcome.
    pub fn join_as(&self, room_id: &str, client_id: ClientId) -> Rc<LocalRoom> {
        let group = self.group(room_id);
        if !group.reserve(client_id) {
            log::warn!("client id {client_id} is already in use in room {room_id}");
        }
        log::debug!("client {client_id} joining room {room_id}");
        Rc::new(LocalRoom::new(room_id, client_id, group))
    }

    /// Drop the channel of a room nobody has joined.
    pub fn remove_if_empty(&self, room_id: &str) -> bool {
        let mut rooms = self.rooms.borrow_mut();
        let empty = rooms
            .get(room_id)
            .is_some_and(|g| g.member_count() == 0 && g.reserved.borrow().is_empty());
        if empty {
            rooms.remove(room_id);
        }
        empty
    }

    pub fn room_count(&self) -> usize {
        self.rooms.borrow().len()
    }

    fn fresh_client_id(group: &BroadcastGroup) -> ClientId {
        loop {
            let id = (Uuid::new_v4().as_u128() & 0xFFFF_FFFF) as ClientId;
            if !group.is_reserved(id) && !group.has_member(id) {
                return id;
            }
        }
    }
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Transport for LocalHub {
    fn join(&self, room_id: &str) -> Rc<dyn Room> {
        let client_id = Self::fresh_client_id(&self.group(room_id));
        self.join_as(room_id, client_id)
    }
}

// ───────────────────────────────────────────────────────────────────
// Room membership
// ───────────────────────────────────────────────────────────────────

struct RoomInner {
    room_id: String,
    client_id: ClientId,
    group: Rc<BroadcastGroup>,
    local_state: RefCell<Option<PeerState>>,
    remote_states: RefCell<BTreeMap<ClientId, PeerState>>,
    remote_clocks: RefCell<HashMap<ClientId, u64>>,
    clock: Cell<u64>,
    change_listeners: Listeners<AwarenessChange>,
    update_listeners: Listeners<[u8]>,
    state_provider: RefCell<Option<StateProvider>>,
    pump: RefCell<Option<JoinHandle<()>>>,
    connected: Cell<bool>,
}

/// A peer's membership in a [`LocalHub`] room.
pub struct LocalRoom {
    inner: Rc<RoomInner>,
}

impl LocalRoom {
    fn new(room_id: &str, client_id: ClientId, group: Rc<BroadcastGroup>) -> Self {
        Self {
            inner: Rc::new(RoomInner {
                room_id: room_id.to_string(),
                client_id,
                group,
                local_state: RefCell::new(None),
                remote_states: RefCell::new(BTreeMap::new()),
                remote_clocks: RefCell::new(HashMap::new()),
                clock: Cell::new(0),
                change_listeners: Listeners::new(),
                update_listeners: Listeners::new(),
                state_provider: RefCell::new(None),
                pump: RefCell::new(None),
                connected: Cell::new(false),
            }),
        }
    }

    pub fn group(&self) -> Rc<BroadcastGroup> {
        self.inner.group.clone()
    }
}

impl RoomInner {
    fn send(&self, msg: &SyncMessage) {
        if let Err(e) = self.group.send(msg) {
            log::warn!("room {}: dropping {:?} message: {e}", self.room_id, msg.msg_type);
        }
    }

    fn next_clock(&self) -> u64 {
        let clock = self.clock.get() + 1;
        self.clock.set(clock);
        clock
    }

    fn full_state(&self) -> Option<Vec<u8>> {
        self.state_provider.borrow().as_ref().map(|provider| provider())
    }

    fn send_awareness(&self) {
        let update = AwarenessUpdate {
            clock: self.clock.get(),
            state: self.local_state.borrow().clone(),
        };
        match SyncMessage::awareness(self.client_id, &update) {
            Ok(msg) => self.send(&msg),
            Err(e) => log::warn!("room {}: cannot encode presence: {e}", self.room_id),
        }
    }

    /// Handshake sent on connect and after lagging.
    fn announce(&self) {
        let state = self.full_state().unwrap_or_default();
        self.send(&SyncMessage::sync_step1(self.client_id, state));
        if self.local_state.borrow().is_some() {
            self.send_awareness();
        }
        self.send(&SyncMessage::awareness_query(self.client_id));
    }

    fn emit_update(&self, update: &[u8]) {
        if !update.is_empty() {
            self.update_listeners.emit(update);
        }
    }

    fn handle(&self, bytes: &[u8]) {
        let msg = match SyncMessage::decode(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("room {}: undecodable message: {e}", self.room_id);
                return;
            }
        };
        if !msg.is_for(self.client_id) {
            return;
        }
        log::trace!(
            "room {}: client {} got {:?} from {}",
            self.room_id,
            self.client_id,
            msg.msg_type,
            msg.from
        );
        match msg.msg_type {
            MessageType::SyncStep1 => {
                self.emit_update(&msg.payload);
                if let Some(state) = self.full_state() {
                    self.send(&SyncMessage::sync_step2(self.client_id, msg.from, state));
                }
            }
            MessageType::SyncStep2 | MessageType::Update => self.emit_update(&msg.payload),
            MessageType::Awareness => match msg.awareness_update() {
                Ok(update) => self.apply_remote_awareness(msg.from, update),
                Err(e) => log::warn!("room {}: bad presence from {}: {e}", self.room_id, msg.from),
            },
            MessageType::AwarenessQuery => {
                if self.local_state.borrow().is_some() {
                    self.send_awareness();
                }
            }
            MessageType::Leave => self.remove_peer(msg.from),
        }
    }

    fn apply_remote_awareness(&self, from: ClientId, update: AwarenessUpdate) {
        {
            let mut clocks = self.remote_clocks.borrow_mut();
            if clocks.get(&from).is_some_and(|known| update.clock < *known) {
                log::trace!("room {}: stale presence from {from}", self.room_id);
                return;
            }
            clocks.insert(from, update.clock);
        }
        let mut change = AwarenessChange {
            origin: ChangeOrigin::Remote,
            ..AwarenessChange::default()
        };
        {
            let mut states = self.remote_states.borrow_mut();
            match update.state {
                Some(state) => match states.insert(from, state.clone()) {
                    None => change.added.push(from),
                    Some(previous) if previous != state => change.updated.push(from),
                    Some(_) => {}
                },
                None => {
                    if states.remove(&from).is_some() {
                        change.removed.push(from);
                    }
                }
            }
        }
        if !change.is_empty() {
            self.change_listeners.emit(&change);
        }
    }

    fn remove_peer(&self, peer: ClientId) {
        self.remote_clocks.borrow_mut().remove(&peer);
        let removed = self.remote_states.borrow_mut().remove(&peer).is_some();
        if removed {
            self.change_listeners.emit(&AwarenessChange {
                removed: vec![peer],
                origin: ChangeOrigin::Remote,
                ..AwarenessChange::default()
            });
        }
    }
}

async fn pump(room: Weak<RoomInner>, mut rx: broadcast::Receiver<Arc<Vec<u8>>>) {
    loop {
        let received = rx.recv().await;
        let Some(inner) = room.upgrade() else {
            break;
        };
        match received {
            Ok(bytes) => inner.handle(&bytes),
            Err(RecvError::Lagged(skipped)) => {
                log::warn!(
                    "room {}: client {} lagged by {skipped} messages, resyncing",
                    inner.room_id,
                    inner.client_id
                );
                inner.group.record_lag();
                // skip what is left of the backlog; the handshake replaces it
                rx = rx.resubscribe();
                inner.announce();
            }
            Err(RecvError::Closed) => break,
        }
    }
}

impl Room for LocalRoom {
    fn room_id(&self) -> &str {
        &self.inner.room_id
    }

    fn client_id(&self) -> ClientId {
        self.inner.client_id
    }

    fn local_state(&self) -> Option<PeerState> {
        self.inner.local_state.borrow().clone()
    }

    fn set_local_state(&self, state: Option<PeerState>) {
        let inner = &self.inner;
        let previous = inner.local_state.replace(state.clone());
        inner.next_clock();
        if inner.connected.get() {
            inner.send_awareness();
        }

        let id = inner.client_id;
        let mut change = AwarenessChange::default();
        match (previous, state) {
            (None, Some(_)) => change.added.push(id),
            (Some(prev), Some(next)) if prev != next => change.updated.push(id),
            (Some(_), None) => change.removed.push(id),
            _ => {}
        }
        if !change.is_empty() {
            inner.change_listeners.emit(&change);
        }
    }

    fn states(&self) -> BTreeMap<ClientId, PeerState> {
        let mut states = self.inner.remote_states.borrow().clone();
        if let Some(local) = self.inner.local_state.borrow().clone() {
            states.insert(self.inner.client_id, local);
        }
        states
    }

    fn on_change(&self, callback: Box<dyn Fn(&AwarenessChange)>) -> ListenerId {
        self.inner.change_listeners.subscribe_boxed(callback)
    }

    fn on_update(&self, callback: Box<dyn Fn(&[u8])>) -> ListenerId {
        self.inner.update_listeners.subscribe_boxed(callback)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.change_listeners.unsubscribe(id) || self.inner.update_listeners.unsubscribe(id)
    }

    fn broadcast_update(&self, update: &[u8]) {
        let inner = &self.inner;
        if !inner.connected.get() {
            log::trace!("room {}: not connected, update held back", inner.room_id);
            return;
        }
        let clock = inner.next_clock();
        inner.send(&SyncMessage::update(inner.client_id, clock, update.to_vec()));
    }

    fn set_state_provider(&self, provider: Option<StateProvider>) {
        *self.inner.state_provider.borrow_mut() = provider;
    }

    fn connect(&self) {
        let inner = &self.inner;
        if inner.connected.replace(true) {
            return;
        }
        inner.group.add_member(inner.client_id);
        let rx = inner.group.subscribe();
        let handle = tokio::task::spawn_local(pump(Rc::downgrade(inner), rx));
        *inner.pump.borrow_mut() = Some(handle);
        log::debug!("client {} connected to room {}", inner.client_id, inner.room_id);
        inner.announce();
    }

    fn disconnect(&self) {
        let inner = &self.inner;
        if !inner.connected.replace(false) {
            return;
        }
        let withdrawn = AwarenessUpdate {
            clock: inner.next_clock(),
            state: None,
        };
        if let Ok(msg) = SyncMessage::awareness(inner.client_id, &withdrawn) {
            inner.send(&msg);
        }
        inner.send(&SyncMessage::leave(inner.client_id));

        if let Some(handle) = inner.pump.borrow_mut().take() {
            handle.abort();
        }
        inner.group.remove_member(inner.client_id);
        inner.remote_clocks.borrow_mut().clear();
        let removed: Vec<ClientId> = inner.remote_states.take().into_keys().collect();
        log::debug!("client {} left room {}", inner.client_id, inner.room_id);
        if !removed.is_empty() {
            inner.change_listeners.emit(&AwarenessChange {
                removed,
                ..AwarenessChange::default()
            });
        }
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.get()
    }
}

impl Drop for LocalRoom {
    fn drop(&mut self) {
        self.disconnect();
        self.inner.group.release(self.inner.client_id);
    }
}
