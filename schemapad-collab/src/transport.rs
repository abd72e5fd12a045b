//! Transport boundary: rooms of peers exchanging document updates and
//! presence state.

use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use schemapad_core::ListenerId;

use crate::protocol::{ClientId, PeerState};

/// Joins rooms by name.
pub trait Transport {
    fn join(&self, room_id: &str) -> Rc<dyn Room>;
}

/// Who caused an awareness change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChangeOrigin {
    #[default]
    Local,
    Remote,
}

/// Client ids whose presence state changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
    pub origin: ChangeOrigin,
}

impl AwarenessChange {
    pub fn is_remote(&self) -> bool {
        self.origin == ChangeOrigin::Remote
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Every client id mentioned by the change.
    pub fn changed(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.added
            .iter()
            .chain(&self.updated)
            .chain(&self.removed)
            .copied()
    }
}

/// Produces the full document state sent to joining peers.
pub type StateProvider = Box<dyn Fn() -> Vec<u8>>;

/// One membership in a room.
pub trait Room {
    fn room_id(&self) -> &str;

    fn client_id(&self) -> ClientId;

    fn local_state(&self) -> Option<PeerState>;

    /// Publish (or with `None`, withdraw) this peer's presence state.
    fn set_local_state(&self, state: Option<PeerState>);

    /// Presence states of every known peer, the local one included.
    fn states(&self) -> BTreeMap<ClientId, PeerState>;

    /// Ids of the connected peers. Always contains the local id.
    fn peer_ids(&self) -> BTreeSet<ClientId> {
        let mut ids: BTreeSet<ClientId> = self.states().into_keys().collect();
        ids.insert(self.client_id());
        ids
    }

    fn on_change(&self, callback: Box<dyn Fn(&AwarenessChange)>) -> ListenerId;

    /// Document updates received from peers.
    fn on_update(&self, callback: Box<dyn Fn(&[u8])>) -> ListenerId;

    fn remove_listener(&self, id: ListenerId) -> bool;

    fn broadcast_update(&self, update: &[u8]);

    fn set_state_provider(&self, provider: Option<StateProvider>);

    fn connect(&self);

    fn disconnect(&self);

    fn is_connected(&self) -> bool;
}

/// Modify the local presence state in place. Does nothing while no local
/// state is published.
pub fn update_local_state(room: &dyn Room, f: impl FnOnce(&mut PeerState)) -> bool {
    match room.local_state() {
        Some(mut state) => {
            f(&mut state);
            room.set_local_state(Some(state));
            true
        }
        None => false,
    }
}
