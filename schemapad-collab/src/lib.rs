//! # schemapad-collab: Real-time collaboration for the schemapad editor
//!
//! Keeps an editor buffer in sync with a replicated text shared by every
//! peer in a room, shows who else is editing and where, and saves the
//! converged document.
//!
//! ## Architecture
//!
//! ```text
//!  ┌────────────┐  edits   ┌─────────────────┐  updates  ┌──────────┐
//!  │ TextModel  │ ◄──────► │ DocumentBinding │ ◄───────► │   Room   │
//!  │ EditorView │          └────────┬────────┘           │ (LocalHub│
//!  └─────┬──────┘                   │                    │  pump)   │
//!        │ decorations     ┌────────┴────────┐  presence └────┬─────┘
//!        └──────────────── │ PresenceTracker │ ◄──────────────┘
//!                          └─────────────────┘
//!                 ┌────────────────────────┐   update   ┌───────────────┐
//!                 │ PersistenceCoordinator │ ─────────► │ DocumentStore │
//!                 └────────────────────────┘            └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`binding`]: buffer ⇄ replicated text, selection capture and restore
//! - [`presence`]: roster and remote selection rendering
//! - [`persistence`]: debounced, leader-elected saving
//! - [`session`]: loading, creating, opening and closing documents
//! - [`transport`] / [`broadcast`]: rooms and the in-process hub
//! - [`protocol`]: bincode-encoded room messages
//! - [`storage`]: memory and RocksDB stores

pub mod binding;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod persistence;
pub mod preferences;
pub mod presence;
pub mod protocol;
pub mod session;
pub mod storage;
pub mod transport;

pub use binding::{BindingError, DocumentBinding, SyncGate};
pub use broadcast::{BroadcastGroup, BroadcastStats, LocalHub, LocalRoom};
pub use config::{ColdStartPolicy, CollabConfig, ConfigError, PersistenceConfig};
pub use error::{CollabError, CollabResult};
pub use persistence::{is_leader, PersistenceCoordinator};
pub use preferences::{FilePreferences, MemoryPreferences, Preferences};
pub use presence::{
    font_color_for_background, random_color, random_name, Collaborator, PresenceTracker,
    RemoteHighlight, Roster,
};
pub use protocol::{ClientId, MessageType, PeerSelection, PeerState, ProtocolError, SyncMessage};
pub use session::{
    room_id_for, CollabSession, SessionManager, SessionParams, DEFAULT_SCHEMA,
    NAME_PREFERENCE_KEY,
};
pub use storage::{
    DocumentStore, MemoryStore, NewSchema, RocksStore, SchemaPatch, SchemaRecord, StoreConfig,
    StoreError,
};
pub use transport::{AwarenessChange, ChangeOrigin, Room, Transport};
