//! Session lifecycle: loading and creating schemas, joining the room for a
//! document and wiring binding, presence and persistence together.
//!
//! ```text
//! SessionManager::open(params)
//!   ├─ ReplicatedText (seeded from snapshot when present)
//!   ├─ Transport::join("session-{credential}")
//!   │     ├─ local updates ──► Room::broadcast_update
//!   │     └─ Room::on_update ──► ReplicatedText::apply_update
//!   ├─ DocumentBinding  (buffer ⇄ replicated text)
//!   ├─ PresenceTracker  (roster, remote selections)
//!   ├─ PersistenceCoordinator (debounced leader saves)
//!   └─ cold start: no snapshot and nobody answers in time
//!         → the buffer's starting content is inserted once
//! ```

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use schemapad_core::{
    ContentChange, EditorView, LineEnding, ListenerId, ReplicatedText, TextModel, UpdateOrigin,
};
use tokio::task::JoinHandle;
use yrs::Subscription;

use crate::binding::DocumentBinding;
use crate::config::{ColdStartPolicy, CollabConfig};
use crate::error::{CollabError, CollabResult};
use crate::persistence::PersistenceCoordinator;
use crate::preferences::Preferences;
use crate::presence::{random_color, random_name, PresenceTracker};
use crate::protocol::{ClientId, PeerState};
use crate::storage::{random_hash, DocumentStore, NewSchema, SchemaRecord};
use crate::transport::{Room, Transport};

/// Preference key holding the local display name.
pub const NAME_PREFERENCE_KEY: &str = "collaboratorName";

/// Content of a brand-new editor.
pub const DEFAULT_SCHEMA: &str = "# Start creating your schema!\ntype Query {\n  ping: Int!\n}\n";

/// Every peer holding `credential` meets in this room.
pub fn room_id_for(credential: &str) -> String {
    format!("session-{credential}")
}

/// What [`SessionManager::open`] needs to know about a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    pub credential: String,
    pub title: String,
    /// Stored replicated state, if the document has been saved before.
    pub snapshot: Option<Vec<u8>>,
}

impl SessionParams {
    /// `None` for read-only records, which never join a room.
    pub fn from_record(record: &SchemaRecord) -> Option<Self> {
        let credential = record.edit_credential.clone()?;
        Some(Self {
            credential,
            title: record.title.clone(),
            snapshot: (!record.snapshot.is_empty()).then(|| record.snapshot.clone()),
        })
    }
}

pub struct SessionManager<S: DocumentStore + 'static> {
    transport: Rc<dyn Transport>,
    store: Rc<S>,
    preferences: Rc<dyn Preferences>,
    config: CollabConfig,
}

impl<S: DocumentStore + 'static> SessionManager<S> {
    pub fn new(
        transport: Rc<dyn Transport>,
        store: Rc<S>,
        preferences: Rc<dyn Preferences>,
        config: CollabConfig,
    ) -> Self {
        Self {
            transport,
            store,
            preferences,
            config,
        }
    }

    pub fn config(&self) -> &CollabConfig {
        &self.config
    }

    pub fn store(&self) -> &Rc<S> {
        &self.store
    }

    /// Fetch by public id (read-only) or by `"{hash}:edit"` credential.
    pub async fn load(&self, id_or_credential: &str) -> CollabResult<Option<SchemaRecord>> {
        Ok(self.store.fetch(id_or_credential).await?)
    }

    /// Store a new schema under fresh random id and edit hash.
    pub async fn create(&self, title: &str, content: &str) -> CollabResult<SchemaRecord> {
        let title = title.trim();
        if title.is_empty() {
            return Err(CollabError::EmptyTitle);
        }
        let id = random_hash();
        let record = self
            .store
            .create(
                &id,
                NewSchema {
                    title: title.to_string(),
                    sdl: content.to_string(),
                    snapshot: Vec::new(),
                    edit_hash: random_hash(),
                },
            )
            .await?;
        log::info!("created schema {id}");
        Ok(record)
    }

    /// Display name from preferences, generated and stored on first use.
    pub fn local_name(&self) -> CollabResult<String> {
        if let Some(name) = self.preferences.get(NAME_PREFERENCE_KEY) {
            if !name.trim().is_empty() {
                return Ok(name);
            }
        }
        let name = random_name();
        self.preferences.set(NAME_PREFERENCE_KEY, &name)?;
        Ok(name)
    }

    /// Join the document's room with `model` shown in `editors`.
    ///
    /// Must be called inside a `tokio::task::LocalSet`.
    pub fn open(
        &self,
        params: SessionParams,
        model: Rc<dyn TextModel>,
        editors: Vec<Rc<dyn EditorView>>,
    ) -> CollabResult<CollabSession<S>> {
        let has_snapshot = params.snapshot.is_some();
        let text = match &params.snapshot {
            Some(snapshot) => ReplicatedText::from_snapshot(snapshot)?,
            None => ReplicatedText::new(),
        };
        let starting_content = LineEnding::Lf.normalize(&model.value());

        let room_id = room_id_for(&params.credential);
        let room = self.transport.join(&room_id);
        let name = self.local_name()?;
        room.set_local_state(Some(PeerState::new(name, random_color())));

        let weak_room: Weak<dyn Room> = Rc::downgrade(&room);
        let outgoing = text.observe_updates(move |origin, update| {
            if origin == UpdateOrigin::Local {
                if let Some(room) = weak_room.upgrade() {
                    room.broadcast_update(update);
                }
            }
        })?;
        let incoming = room.on_update(Box::new({
            let text = text.clone();
            move |update| {
                if let Err(e) = text.apply_update(update) {
                    log::warn!("dropping peer update: {e}");
                }
            }
        }));
        room.set_state_provider(Some(Box::new({
            let text = text.clone();
            move || text.encode_snapshot()
        })));

        let binding =
            DocumentBinding::attach(text.clone(), model.clone(), editors.clone(), Some(room.clone()));
        let presence = PresenceTracker::attach(room.clone(), text.clone(), model.clone(), editors);
        binding.set_presence(Some(presence.clone()));
        let persistence = PersistenceCoordinator::attach(
            text.clone(),
            room.clone(),
            self.store.clone(),
            self.config.persistence,
            Some(params.credential.clone()),
            params.title.clone(),
        )?;

        room.connect();
        log::info!(
            "client {} joined {room_id} ({})",
            room.client_id(),
            if has_snapshot { "from snapshot" } else { "cold" }
        );

        let cold_start = ColdStart::new(room.clone());
        let seed = !has_snapshot
            && self.config.cold_start == ColdStartPolicy::FirstWriterFallback
            && !starting_content.is_empty();
        if seed {
            ColdStart::arm(&cold_start, model, starting_content, self.config.cold_start_window());
        }

        Ok(CollabSession {
            room_id,
            room,
            text,
            binding,
            presence,
            persistence,
            outgoing: RefCell::new(Some(outgoing)),
            incoming: Cell::new(Some(incoming)),
            cold_start,
            closed: Cell::new(false),
        })
    }
}

/// The first-writer fallback timer and the listeners that cancel it.
struct ColdStart {
    room: Rc<dyn Room>,
    timer: RefCell<Option<JoinHandle<()>>>,
    listeners: RefCell<Vec<ListenerId>>,
    seeded: Cell<bool>,
}

impl ColdStart {
    fn new(room: Rc<dyn Room>) -> Rc<Self> {
        Rc::new(Self {
            room,
            timer: RefCell::new(None),
            listeners: RefCell::new(Vec::new()),
            seeded: Cell::new(false),
        })
    }

    fn arm(
        this: &Rc<Self>,
        model: Rc<dyn TextModel>,
        content: String,
        window: std::time::Duration,
    ) {
        let weak = Rc::downgrade(this);
        let on_change = this.room.on_change(Box::new({
            let weak = weak.clone();
            move |change| {
                if change.is_remote() {
                    if let Some(cold) = weak.upgrade() {
                        log::debug!("cold start cancelled by peer presence");
                        cold.cancel();
                    }
                }
            }
        }));
        let on_update = this.room.on_update(Box::new({
            let weak = weak.clone();
            move |_| {
                if let Some(cold) = weak.upgrade() {
                    log::debug!("cold start cancelled by peer update");
                    cold.cancel();
                }
            }
        }));
        this.listeners.borrow_mut().extend([on_change, on_update]);

        let handle = tokio::task::spawn_local(async move {
            tokio::time::sleep(window).await;
            let Some(cold) = weak.upgrade() else {
                return;
            };
            cold.timer.take();
            cold.remove_listeners();
            if cold.seeded.replace(true) {
                return;
            }
            log::info!("no peers answered, seeding {} bytes", content.len());
            if let Err(e) = model.apply_edits(&[ContentChange::insert(0, content)]) {
                log::error!("cold start seeding failed: {e}");
            }
        });
        *this.timer.borrow_mut() = Some(handle);
    }

    fn is_armed(&self) -> bool {
        self.timer.borrow().is_some()
    }

    fn cancel(&self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.remove_listeners();
    }

    fn remove_listeners(&self) {
        for id in self.listeners.take() {
            self.room.remove_listener(id);
        }
    }
}

/// One peer's participation in one document's room.
///
/// Dropping the session closes it.
pub struct CollabSession<S: DocumentStore + 'static> {
    room_id: String,
    room: Rc<dyn Room>,
    text: ReplicatedText,
    binding: DocumentBinding,
    presence: PresenceTracker,
    persistence: PersistenceCoordinator<S>,
    outgoing: RefCell<Option<Subscription>>,
    incoming: Cell<Option<ListenerId>>,
    cold_start: Rc<ColdStart>,
    closed: Cell<bool>,
}

impl<S: DocumentStore + 'static> CollabSession<S> {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn client_id(&self) -> ClientId {
        self.room.client_id()
    }

    pub fn room(&self) -> &Rc<dyn Room> {
        &self.room
    }

    pub fn text(&self) -> &ReplicatedText {
        &self.text
    }

    pub fn binding(&self) -> &DocumentBinding {
        &self.binding
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn persistence(&self) -> &PersistenceCoordinator<S> {
        &self.persistence
    }

    pub fn is_saving(&self) -> bool {
        self.persistence.is_saving()
    }

    /// Whether the first-writer fallback is still waiting.
    pub fn cold_start_pending(&self) -> bool {
        self.cold_start.is_armed()
    }

    /// Rename the local participant and remember the name for later
    /// sessions.
    pub fn change_name(&self, name: &str, preferences: &dyn Preferences) -> CollabResult<bool> {
        self.ensure_open()?;
        if !self.presence.change_name(name) {
            return Ok(false);
        }
        preferences.set(NAME_PREFERENCE_KEY, name.trim())?;
        Ok(true)
    }

    pub fn set_title(&self, title: &str) -> CollabResult<()> {
        self.ensure_open()?;
        self.persistence.set_title(title.trim());
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    /// Tear everything down and leave the room. Safe to call more than
    /// once; an in-flight save still completes.
    pub fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        self.cold_start.cancel();
        self.binding.dispose();
        self.presence.dispose();
        self.persistence.dispose();
        self.outgoing.take();
        if let Some(id) = self.incoming.take() {
            self.room.remove_listener(id);
        }
        self.room.set_state_provider(None);
        self.room.set_local_state(None);
        self.room.disconnect();
        log::info!("client {} left {}", self.room.client_id(), self.room_id);
    }

    fn ensure_open(&self) -> CollabResult<()> {
        if self.closed.get() {
            return Err(CollabError::SessionClosed(self.room_id.clone()));
        }
        Ok(())
    }
}

impl<S: DocumentStore + 'static> Drop for CollabSession<S> {
    fn drop(&mut self) {
        self.close();
    }
}
