//! End-to-end sessions: several peers in one in-process hub, each with its
//! own buffer and editor, converging on the same document.

use std::rc::Rc;

use schemapad_collab::{
    CollabConfig, CollabSession, DocumentStore, LocalHub, MemoryPreferences, MemoryStore,
    SessionManager, SessionParams, DEFAULT_SCHEMA,
};
use schemapad_core::{EditorView, HeadlessEditor, TextBuffer, TextModel};
use tokio::task::LocalSet;
use tokio::time::{sleep, Duration};

struct Peer {
    model: Rc<TextBuffer>,
    editor: Rc<HeadlessEditor>,
    session: CollabSession<MemoryStore>,
}

impl Peer {
    fn open(hub: &Rc<LocalHub>, store: &Rc<MemoryStore>, params: &SessionParams, content: &str) -> Self {
        let manager = SessionManager::new(
            hub.clone(),
            store.clone(),
            Rc::new(MemoryPreferences::new()),
            CollabConfig::for_testing(),
        );
        let model = Rc::new(TextBuffer::new(content));
        let editor = Rc::new(HeadlessEditor::new(model.clone()));
        let editors: Vec<Rc<dyn EditorView>> = vec![editor.clone()];
        let session = manager.open(params.clone(), model.clone(), editors).unwrap();
        Self {
            model,
            editor,
            session,
        }
    }

    fn type_at(&self, offset: usize, text: &str) {
        self.editor.set_caret_offset(offset);
        self.editor.type_text(text).unwrap();
    }
}

async fn new_document(store: &Rc<MemoryStore>) -> SessionParams {
    let manager = SessionManager::new(
        Rc::new(LocalHub::default()),
        store.clone(),
        Rc::new(MemoryPreferences::new()),
        CollabConfig::for_testing(),
    );
    let record = manager.create("Blog", "").await.unwrap();
    SessionParams::from_record(&record).unwrap()
}

/// Let every message chain and due timer run.
async fn settle() {
    sleep(Duration::from_millis(5)).await;
}

#[tokio::test(start_paused = true)]
async fn test_late_joiner_receives_document() {
    LocalSet::new()
        .run_until(async {
            let hub = Rc::new(LocalHub::default());
            let store = Rc::new(MemoryStore::new());
            let params = new_document(&store).await;

            let alice = Peer::open(&hub, &store, &params, DEFAULT_SCHEMA);
            sleep(Duration::from_millis(50)).await;
            assert_eq!(alice.model.value(), DEFAULT_SCHEMA);

            let bob = Peer::open(&hub, &store, &params, "");
            settle().await;
            assert_eq!(bob.model.value(), DEFAULT_SCHEMA);
            assert_eq!(bob.session.text().text(), DEFAULT_SCHEMA);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_edits_converge() {
    LocalSet::new()
        .run_until(async {
            let hub = Rc::new(LocalHub::default());
            let store = Rc::new(MemoryStore::new());
            let params = new_document(&store).await;

            let alice = Peer::open(&hub, &store, &params, "type Query {}\n");
            sleep(Duration::from_millis(50)).await;
            let bob = Peer::open(&hub, &store, &params, "");
            let carol = Peer::open(&hub, &store, &params, "");
            settle().await;

            // Nobody has seen anybody else's edit yet.
            alice.type_at(alice.model.len(), "type A {}\n");
            bob.type_at(0, "# bob\n");
            carol.type_at(11, " id: ID ");
            settle().await;

            let expected = alice.model.value();
            assert_eq!(bob.model.value(), expected);
            assert_eq!(carol.model.value(), expected);
            assert_eq!(alice.session.text().text(), expected);
            assert!(expected.starts_with("# bob\n"));
            assert!(expected.contains(" id: ID "));
            assert!(expected.ends_with("type A {}\n"));
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_remote_insert_keeps_caret_after_text() {
    LocalSet::new()
        .run_until(async {
            let hub = Rc::new(LocalHub::default());
            let store = Rc::new(MemoryStore::new());
            let params = new_document(&store).await;

            let alice = Peer::open(&hub, &store, &params, "hello world");
            sleep(Duration::from_millis(50)).await;
            let bob = Peer::open(&hub, &store, &params, "");
            settle().await;

            bob.editor.set_caret_offset(11);
            alice.type_at(0, "XX ");
            settle().await;

            assert_eq!(bob.model.value(), "XX hello world");
            assert_eq!(bob.editor.selection_offsets(), Some((14, 14)));
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_present_peer_suppresses_cold_start() {
    LocalSet::new()
        .run_until(async {
            let hub = Rc::new(LocalHub::default());
            let store = Rc::new(MemoryStore::new());
            let params = new_document(&store).await;

            let alice = Peer::open(&hub, &store, &params, "type Alice");
            sleep(Duration::from_millis(50)).await;

            let bob = Peer::open(&hub, &store, &params, "type Bob");
            assert!(bob.session.cold_start_pending());
            settle().await;
            assert!(!bob.session.cold_start_pending());

            sleep(Duration::from_millis(100)).await;
            assert_eq!(bob.model.value(), "type Alice");
            assert_eq!(alice.model.value(), "type Alice");
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_only_lowest_client_saves() {
    LocalSet::new()
        .run_until(async {
            let hub = Rc::new(LocalHub::default());
            let store = Rc::new(MemoryStore::new());
            let params = new_document(&store).await;

            let alice = Peer::open(&hub, &store, &params, "type Query");
            sleep(Duration::from_millis(50)).await;
            let mut peers = vec![
                alice,
                Peer::open(&hub, &store, &params, ""),
                Peer::open(&hub, &store, &params, ""),
            ];
            sleep(Duration::from_millis(500)).await;

            let before = store.update_attempts();
            peers[0].type_at(0, "# one\n");
            sleep(Duration::from_millis(500)).await;
            assert_eq!(store.update_attempts(), before + 1);

            // The leader leaves; the next lowest id takes over.
            let leader = peers
                .iter()
                .enumerate()
                .min_by_key(|(_, peer)| peer.session.client_id())
                .map(|(i, _)| i)
                .unwrap();
            peers.remove(leader).session.close();
            settle().await;

            let before = store.update_attempts();
            peers[0].type_at(0, "# two\n");
            sleep(Duration::from_millis(500)).await;
            assert_eq!(store.update_attempts(), before + 1);

            let saved = store.fetch(&params.credential).await.unwrap().unwrap();
            assert_eq!(saved.sdl, peers[0].model.value());
            assert!(saved.sdl.starts_with("# two\n# one\n"));
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_closed_peer_stops_replicating() {
    LocalSet::new()
        .run_until(async {
            let hub = Rc::new(LocalHub::default());
            let store = Rc::new(MemoryStore::new());
            let params = new_document(&store).await;

            let alice = Peer::open(&hub, &store, &params, "type Query");
            sleep(Duration::from_millis(50)).await;
            let bob = Peer::open(&hub, &store, &params, "");
            settle().await;

            bob.session.close();
            alice.type_at(0, "# after\n");
            settle().await;

            assert_eq!(bob.model.value(), "type Query");
            assert_eq!(alice.model.value(), "# after\ntype Query");
        })
        .await;
}
