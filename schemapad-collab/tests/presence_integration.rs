//! Presence across sessions: roster, remote selection rendering, renames
//! and departures.

use std::cell::RefCell;
use std::rc::Rc;

use schemapad_collab::{
    CollabConfig, CollabSession, LocalHub, MemoryPreferences, MemoryStore, Preferences,
    SessionManager, SessionParams, NAME_PREFERENCE_KEY,
};
use schemapad_core::{EditorView, HeadlessEditor, TextBuffer, WidgetPlacement};
use tokio::task::LocalSet;
use tokio::time::{sleep, Duration};

struct Peer {
    prefs: Rc<MemoryPreferences>,
    editor: Rc<HeadlessEditor>,
    session: CollabSession<MemoryStore>,
}

fn open_peer(hub: &Rc<LocalHub>, name: &str, content: &str) -> Peer {
    let prefs = Rc::new(MemoryPreferences::new());
    prefs.set(NAME_PREFERENCE_KEY, name).unwrap();
    let manager = SessionManager::new(
        hub.clone(),
        Rc::new(MemoryStore::new()),
        prefs.clone(),
        CollabConfig::for_testing(),
    );
    let model = Rc::new(TextBuffer::new(content));
    let editor = Rc::new(HeadlessEditor::new(model.clone()));
    let editors: Vec<Rc<dyn EditorView>> = vec![editor.clone()];
    let params = SessionParams {
        credential: "presence:edit".into(),
        title: "t".into(),
        snapshot: None,
    };
    let session = manager.open(params, model, editors).unwrap();
    Peer {
        prefs,
        editor,
        session,
    }
}

async fn settle() {
    sleep(Duration::from_millis(5)).await;
}

#[tokio::test(start_paused = true)]
async fn test_roster_splits_viewer_and_collaborators() {
    LocalSet::new()
        .run_until(async {
            let hub = Rc::new(LocalHub::default());
            let alice = open_peer(&hub, "Alice", "type Query");
            sleep(Duration::from_millis(50)).await;
            let bob = open_peer(&hub, "Bob", "");
            settle().await;

            let roster = alice.session.presence().roster();
            assert_eq!(roster.viewer.map(|v| v.name).as_deref(), Some("Alice"));
            assert_eq!(roster.collaborators.len(), 1);
            assert_eq!(roster.collaborators[0].name, "Bob");
            assert_eq!(roster.collaborators[0].id, bob.session.client_id());

            let roster = bob.session.presence().roster();
            assert_eq!(roster.viewer.map(|v| v.name).as_deref(), Some("Bob"));
            assert_eq!(roster.collaborators[0].name, "Alice");
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_remote_selection_is_rendered() {
    LocalSet::new()
        .run_until(async {
            let hub = Rc::new(LocalHub::default());
            let alice = open_peer(&hub, "Alice", "type Query {\n  ping: Int\n}");
            sleep(Duration::from_millis(50)).await;
            let bob = open_peer(&hub, "Bob", "");
            settle().await;

            // Backward selection over "Query".
            alice.editor.select_offsets(10, 5);
            settle().await;

            let id = alice.session.client_id();
            let highlights = bob.session.presence().highlights();
            assert_eq!(highlights.len(), 1);
            assert_eq!((highlights[0].start, highlights[0].end), (5, 10));
            assert!(highlights[0].head_at_start);

            let decorations = bob.editor.decorations();
            assert_eq!(decorations.len(), 1);
            assert_eq!(
                decorations[0].class_name,
                format!("yRemoteSelection yRemoteSelection-{id}")
            );
            assert_eq!(
                decorations[0].before_content_class,
                Some(format!("yRemoteSelectionHead yRemoteSelectionHead-{id}"))
            );
            assert!(decorations[0].after_content_class.is_none());

            let widgets = bob.editor.widgets();
            assert_eq!(widgets.len(), 1);
            assert_eq!(widgets[0].label, "Alice");
            assert_eq!(widgets[0].placement, WidgetPlacement::Above);

            // The local selection is never drawn locally.
            assert!(alice.editor.decorations().is_empty());
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_selection_at_multibyte_end_is_published() {
    LocalSet::new()
        .run_until(async {
            let hub = Rc::new(LocalHub::default());
            let alice = open_peer(&hub, "Alice", "type Café { prix: Int } # ünï");
            sleep(Duration::from_millis(50)).await;
            let bob = open_peer(&hub, "Bob", "");
            settle().await;

            // "ünï" runs to the last byte.
            alice.editor.select_offsets(27, 32);
            settle().await;
            let highlights = bob.session.presence().highlights();
            assert_eq!(highlights.len(), 1);
            assert_eq!((highlights[0].start, highlights[0].end), (27, 32));

            bob.editor.set_caret_offset(0);
            bob.editor.type_text("# ").unwrap();
            settle().await;
            let highlights = bob.session.presence().highlights();
            assert_eq!((highlights[0].start, highlights[0].end), (29, 34));
            assert_eq!(alice.session.text().text(), "# type Café { prix: Int } # ünï");
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_highlight_follows_remote_edits() {
    LocalSet::new()
        .run_until(async {
            let hub = Rc::new(LocalHub::default());
            let alice = open_peer(&hub, "Alice", "type Query");
            sleep(Duration::from_millis(50)).await;
            let bob = open_peer(&hub, "Bob", "");
            settle().await;

            alice.editor.select_offsets(5, 10);
            settle().await;

            bob.editor.set_caret_offset(0);
            bob.editor.type_text("# header\n").unwrap();
            settle().await;

            let highlights = bob.session.presence().highlights();
            assert_eq!((highlights[0].start, highlights[0].end), (14, 19));
            let highlights = alice.session.presence().highlights();
            assert_eq!(highlights.len(), 1);
            assert_eq!((highlights[0].start, highlights[0].end), (9, 9));
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_style_rules_installed_once_per_client() {
    LocalSet::new()
        .run_until(async {
            let hub = Rc::new(LocalHub::default());
            let alice = open_peer(&hub, "Alice", "type Query");
            sleep(Duration::from_millis(50)).await;
            let bob = open_peer(&hub, "Bob", "");
            settle().await;
            let installed = alice.editor.style_rules().len();
            assert_eq!(installed, 2);

            for offset in 0..5 {
                bob.editor.set_caret_offset(offset);
                settle().await;
            }
            assert_eq!(alice.editor.style_rules().len(), installed);

            let _carol = open_peer(&hub, "Carol", "");
            settle().await;
            assert_eq!(alice.editor.style_rules().len(), installed + 2);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_rename_and_leave() {
    LocalSet::new()
        .run_until(async {
            let hub = Rc::new(LocalHub::default());
            let alice = open_peer(&hub, "Alice", "type Query");
            sleep(Duration::from_millis(50)).await;
            let bob = open_peer(&hub, "Bob", "");
            settle().await;

            let seen = Rc::new(RefCell::new(Vec::new()));
            alice.session.presence().on_roster_change({
                let seen = seen.clone();
                move |roster| {
                    seen.borrow_mut()
                        .push(roster.collaborators.iter().map(|c| c.name.clone()).collect::<Vec<_>>());
                }
            });

            assert!(bob
                .session
                .change_name("  Robert ", bob.prefs.as_ref())
                .unwrap());
            assert!(!bob.session.change_name("   ", bob.prefs.as_ref()).unwrap());
            assert_eq!(bob.prefs.get(NAME_PREFERENCE_KEY).as_deref(), Some("Robert"));
            settle().await;
            assert_eq!(alice.session.presence().collaborators()[0].name, "Robert");

            bob.editor.select_offsets(0, 4);
            settle().await;
            assert_eq!(alice.editor.decorations().len(), 1);

            bob.session.close();
            settle().await;
            assert!(alice.session.presence().collaborators().is_empty());
            assert!(alice.editor.decorations().is_empty());
            assert!(alice.editor.widgets().is_empty());
            assert_eq!(seen.borrow().last().cloned(), Some(Vec::<String>::new()));
        })
        .await;
}
