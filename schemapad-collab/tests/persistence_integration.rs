//! Persistence through RocksDB: a session's edits survive the store being
//! closed and reopened, and the saved snapshot seeds the next session.

use std::rc::Rc;

use schemapad_collab::{
    CollabConfig, DocumentStore, FilePreferences, LocalHub, MemoryPreferences, Preferences,
    RocksStore, SessionManager, SessionParams, StoreConfig, NAME_PREFERENCE_KEY,
};
use schemapad_core::{EditorView, HeadlessEditor, TextBuffer, TextModel};
use tempfile::TempDir;
use tokio::task::LocalSet;
use tokio::time::{sleep, Duration};

fn manager(store: Rc<RocksStore>, prefs: Rc<dyn Preferences>) -> SessionManager<RocksStore> {
    SessionManager::new(
        Rc::new(LocalHub::default()),
        store,
        prefs,
        CollabConfig::for_testing(),
    )
}

fn editor(content: &str) -> (Rc<TextBuffer>, Rc<HeadlessEditor>, Vec<Rc<dyn EditorView>>) {
    let model = Rc::new(TextBuffer::new(content));
    let editor = Rc::new(HeadlessEditor::new(model.clone()));
    let editors: Vec<Rc<dyn EditorView>> = vec![editor.clone()];
    (model, editor, editors)
}

#[tokio::test(start_paused = true)]
async fn test_saved_session_reopens_from_snapshot() {
    let dir = TempDir::new().unwrap();

    let credential = LocalSet::new()
        .run_until(async {
            let store = Rc::new(RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap());
            let manager = manager(store.clone(), Rc::new(MemoryPreferences::new()));
            let record = manager.create("Shop", "type Product").await.unwrap();
            let params = SessionParams::from_record(&record).unwrap();

            let (model, editor, editors) = editor("type Product");
            let session = manager.open(params.clone(), model.clone(), editors).unwrap();
            sleep(Duration::from_millis(50)).await;
            assert_eq!(model.value(), "type Product");

            editor.set_caret_offset(model.len());
            editor.type_text(" { sku: ID! }").unwrap();
            session.set_title("Shop v2").unwrap();
            sleep(Duration::from_millis(100)).await;
            assert!(!session.is_saving());

            let saved = store.fetch(&params.credential).await.unwrap().unwrap();
            assert_eq!(saved.sdl, "type Product { sku: ID! }");
            assert_eq!(saved.title, "Shop v2");
            session.close();
            params.credential
        })
        .await;

    LocalSet::new()
        .run_until(async {
            let store = Rc::new(RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap());
            let manager = manager(store, Rc::new(MemoryPreferences::new()));
            let record = manager.load(&credential).await.unwrap().unwrap();
            let params = SessionParams::from_record(&record).unwrap();
            assert!(params.snapshot.is_some());

            // Whatever the editor showed before, the snapshot wins.
            let (model, _editor, editors) = editor("type Stale");
            let session = manager.open(params, model.clone(), editors).unwrap();
            assert!(!session.cold_start_pending());
            sleep(Duration::from_millis(100)).await;
            assert_eq!(model.value(), "type Product { sku: ID! }");
            assert_eq!(session.text().text(), "type Product { sku: ID! }");
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_public_id_is_read_only() {
    let dir = TempDir::new().unwrap();
    let store = Rc::new(RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap());
    let manager = manager(store, Rc::new(MemoryPreferences::new()));

    let record = manager.create("Shop", "type Product").await.unwrap();
    let public = manager.load(&record.id).await.unwrap().unwrap();
    assert_eq!(public.sdl, "type Product");
    assert!(public.edit_credential.is_none());
    assert!(SessionParams::from_record(&public).is_none());

    assert!(manager.load("unknown").await.unwrap().is_none());
    assert!(manager.load("unknown:edit").await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_collaborator_name_survives_restart() {
    let dir = TempDir::new().unwrap();
    let prefs_path = dir.path().join("prefs.json");
    let store = Rc::new(RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());

    let first = {
        let prefs = Rc::new(FilePreferences::open(&prefs_path).unwrap());
        manager(store.clone(), prefs).local_name().unwrap()
    };
    let prefs = Rc::new(FilePreferences::open(&prefs_path).unwrap());
    assert_eq!(prefs.get(NAME_PREFERENCE_KEY), Some(first.clone()));
    assert_eq!(manager(store, prefs).local_name().unwrap(), first);
}
