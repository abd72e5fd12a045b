//! In-process document store with optional simulated latency and failures.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::time::Duration;

use super::{
    parse_credential, DocumentStore, NewSchema, SchemaPatch, SchemaRecord, StoreError,
    StoredSchema,
};

#[derive(Default)]
pub struct MemoryStore {
    rows: RefCell<HashMap<String, StoredSchema>>,
    /// edit hash → id
    edit_index: RefCell<HashMap<String, String>>,
    latency: Cell<Duration>,
    failing: Cell<bool>,
    update_attempts: Cell<u64>,
    writes: Cell<u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every operation sleeps this long before touching the maps.
    pub fn with_latency(latency: Duration) -> Self {
        let store = Self::new();
        store.latency.set(latency);
        store
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency.set(latency);
    }

    /// While set, every operation fails with [`StoreError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.set(failing);
    }

    /// Updates that were started, completed or not.
    pub fn update_attempts(&self) -> u64 {
        self.update_attempts.get()
    }

    /// Updates that reached the maps.
    pub fn writes(&self) -> u64 {
        self.writes.get()
    }

    pub fn len(&self) -> usize {
        self.rows.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.borrow().is_empty()
    }

    /// Raw row access for assertions.
    pub fn get(&self, id: &str) -> Option<SchemaRecord> {
        self.rows.borrow().get(id).map(StoredSchema::read_only)
    }

    async fn settle(&self) -> Result<(), StoreError> {
        let latency = self.latency.get();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.failing.get() {
            return Err(StoreError::Unavailable("memory store is failing".into()));
        }
        Ok(())
    }

    fn id_for_credential(&self, credential: &str) -> Option<String> {
        let hash = parse_credential(credential)?;
        self.edit_index.borrow().get(hash).cloned()
    }
}

impl DocumentStore for MemoryStore {
    async fn find_by_id(&self, id: &str) -> Result<Option<SchemaRecord>, StoreError> {
        self.settle().await?;
        Ok(self.rows.borrow().get(id).map(StoredSchema::read_only))
    }

    async fn find_by_credential(
        &self,
        credential: &str,
    ) -> Result<Option<SchemaRecord>, StoreError> {
        self.settle().await?;
        let Some(id) = self.id_for_credential(credential) else {
            return Ok(None);
        };
        Ok(self.rows.borrow().get(&id).map(StoredSchema::editable))
    }

    async fn create(&self, id: &str, schema: NewSchema) -> Result<SchemaRecord, StoreError> {
        self.settle().await?;
        if self.rows.borrow().contains_key(id) {
            return Err(StoreError::AlreadyExists(id.to_string()));
        }
        let row = StoredSchema::new(id, schema);
        let record = row.editable();
        self.edit_index
            .borrow_mut()
            .insert(row.edit_hash.clone(), id.to_string());
        self.rows.borrow_mut().insert(id.to_string(), row);
        Ok(record)
    }

    async fn update(&self, credential: &str, patch: SchemaPatch) -> Result<bool, StoreError> {
        self.update_attempts.set(self.update_attempts.get() + 1);
        self.settle().await?;
        let Some(id) = self.id_for_credential(credential) else {
            return Ok(false);
        };
        let mut rows = self.rows.borrow_mut();
        let Some(row) = rows.get_mut(&id) else {
            return Ok(false);
        };
        row.apply(patch);
        self.writes.set(self.writes.get() + 1);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(sdl: &str) -> NewSchema {
        NewSchema {
            title: "Untitled".into(),
            sdl: sdl.into(),
            snapshot: Vec::new(),
            edit_hash: "h1".into(),
        }
    }

    #[tokio::test]
    async fn test_lookup_by_id_is_read_only() {
        let store = MemoryStore::new();
        store.create("s1", schema("type Query")).await.unwrap();

        let record = store.fetch("s1").await.unwrap().unwrap();
        assert_eq!(record.sdl, "type Query");
        assert!(record.edit_credential.is_none());
    }

    #[tokio::test]
    async fn test_lookup_by_credential_is_editable() {
        let store = MemoryStore::new();
        store.create("s1", schema("type Query")).await.unwrap();

        let record = store.fetch("h1:edit").await.unwrap().unwrap();
        assert_eq!(record.id, "s1");
        assert_eq!(record.edit_credential.as_deref(), Some("h1:edit"));

        assert!(store.fetch("h2:edit").await.unwrap().is_none());
        // The id is not a credential.
        assert!(store.fetch("s1:edit").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_unknown_credential() {
        let store = MemoryStore::new();
        store.create("s1", schema("a")).await.unwrap();

        let patch = SchemaPatch {
            sdl: Some("b".into()),
            ..SchemaPatch::default()
        };
        assert!(!store.update("nope:edit", patch.clone()).await.unwrap());
        assert!(!store.update("h1", patch.clone()).await.unwrap());
        assert!(store.update("h1:edit", patch).await.unwrap());
        assert_eq!(store.get("s1").unwrap().sdl, "b");
        assert_eq!(store.update_attempts(), 3);
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_create() {
        let store = MemoryStore::new();
        store.create("s1", schema("a")).await.unwrap();
        let err = store.create("s1", schema("b")).await.unwrap_err();
        assert_eq!(err, StoreError::AlreadyExists("s1".into()));
    }

    #[tokio::test]
    async fn test_failing_store() {
        let store = MemoryStore::new();
        store.create("s1", schema("a")).await.unwrap();
        store.set_failing(true);
        assert!(matches!(
            store.update("h1:edit", SchemaPatch::default()).await,
            Err(StoreError::Unavailable(_))
        ));
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_update_leaves_record_untouched() {
        let store = MemoryStore::new();
        store.create("s1", schema("a")).await.unwrap();
        store.set_latency(Duration::from_millis(100));

        let patch = SchemaPatch {
            sdl: Some("b".into()),
            ..SchemaPatch::default()
        };
        let pending = store.update("h1:edit", patch);
        let _ = tokio::time::timeout(Duration::from_millis(10), pending).await;

        assert_eq!(store.get("s1").unwrap().sdl, "a");
        assert_eq!(store.update_attempts(), 1);
        assert_eq!(store.writes(), 0);
    }
}
