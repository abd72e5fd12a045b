//! Durable storage of schema documents.
//!
//! ```text
//! PersistenceCoordinator ──update(credential, patch)──► DocumentStore
//! SessionManager ─────────fetch(id | credential)──────►   ├─ MemoryStore
//!                                                         └─ RocksStore
//! ```
//!
//! A record is reachable two ways. Its public id gives a read-only view
//! (`edit_credential: None`). Its edit credential, `"{edit_hash}:edit"`,
//! gives the editable view and is the key for updates.

pub mod memory;
pub mod rocks;

use std::future::Future;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

/// Suffix marking an edit credential.
pub const EDIT_SUFFIX: &str = ":edit";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("document {0} already exists")]
    AlreadyExists(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// A schema document as handed out by a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaRecord {
    pub id: String,
    pub title: String,
    /// Plain text of the document.
    pub sdl: String,
    /// Encoded replicated document state.
    pub snapshot: Vec<u8>,
    /// Present only on the editable view.
    pub edit_credential: Option<String>,
}

impl SchemaRecord {
    pub fn is_editable(&self) -> bool {
        self.edit_credential.is_some()
    }
}

/// Input of [`DocumentStore::create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSchema {
    pub title: String,
    pub sdl: String,
    pub snapshot: Vec<u8>,
    pub edit_hash: String,
}

/// Fields to overwrite. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaPatch {
    pub title: Option<String>,
    pub sdl: Option<String>,
    pub snapshot: Option<Vec<u8>>,
}

/// Row layout shared by the stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct StoredSchema {
    pub id: String,
    pub title: String,
    pub sdl: String,
    pub snapshot: Vec<u8>,
    pub edit_hash: String,
}

impl StoredSchema {
    pub(crate) fn new(id: &str, schema: NewSchema) -> Self {
        Self {
            id: id.to_string(),
            title: schema.title,
            sdl: schema.sdl,
            snapshot: schema.snapshot,
            edit_hash: schema.edit_hash,
        }
    }

    pub(crate) fn read_only(&self) -> SchemaRecord {
        SchemaRecord {
            id: self.id.clone(),
            title: self.title.clone(),
            sdl: self.sdl.clone(),
            snapshot: self.snapshot.clone(),
            edit_credential: None,
        }
    }

    pub(crate) fn editable(&self) -> SchemaRecord {
        SchemaRecord {
            edit_credential: Some(edit_credential(&self.edit_hash)),
            ..self.read_only()
        }
    }

    pub(crate) fn apply(&mut self, patch: SchemaPatch) {
        if let Some(title) = patch.title {
            self.title = title;
        }
        if let Some(sdl) = patch.sdl {
            self.sdl = sdl;
        }
        if let Some(snapshot) = patch.snapshot {
            self.snapshot = snapshot;
        }
    }
}

/// `"{hash}:edit"`.
pub fn edit_credential(edit_hash: &str) -> String {
    format!("{edit_hash}{EDIT_SUFFIX}")
}

/// The edit hash inside a credential, or `None` for a plain id.
pub fn parse_credential(key: &str) -> Option<&str> {
    key.strip_suffix(EDIT_SUFFIX).filter(|hash| !hash.is_empty())
}

/// A fresh random hex token for ids and edit hashes.
pub fn random_hash() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Where schema documents live.
///
/// Futures may be dropped before completion; an update that has not
/// completed must leave the record untouched or fully written.
pub trait DocumentStore {
    /// Read-only view by public id.
    fn find_by_id(&self, id: &str)
        -> impl Future<Output = Result<Option<SchemaRecord>, StoreError>>;

    /// Editable view by `"{hash}:edit"` credential.
    fn find_by_credential(
        &self,
        credential: &str,
    ) -> impl Future<Output = Result<Option<SchemaRecord>, StoreError>>;

    /// Store a new document under `id`, returning its editable view.
    fn create(
        &self,
        id: &str,
        schema: NewSchema,
    ) -> impl Future<Output = Result<SchemaRecord, StoreError>>;

    /// Patch the document the credential belongs to. `Ok(false)` when the
    /// credential matches nothing.
    fn update(
        &self,
        credential: &str,
        patch: SchemaPatch,
    ) -> impl Future<Output = Result<bool, StoreError>>;

    /// Look up by either form.
    fn fetch(
        &self,
        id_or_credential: &str,
    ) -> impl Future<Output = Result<Option<SchemaRecord>, StoreError>> {
        async move {
            if parse_credential(id_or_credential).is_some() {
                self.find_by_credential(id_or_credential).await
            } else {
                self.find_by_id(id_or_credential).await
            }
        }
    }
}
