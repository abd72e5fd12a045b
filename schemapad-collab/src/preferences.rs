//! Local key/value preferences, such as the collaborator's display name.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{CollabError, CollabResult};

pub trait Preferences {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: &str) -> CollabResult<()>;
}

#[derive(Debug, Default)]
pub struct MemoryPreferences {
    values: RefCell<BTreeMap<String, String>>,
}

impl MemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Preferences for MemoryPreferences {
    fn get(&self, key: &str) -> Option<String> {
        self.values.borrow().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> CollabResult<()> {
        self.values
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Preferences kept in a JSON object on disk. The whole file is rewritten
/// on every `set`.
#[derive(Debug)]
pub struct FilePreferences {
    path: PathBuf,
    values: RefCell<BTreeMap<String, String>>,
}

impl FilePreferences {
    /// Load `path`, starting empty if it does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> CollabResult<Self> {
        let path = path.into();
        let values = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).map_err(|e| {
                CollabError::Preferences(format!("{}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(CollabError::Preferences(format!("{}: {e}", path.display())))
            }
        };
        Ok(Self {
            path,
            values: RefCell::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Preferences for FilePreferences {
    fn get(&self, key: &str) -> Option<String> {
        self.values.borrow().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> CollabResult<()> {
        let json = {
            let mut values = self.values.borrow_mut();
            values.insert(key.to_string(), value.to_string());
            serde_json::to_string_pretty(&*values)
                .map_err(|e| CollabError::Preferences(e.to_string()))?
        };
        std::fs::write(&self.path, json)
            .map_err(|e| CollabError::Preferences(format!("{}: {e}", self.path.display())))
    }
}
