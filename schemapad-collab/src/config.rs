//! Runtime configuration.
//!
//! Every field has a default, so a config file only needs the keys it
//! overrides:
//!
//! ```json
//! { "persistence": { "debounce_ms": 250 }, "cold_start": "snapshot_only" }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Debounce timing of the save pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Quiet period after the last change before a save.
    pub debounce_ms: u64,
    /// Upper bound between the first change of a burst and its save.
    pub max_wait_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            max_wait_ms: 10_000,
        }
    }
}

impl PersistenceConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

/// What a session does with the editor's initial content when it starts
/// without a stored snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColdStartPolicy {
    /// If no peer shows up within the cold-start window, insert the
    /// editor's initial content into the shared text.
    #[default]
    FirstWriterFallback,
    /// Only a stored snapshot seeds the shared text.
    SnapshotOnly,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    pub persistence: PersistenceConfig,
    /// How long a fresh session waits for peers before seeding.
    pub cold_start_window_ms: u64,
    pub cold_start: ColdStartPolicy,
    /// File holding client preferences (collaborator name). In-memory
    /// preferences are used when unset.
    pub preferences_path: Option<PathBuf>,
    /// Messages buffered per room receiver before it lags.
    pub hub_capacity: usize,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            persistence: PersistenceConfig::default(),
            cold_start_window_ms: 100,
            cold_start: ColdStartPolicy::default(),
            preferences_path: None,
            hub_capacity: 1024,
        }
    }
}

impl CollabConfig {
    /// Short timings for tests running on paused time.
    pub fn for_testing() -> Self {
        Self {
            persistence: PersistenceConfig {
                debounce_ms: 50,
                max_wait_ms: 400,
            },
            cold_start_window_ms: 20,
            cold_start: ColdStartPolicy::FirstWriterFallback,
            preferences_path: None,
            hub_capacity: 64,
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn cold_start_window(&self) -> Duration {
        Duration::from_millis(self.cold_start_window_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.persistence.debounce_ms == 0 {
            return Err(ConfigError::Invalid("debounce_ms must be positive".into()));
        }
        if self.persistence.max_wait_ms < self.persistence.debounce_ms {
            return Err(ConfigError::Invalid(format!(
                "max_wait_ms ({}) is shorter than debounce_ms ({})",
                self.persistence.max_wait_ms, self.persistence.debounce_ms
            )));
        }
        if self.hub_capacity == 0 {
            return Err(ConfigError::Invalid("hub_capacity must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CollabConfig::default();
        assert_eq!(config.persistence.debounce(), Duration::from_millis(500));
        assert_eq!(config.persistence.max_wait(), Duration::from_secs(10));
        assert_eq!(config.cold_start_window(), Duration::from_millis(100));
        assert_eq!(config.cold_start, ColdStartPolicy::FirstWriterFallback);
        assert!(config.validate().is_ok());
        assert!(CollabConfig::for_testing().validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = CollabConfig::from_json_str(
            r#"{ "persistence": { "debounce_ms": 250 }, "cold_start": "snapshot_only" }"#,
        )
        .unwrap();
        assert_eq!(config.persistence.debounce_ms, 250);
        assert_eq!(config.persistence.max_wait_ms, 10_000);
        assert_eq!(config.cold_start, ColdStartPolicy::SnapshotOnly);
        assert_eq!(config.hub_capacity, 1024);
    }

    #[test]
    fn test_validate_rejects_inverted_timings() {
        let err = CollabConfig::from_json_str(
            r#"{ "persistence": { "debounce_ms": 900, "max_wait_ms": 100 } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("collab.json");
        std::fs::write(&path, r#"{ "cold_start_window_ms": 5 }"#).unwrap();
        let config = CollabConfig::from_json_file(&path).unwrap();
        assert_eq!(config.cold_start_window_ms, 5);

        assert!(matches!(
            CollabConfig::from_json_file(dir.path().join("missing.json")),
            Err(ConfigError::Io(_))
        ));
    }
}
