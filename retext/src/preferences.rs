use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config;

const PREFERENCES_FILE_NAME: &str = "preferences.json";
pub const LOAD_LABEL: &str = "Load Model";
pub const DOWNLOAD_AND_LOAD_LABEL: &str = "Download & Load Model";

#[derive(Debug, Error)]
pub enum PreferenceError {
    #[error(transparent)]
    Location(#[from] config::ConfigError),
    #[error("failed to access preferences {path}: {message}")]
    Io { path: PathBuf, message: String },
    #[error("preferences file is not valid JSON: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredPreferences {
    #[serde(default)]
    downloaded_models: Vec<String>,
}

/// Model ids the user has already fetched, used only to pick a default.
#[derive(Debug, Clone, Default)]
pub struct PreferenceStore {
    path: Option<PathBuf>,
    stored: StoredPreferences,
}

impl PreferenceStore {
    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn open_default() -> Result<Self, PreferenceError> {
        Self::open(config::config_dir()?.join(PREFERENCES_FILE_NAME))
    }

    /// Opens the store at `path`. A corrupt file is logged and treated as
    /// empty since the list only steers the default choice.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PreferenceError> {
        let path = path.into();
        let stored = match read_preferences(&path) {
            Ok(stored) => stored,
            Err(PreferenceError::Parse(message)) => {
                warn!(path = %path.display(), "ignoring unreadable preferences: {message}");
                StoredPreferences::default()
            }
            Err(err) => return Err(err),
        };
        Ok(Self {
            path: Some(path),
            stored,
        })
    }

    pub fn downloaded_models(&self) -> &[String] {
        &self.stored.downloaded_models
    }

    pub fn is_downloaded(&self, model_id: &str) -> bool {
        self.stored
            .downloaded_models
            .iter()
            .any(|known| known == model_id)
    }

    /// Appends `model_id` if absent and persists. Returns whether it was new.
    pub fn record_downloaded(&mut self, model_id: &str) -> Result<bool, PreferenceError> {
        if self.is_downloaded(model_id) {
            return Ok(false);
        }
        self.stored.downloaded_models.push(model_id.to_string());
        debug!(model_id, "recorded downloaded model");
        if let Some(path) = self.path.as_deref() {
            write_preferences(path, &self.stored)?;
        }
        Ok(true)
    }

    /// First catalog entry that was fetched before.
    pub fn default_model<'a>(&self, catalog: &'a [String]) -> Option<&'a str> {
        catalog
            .iter()
            .find(|candidate| self.is_downloaded(candidate))
            .map(String::as_str)
    }

    pub fn load_label(&self, model_id: &str) -> &'static str {
        if self.is_downloaded(model_id) {
            LOAD_LABEL
        } else {
            DOWNLOAD_AND_LOAD_LABEL
        }
    }
}

fn read_preferences(path: &Path) -> Result<StoredPreferences, PreferenceError> {
    if !path.exists() {
        return Ok(StoredPreferences::default());
    }
    let content = fs::read_to_string(path).map_err(|err| PreferenceError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    serde_json::from_str(&content).map_err(|err| PreferenceError::Parse(err.to_string()))
}

fn write_preferences(path: &Path, stored: &StoredPreferences) -> Result<(), PreferenceError> {
    let io_error = |err: std::io::Error| PreferenceError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_error)?;
    }
    let serialized =
        serde_json::to_string_pretty(stored).map_err(|err| PreferenceError::Parse(err.to_string()))?;
    fs::write(path, serialized).map_err(io_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("retext-prefs-{}-{name}", std::process::id()))
            .join(PREFERENCES_FILE_NAME)
    }

    fn catalog() -> Vec<String> {
        vec!["big".to_string(), "small".to_string(), "tiny".to_string()]
    }

    #[test]
    fn default_model_follows_catalog_order() {
        let mut store = PreferenceStore::in_memory();
        store.record_downloaded("tiny").expect("record");
        store.record_downloaded("small").expect("record");

        assert_eq!(store.default_model(&catalog()), Some("small"));
    }

    #[test]
    fn nothing_downloaded_means_no_default() {
        let store = PreferenceStore::in_memory();
        assert_eq!(store.default_model(&catalog()), None);
    }

    #[test]
    fn labels_depend_on_download_state() {
        let mut store = PreferenceStore::in_memory();
        assert_eq!(store.load_label("tiny"), "Download & Load Model");
        store.record_downloaded("tiny").expect("record");
        assert_eq!(store.load_label("tiny"), "Load Model");
    }

    #[test]
    fn recording_is_idempotent_and_persisted() {
        let path = scratch_path("persist");
        let mut store = PreferenceStore::open(&path).expect("open");
        assert!(store.record_downloaded("tiny").expect("record"));
        assert!(!store.record_downloaded("tiny").expect("record again"));

        let reopened = PreferenceStore::open(&path).expect("reopen");
        let _ = fs::remove_dir_all(path.parent().expect("parent dir"));

        assert_eq!(reopened.downloaded_models(), ["tiny".to_string()]);
    }

    #[test]
    fn corrupt_file_is_treated_as_empty() {
        let path = scratch_path("corrupt");
        fs::create_dir_all(path.parent().expect("parent dir")).expect("mkdir");
        fs::write(&path, "{not json").expect("write");

        let store = PreferenceStore::open(&path).expect("open should tolerate corruption");
        let _ = fs::remove_dir_all(path.parent().expect("parent dir"));

        assert!(store.downloaded_models().is_empty());
    }
}
