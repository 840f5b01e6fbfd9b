use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use serde_json::{Map, Value};
use thiserror::Error;

/// Storage key under which preferences are persisted.
pub const PREFERENCES_KEY: &str = "notification_preferences";

/// Errors produced by preference persistence.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Reading or writing the backing file failed.
    #[error("storage io error: {0}")]
    Io(#[from] io::Error),
    /// The stored document is not valid JSON.
    #[error("storage json error: {0}")]
    Json(#[from] serde_json::Error),
    /// The stored document is not a JSON object.
    #[error("storage document is not a json object")]
    NotAnObject,
}

/// Durable per-device storage for serialized preferences.
pub trait PreferenceStore: Send + Sync {
    /// Returns the stored preferences object, if any.
    fn load(&self) -> Result<Option<Value>, StoreError>;

    /// Merges `preferences` over the stored object and persists the result.
    ///
    /// Keys present in storage but absent from `preferences` are kept.
    fn save(&self, preferences: &Value) -> Result<(), StoreError>;
}

/// Merges every key of `update` into `target`, replacing non-object targets.
fn merge_object(target: &mut Value, update: &Value) {
    let Value::Object(update) = update else {
        *target = update.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target) = target {
        for (key, value) in update {
            target.insert(key.clone(), value.clone());
        }
    }
}

/// Key-value JSON document on disk, one key per stored setting.
#[derive(Debug, Clone)]
pub struct FilePreferenceStore {
    path: PathBuf,
}

impl FilePreferenceStore {
    /// Creates a store backed by the document at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the backing document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_document(&self) -> Result<Map<String, Value>, StoreError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(err) => return Err(err.into()),
        };
        if raw.trim().is_empty() {
            return Ok(Map::new());
        }

        match serde_json::from_str(&raw)? {
            Value::Object(document) => Ok(document),
            _ => Err(StoreError::NotAnObject),
        }
    }

    fn write_document(&self, document: &Map<String, Value>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(document)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl PreferenceStore for FilePreferenceStore {
    fn load(&self) -> Result<Option<Value>, StoreError> {
        Ok(self.read_document()?.remove(PREFERENCES_KEY))
    }

    fn save(&self, preferences: &Value) -> Result<(), StoreError> {
        let mut document = self.read_document()?;
        let entry = document
            .entry(PREFERENCES_KEY.to_string())
            .or_insert(Value::Null);
        merge_object(entry, preferences);
        self.write_document(&document)
    }
}

/// In-memory store for tests and hosts without durable storage.
#[derive(Debug, Default)]
pub struct MemoryPreferenceStore {
    value: Mutex<Option<Value>>,
}

impl MemoryPreferenceStore {
    /// Creates a store pre-populated with `value`.
    pub fn with_value(value: Value) -> Self {
        Self {
            value: Mutex::new(Some(value)),
        }
    }

    /// Returns the currently stored object.
    pub fn snapshot(&self) -> Option<Value> {
        self.value
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl PreferenceStore for MemoryPreferenceStore {
    fn load(&self) -> Result<Option<Value>, StoreError> {
        Ok(self.snapshot())
    }

    fn save(&self, preferences: &Value) -> Result<(), StoreError> {
        let mut slot = self.value.lock().unwrap_or_else(PoisonError::into_inner);
        let stored = slot.get_or_insert(Value::Null);
        merge_object(stored, preferences);
        Ok(())
    }
}
