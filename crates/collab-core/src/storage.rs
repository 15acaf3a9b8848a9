//! Storage: small key-value persistence for display identity.
//!
//! Values are stored JSON-encoded. Two scopes exist:
//! - `Session`: lives as long as the process (`MemoryStore`)
//! - `Local`: survives restarts, one JSON file on disk (`FileStore`)

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Raw string storage.
pub trait KeyValueStore {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&mut self, key: &str, value: String) -> Result<()>;

    fn remove(&mut self, key: &str) -> Result<()>;

    fn clear(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StorageScope {
    #[default]
    Session,
    Local,
}

/// Process-lifetime store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    items: BTreeMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.items.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: String) -> Result<()> {
        self.items.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.items.remove(key);
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.items.clear();
        Ok(())
    }
}

/// Store backed by one JSON file, rewritten on every change.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    items: BTreeMap<String, String>,
}

impl FileStore {
    /// Open the store at `path`. A missing or unreadable file starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let items = match Self::load(&path) {
            Ok(items) => items,
            Err(e) => {
                warn!("Ignoring unreadable store {}: {}", path.display(), e);
                BTreeMap::new()
            }
        };
        Self { path, items }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(path: &Path) -> Result<BTreeMap<String, String>> {
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(&self.items)?;
        fs::write(&self.path, contents)?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.items.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: String) -> Result<()> {
        self.items.insert(key.to_string(), value);
        self.save()
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        if self.items.remove(key).is_some() {
            self.save()?;
        }
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.items.clear();
        self.save()
    }
}

/// Typed access to a `KeyValueStore`.
#[derive(Debug, Default)]
pub struct StorageService<S: KeyValueStore> {
    store: S,
}

impl<S: KeyValueStore> StorageService<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn set_item<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<()> {
        let encoded = serde_json::to_string(value)?;
        self.store.set(key, encoded)
    }

    /// Stored value, or `None` if absent or not decodable as `T`.
    pub fn get_item<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.store.get(key)?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!("Stored item {} did not decode: {}", key, e);
                None
            }
        }
    }

    pub fn remove_item(&mut self, key: &str) -> Result<()> {
        self.store.remove(key)
    }

    pub fn clear(&mut self) -> Result<()> {
        self.store.clear()
    }

    pub fn into_inner(self) -> S {
        self.store
    }
}

/// Storage for either scope. Local storage lives at `local_path`.
pub fn open_scope(scope: StorageScope, local_path: &Path) -> Box<dyn KeyValueStore> {
    match scope {
        StorageScope::Session => Box::new(MemoryStore::new()),
        StorageScope::Local => Box::new(FileStore::open(local_path)),
    }
}

impl KeyValueStore for Box<dyn KeyValueStore> {
    fn get(&self, key: &str) -> Option<String> {
        (**self).get(key)
    }

    fn set(&mut self, key: &str, value: String) -> Result<()> {
        (**self).set(key, value)
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        (**self).remove(key)
    }

    fn clear(&mut self) -> Result<()> {
        (**self).clear()
    }
}

/// Display identity of an editor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub color: String,
}

impl Identity {
    /// A random 13-character base36 name and a random `#rrggbb` color.
    pub fn random() -> Self {
        use rand::Rng;
        const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

        let mut rng = rand::rng();
        let name = (0..13)
            .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
            .collect();
        let color = format!("#{:06x}", rng.random_range(0..=0xff_ffffu32));
        Self { name, color }
    }
}

/// Supplies the display identity at construction.
pub trait IdentityProvider {
    fn identity(&mut self) -> Identity;
}

impl IdentityProvider for Identity {
    fn identity(&mut self) -> Identity {
        self.clone()
    }
}

/// Identity persisted in a store, generated on first use.
pub struct StoredIdentity<S: KeyValueStore> {
    storage: StorageService<S>,
}

impl<S: KeyValueStore> StoredIdentity<S> {
    pub const KEY: &'static str = "collab.identity";

    pub fn new(store: S) -> Self {
        Self {
            storage: StorageService::new(store),
        }
    }

    pub fn storage(&self) -> &StorageService<S> {
        &self.storage
    }
}

impl<S: KeyValueStore> IdentityProvider for StoredIdentity<S> {
    fn identity(&mut self) -> Identity {
        if let Some(identity) = self.storage.get_item::<Identity>(Self::KEY) {
            return identity;
        }

        let identity = Identity::random();
        if let Err(e) = self.storage.set_item(Self::KEY, &identity) {
            warn!("Failed to persist identity: {}", e);
        }
        identity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_service_roundtrip() {
        let mut storage = StorageService::new(MemoryStore::new());
        storage.set_item("count", &3u32).unwrap();
        storage.set_item("names", &vec!["a", "b"]).unwrap();

        assert_eq!(storage.get_item::<u32>("count"), Some(3));
        assert_eq!(storage.get_item::<Vec<String>>("names").unwrap(), vec!["a", "b"]);
        assert_eq!(storage.get_item::<u32>("missing"), None);
        assert_eq!(storage.get_item::<u32>("names"), None);

        storage.remove_item("count").unwrap();
        assert_eq!(storage.get_item::<u32>("count"), None);
        storage.clear().unwrap();
        assert_eq!(storage.get_item::<Vec<String>>("names"), None);
    }

    #[test]
    fn test_file_store_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("store.json");

        let mut store = FileStore::open(&path);
        store.set("key", "\"value\"".to_string()).unwrap();
        assert!(path.exists());

        let reopened = FileStore::open(&path);
        assert_eq!(reopened.get("key").as_deref(), Some("\"value\""));
    }

    #[test]
    fn test_file_store_ignores_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");
        fs::write(&path, "not json").unwrap();

        let store = FileStore::open(&path);
        assert!(store.get("key").is_none());
    }

    #[test]
    fn test_random_identity_shape() {
        let identity = Identity::random();
        assert_eq!(identity.name.len(), 13);
        assert!(identity.name.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
        assert_eq!(identity.color.len(), 7);
        assert!(identity.color.starts_with('#'));
        assert!(identity.color[1..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_stored_identity_is_stable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("identity.json");

        let first = StoredIdentity::new(FileStore::open(&path)).identity();
        let second = StoredIdentity::new(FileStore::open(&path)).identity();
        assert_eq!(first, second);
    }

    #[test]
    fn test_session_scope_is_not_shared() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("identity.json");

        let mut a = StoredIdentity::new(open_scope(StorageScope::Session, &path));
        let mut b = StoredIdentity::new(open_scope(StorageScope::Session, &path));
        assert_eq!(a.identity(), a.identity());
        assert_ne!(a.identity(), b.identity());
        assert!(!path.exists());
    }
}
