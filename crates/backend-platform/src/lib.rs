//! Persistent key-value capability and the identity store built on it.

use std::{
    collections::{BTreeMap, HashMap},
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, RwLock},
    time::{SystemTime, UNIX_EPOCH},
};

use thiserror::Error;
use tracing::{debug, warn};

/// Key under which the chosen display name is stored.
pub const USERNAME_KEY: &str = "username";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyValueStoreError {
    #[error("key-value store unavailable: {0}")]
    Unavailable(String),
    #[error("key-value store contents are corrupt: {0}")]
    Corrupt(String),
    #[error("key-value store backend failure: {0}")]
    Backend(String),
}

/// Minimal persistent string store (`get`/`set`/`remove`).
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, KeyValueStoreError>;

    fn set(&self, key: &str, value: &str) -> Result<(), KeyValueStoreError>;

    /// Remove `key`. Removing an absent key succeeds.
    fn remove(&self, key: &str) -> Result<(), KeyValueStoreError>;
}

impl<S: KeyValueStore + ?Sized> KeyValueStore for Arc<S> {
    fn get(&self, key: &str) -> Result<Option<String>, KeyValueStoreError> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), KeyValueStoreError> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), KeyValueStoreError> {
        (**self).remove(key)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryKeyValueStore {
    data: Arc<RwLock<HashMap<String, String>>>,
}

impl KeyValueStore for InMemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, KeyValueStoreError> {
        let data = self
            .data
            .read()
            .map_err(|_| KeyValueStoreError::Backend("poisoned lock".to_owned()))?;
        Ok(data.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), KeyValueStoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| KeyValueStoreError::Backend("poisoned lock".to_owned()))?;
        data.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), KeyValueStoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| KeyValueStoreError::Backend("poisoned lock".to_owned()))?;
        data.remove(key);
        Ok(())
    }
}

/// Key-value store persisted as one JSON object file.
///
/// Writes go to a temp file in the same directory and are renamed over the target.
pub struct JsonFileKeyValueStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileKeyValueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, String>, KeyValueStoreError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => {
                return Err(KeyValueStoreError::Unavailable(format!(
                    "failed reading {}: {err}",
                    self.path.display()
                )));
            }
        };
        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        serde_json::from_str(&raw).map_err(|err| {
            KeyValueStoreError::Corrupt(format!("failed parsing {}: {err}", self.path.display()))
        })
    }

    fn store(&self, entries: &BTreeMap<String, String>) -> Result<(), KeyValueStoreError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|err| {
                KeyValueStoreError::Unavailable(format!(
                    "failed creating directory {}: {err}",
                    parent.display()
                ))
            })?;
        }

        let encoded = serde_json::to_vec_pretty(entries)
            .map_err(|err| KeyValueStoreError::Backend(err.to_string()))?;
        let temp_path = temp_path_for(&self.path);
        fs::write(&temp_path, encoded).map_err(|err| {
            KeyValueStoreError::Unavailable(format!(
                "failed writing temp file {}: {err}",
                temp_path.display()
            ))
        })?;

        if let Err(rename_err) = fs::rename(&temp_path, &self.path) {
            // Windows does not allow replacing existing files via rename.
            match fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    let _ = fs::remove_file(&temp_path);
                    return Err(KeyValueStoreError::Unavailable(format!(
                        "failed replacing {} after rename error ({rename_err}): {err}",
                        self.path.display()
                    )));
                }
            }
            fs::rename(&temp_path, &self.path).map_err(|err| {
                let _ = fs::remove_file(&temp_path);
                KeyValueStoreError::Unavailable(format!(
                    "failed writing {} after temp write: {err}",
                    self.path.display()
                ))
            })?;
        }
        Ok(())
    }

    fn update<F>(&self, mutate: F) -> Result<(), KeyValueStoreError>
    where
        F: FnOnce(&mut BTreeMap<String, String>) -> bool,
    {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| KeyValueStoreError::Backend("poisoned lock".to_owned()))?;
        let mut entries = self.load()?;
        if mutate(&mut entries) {
            self.store(&entries)?;
        }
        Ok(())
    }
}

impl KeyValueStore for JsonFileKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, KeyValueStoreError> {
        Ok(self.load()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), KeyValueStoreError> {
        self.update(|entries| {
            entries.insert(key.to_owned(), value.to_owned());
            true
        })
    }

    fn remove(&self, key: &str) -> Result<(), KeyValueStoreError> {
        self.update(|entries| entries.remove(key).is_some())
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("store.json");
    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_nanos())
        .unwrap_or(0);
    parent.join(format!(".{file_name}.{now_nanos}.tmp"))
}

/// Persisted display name, stored under [`USERNAME_KEY`].
#[derive(Clone)]
pub struct IdentityStore<S: KeyValueStore> {
    inner: S,
}

impl<S: KeyValueStore> IdentityStore<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    /// Stored username; blank values count as absent.
    pub fn load(&self) -> Result<Option<String>, KeyValueStoreError> {
        let stored = self.inner.get(USERNAME_KEY)?;
        Ok(stored.filter(|value| {
            let keep = !value.trim().is_empty();
            if !keep {
                warn!("ignoring blank stored username");
            }
            keep
        }))
    }

    pub fn save(&self, username: &str) -> Result<(), KeyValueStoreError> {
        debug!(username, "persisting identity");
        self.inner.set(USERNAME_KEY, username)
    }

    pub fn clear(&self) -> Result<(), KeyValueStoreError> {
        debug!("clearing identity");
        self.inner.remove(USERNAME_KEY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn unique_temp_path(label: &str) -> PathBuf {
        let now_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        env::temp_dir()
            .join(format!("chatroom-{label}-{now_nanos}"))
            .join("identity.json")
    }

    #[test]
    fn in_memory_get_set_remove() {
        let store = InMemoryKeyValueStore::default();
        assert_eq!(store.get("username"), Ok(None));

        store.set("username", "alice").expect("set should work");
        assert_eq!(store.get("username"), Ok(Some("alice".to_owned())));

        store.remove("username").expect("remove should work");
        store.remove("username").expect("second remove should work");
        assert_eq!(store.get("username"), Ok(None));
    }

    #[test]
    fn json_file_store_survives_new_instances() {
        let path = unique_temp_path("kv");
        let first = JsonFileKeyValueStore::new(&path);
        first.set("username", "alice").expect("set should work");
        first.set("theme", "dark").expect("set should work");

        let second = JsonFileKeyValueStore::new(&path);
        assert_eq!(second.get("username"), Ok(Some("alice".to_owned())));

        second.remove("username").expect("remove should work");
        let third = JsonFileKeyValueStore::new(&path);
        assert_eq!(third.get("username"), Ok(None));
        assert_eq!(third.get("theme"), Ok(Some("dark".to_owned())));

        let _ = fs::remove_dir_all(path.parent().expect("temp parent"));
    }

    #[test]
    fn json_file_store_reports_corrupt_contents() {
        let path = unique_temp_path("corrupt");
        fs::create_dir_all(path.parent().expect("temp parent")).expect("mkdir");
        fs::write(&path, "{not json").expect("write");

        let store = JsonFileKeyValueStore::new(&path);
        assert!(matches!(
            store.get("username"),
            Err(KeyValueStoreError::Corrupt(_))
        ));

        let _ = fs::remove_dir_all(path.parent().expect("temp parent"));
    }

    #[test]
    fn identity_lifecycle_absent_set_cleared() {
        let identity = IdentityStore::new(InMemoryKeyValueStore::default());
        assert_eq!(identity.load(), Ok(None));

        identity.save("alice").expect("save should work");
        assert_eq!(identity.load(), Ok(Some("alice".to_owned())));

        identity.clear().expect("clear should work");
        assert_eq!(identity.load(), Ok(None));

        identity.save("bob").expect("re-save should work");
        assert_eq!(identity.load(), Ok(Some("bob".to_owned())));
    }

    #[test]
    fn identity_ignores_blank_values() {
        let base = InMemoryKeyValueStore::default();
        base.set(USERNAME_KEY, "   ").expect("set should work");
        let identity = IdentityStore::new(base);
        assert_eq!(identity.load(), Ok(None));
    }

    struct FailingStore;

    impl KeyValueStore for FailingStore {
        fn get(&self, _key: &str) -> Result<Option<String>, KeyValueStoreError> {
            Err(KeyValueStoreError::Unavailable("mock outage".to_owned()))
        }

        fn set(&self, _key: &str, _value: &str) -> Result<(), KeyValueStoreError> {
            Err(KeyValueStoreError::Unavailable("mock outage".to_owned()))
        }

        fn remove(&self, _key: &str) -> Result<(), KeyValueStoreError> {
            Err(KeyValueStoreError::Unavailable("mock outage".to_owned()))
        }
    }

    #[test]
    fn failure_propagates_through_identity_store() {
        let identity = IdentityStore::new(FailingStore);
        let err = identity.save("alice").expect_err("save must fail");
        assert_eq!(
            err,
            KeyValueStoreError::Unavailable("mock outage".to_owned())
        );
    }
}
