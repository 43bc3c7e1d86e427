//! Object-storage backend: one object per template under a key prefix.
//!
//! The network transport is not baked in. The backend speaks to a narrow
//! blocking [`ObjectStore`] trait; production code injects a client bound
//! to a real S3 bucket, tests (and offline use) inject the in-memory
//! implementation below. Keys follow `<prefix>/<template_id>.json`.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::error::{ModelError, Result};
use crate::template::bundle::TemplateBundle;

use super::{duplicate_template, unknown_template, StorageBackend};

/// Minimal blocking object-storage surface the backend needs.
pub trait ObjectStore: Send + Sync {
    /// The object's bytes, or `None` if the key is absent.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &str, body: &[u8]) -> Result<()>;
    /// Absent keys are not an error.
    fn delete(&self, key: &str) -> Result<()>;
    /// All keys under a prefix.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

pub struct S3Backend {
    store: Box<dyn ObjectStore>,
    prefix: String,
    lock: Mutex<()>,
}

impl S3Backend {
    /// `prefix` scopes every key, e.g. `"templates"`; empty means the
    /// bucket root.
    pub fn new(store: Box<dyn ObjectStore>, prefix: impl Into<String>) -> S3Backend {
        S3Backend {
            store,
            prefix: prefix.into().trim_matches('/').to_string(),
            lock: Mutex::new(()),
        }
    }

    fn key_for(&self, template_id: &str) -> String {
        if self.prefix.is_empty() {
            format!("{template_id}.json")
        } else {
            format!("{}/{template_id}.json", self.prefix)
        }
    }

    fn hold(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| ModelError::Storage("registry lock poisoned".into()))
    }
}

impl StorageBackend for S3Backend {
    fn list(&self) -> Result<Vec<String>> {
        let _guard = self.hold()?;
        let prefix = if self.prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", self.prefix)
        };
        let mut ids: Vec<String> = self
            .store
            .list(&prefix)?
            .into_iter()
            .filter_map(|key| {
                key.strip_prefix(&prefix)
                    .and_then(|rest| rest.strip_suffix(".json"))
                    .map(str::to_string)
            })
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn save(&self, template_id: &str, bundle: &TemplateBundle) -> Result<()> {
        let _guard = self.hold()?;
        let key = self.key_for(template_id);
        if self.store.get(&key)?.is_some() {
            return Err(duplicate_template(template_id));
        }
        let bytes = serde_json::to_vec(bundle)
            .map_err(|e| ModelError::Storage(format!("encoding bundle: {e}")))?;
        self.store.put(&key, &bytes)
    }

    fn load(&self, template_id: &str) -> Result<TemplateBundle> {
        let _guard = self.hold()?;
        let key = self.key_for(template_id);
        let bytes = self
            .store
            .get(&key)?
            .ok_or_else(|| unknown_template(template_id))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ModelError::Storage(format!("bundle '{template_id}' is corrupt: {e}")))
    }

    fn delete(&self, template_id: &str) -> Result<()> {
        let _guard = self.hold()?;
        self.store.delete(&self.key_for(template_id))
    }

    fn exists(&self, template_id: &str) -> Result<bool> {
        let _guard = self.hold()?;
        Ok(self.store.get(&self.key_for(template_id))?.is_some())
    }
}

/// In-memory [`ObjectStore`], for tests and offline use.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> MemoryObjectStore {
        MemoryObjectStore::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>>> {
        self.objects
            .lock()
            .map_err(|_| ModelError::Storage("object store lock poisoned".into()))
    }
}

impl ObjectStore for MemoryObjectStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn put(&self, key: &str, body: &[u8]) -> Result<()> {
        self.lock()?.insert(key.to_string(), body.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()?
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}
