//! In-memory backend, mainly for tests and ephemeral registries.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::error::{ModelError, Result};
use crate::template::bundle::TemplateBundle;

use super::{duplicate_template, unknown_template, StorageBackend};

/// Bundles are cloned on save and on load, so callers never alias the
/// stored copy.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    bundles: Mutex<BTreeMap<String, TemplateBundle>>,
}

impl InMemoryBackend {
    pub fn new() -> InMemoryBackend {
        InMemoryBackend::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, TemplateBundle>>> {
        self.bundles
            .lock()
            .map_err(|_| ModelError::Storage("in-memory store lock poisoned".into()))
    }
}

impl StorageBackend for InMemoryBackend {
    fn list(&self) -> Result<Vec<String>> {
        Ok(self.lock()?.keys().cloned().collect())
    }

    fn save(&self, template_id: &str, bundle: &TemplateBundle) -> Result<()> {
        let mut bundles = self.lock()?;
        if bundles.contains_key(template_id) {
            return Err(duplicate_template(template_id));
        }
        bundles.insert(template_id.to_string(), bundle.clone());
        Ok(())
    }

    fn load(&self, template_id: &str) -> Result<TemplateBundle> {
        self.lock()?
            .get(template_id)
            .cloned()
            .ok_or_else(|| unknown_template(template_id))
    }

    fn delete(&self, template_id: &str) -> Result<()> {
        self.lock()?.remove(template_id);
        Ok(())
    }

    fn exists(&self, template_id: &str) -> Result<bool> {
        Ok(self.lock()?.contains_key(template_id))
    }
}
