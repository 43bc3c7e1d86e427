//! Single-file backend: every bundle in one JSON document.
//!
//! Convenient for small registries shipped as a fixture or checked into a
//! repository. The document is a `template_id -> bundle` object, rewritten
//! atomically on every mutation.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use tempfile::NamedTempFile;

use crate::error::{ModelError, Result};
use crate::template::bundle::TemplateBundle;

use super::{duplicate_template, unknown_template, StorageBackend};

#[derive(Debug)]
pub struct SingleFileBackend {
    path: PathBuf,
    lock: Mutex<()>,
}

impl SingleFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> SingleFileBackend {
        SingleFileBackend {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn read_all(&self) -> Result<BTreeMap<String, TemplateBundle>> {
        match std::fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                ModelError::Storage(format!(
                    "registry file {} is corrupt: {e}",
                    self.path.display()
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(ModelError::Storage(format!(
                "reading registry file {}: {e}",
                self.path.display()
            ))),
        }
    }

    fn write_all(&self, bundles: &BTreeMap<String, TemplateBundle>) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(bundles)
            .map_err(|e| ModelError::Storage(format!("encoding registry file: {e}")))?;
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let mut staged = NamedTempFile::new_in(&dir)
            .map_err(|e| ModelError::Storage(format!("staging registry write: {e}")))?;
        staged
            .write_all(&bytes)
            .map_err(|e| ModelError::Storage(format!("staging registry write: {e}")))?;
        staged.persist(&self.path).map_err(|e| {
            ModelError::Storage(format!(
                "committing registry file {}: {}",
                self.path.display(),
                e.error
            ))
        })?;
        Ok(())
    }

    fn hold(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| ModelError::Storage("registry lock poisoned".into()))
    }
}

impl StorageBackend for SingleFileBackend {
    fn list(&self) -> Result<Vec<String>> {
        let _guard = self.hold()?;
        Ok(self.read_all()?.into_keys().collect())
    }

    fn save(&self, template_id: &str, bundle: &TemplateBundle) -> Result<()> {
        let _guard = self.hold()?;
        let mut bundles = self.read_all()?;
        if bundles.contains_key(template_id) {
            return Err(duplicate_template(template_id));
        }
        bundles.insert(template_id.to_string(), bundle.clone());
        self.write_all(&bundles)
    }

    fn load(&self, template_id: &str) -> Result<TemplateBundle> {
        let _guard = self.hold()?;
        self.read_all()?
            .remove(template_id)
            .ok_or_else(|| unknown_template(template_id))
    }

    fn delete(&self, template_id: &str) -> Result<()> {
        let _guard = self.hold()?;
        let mut bundles = self.read_all()?;
        if bundles.remove(template_id).is_some() {
            self.write_all(&bundles)?;
        }
        Ok(())
    }

    fn exists(&self, template_id: &str) -> Result<bool> {
        let _guard = self.hold()?;
        Ok(self.read_all()?.contains_key(template_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::bundle::TemplateMeta;
    use serde_json::json;

    fn bundle(name: &str) -> TemplateBundle {
        TemplateBundle::seal(TemplateMeta::new(name, "v1"), json!({ "nodes": {} })).unwrap()
    }

    #[test]
    fn test_round_trip_in_one_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let backend = SingleFileBackend::new(&path);

        backend.save("a_v1", &bundle("a")).unwrap();
        backend.save("b_v1", &bundle("b")).unwrap();
        assert_eq!(backend.list().unwrap(), vec!["a_v1", "b_v1"]);

        // One document on disk holding both.
        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert!(raw.get("a_v1").is_some() && raw.get("b_v1").is_some());

        backend.delete("a_v1").unwrap();
        assert_eq!(backend.list().unwrap(), vec!["b_v1"]);
        backend.delete("a_v1").unwrap();
    }

    #[test]
    fn test_no_silent_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SingleFileBackend::new(dir.path().join("registry.json"));
        backend.save("a_v1", &bundle("a")).unwrap();
        assert!(matches!(
            backend.save("a_v1", &bundle("a")),
            Err(ModelError::Storage(_))
        ));
    }

    #[test]
    fn test_missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SingleFileBackend::new(dir.path().join("absent.json"));
        assert!(backend.list().unwrap().is_empty());
        assert!(matches!(
            backend.load("ghost_v1"),
            Err(ModelError::Node(_))
        ));
    }
}
