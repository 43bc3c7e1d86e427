//! Filesystem backend: one JSON file per bundle plus an index file.
//!
//! Layout under the root directory:
//!
//! ```text
//! index.json                              template_id -> relative path
//! store/<name>/<version>/bundle.json      one bundle per template
//! ```
//!
//! Writes go through a tempfile in the destination directory followed by an
//! atomic rename, so a reader (or a concurrent process honoring the same
//! discipline) never observes a partial file. The root and every file are
//! created owner-only. Relative paths read back from the index are guarded
//! against traversal before any file access.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{ModelError, Result};
use crate::template::bundle::TemplateBundle;

use super::{duplicate_template, unknown_template, StorageBackend};

const INDEX_FILE: &str = "index.json";

/// Environment variable overriding the default registry root.
pub const ROOT_ENV_VAR: &str = "FINMODEL_TEMPLATE_DIR";

#[derive(Debug)]
pub struct FilesystemBackend {
    root: PathBuf,
    lock: Mutex<()>,
}

fn hold(lock: &Mutex<()>) -> Result<std::sync::MutexGuard<'_, ()>> {
    lock.lock()
        .map_err(|_| ModelError::Storage("registry lock poisoned".into()))
}

impl FilesystemBackend {
    /// Opens (creating if needed) a registry rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<FilesystemBackend> {
        let root = root.into();
        std::fs::create_dir_all(root.join("store"))
            .map_err(|e| storage_error("creating registry root", &root, e))?;
        restrict_dir(&root)?;
        restrict_dir(&root.join("store"))?;
        Ok(FilesystemBackend {
            root,
            lock: Mutex::new(()),
        })
    }

    /// The default root: `$FINMODEL_TEMPLATE_DIR`, or a user-scoped data
    /// directory.
    pub fn default_root() -> PathBuf {
        if let Ok(root) = std::env::var(ROOT_ENV_VAR) {
            return PathBuf::from(root);
        }
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("finmodel")
            .join("templates")
    }

    fn read_index(&self) -> Result<BTreeMap<String, String>> {
        let path = self.root.join(INDEX_FILE);
        match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| ModelError::Storage(format!("registry index is corrupt: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(storage_error("reading registry index", &path, e)),
        }
    }

    fn write_index(&self, index: &BTreeMap<String, String>) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(index)
            .map_err(|e| ModelError::Storage(format!("encoding registry index: {e}")))?;
        self.write_atomic(&self.root.join(INDEX_FILE), &bytes)
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let dir = path
            .parent()
            .ok_or_else(|| ModelError::Storage(format!("no parent directory for {path:?}")))?;
        let mut staged = NamedTempFile::new_in(dir)
            .map_err(|e| storage_error("staging write", dir, e))?;
        staged
            .write_all(bytes)
            .map_err(|e| storage_error("staging write", path, e))?;
        restrict_file(staged.path())?;
        staged
            .persist(path)
            .map_err(|e| storage_error("committing write", path, e.error))?;
        Ok(())
    }

    /// Validates an index-supplied relative path: traversal outside the
    /// root is an integrity violation, never repaired.
    fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let candidate = Path::new(relative);
        let escapes = candidate.is_absolute()
            || candidate
                .components()
                .any(|c| !matches!(c, Component::Normal(_)));
        if escapes {
            return Err(ModelError::Storage(format!(
                "registry index entry '{relative}' escapes the registry root"
            )));
        }
        Ok(self.root.join(candidate))
    }

    fn bundle_relative_path(bundle: &TemplateBundle) -> Result<String> {
        let name = path_segment(&bundle.meta.name)?;
        let version = path_segment(&bundle.meta.version)?;
        Ok(format!("store/{name}/{version}/bundle.json"))
    }
}

impl StorageBackend for FilesystemBackend {
    fn list(&self) -> Result<Vec<String>> {
        let _guard = hold(&self.lock)?;
        Ok(self.read_index()?.into_keys().collect())
    }

    fn save(&self, template_id: &str, bundle: &TemplateBundle) -> Result<()> {
        let _guard = hold(&self.lock)?;
        let mut index = self.read_index()?;
        if index.contains_key(template_id) {
            return Err(duplicate_template(template_id));
        }

        let relative = Self::bundle_relative_path(bundle)?;
        let path = self.resolve(&relative)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| storage_error("creating bundle directory", parent, e))?;
            // Owner-only on every directory component below the root.
            let mut dir = parent.to_path_buf();
            while dir.starts_with(&self.root) && dir != self.root {
                restrict_dir(&dir)?;
                if !dir.pop() {
                    break;
                }
            }
        }

        let bytes = serde_json::to_vec_pretty(bundle)
            .map_err(|e| ModelError::Storage(format!("encoding bundle: {e}")))?;
        self.write_atomic(&path, &bytes)?;

        index.insert(template_id.to_string(), relative);
        self.write_index(&index)?;
        debug!(template_id, path = %path.display(), "bundle persisted");
        Ok(())
    }

    fn load(&self, template_id: &str) -> Result<TemplateBundle> {
        let _guard = hold(&self.lock)?;
        let index = self.read_index()?;
        let relative = index
            .get(template_id)
            .ok_or_else(|| unknown_template(template_id))?;
        let path = self.resolve(relative)?;
        let bytes =
            std::fs::read(&path).map_err(|e| storage_error("reading bundle", &path, e))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ModelError::Storage(format!("bundle '{template_id}' is corrupt: {e}")))
    }

    fn delete(&self, template_id: &str) -> Result<()> {
        let _guard = hold(&self.lock)?;
        let mut index = self.read_index()?;
        let Some(relative) = index.remove(template_id) else {
            debug!(template_id, "delete of absent template ignored");
            return Ok(());
        };
        let path = self.resolve(&relative)?;
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(storage_error("deleting bundle", &path, e)),
        }
        self.write_index(&index)
    }

    fn exists(&self, template_id: &str) -> Result<bool> {
        let _guard = hold(&self.lock)?;
        Ok(self.read_index()?.contains_key(template_id))
    }
}

/// A template name/version used as a path segment must not reshape the
/// layout.
fn path_segment(raw: &str) -> Result<&str> {
    let valid = !raw.is_empty()
        && raw != "."
        && raw != ".."
        && !raw.contains(['/', '\\'])
        && !raw.contains('\0');
    if !valid {
        return Err(ModelError::Storage(format!(
            "'{raw}' is not usable as a registry path segment"
        )));
    }
    Ok(raw)
}

fn storage_error(context: &str, path: &Path, error: std::io::Error) -> ModelError {
    ModelError::Storage(format!("{context} ({}): {error}", path.display()))
}

#[cfg(unix)]
fn restrict_dir(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .map_err(|e| storage_error("restricting directory permissions", path, e))
}

#[cfg(not(unix))]
fn restrict_dir(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn restrict_file(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| storage_error("restricting file permissions", path, e))
}

#[cfg(not(unix))]
fn restrict_file(_path: &Path) -> Result<()> {
    Ok(())
}
