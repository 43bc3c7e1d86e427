//! Pluggable persistence for template bundles.
//!
//! All backends share the same contract: `save` never overwrites an
//! existing id, `delete` is quiet about absent ids, and `load` reports an
//! unknown id with node/key-not-found semantics. Each backend serializes
//! its own access through an instance-scoped lock; cross-process writers
//! additionally rely on the filesystem backend's atomic rename discipline.

mod filesystem;
mod memory;
mod s3;
mod single_file;

pub use filesystem::FilesystemBackend;
pub use memory::InMemoryBackend;
pub use s3::{MemoryObjectStore, ObjectStore, S3Backend};
pub use single_file::SingleFileBackend;

use crate::error::Result;
use crate::template::bundle::TemplateBundle;

pub trait StorageBackend: Send {
    /// All stored template ids, sorted.
    fn list(&self) -> Result<Vec<String>>;

    /// Persists a bundle. Fails if `template_id` already exists.
    fn save(&self, template_id: &str, bundle: &TemplateBundle) -> Result<()>;

    /// Loads a bundle. Fails with a node error if the id is unknown.
    fn load(&self, template_id: &str) -> Result<TemplateBundle>;

    /// Removes a bundle; absent ids are not an error.
    fn delete(&self, template_id: &str) -> Result<()>;

    fn exists(&self, template_id: &str) -> Result<bool> {
        Ok(self.list()?.iter().any(|id| id == template_id))
    }
}

pub(crate) fn unknown_template(template_id: &str) -> crate::error::ModelError {
    crate::error::ModelError::Node(format!("template '{template_id}' not found"))
}

pub(crate) fn duplicate_template(template_id: &str) -> crate::error::ModelError {
    crate::error::ModelError::Storage(format!(
        "template '{template_id}' already exists; register a new version instead"
    ))
}
