//! Template bundles: checksummed, versioned graph snapshots.
//!
//! The checksum is the lowercase-hex SHA-256 of the canonical JSON encoding
//! of `graph_dict` — sorted keys, compact separators. `serde_json::Map` is
//! BTreeMap-backed in this crate, so `serde_json::to_string` of a `Value`
//! already yields that canonical form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{ModelError, Result};
use crate::template::recipe::{ForecastRecipe, PreprocessingRecipe};

/// Canonical encoding of a graph dict: the exact bytes that get hashed.
pub fn canonical_json(graph_dict: &Value) -> Result<String> {
    serde_json::to_string(graph_dict)
        .map_err(|e| ModelError::DataValidation(format!("graph_dict is not encodable: {e}")))
}

/// Lowercase-hex SHA-256 of the canonical encoding.
pub fn checksum_of(graph_dict: &Value) -> Result<String> {
    let encoded = canonical_json(graph_dict)?;
    let mut hasher = Sha256::new();
    hasher.update(encoded.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateMeta {
    pub name: String,
    pub version: String,
    pub category: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub tags: Vec<String>,
}

impl TemplateMeta {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> TemplateMeta {
        TemplateMeta {
            name: name.into(),
            version: version.into(),
            category: "general".to_string(),
            description: String::new(),
            created_at: Utc::now(),
            tags: Vec::new(),
        }
    }

    /// The registry key: `{name}_{version}`.
    pub fn template_id(&self) -> String {
        format!("{}_{}", self.name, self.version)
    }
}

/// An immutable snapshot record. The checksum invariant holds from
/// construction on; a bundle that fails it is corrupt and rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateBundle {
    pub meta: TemplateMeta,
    pub graph_dict: Value,
    pub checksum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forecast: Option<ForecastRecipe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preprocessing: Option<PreprocessingRecipe>,
}

impl TemplateBundle {
    /// Builds a bundle, computing the checksum from `graph_dict`.
    pub fn seal(meta: TemplateMeta, graph_dict: Value) -> Result<TemplateBundle> {
        let checksum = checksum_of(&graph_dict)?;
        Ok(TemplateBundle {
            meta,
            graph_dict,
            checksum,
            forecast: None,
            preprocessing: None,
        })
    }

    /// Builds a bundle from an externally supplied checksum, validating it
    /// against `graph_dict`.
    pub fn new(meta: TemplateMeta, graph_dict: Value, checksum: String) -> Result<TemplateBundle> {
        let bundle = TemplateBundle {
            meta,
            graph_dict,
            checksum,
            forecast: None,
            preprocessing: None,
        };
        bundle.verify()?;
        Ok(bundle)
    }

    pub fn template_id(&self) -> String {
        self.meta.template_id()
    }

    /// Recomputes the checksum and compares. The tamper/corruption detector
    /// run at every load.
    pub fn verify(&self) -> Result<()> {
        let actual = checksum_of(&self.graph_dict)?;
        if actual != self.checksum {
            return Err(ModelError::ChecksumMismatch {
                template_id: self.template_id(),
                expected: self.checksum.clone(),
                actual,
            });
        }
        Ok(())
    }
}
