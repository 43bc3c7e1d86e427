//! Template registry: content-addressed persistence of graph snapshots.
//!
//! A registered template is immutable. Its lifecycle per id is
//! `absent -> registered -> (retrieved | deleted)`; there is no update in
//! place — callers register a new version instead. Every retrieval
//! re-verifies the bundle checksum, so on-disk tampering surfaces at `get`.

pub mod bundle;
pub mod diff;
pub mod recipe;
pub mod storage;

use std::collections::BTreeMap;

use crate::error::Result;
use crate::graph::Graph;

pub use bundle::{TemplateBundle, TemplateMeta};
pub use diff::{DiffResult, StructureDiff, ValuesDiff, DEFAULT_ATOL};
pub use recipe::{
    ForecastEntry, ForecastRecipe, PreprocessingRecipe, PreprocessingStep, RecipePolicy,
};
pub use storage::{
    FilesystemBackend, InMemoryBackend, MemoryObjectStore, ObjectStore, S3Backend,
    SingleFileBackend, StorageBackend,
};

/// Optional fields for [`TemplateRegistry::register_graph`].
#[derive(Default)]
pub struct RegisterOptions {
    /// Explicit version label; computed as the next `v<N>` when absent.
    pub version: Option<String>,
    pub category: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    /// Recipes replayed at instantiation.
    pub forecast: Option<ForecastRecipe>,
    pub preprocessing: Option<PreprocessingRecipe>,
}

/// Options for [`TemplateRegistry::instantiate`].
pub struct InstantiateOptions {
    /// Extra periods merged into the rehydrated graph's period list.
    pub periods: Option<Vec<String>>,
    /// Old-name -> new-name map applied after the recipes run.
    pub rename: Option<BTreeMap<String, String>>,
    pub apply_preprocessing: bool,
    pub apply_forecast: bool,
}

impl Default for InstantiateOptions {
    fn default() -> InstantiateOptions {
        InstantiateOptions {
            periods: None,
            rename: None,
            apply_preprocessing: true,
            apply_forecast: true,
        }
    }
}

pub struct TemplateRegistry {
    backend: Box<dyn StorageBackend>,
}

impl TemplateRegistry {
    pub fn new(backend: Box<dyn StorageBackend>) -> TemplateRegistry {
        TemplateRegistry { backend }
    }

    /// A registry that forgets everything on drop.
    pub fn in_memory() -> TemplateRegistry {
        TemplateRegistry::new(Box::new(InMemoryBackend::new()))
    }

    /// A registry rooted at the default filesystem location
    /// (`$FINMODEL_TEMPLATE_DIR` or a user-scoped data directory).
    pub fn with_default_root() -> Result<TemplateRegistry> {
        Ok(TemplateRegistry::new(Box::new(FilesystemBackend::new(
            FilesystemBackend::default_root(),
        )?)))
    }

    /// Snapshots a graph under `name`, returning the new template id.
    /// Registering an id that already exists is an error.
    pub fn register_graph(
        &self,
        graph: &Graph,
        name: &str,
        options: RegisterOptions,
    ) -> Result<String> {
        let version = match options.version {
            Some(version) => version,
            None => self.next_version(name)?,
        };

        let mut meta = TemplateMeta::new(name, version);
        if let Some(category) = options.category {
            meta.category = category;
        }
        if let Some(description) = options.description {
            meta.description = description;
        }
        meta.tags = options.tags;

        let mut bundle = TemplateBundle::seal(meta, graph.to_dict()?)?;
        bundle.forecast = options.forecast;
        bundle.preprocessing = options.preprocessing;

        let template_id = bundle.template_id();
        self.backend.save(&template_id, &bundle)?;
        Ok(template_id)
    }

    /// The next free `v<N>` for `name`, scanning existing `name_v*` ids.
    fn next_version(&self, name: &str) -> Result<String> {
        let prefix = format!("{name}_v");
        let highest = self
            .backend
            .list()?
            .iter()
            .filter_map(|id| id.strip_prefix(&prefix)?.parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        Ok(format!("v{}", highest + 1))
    }

    /// Loads and re-verifies a bundle. Unknown ids fail with key-not-found
    /// semantics; a checksum mismatch is a hard integrity failure.
    pub fn get(&self, template_id: &str) -> Result<TemplateBundle> {
        let bundle = self.backend.load(template_id)?;
        bundle.verify()?;
        Ok(bundle)
    }

    /// Rehydrates a live graph: periods extension, then the bundle's
    /// preprocessing and forecast recipes (which reference the snapshot's
    /// node names), then the caller's renames.
    pub fn instantiate(
        &self,
        template_id: &str,
        options: InstantiateOptions,
    ) -> Result<Graph> {
        let bundle = self.get(template_id)?;
        let mut graph = Graph::from_dict(&bundle.graph_dict)?;

        if let Some(periods) = options.periods {
            graph.add_periods(periods);
        }
        if options.apply_preprocessing {
            if let Some(preprocessing) = &bundle.preprocessing {
                preprocessing.apply(&mut graph)?;
            }
        }
        if options.apply_forecast {
            if let Some(forecast) = &bundle.forecast {
                forecast.apply(&mut graph)?;
            }
        }
        if let Some(renames) = &options.rename {
            graph.rename_nodes(renames)?;
        }
        Ok(graph)
    }

    /// All template ids, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut ids = self.backend.list()?;
        ids.sort();
        Ok(ids)
    }

    /// Best-effort removal; absent ids are not an error.
    pub fn delete(&self, template_id: &str) -> Result<()> {
        self.backend.delete(template_id)
    }

    /// Compares two registered templates (structure, and values when
    /// requested) by rehydrating each bundle's snapshot without recipes.
    pub fn diff_templates(
        &self,
        template_id_a: &str,
        template_id_b: &str,
        include_values: bool,
        periods: Option<&[String]>,
        atol: f64,
    ) -> Result<DiffResult> {
        let snapshot_only = || InstantiateOptions {
            apply_preprocessing: false,
            apply_forecast: false,
            ..InstantiateOptions::default()
        };
        let graph_a = self.instantiate(template_id_a, snapshot_only())?;
        let graph_b = self.instantiate(template_id_b, snapshot_only())?;
        diff::diff(&graph_a, &graph_b, include_values, periods, atol)
    }
}
