//! finmodel: financial-statement models as a calculation graph.
//!
//! A model is a [`Graph`] of named nodes — raw line items, arithmetic
//! calculations, formulas, registered metrics, forecasts — evaluated lazily
//! per period with engine-level caching. Graphs snapshot into checksummed
//! [`template::TemplateBundle`]s behind pluggable storage backends, and two
//! graphs (or template versions) can be diffed structurally and
//! numerically.
//!
//! ```
//! use finmodel::{Graph, engine::CalculationMethod};
//! use std::collections::BTreeMap;
//!
//! let mut graph = Graph::new(["2023"]);
//! graph.add_item("revenue", BTreeMap::from([("2023".to_string(), 100.0)]))?;
//! graph.add_item("cogs", BTreeMap::from([("2023".to_string(), 60.0)]))?;
//! graph.add_calculation("gross_profit", &["revenue", "cogs"], CalculationMethod::Subtraction)?;
//! assert_eq!(graph.calculate("gross_profit", "2023")?, 40.0);
//! # Ok::<(), finmodel::ModelError>(())
//! ```

pub mod engine;
pub mod error;
pub mod graph;
pub mod metrics;
pub mod node;
pub mod template;

// Re-export key types for convenient access
pub use engine::{CalculationEngine, CalculationMethod, ForecastMethod};
pub use error::{ModelError, Result};
pub use graph::Graph;
pub use metrics::{MetricDef, MetricRegistry};
pub use node::{GrowthPolicy, Node, Strategy};
pub use template::{
    DiffResult, InstantiateOptions, RegisterOptions, TemplateBundle, TemplateMeta,
    TemplateRegistry,
};
