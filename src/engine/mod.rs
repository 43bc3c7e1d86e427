//! The calculation engine: the sole authority for cross-node value caching.
//!
//! Evaluation is a recursive DFS through the node registry, honoring cached
//! values so shared dependencies are computed once. The visiting stack is
//! keyed by `(node, period)` — a forecast node resolving its own earlier
//! period is legitimate recursion, not a cycle.

pub mod builders;

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::error::{ModelError, Result};
use crate::graph::registry::NodeRegistry;
use crate::node::ValueResolver;

pub use builders::{CalculationMethod, ForecastMethod};

/// Two-level value cache plus the evaluation driver. Owned by a `Graph`;
/// logically part of the graph's derived state and never persisted.
#[derive(Debug, Default)]
pub struct CalculationEngine {
    // node name -> period -> value. Interior mutability keeps `calculate`
    // usable through a shared borrow; the crate is single-threaded by
    // contract and the cell is never held across a recursion boundary.
    cache: RefCell<HashMap<String, HashMap<String, f64>>>,
}

impl Clone for CalculationEngine {
    fn clone(&self) -> CalculationEngine {
        CalculationEngine {
            cache: RefCell::new(self.cache.borrow().clone()),
        }
    }
}

impl CalculationEngine {
    pub fn new() -> CalculationEngine {
        CalculationEngine::default()
    }

    /// Computes one node's value for one period, consulting the cache
    /// first. Any failure inside evaluation surfaces as a single
    /// calculation-error kind naming the failing node and period.
    pub(crate) fn calculate(&self, registry: &NodeRegistry, name: &str, period: &str) -> Result<f64> {
        let mut visiting = Vec::new();
        self.evaluate(registry, name, period, &mut visiting)
    }

    fn evaluate(
        &self,
        registry: &NodeRegistry,
        name: &str,
        period: &str,
        visiting: &mut Vec<(String, String)>,
    ) -> Result<f64> {
        if let Some(value) = self.cached(name, period) {
            return Ok(value);
        }

        let node = registry
            .get(name)
            .ok_or_else(|| ModelError::Node(format!("node '{name}' not found")))?;

        if visiting.iter().any(|(n, p)| n == name && p == period) {
            let mut path: Vec<String> = visiting.iter().map(|(n, _)| n.clone()).collect();
            path.push(name.to_string());
            let cycle = ModelError::CircularDependency { path };
            return Err(ModelError::calculation(name, period, cycle));
        }

        visiting.push((name.to_string(), period.to_string()));
        let result = node.evaluate(
            &mut EngineResolver {
                engine: self,
                registry,
                visiting: &mut *visiting,
            },
            period,
        );
        visiting.pop();

        match result {
            Ok(value) => {
                self.store(name, period, value);
                Ok(value)
            }
            // Wrap the cause exactly once, at the node where it surfaced;
            // enclosing frames pass it through unchanged.
            Err(already @ ModelError::Calculation { .. }) => Err(already),
            Err(cause) => Err(ModelError::calculation(name, period, cause)),
        }
    }

    fn cached(&self, name: &str, period: &str) -> Option<f64> {
        self.cache
            .borrow()
            .get(name)
            .and_then(|by_period| by_period.get(period))
            .copied()
    }

    fn store(&self, name: &str, period: &str, value: f64) {
        self.cache
            .borrow_mut()
            .entry(name.to_string())
            .or_default()
            .insert(period.to_string(), value);
    }

    /// Drops every cached value.
    pub fn clear(&self) {
        debug!("clearing calculation cache");
        self.cache.borrow_mut().clear();
    }

    /// Drops cached values for the given node names only.
    pub fn invalidate<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut cache = self.cache.borrow_mut();
        for name in names {
            cache.remove(name.as_ref());
        }
    }

    /// Best-effort bulk recalculation: full cache clear first (no partial
    /// reuse across a sweep), then every node for every target period.
    /// Per-cell failures are logged and skipped; one broken node must not
    /// abort the sweep.
    pub(crate) fn recalculate_all(&self, registry: &NodeRegistry, periods: &[String]) {
        self.clear();
        let names: Vec<String> = registry.names().map(str::to_string).collect();
        for name in &names {
            for period in periods {
                if let Err(error) = self.calculate(registry, name, period) {
                    warn!(node = %name, period = %period, %error, "skipping cell in bulk recalculation");
                }
            }
        }
    }

    /// Invalidates a node and its transitive dependents. Used when a node is
    /// replaced, removed, or its calculation method changes: cached values
    /// must always reflect current configuration and current input values.
    pub(crate) fn invalidate_downstream(&self, registry: &NodeRegistry, name: &str) {
        let affected: HashSet<String> = crate::graph::topology::dependents_closure(registry, name);
        self.invalidate(affected.iter());
    }
}

struct EngineResolver<'a, 'v> {
    engine: &'a CalculationEngine,
    registry: &'a NodeRegistry,
    visiting: &'v mut Vec<(String, String)>,
}

impl ValueResolver for EngineResolver<'_, '_> {
    fn value_of(&mut self, name: &str, period: &str) -> Result<f64> {
        self.engine.evaluate(self.registry, name, period, self.visiting)
    }
}
