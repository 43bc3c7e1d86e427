//! The calculation graph: node registry lifecycle, period management,
//! structural validation, cloning, and the serialization boundary.
//!
//! Evaluation itself is delegated to the [`CalculationEngine`]; builder
//! operations live in [`crate::engine::builders`].

pub(crate) mod registry;
pub(crate) mod serialize;
pub(crate) mod topology;

use std::collections::BTreeMap;

use serde_json::Value;

use crate::engine::CalculationEngine;
use crate::error::{ModelError, Result};
use crate::node::Node;
use registry::NodeRegistry;

#[derive(Debug, Clone, Default)]
pub struct Graph {
    pub(crate) registry: NodeRegistry,
    // Sorted, unique. Periods are opaque sortable strings.
    pub(crate) periods: Vec<String>,
    pub(crate) engine: CalculationEngine,
}

impl Graph {
    pub fn new<I, S>(periods: I) -> Graph
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut graph = Graph::default();
        graph.extend_periods(periods.into_iter().map(Into::into));
        graph
    }

    // --- Periods ---

    pub fn periods(&self) -> &[String] {
        &self.periods
    }

    pub fn has_period(&self, period: &str) -> bool {
        self.periods.iter().any(|p| p == period)
    }

    /// Merges new periods in, keeping the list sorted and unique.
    pub fn add_periods<I, S>(&mut self, periods: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extend_periods(periods.into_iter().map(Into::into));
    }

    fn extend_periods(&mut self, periods: impl Iterator<Item = String>) {
        self.periods.extend(periods);
        self.periods.sort();
        self.periods.dedup();
    }

    // --- Node registry ---

    pub fn node_count(&self) -> usize {
        self.registry.len()
    }

    /// Node names in insertion order.
    pub fn node_names(&self) -> Vec<&str> {
        self.registry.names().collect()
    }

    pub fn get_node(&self, name: &str) -> Option<&Node> {
        self.registry.get(name)
    }

    pub fn has_node(&self, name: &str) -> bool {
        self.registry.contains(name)
    }

    /// Inserts a node, replacing any existing node of the same name.
    /// Dependents always resolve inputs by name through the registry, so a
    /// replacement reconnects them with no rebuild; their cached values are
    /// invalidated here.
    pub fn add_node(&mut self, node: Node) {
        let name = node.name().to_string();
        self.registry.insert(node);
        self.engine.invalidate_downstream(&self.registry, &name);
    }

    /// Removes a node. Fails if absent. Downstream cache entries are
    /// invalidated; dependents keep their (now dangling) reference, which
    /// `validate` reports.
    pub fn remove_node(&mut self, name: &str) -> Result<Node> {
        if !self.registry.contains(name) {
            return Err(ModelError::Node(format!("node '{name}' not found")));
        }
        self.engine.invalidate_downstream(&self.registry, name);
        self.registry.remove(name)
    }

    /// Replaces an existing node under the same name.
    pub fn replace_node(&mut self, name: &str, node: Node) -> Result<()> {
        if !self.registry.contains(name) {
            return Err(ModelError::Node(format!("node '{name}' not found")));
        }
        if node.name() != name {
            return Err(ModelError::Node(format!(
                "replacement for '{name}' is named '{}'",
                node.name()
            )));
        }
        self.add_node(node);
        Ok(())
    }

    /// Adds a raw item node. Fails if the name is taken; values must land
    /// on declared periods and be finite.
    pub fn add_item(&mut self, name: &str, values: BTreeMap<String, f64>) -> Result<&Node> {
        if self.registry.contains(name) {
            return Err(ModelError::Node(format!("node '{name}' already exists")));
        }
        for (period, value) in &values {
            if !self.has_period(period) {
                return Err(ModelError::Period(format!(
                    "period '{period}' is not declared in this graph"
                )));
            }
            if !value.is_finite() {
                return Err(ModelError::DataValidation(format!(
                    "value for '{name}' in '{period}' must be finite"
                )));
            }
        }
        self.add_node(Node::item(name, values));
        Ok(self.registry.get(name).expect("node was just inserted"))
    }

    /// Stores a raw value on an item node for a declared period.
    pub fn set_item_value(&mut self, name: &str, period: &str, value: f64) -> Result<()> {
        if !self.has_period(period) {
            return Err(ModelError::Period(format!(
                "period '{period}' is not declared in this graph"
            )));
        }
        if !value.is_finite() {
            return Err(ModelError::DataValidation(format!(
                "value for '{name}' in '{period}' must be finite"
            )));
        }
        let node = self
            .registry
            .get_mut(name)
            .ok_or_else(|| ModelError::Node(format!("node '{name}' not found")))?;
        node.set_value(period, value)?;
        self.engine.invalidate_downstream(&self.registry, name);
        Ok(())
    }

    /// Renames nodes per an old-name -> new-name map, rewriting every
    /// reference held by other nodes. All caches are dropped afterwards.
    pub fn rename_nodes(&mut self, renames: &BTreeMap<String, String>) -> Result<()> {
        for (old, new) in renames {
            if !self.registry.contains(old) {
                return Err(ModelError::Node(format!("node '{old}' not found")));
            }
            let clashes = self.registry.contains(new) && !renames.contains_key(new);
            if clashes || renames.values().filter(|n| *n == new).count() > 1 {
                return Err(ModelError::Node(format!(
                    "rename target '{new}' collides with an existing node"
                )));
            }
        }
        // Two phases via placeholder names, so swaps inside the map cannot
        // collide mid-flight.
        for (position, old) in renames.keys().enumerate() {
            self.registry.rename(old, &format!("\u{0}pending_rename_{position}"))?;
        }
        for (position, new) in renames.values().enumerate() {
            self.registry
                .rename(&format!("\u{0}pending_rename_{position}"), new)?;
        }
        for node in self.registry.iter_mut() {
            node.rewrite_references(renames);
        }
        self.clear_all_caches();
        Ok(())
    }

    // --- Traversal / validation ---

    /// Kahn's algorithm; every node appears after all of its direct inputs.
    pub fn topological_sort(&self) -> Result<Vec<String>> {
        topology::topological_sort(&self.registry)
    }

    /// Every distinct dependency cycle, each as a name path with the first
    /// name repeated at the end.
    pub fn detect_cycles(&self) -> Vec<Vec<String>> {
        topology::detect_cycles(&self.registry)
    }

    /// One message per cycle plus one per dangling input reference; empty
    /// means well-formed.
    pub fn validate(&self) -> Vec<String> {
        topology::validate(&self.registry)
    }

    /// Full adjacency snapshot: node name to direct input names.
    pub fn get_dependency_graph(&self) -> BTreeMap<String, Vec<String>> {
        topology::dependency_graph(&self.registry)
    }

    // --- Cloning ---

    /// Duplicates the graph. The arena owns every node, so the clone never
    /// aliases the original's item data either way; `deep` additionally
    /// resets derived caches (engine cache, forecast memos) on the clone,
    /// while a shallow clone carries them over. Custom-function handles are
    /// shared in both modes.
    pub fn clone_graph(&self, deep: bool) -> Graph {
        let clone = Graph {
            registry: self.registry.clone(),
            periods: self.periods.clone(),
            engine: self.engine.clone(),
        };
        if deep {
            clone.clear_all_caches();
        }
        clone
    }

    // --- Evaluation (delegated to the engine) ---

    /// Computes one node's value for one period.
    pub fn calculate(&self, name: &str, period: &str) -> Result<f64> {
        self.engine.calculate(&self.registry, name, period)
    }

    /// Clears the whole cache, optionally copy-forwards item data, then
    /// best-effort recomputes every node for the target periods (the
    /// graph's full period list when `periods` is `None`; a one-element
    /// slice is the single-period form).
    pub fn recalculate_all(
        &mut self,
        periods: Option<&[String]>,
        copy_forward: bool,
    ) -> Result<()> {
        let targets: Vec<String> = match periods {
            Some(list) => {
                for period in list {
                    if !self.has_period(period) {
                        return Err(ModelError::Period(format!(
                            "period '{period}' is not declared in this graph"
                        )));
                    }
                }
                list.to_vec()
            }
            None => self.periods.clone(),
        };
        if copy_forward {
            self.copy_forward_items(None)?;
        }
        self.engine.recalculate_all(&self.registry, &targets);
        Ok(())
    }

    /// Drops the engine cache and every node-local memo.
    pub fn clear_all_caches(&self) {
        self.engine.clear();
        for node in self.registry.iter() {
            node.clear_cache();
        }
    }

    /// Copies each item node's last populated value into later periods
    /// lacking data. `nodes` restricts the pass; `None` applies to every
    /// item node. Items with no data at all are left untouched.
    pub fn copy_forward_items(&mut self, nodes: Option<&[String]>) -> Result<()> {
        if let Some(names) = nodes {
            for name in names {
                match self.registry.get(name) {
                    Some(Node::Item { .. }) => {}
                    Some(_) => {
                        return Err(ModelError::Node(format!("'{name}' is not an item node")))
                    }
                    None => return Err(ModelError::Node(format!("node '{name}' not found"))),
                }
            }
        }

        let periods = self.periods.clone();
        let mut touched = Vec::new();
        for node in self.registry.iter_mut() {
            if let Node::Item { name, values } = node {
                if nodes.is_some_and(|list| !list.iter().any(|n| n == name)) {
                    continue;
                }
                let Some(last) = periods
                    .iter()
                    .rev()
                    .find(|period| values.contains_key(*period))
                    .cloned()
                else {
                    continue;
                };
                let carry = values[&last];
                let mut changed = false;
                for period in periods.iter().filter(|p| **p > last) {
                    values.entry(period.clone()).or_insert_with(|| {
                        changed = true;
                        carry
                    });
                }
                if changed {
                    touched.push(name.clone());
                }
            }
        }
        for name in touched {
            self.engine.invalidate_downstream(&self.registry, &name);
        }
        Ok(())
    }

    // --- Import / export ---

    /// Ingests an external reader's `item_name -> {period: value}` mapping.
    /// Unknown periods and non-finite values are rejected before any node
    /// is touched.
    pub fn import_data(&mut self, data: &BTreeMap<String, BTreeMap<String, f64>>) -> Result<()> {
        for (name, series) in data {
            for (period, value) in series {
                if !self.has_period(period) {
                    return Err(ModelError::Period(format!(
                        "import for '{name}' references undeclared period '{period}'"
                    )));
                }
                if !value.is_finite() {
                    return Err(ModelError::DataValidation(format!(
                        "import for '{name}' in '{period}' is not a finite number"
                    )));
                }
            }
            if let Some(existing) = self.registry.get(name) {
                if !matches!(existing, Node::Item { .. }) {
                    return Err(ModelError::Node(format!(
                        "cannot import raw data into calculated node '{name}'"
                    )));
                }
            }
        }

        for (name, series) in data {
            match self.registry.get_mut(name) {
                Some(node) => {
                    for (period, value) in series {
                        node.set_value(period.clone(), *value)?;
                    }
                }
                None => {
                    self.registry
                        .insert(Node::item(name.clone(), series.clone()));
                }
            }
            self.engine.invalidate_downstream(&self.registry, name);
        }
        Ok(())
    }

    /// Serializes to a plain-data dict sufficient to reconstruct an
    /// equivalent graph; the exact payload checksummed in template bundles.
    pub fn to_dict(&self) -> Result<Value> {
        serialize::export(&self.registry, &self.periods)
    }

    /// Reconstructs a graph from a `graph_dict`.
    pub fn from_dict(dict: &Value) -> Result<Graph> {
        let (registry, periods) = serialize::import(dict)?;
        Ok(Graph {
            registry,
            periods,
            engine: CalculationEngine::new(),
        })
    }
}
