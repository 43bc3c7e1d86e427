//! Structural and numeric comparison of two graphs.
//!
//! Structure compares configuration signatures (a node's exported shape
//! minus its stored time-series values). Values compare computed cells
//! within a tolerance; a cell that fails to calculate on either side is
//! logged and skipped rather than failing the whole comparison.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

use crate::error::{ModelError, Result};
use crate::graph::serialize::node_signature;
use crate::graph::Graph;

pub const DEFAULT_ATOL: f64 = 1e-9;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StructureDiff {
    /// Names present in B but not in A.
    pub added_nodes: Vec<String>,
    /// Names present in A but not in B.
    pub removed_nodes: Vec<String>,
    /// Names present in both whose configuration signatures differ.
    pub changed_nodes: BTreeMap<String, String>,
}

impl StructureDiff {
    pub fn is_empty(&self) -> bool {
        self.added_nodes.is_empty()
            && self.removed_nodes.is_empty()
            && self.changed_nodes.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValuesDiff {
    /// `"node|period"` -> `value_in_B - value_in_A`, for cells whose
    /// absolute delta exceeds the tolerance.
    pub changed_cells: BTreeMap<String, f64>,
    /// Largest absolute delta among the reported cells.
    pub max_delta: f64,
}

impl ValuesDiff {
    pub fn is_empty(&self) -> bool {
        self.changed_cells.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiffResult {
    pub structure: StructureDiff,
    pub values: Option<ValuesDiff>,
}

impl DiffResult {
    /// Drives the CLI's exit-code contract.
    pub fn has_differences(&self) -> bool {
        !self.structure.is_empty() || self.values.as_ref().is_some_and(|v| !v.is_empty())
    }
}

/// O(total node count) structural comparison.
pub fn compare_structure(graph_a: &Graph, graph_b: &Graph) -> StructureDiff {
    let mut diff = StructureDiff::default();

    for name in graph_b.node_names() {
        if !graph_a.has_node(name) {
            diff.added_nodes.push(name.to_string());
        }
    }
    for name in graph_a.node_names() {
        let Some(node_a) = graph_a.get_node(name) else {
            continue;
        };
        match graph_b.get_node(name) {
            None => diff.removed_nodes.push(name.to_string()),
            Some(node_b) => {
                if node_signature(node_a) != node_signature(node_b) {
                    diff.changed_nodes
                        .insert(name.to_string(), "config".to_string());
                }
            }
        }
    }

    diff
}

/// Cell-by-cell comparison over the intersection of node names. Periods are
/// the supplied list, or the intersection of both graphs' period lists;
/// having nothing to compare is an error only when no list was supplied.
pub fn compare_values(
    graph_a: &Graph,
    graph_b: &Graph,
    periods: Option<&[String]>,
    atol: f64,
) -> Result<ValuesDiff> {
    let periods: Vec<String> = match periods {
        Some(list) => list.to_vec(),
        None => {
            let shared: Vec<String> = graph_a
                .periods()
                .iter()
                .filter(|p| graph_b.has_period(p))
                .cloned()
                .collect();
            if shared.is_empty() {
                return Err(ModelError::Period(
                    "the graphs share no periods to compare".into(),
                ));
            }
            shared
        }
    };

    let mut diff = ValuesDiff::default();
    for name in graph_a.node_names() {
        if !graph_b.has_node(name) {
            continue;
        }
        for period in &periods {
            let value_a = match graph_a.calculate(name, period) {
                Ok(value) => value,
                Err(error) => {
                    debug!(node = name, period = %period, %error, "skipping cell (left side failed)");
                    continue;
                }
            };
            let value_b = match graph_b.calculate(name, period) {
                Ok(value) => value,
                Err(error) => {
                    debug!(node = name, period = %period, %error, "skipping cell (right side failed)");
                    continue;
                }
            };
            let delta = value_b - value_a;
            if delta.abs() > atol {
                diff.changed_cells.insert(format!("{name}|{period}"), delta);
                diff.max_delta = diff.max_delta.max(delta.abs());
            }
        }
    }
    Ok(diff)
}

/// Structure always; values when requested.
pub fn diff(
    graph_a: &Graph,
    graph_b: &Graph,
    include_values: bool,
    periods: Option<&[String]>,
    atol: f64,
) -> Result<DiffResult> {
    let structure = compare_structure(graph_a, graph_b);
    let values = if include_values {
        Some(compare_values(graph_a, graph_b, periods, atol)?)
    } else {
        None
    };
    Ok(DiffResult { structure, values })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CalculationMethod;
    use std::collections::BTreeMap as Map;

    fn base_graph() -> Graph {
        let mut graph = Graph::new(["2022", "2023"]);
        graph
            .import_data(&Map::from([
                (
                    "revenue".to_string(),
                    Map::from([("2022".to_string(), 90.0), ("2023".to_string(), 100.0)]),
                ),
                (
                    "cogs".to_string(),
                    Map::from([("2023".to_string(), 60.0)]),
                ),
            ]))
            .unwrap();
        graph
            .add_calculation(
                "gross_profit",
                &["revenue", "cogs"],
                CalculationMethod::Subtraction,
            )
            .unwrap();
        graph
    }

    #[test]
    fn test_diff_of_deep_clone_is_empty() {
        let graph = base_graph();
        let clone = graph.clone_graph(true);
        let result = diff(&graph, &clone, true, None, DEFAULT_ATOL).unwrap();
        assert!(!result.has_differences());
        assert!(result.structure.added_nodes.is_empty());
        assert!(result.structure.removed_nodes.is_empty());
        assert!(result.structure.changed_nodes.is_empty());
        assert!(result.values.unwrap().changed_cells.is_empty());
    }

    #[test]
    fn test_added_removed_changed() {
        let graph_a = base_graph();
        let mut graph_b = base_graph();
        graph_b.remove_node("gross_profit").unwrap();
        graph_b
            .add_item("opex", Map::from([("2023".to_string(), 10.0)]))
            .unwrap();
        graph_b
            .add_calculation(
                "gross_profit",
                &["revenue", "cogs"],
                CalculationMethod::Addition,
            )
            .unwrap();

        let structure = compare_structure(&graph_a, &graph_b);
        assert_eq!(structure.added_nodes, vec!["opex"]);
        assert!(structure.removed_nodes.is_empty());
        assert_eq!(
            structure.changed_nodes.get("gross_profit").map(String::as_str),
            Some("config")
        );
        // Stored values are not part of the configuration signature.
        assert!(!structure.changed_nodes.contains_key("revenue"));
    }

    #[test]
    fn test_value_changes_within_tolerance_ignored() {
        let graph_a = base_graph();
        let mut graph_b = base_graph();
        graph_b
            .set_item_value("revenue", "2023", 100.0 + 1e-12)
            .unwrap();
        let values = compare_values(&graph_a, &graph_b, None, DEFAULT_ATOL).unwrap();
        assert!(values.is_empty());

        graph_b.set_item_value("revenue", "2023", 101.0).unwrap();
        let values = compare_values(&graph_a, &graph_b, None, DEFAULT_ATOL).unwrap();
        assert_eq!(values.changed_cells.get("revenue|2023"), Some(&1.0));
        assert_eq!(values.changed_cells.get("gross_profit|2023"), Some(&1.0));
        assert_eq!(values.max_delta, 1.0);
    }

    #[test]
    fn test_no_shared_periods_fails_fast_unless_supplied() {
        let graph_a = Graph::new(["2020"]);
        let graph_b = Graph::new(["2030"]);
        assert!(matches!(
            compare_values(&graph_a, &graph_b, None, DEFAULT_ATOL),
            Err(ModelError::Period(_))
        ));

        // An explicitly supplied (even empty) list never raises.
        let values = compare_values(&graph_a, &graph_b, Some(&[]), DEFAULT_ATOL).unwrap();
        assert!(values.is_empty());
    }

    #[test]
    fn test_failing_cells_are_skipped() {
        let mut graph_a = base_graph();
        let mut graph_b = base_graph();
        // A division by zero on one side only.
        for graph in [&mut graph_a, &mut graph_b] {
            graph
                .add_item("divisor", Map::from([("2023".to_string(), 2.0)]))
                .unwrap();
            graph
                .add_calculation(
                    "ratio",
                    &["revenue", "divisor"],
                    CalculationMethod::Division,
                )
                .unwrap();
        }
        graph_b.set_item_value("divisor", "2023", 0.0).unwrap();

        let values = compare_values(&graph_a, &graph_b, None, DEFAULT_ATOL).unwrap();
        assert!(!values.changed_cells.keys().any(|k| k.starts_with("ratio|")));
        // The divisor cell itself still reports.
        assert_eq!(values.changed_cells.get("divisor|2023"), Some(&-2.0));
    }

    #[test]
    fn test_structure_only_when_values_not_requested() {
        let graph = base_graph();
        let result = diff(&graph, &graph, false, None, DEFAULT_ATOL).unwrap();
        assert!(result.values.is_none());
        assert!(!result.has_differences());
    }
}
