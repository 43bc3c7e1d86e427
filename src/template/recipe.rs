//! Declarative recipes stored alongside a template and replayed at
//! instantiation: a forecast recipe (which nodes to project and how) and a
//! preprocessing recipe (ordered data-preparation steps).
//!
//! Only the serializable subset of growth policies can appear here;
//! callable-bearing policies never round-trip through a bundle.

use serde::{Deserialize, Serialize};

use crate::engine::ForecastMethod;
use crate::error::Result;
use crate::graph::Graph;

/// Serializable growth policy selector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum RecipePolicy {
    Fixed { rate: f64 },
    Curve { rates: Vec<f64> },
    HistoricalAverage,
    AverageValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastEntry {
    /// The node to project.
    pub source: String,
    /// Name of the forecast node; defaults to `{source}_forecast`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub base_period: String,
    pub periods: Vec<String>,
    pub policy: RecipePolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastRecipe {
    pub entries: Vec<ForecastEntry>,
}

impl ForecastRecipe {
    /// Adds one forecast node per entry.
    pub fn apply(&self, graph: &mut Graph) -> Result<()> {
        for entry in &self.entries {
            let name = entry
                .name
                .clone()
                .unwrap_or_else(|| format!("{}_forecast", entry.source));
            let method = match &entry.policy {
                RecipePolicy::Fixed { rate } => ForecastMethod::FixedGrowth(*rate),
                RecipePolicy::Curve { rates } => ForecastMethod::Curve(rates.clone()),
                RecipePolicy::HistoricalAverage => ForecastMethod::HistoricalGrowth,
                RecipePolicy::AverageValue => ForecastMethod::AverageValue,
            };
            graph.add_forecast(
                &name,
                &entry.source,
                &entry.base_period,
                &entry.periods,
                method,
            )?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum PreprocessingStep {
    /// Copy each item's last populated value into later empty periods.
    /// `nodes` restricts the pass; absent means every item node.
    CopyForward {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nodes: Option<Vec<String>>,
    },
    /// Create negated companion nodes for the given bases.
    EnsureSigned {
        nodes: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        suffix: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessingRecipe {
    pub steps: Vec<PreprocessingStep>,
}

impl PreprocessingRecipe {
    /// Runs the steps in order.
    pub fn apply(&self, graph: &mut Graph) -> Result<()> {
        for step in &self.steps {
            match step {
                PreprocessingStep::CopyForward { nodes } => {
                    graph.copy_forward_items(nodes.as_deref())?;
                }
                PreprocessingStep::EnsureSigned { nodes, suffix } => {
                    let bases: Vec<&str> = nodes.iter().map(String::as_str).collect();
                    graph.ensure_signed_nodes(&bases, suffix.as_deref())?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::collections::BTreeMap;

    fn sales_graph() -> Graph {
        let mut graph = Graph::new(["2022", "2023"]);
        graph
            .add_item(
                "sales",
                BTreeMap::from([("2022".to_string(), 100.0), ("2023".to_string(), 120.0)]),
            )
            .unwrap();
        graph
    }

    #[test]
    fn test_forecast_recipe_round_trips_and_applies() {
        let recipe = ForecastRecipe {
            entries: vec![ForecastEntry {
                source: "sales".to_string(),
                name: None,
                base_period: "2023".to_string(),
                periods: vec!["2024".to_string()],
                policy: RecipePolicy::Fixed { rate: 0.10 },
            }],
        };

        let text = serde_json::to_string(&recipe).unwrap();
        let back: ForecastRecipe = serde_json::from_str(&text).unwrap();
        assert_eq!(back, recipe);

        let mut graph = sales_graph();
        back.apply(&mut graph).unwrap();
        assert_relative_eq!(
            graph.calculate("sales_forecast", "2024").unwrap(),
            132.0,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_preprocessing_steps_run_in_order() {
        let recipe = PreprocessingRecipe {
            steps: vec![
                PreprocessingStep::CopyForward { nodes: None },
                PreprocessingStep::EnsureSigned {
                    nodes: vec!["sales".to_string()],
                    suffix: None,
                },
            ],
        };

        let mut graph = Graph::new(["2022", "2023"]);
        graph
            .add_item("sales", BTreeMap::from([("2022".to_string(), 100.0)]))
            .unwrap();
        recipe.apply(&mut graph).unwrap();

        assert_eq!(graph.calculate("sales", "2023").unwrap(), 100.0);
        assert_eq!(graph.calculate("sales_signed", "2023").unwrap(), -100.0);
    }
}
