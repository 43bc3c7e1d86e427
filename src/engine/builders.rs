//! Builder operations: the engine-side mutations of the graph's registry.
//!
//! These construct calculation, metric, custom, signed-companion, and
//! forecast nodes with referential validation up front, so a successfully
//! added node never dangles at evaluation time.

use std::collections::BTreeMap;

use crate::error::{ModelError, Result};
use crate::graph::Graph;
use crate::metrics::{MetricDef, MetricRegistry};
use crate::node::{
    CustomFn, ForecastState, GrowthFn, GrowthPolicy, Node, SamplerFn, Strategy,
};

/// How a new calculation node combines its inputs.
pub enum CalculationMethod {
    Addition,
    Subtraction,
    Multiplication,
    Division,
    WeightedAverage { weights: Option<Vec<f64>> },
    /// An arithmetic formula over the inputs. `variables` optionally aliases
    /// the inputs positionally; by default a formula references inputs by
    /// their own node names.
    Formula {
        formula: String,
        variables: Option<Vec<String>>,
    },
    Custom { func: CustomFn },
}

/// Growth policy selector for a new forecast node. The historical variants
/// are precomputed from the input node's evaluated history at build time.
pub enum ForecastMethod {
    FixedGrowth(f64),
    Curve(Vec<f64>),
    Statistical(SamplerFn),
    Custom(GrowthFn),
    HistoricalGrowth,
    AverageValue,
}

impl Graph {
    /// Adds a calculation node over existing inputs.
    pub fn add_calculation(
        &mut self,
        name: &str,
        input_names: &[&str],
        method: CalculationMethod,
    ) -> Result<&Node> {
        self.check_new_name(name)?;
        if input_names.is_empty() {
            return Err(ModelError::Configuration(format!(
                "calculation '{name}' needs at least one input"
            )));
        }
        self.check_inputs_exist(name, input_names)?;
        let inputs: Vec<String> = input_names.iter().map(|i| i.to_string()).collect();

        let node = match method {
            CalculationMethod::Addition => calculation(name, inputs, Strategy::Addition),
            CalculationMethod::Subtraction => calculation(name, inputs, Strategy::Subtraction),
            CalculationMethod::Multiplication => {
                calculation(name, inputs, Strategy::Multiplication)
            }
            CalculationMethod::Division => calculation(name, inputs, Strategy::Division),
            CalculationMethod::WeightedAverage { weights } => {
                if let Some(weights) = &weights {
                    if weights.len() != inputs.len() {
                        return Err(ModelError::Strategy(format!(
                            "'{name}': {} weights for {} inputs",
                            weights.len(),
                            inputs.len()
                        )));
                    }
                }
                calculation(name, inputs, Strategy::WeightedAverage { weights })
            }
            CalculationMethod::Formula { formula, variables } => {
                let bindings: BTreeMap<String, String> = match variables {
                    // Positional aliases: variables[i] names inputs[i].
                    Some(aliases) => {
                        if aliases.len() != inputs.len() {
                            return Err(ModelError::Configuration(format!(
                                "'{name}': {} variable names for {} inputs",
                                aliases.len(),
                                inputs.len()
                            )));
                        }
                        aliases.into_iter().zip(inputs.iter().cloned()).collect()
                    }
                    // Default: formulas reference inputs by their own names.
                    None => inputs.iter().map(|i| (i.clone(), i.clone())).collect(),
                };
                formula_node(name, &formula, bindings)?
            }
            CalculationMethod::Custom { func } => Node::Calculation {
                name: name.to_string(),
                inputs,
                strategy: Strategy::CustomFormula(func),
                description: None,
            },
        };

        self.add_node(node);
        Ok(self.get_node(name).expect("node was just inserted"))
    }

    /// Adds a metric node from a registered definition. Each required input
    /// resolves to an existing node — directly by name, or through
    /// `input_map` (metric input name -> node name). Every missing input is
    /// reported in one error.
    pub fn add_metric(
        &mut self,
        metrics: &MetricRegistry,
        metric_name: &str,
        node_name: Option<&str>,
        input_map: Option<&BTreeMap<String, String>>,
    ) -> Result<&Node> {
        let def = metrics.get(metric_name).ok_or_else(|| {
            ModelError::Metric(format!("unknown metric '{metric_name}'"))
        })?;
        let name = node_name.unwrap_or(metric_name);
        self.check_new_name(name)?;

        let mut bindings = BTreeMap::new();
        let mut missing = Vec::new();
        for input in &def.inputs {
            let resolved = input_map
                .and_then(|map| map.get(input))
                .cloned()
                .unwrap_or_else(|| input.clone());
            if self.has_node(&resolved) {
                bindings.insert(input.clone(), resolved);
            } else {
                missing.push(resolved);
            }
        }
        if !missing.is_empty() {
            return Err(ModelError::Node(format!(
                "metric '{metric_name}' requires missing input node(s): {}",
                missing.join(", ")
            )));
        }

        let base = formula_node(name, &def.formula, bindings)?;
        let node = match base {
            Node::Formula {
                name,
                source,
                expr,
                variables,
            } => Node::Metric {
                name,
                metric_name: def.name.clone(),
                metric_description: def.description.clone(),
                source,
                expr,
                variables,
            },
            _ => unreachable!("formula_node builds formula nodes"),
        };

        self.add_node(node);
        Ok(self.get_node(name).expect("node was just inserted"))
    }

    /// Wraps an arbitrary callable as a node. `inputs`, if given, must name
    /// existing nodes; their values are handed to the callable by name.
    pub fn add_custom_calculation(
        &mut self,
        name: &str,
        calculation_func: CustomFn,
        inputs: Option<&[&str]>,
        description: Option<&str>,
    ) -> Result<&Node> {
        self.check_new_name(name)?;
        let inputs = inputs.unwrap_or_default();
        self.check_inputs_exist(name, inputs)?;
        let node = Node::Calculation {
            name: name.to_string(),
            inputs: inputs.iter().map(|i| i.to_string()).collect(),
            strategy: Strategy::CustomFormula(calculation_func),
            description: description.map(str::to_string),
        };
        self.add_node(node);
        Ok(self.get_node(name).expect("node was just inserted"))
    }

    /// Idempotently creates a negated companion (`-1 * base`) for each base
    /// id not already paired. Returns the companion names, aligned with
    /// `base_ids`. Fails if any base id does not exist.
    pub fn ensure_signed_nodes(
        &mut self,
        base_ids: &[&str],
        suffix: Option<&str>,
    ) -> Result<Vec<String>> {
        let suffix = suffix.unwrap_or("_signed");
        for base in base_ids {
            if !self.has_node(base) {
                return Err(ModelError::Node(format!("node '{base}' not found")));
            }
        }
        let mut companions = Vec::with_capacity(base_ids.len());
        for base in base_ids {
            let companion = format!("{base}{suffix}");
            if !self.has_node(&companion) {
                let node = formula_node(
                    &companion,
                    "-value",
                    BTreeMap::from([("value".to_string(), base.to_string())]),
                )?;
                self.add_node(node);
            }
            companions.push(companion);
        }
        Ok(companions)
    }

    /// Swaps the calculation strategy of an existing calculation node in
    /// place and drops the stale cached values it and its dependents hold.
    pub fn change_calculation_method(
        &mut self,
        node_name: &str,
        new_method_key: &str,
        weights: Option<Vec<f64>>,
    ) -> Result<()> {
        let new_strategy = Strategy::from_key(new_method_key, weights)?;
        let node = self
            .registry
            .get_mut(node_name)
            .ok_or_else(|| ModelError::Node(format!("node '{node_name}' not found")))?;
        match node {
            Node::Calculation { strategy, .. } => {
                *strategy = new_strategy;
            }
            other => {
                return Err(ModelError::Node(format!(
                    "'{}' is not a calculation node",
                    other.name()
                )))
            }
        }
        self.engine.invalidate_downstream(&self.registry, node_name);
        Ok(())
    }

    /// Adds a forecast node projecting `input` over `forecast_periods` from
    /// `base_period`. The graph's period list is extended to cover the
    /// forecast periods.
    pub fn add_forecast(
        &mut self,
        name: &str,
        input: &str,
        base_period: &str,
        forecast_periods: &[String],
        method: ForecastMethod,
    ) -> Result<&Node> {
        self.check_new_name(name)?;
        if !self.has_node(input) {
            return Err(ModelError::Node(format!("node '{input}' not found")));
        }
        if !self.has_period(base_period) {
            return Err(ModelError::Period(format!(
                "base period '{base_period}' is not declared in this graph"
            )));
        }
        if forecast_periods.is_empty() {
            return Err(ModelError::Configuration(format!(
                "forecast '{name}' needs at least one forecast period"
            )));
        }

        let policy = match method {
            ForecastMethod::FixedGrowth(rate) => GrowthPolicy::Fixed(rate),
            ForecastMethod::Curve(rates) => GrowthPolicy::Curve(rates),
            ForecastMethod::Statistical(sampler) => GrowthPolicy::Statistical(sampler),
            ForecastMethod::Custom(func) => GrowthPolicy::Custom(func),
            ForecastMethod::HistoricalGrowth => {
                GrowthPolicy::historical_average(&self.history_of(input, base_period)?)
            }
            ForecastMethod::AverageValue => {
                GrowthPolicy::average_value(&self.history_of(input, base_period)?)
            }
        };

        let state = ForecastState::new(input, base_period, forecast_periods.to_vec(), policy)?;
        self.add_periods(forecast_periods.iter().cloned());
        self.add_node(Node::Forecast {
            name: name.to_string(),
            state,
        });
        Ok(self.get_node(name).expect("node was just inserted"))
    }

    /// The metric node tagged with `metric_name`, if one was added.
    pub fn get_metric(&self, metric_name: &str) -> Option<&Node> {
        self.registry.iter().find(|node| {
            matches!(node, Node::Metric { metric_name: tag, .. } if tag == metric_name)
        })
    }

    /// Metric names available for [`Graph::add_metric`], sorted.
    pub fn get_available_metrics<'a>(&self, metrics: &'a MetricRegistry) -> Vec<&'a str> {
        metrics.list()
    }

    /// A registered metric's definition.
    pub fn get_metric_info<'a>(
        &self,
        metrics: &'a MetricRegistry,
        metric_name: &str,
    ) -> Result<&'a MetricDef> {
        metrics.get(metric_name).ok_or_else(|| {
            ModelError::Metric(format!("unknown metric '{metric_name}'"))
        })
    }

    // --- shared validation ---

    fn check_new_name(&self, name: &str) -> Result<()> {
        if self.has_node(name) {
            return Err(ModelError::Node(format!("node '{name}' already exists")));
        }
        Ok(())
    }

    fn check_inputs_exist(&self, name: &str, inputs: &[&str]) -> Result<()> {
        let missing: Vec<&str> = inputs
            .iter()
            .copied()
            .filter(|input| !self.has_node(input))
            .collect();
        if !missing.is_empty() {
            return Err(ModelError::Node(format!(
                "'{name}' references missing input node(s): {}",
                missing.join(", ")
            )));
        }
        Ok(())
    }

    /// The input node's evaluated values over every declared period up to
    /// and including `base_period`, in period order.
    fn history_of(&self, input: &str, base_period: &str) -> Result<Vec<f64>> {
        self.periods
            .iter()
            .filter(|period| period.as_str() <= base_period)
            .map(|period| self.calculate(input, period))
            .collect()
    }
}

fn calculation(name: &str, inputs: Vec<String>, strategy: Strategy) -> Node {
    Node::Calculation {
        name: name.to_string(),
        inputs,
        strategy,
        description: None,
    }
}

/// Builds a formula node, validating at construction that every variable in
/// the parsed expression is bound to a node.
fn formula_node(name: &str, formula: &str, bindings: BTreeMap<String, String>) -> Result<Node> {
    let node = Node::formula(name, formula, bindings)?;
    if let Node::Formula {
        expr, variables, ..
    } = &node
    {
        for variable in expr.variables() {
            if !variables.contains_key(&variable) {
                return Err(ModelError::Configuration(format!(
                    "formula '{formula}' references unbound variable '{variable}'"
                )));
            }
        }
    }
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::collections::BTreeMap as Map;
    use std::sync::Arc;

    fn graph_with_items(items: &[(&str, f64)]) -> Graph {
        let mut graph = Graph::new(["2023"]);
        let data = items
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    Map::from([("2023".to_string(), *value)]),
                )
            })
            .collect();
        graph.import_data(&data).unwrap();
        graph
    }

    #[test]
    fn test_formula_defaults_to_input_names() {
        let mut graph = graph_with_items(&[("revenue", 100.0), ("cogs", 60.0)]);
        graph
            .add_calculation(
                "gross_profit",
                &["revenue", "cogs"],
                CalculationMethod::Formula {
                    formula: "revenue - cogs".to_string(),
                    variables: None,
                },
            )
            .unwrap();
        assert_eq!(graph.calculate("gross_profit", "2023").unwrap(), 40.0);
    }

    #[test]
    fn test_formula_positional_aliases() {
        let mut graph = graph_with_items(&[("revenue", 100.0), ("cogs", 60.0)]);
        graph
            .add_calculation(
                "margin",
                &["revenue", "cogs"],
                CalculationMethod::Formula {
                    formula: "(r - c) / r".to_string(),
                    variables: Some(vec!["r".to_string(), "c".to_string()]),
                },
            )
            .unwrap();
        assert_relative_eq!(graph.calculate("margin", "2023").unwrap(), 0.4);
    }

    #[test]
    fn test_formula_unbound_variable_rejected_at_build() {
        let mut graph = graph_with_items(&[("revenue", 100.0)]);
        let err = graph
            .add_calculation(
                "bad",
                &["revenue"],
                CalculationMethod::Formula {
                    formula: "revenue - cogs".to_string(),
                    variables: None,
                },
            )
            .unwrap_err();
        assert!(matches!(err, ModelError::Configuration(_)), "{err:?}");
    }

    #[test]
    fn test_missing_inputs_reported_together() {
        let mut graph = graph_with_items(&[("revenue", 100.0)]);
        let err = graph
            .add_calculation(
                "x",
                &["revenue", "ghost_a", "ghost_b"],
                CalculationMethod::Addition,
            )
            .unwrap_err();
        match err {
            ModelError::Node(message) => {
                assert!(message.contains("ghost_a") && message.contains("ghost_b"), "{message}");
            }
            other => panic!("expected node error, got {other:?}"),
        }
    }

    #[test]
    fn test_name_clash_rejected() {
        let mut graph = graph_with_items(&[("revenue", 100.0)]);
        let err = graph
            .add_calculation("revenue", &["revenue"], CalculationMethod::Addition)
            .unwrap_err();
        assert!(matches!(err, ModelError::Node(_)));
    }

    #[test]
    fn test_metric_dependency_auto_resolution() {
        let metrics = MetricRegistry::builtin();
        let mut graph = graph_with_items(&[("revenue", 200.0)]);

        // net_income is absent: one node error naming it.
        let err = graph
            .add_metric(&metrics, "net_profit_margin", None, None)
            .unwrap_err();
        match err {
            ModelError::Node(message) => assert!(message.contains("net_income"), "{message}"),
            other => panic!("expected node error, got {other:?}"),
        }

        // After adding the raw item, the same call succeeds.
        graph
            .add_item("net_income", Map::from([("2023".to_string(), 30.0)]))
            .unwrap();
        graph
            .add_metric(&metrics, "net_profit_margin", None, None)
            .unwrap();
        assert_relative_eq!(
            graph.calculate("net_profit_margin", "2023").unwrap(),
            0.15,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_metric_rename_mapping_and_introspection() {
        let metrics = MetricRegistry::builtin();
        let mut graph = graph_with_items(&[("sales", 100.0), ("cost_of_sales", 55.0)]);
        graph
            .add_metric(
                &metrics,
                "gross_profit_margin",
                Some("gpm"),
                Some(&Map::from([
                    ("revenue".to_string(), "sales".to_string()),
                    ("cogs".to_string(), "cost_of_sales".to_string()),
                ])),
            )
            .unwrap();

        assert_relative_eq!(graph.calculate("gpm", "2023").unwrap(), 0.45);
        let node = graph.get_metric("gross_profit_margin").unwrap();
        assert_eq!(node.name(), "gpm");
        assert!(graph
            .get_available_metrics(&metrics)
            .contains(&"gross_profit_margin"));
        assert_eq!(
            graph
                .get_metric_info(&metrics, "gross_profit_margin")
                .unwrap()
                .inputs,
            vec!["revenue", "cogs"]
        );
    }

    #[test]
    fn test_unknown_metric_is_a_metric_error() {
        let metrics = MetricRegistry::builtin();
        let mut graph = graph_with_items(&[]);
        let err = graph
            .add_metric(&metrics, "profitability_of_dreams", None, None)
            .unwrap_err();
        assert!(matches!(err, ModelError::Metric(_)));
    }

    #[test]
    fn test_custom_calculation() {
        let mut graph = graph_with_items(&[("revenue", 100.0)]);
        graph
            .add_custom_calculation(
                "taxed",
                Arc::new(|inputs| Ok(inputs["revenue"] * 0.79)),
                Some(&["revenue"]),
                Some("Revenue after flat tax"),
            )
            .unwrap();
        assert_relative_eq!(graph.calculate("taxed", "2023").unwrap(), 79.0);

        let err = graph
            .add_custom_calculation("bad", Arc::new(|_| Ok(0.0)), Some(&["ghost"]), None)
            .unwrap_err();
        assert!(matches!(err, ModelError::Node(_)));
    }

    #[test]
    fn test_ensure_signed_nodes_idempotent() {
        let mut graph = graph_with_items(&[("dividends", 12.0)]);
        let first = graph.ensure_signed_nodes(&["dividends"], None).unwrap();
        let second = graph.ensure_signed_nodes(&["dividends"], None).unwrap();
        assert_eq!(first, vec!["dividends_signed"]);
        assert_eq!(first, second);
        assert_eq!(
            graph.calculate("dividends_signed", "2023").unwrap(),
            -12.0
        );

        let err = graph.ensure_signed_nodes(&["ghost"], None).unwrap_err();
        assert!(matches!(err, ModelError::Node(_)));
    }

    #[test]
    fn test_change_calculation_method_invalidates_cache() {
        let mut graph = graph_with_items(&[("a", 10.0), ("b", 2.0)]);
        graph
            .add_calculation("combined", &["a", "b"], CalculationMethod::Addition)
            .unwrap();
        assert_eq!(graph.calculate("combined", "2023").unwrap(), 12.0);

        graph
            .change_calculation_method("combined", "multiplication", None)
            .unwrap();
        // The cached 12.0 must not survive the method change.
        assert_eq!(graph.calculate("combined", "2023").unwrap(), 20.0);
    }

    #[test]
    fn test_change_calculation_method_error_paths() {
        let mut graph = graph_with_items(&[("a", 1.0)]);
        graph
            .add_calculation("c", &["a"], CalculationMethod::Addition)
            .unwrap();

        assert!(matches!(
            graph.change_calculation_method("ghost", "addition", None),
            Err(ModelError::Node(_))
        ));
        assert!(matches!(
            graph.change_calculation_method("a", "addition", None),
            Err(ModelError::Node(_))
        ));
        assert!(matches!(
            graph.change_calculation_method("c", "teleportation", None),
            Err(ModelError::Strategy(_))
        ));
    }

    #[test]
    fn test_division_by_zero_surfaces_as_calculation_error() {
        let mut graph = graph_with_items(&[("num", 8.0), ("den", 0.0)]);
        graph
            .add_calculation("ratio", &["num", "den"], CalculationMethod::Division)
            .unwrap();
        match graph.calculate("ratio", "2023").unwrap_err() {
            ModelError::Calculation { node, message, .. } => {
                assert_eq!(node, "ratio");
                assert!(message.contains("division by zero"), "{message}");
            }
            other => panic!("expected calculation error, got {other:?}"),
        }
    }

    #[test]
    fn test_fixed_growth_forecast_compounds() {
        let mut graph = Graph::new(["2023"]);
        graph
            .add_item("sales", Map::from([("2023".to_string(), 120.0)]))
            .unwrap();
        graph
            .add_forecast(
                "sales_forecast",
                "sales",
                "2023",
                &["p1".to_string(), "p2".to_string()],
                ForecastMethod::FixedGrowth(0.05),
            )
            .unwrap();

        // Forecast periods joined the graph's period list.
        assert!(graph.has_period("p1") && graph.has_period("p2"));
        assert_relative_eq!(
            graph.calculate("sales_forecast", "p1").unwrap(),
            126.0,
            epsilon = 1e-9
        );
        assert_relative_eq!(
            graph.calculate("sales_forecast", "p2").unwrap(),
            132.3,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_historical_growth_forecast_uses_evaluated_history() {
        let mut graph = Graph::new(["2021", "2022", "2023"]);
        graph
            .add_item(
                "sales",
                Map::from([
                    ("2021".to_string(), 100.0),
                    ("2022".to_string(), 110.0),
                    ("2023".to_string(), 121.0),
                ]),
            )
            .unwrap();
        graph
            .add_forecast(
                "sales_forecast",
                "sales",
                "2023",
                &["2024".to_string()],
                ForecastMethod::HistoricalGrowth,
            )
            .unwrap();
        assert_relative_eq!(
            graph.calculate("sales_forecast", "2024").unwrap(),
            133.1,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_forecast_base_period_must_be_declared() {
        let mut graph = Graph::new(["2023"]);
        graph
            .add_item("sales", Map::from([("2023".to_string(), 1.0)]))
            .unwrap();
        let err = graph
            .add_forecast(
                "f",
                "sales",
                "2040",
                &["2041".to_string()],
                ForecastMethod::FixedGrowth(0.1),
            )
            .unwrap_err();
        assert!(matches!(err, ModelError::Period(_)));
    }
}
