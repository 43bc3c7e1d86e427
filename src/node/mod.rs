//! The node variants of the calculation graph and their evaluation contract.
//!
//! A node is the "skeleton" of one line item or derived figure. It never
//! holds references to other node objects: every relationship is a name,
//! resolved through the graph's registry at evaluation time. Replacing a
//! node therefore reconnects its dependents with no pointer surgery.

pub mod forecast;
pub mod formula;
pub mod strategy;

use std::collections::BTreeMap;

use smallvec::SmallVec;

use crate::error::{ModelError, Result};

pub use forecast::{ForecastState, GrowthFn, GrowthPolicy, SamplerFn};
pub use formula::{BinaryOp, Expr};
pub use strategy::{CustomFn, Strategy};

/// Resolves a named node's value for a period. Implemented by the
/// calculation engine; nodes call back through it for their inputs.
pub(crate) trait ValueResolver {
    fn value_of(&mut self, name: &str, period: &str) -> Result<f64>;
}

/// The primary enum representing a node in the graph.
#[derive(Debug, Clone)]
pub enum Node {
    /// Raw stored data: a period-to-value map mutated directly.
    Item {
        name: String,
        values: BTreeMap<String, f64>,
    },
    /// A value combined from named inputs via a fixed strategy. The input
    /// order is significant for subtraction and division.
    Calculation {
        name: String,
        inputs: Vec<String>,
        strategy: Strategy,
        description: Option<String>,
    },
    /// A parsed arithmetic expression over named variables, each bound to a
    /// node name.
    Formula {
        name: String,
        source: String,
        expr: Expr,
        variables: BTreeMap<String, String>,
    },
    /// A formula node built from a registered metric definition, tagged for
    /// introspection.
    Metric {
        name: String,
        metric_name: String,
        metric_description: String,
        source: String,
        expr: Expr,
        variables: BTreeMap<String, String>,
    },
    /// A projection of future periods from an input node.
    Forecast { name: String, state: ForecastState },
}

impl Node {
    /// Convenience constructor for an item node.
    pub fn item(name: impl Into<String>, values: BTreeMap<String, f64>) -> Node {
        Node::Item {
            name: name.into(),
            values,
        }
    }

    /// Convenience constructor for a formula node; parses `source` and binds
    /// each variable per `variables` (variable name to node name).
    pub fn formula(
        name: impl Into<String>,
        source: impl Into<String>,
        variables: BTreeMap<String, String>,
    ) -> Result<Node> {
        let source = source.into();
        let expr = Expr::parse(&source)?;
        Ok(Node::Formula {
            name: name.into(),
            source,
            expr,
            variables,
        })
    }

    pub fn name(&self) -> &str {
        match self {
            Node::Item { name, .. }
            | Node::Calculation { name, .. }
            | Node::Formula { name, .. }
            | Node::Metric { name, .. }
            | Node::Forecast { name, .. } => name,
        }
    }

    pub(crate) fn set_name(&mut self, new_name: impl Into<String>) {
        let slot = match self {
            Node::Item { name, .. }
            | Node::Calculation { name, .. }
            | Node::Formula { name, .. }
            | Node::Metric { name, .. }
            | Node::Forecast { name, .. } => name,
        };
        *slot = new_name.into();
    }

    /// `false` only for item nodes; used to classify nodes for
    /// introspection and export without evaluating them.
    pub fn has_calculation(&self) -> bool {
        !matches!(self, Node::Item { .. })
    }

    /// Names of directly referenced input nodes, in a deterministic order.
    pub fn dependencies(&self) -> Vec<String> {
        match self {
            Node::Item { .. } => Vec::new(),
            Node::Calculation { inputs, .. } => inputs.clone(),
            Node::Formula { variables, .. } | Node::Metric { variables, .. } => {
                let mut deps: Vec<String> = Vec::new();
                for dep in variables.values() {
                    if !deps.iter().any(|d| d == dep) {
                        deps.push(dep.clone());
                    }
                }
                deps
            }
            Node::Forecast { state, .. } => vec![state.input.clone()],
        }
    }

    /// Stores a raw value on an item node.
    pub fn set_value(&mut self, period: impl Into<String>, value: f64) -> Result<()> {
        match self {
            Node::Item { values, .. } => {
                values.insert(period.into(), value);
                Ok(())
            }
            other => Err(ModelError::Node(format!(
                "cannot set a raw value on calculated node '{}'",
                other.name()
            ))),
        }
    }

    /// Drops node-local memoized values. The canonical cache lives in the
    /// engine; only forecast nodes carry state of their own.
    pub fn clear_cache(&self) {
        if let Node::Forecast { state, .. } = self {
            state.clear_memo();
        }
    }

    /// Rewrites input references per an old-name -> new-name map. The node's
    /// own name is untouched; the registry handles that side of a rename.
    pub(crate) fn rewrite_references(&mut self, renames: &std::collections::BTreeMap<String, String>) {
        match self {
            Node::Item { .. } => {}
            Node::Calculation { inputs, .. } => {
                for input in inputs {
                    if let Some(new) = renames.get(input) {
                        *input = new.clone();
                    }
                }
            }
            Node::Formula { variables, .. } | Node::Metric { variables, .. } => {
                for target in variables.values_mut() {
                    if let Some(new) = renames.get(target) {
                        *target = new.clone();
                    }
                }
            }
            Node::Forecast { state, .. } => {
                if let Some(new) = renames.get(&state.input) {
                    state.input = new.clone();
                }
            }
        }
    }

    /// Evaluates this node for `period`, resolving inputs through
    /// `resolver`. Missing item data is not an error and reads as 0.0.
    pub(crate) fn evaluate(&self, resolver: &mut dyn ValueResolver, period: &str) -> Result<f64> {
        match self {
            Node::Item { values, .. } => Ok(values.get(period).copied().unwrap_or(0.0)),
            Node::Calculation {
                inputs, strategy, ..
            } => {
                let mut collected: SmallVec<[f64; 4]> = SmallVec::with_capacity(inputs.len());
                for input in inputs {
                    collected.push(resolver.value_of(input, period)?);
                }
                strategy.apply(inputs, &collected)
            }
            Node::Formula {
                expr, variables, ..
            }
            | Node::Metric {
                expr, variables, ..
            } => expr.evaluate(&mut |variable| {
                let node_name = variables.get(variable).ok_or_else(|| {
                    ModelError::Node(format!(
                        "formula variable '{variable}' is not bound to a node"
                    ))
                })?;
                resolver.value_of(node_name, period)
            }),
            Node::Forecast { state, .. } => state.evaluate(resolver, period),
        }
    }
}
