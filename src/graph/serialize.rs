//! Graph snapshot serialization: the `graph_dict` boundary.
//!
//! The exported dict fully reconstructs an equivalent graph (periods plus
//! every node's configuration and stored values). It is also the exact
//! payload checksummed inside a template bundle, so determinism matters:
//! `serde_json::Map` is BTreeMap-backed here, which makes the encoding
//! canonical (sorted keys) by construction.
//!
//! Caller-supplied functions (custom calculations, statistical or custom
//! growth) cannot round-trip; exporting a graph that contains one is a
//! data-validation error rather than a silent drop.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};

use crate::error::{ModelError, Result};
use crate::graph::registry::NodeRegistry;
use crate::node::{ForecastState, GrowthPolicy, Node, Strategy};

pub(crate) const SCHEMA_VERSION: u64 = 1;

/// A node's configuration signature: its exported representation minus any
/// stored time-series values. Unlike [`export`], this never fails —
/// function-backed nodes get an opaque marker — so structural diffs work on
/// any graph.
pub(crate) fn node_signature(node: &Node) -> Value {
    match node {
        Node::Item { .. } => json!({ "kind": "item" }),
        Node::Calculation {
            inputs,
            strategy,
            description,
            ..
        } => {
            let mut payload = Map::new();
            payload.insert("kind".into(), json!("calculation"));
            payload.insert("operation".into(), json!(strategy.key()));
            payload.insert("inputs".into(), json!(inputs));
            if let Strategy::WeightedAverage {
                weights: Some(weights),
            } = strategy
            {
                payload.insert("weights".into(), json!(weights));
            }
            if let Some(description) = description {
                payload.insert("description".into(), json!(description));
            }
            Value::Object(payload)
        }
        Node::Formula {
            source, variables, ..
        } => json!({
            "kind": "formula",
            "formula": source,
            "variables": variables,
        }),
        Node::Metric {
            metric_name,
            metric_description,
            source,
            variables,
            ..
        } => json!({
            "kind": "metric",
            "metric": metric_name,
            "description": metric_description,
            "formula": source,
            "variables": variables,
        }),
        Node::Forecast { state, .. } => json!({
            "kind": "forecast",
            "input": state.input,
            "base_period": state.base_period,
            "forecast_periods": state.forecast_periods,
            "policy": policy_signature(&state.policy),
        }),
    }
}

fn policy_signature(policy: &GrowthPolicy) -> Value {
    match policy {
        GrowthPolicy::Fixed(rate) => json!({ "method": "fixed", "rate": rate }),
        GrowthPolicy::Curve(rates) => json!({ "method": "curve", "rates": rates }),
        GrowthPolicy::Statistical(_) => json!({ "method": "statistical" }),
        GrowthPolicy::Custom(_) => json!({ "method": "custom" }),
        GrowthPolicy::HistoricalAverage(rate) => {
            json!({ "method": "historical_average", "rate": rate })
        }
        GrowthPolicy::AverageValue(value) => {
            json!({ "method": "average_value", "value": value })
        }
    }
}

/// Serializes the registry and period list into a `graph_dict`.
pub(crate) fn export(registry: &NodeRegistry, periods: &[String]) -> Result<Value> {
    let mut nodes = Map::new();
    for node in registry.iter() {
        // Function-backed configuration has no faithful representation.
        match node {
            Node::Calculation {
                strategy: Strategy::CustomFormula(_),
                ..
            } => {
                return Err(ModelError::DataValidation(format!(
                    "node '{}' uses a custom calculation function and cannot be serialized",
                    node.name()
                )));
            }
            Node::Forecast { state, .. }
                if matches!(
                    state.policy,
                    GrowthPolicy::Statistical(_) | GrowthPolicy::Custom(_)
                ) =>
            {
                return Err(ModelError::DataValidation(format!(
                    "node '{}' uses a callable growth policy and cannot be serialized",
                    node.name()
                )));
            }
            _ => {}
        }

        let mut payload = match node_signature(node) {
            Value::Object(map) => map,
            _ => unreachable!("signatures are objects"),
        };
        if let Node::Item { values, .. } = node {
            payload.insert("values".into(), json!(values));
        }
        nodes.insert(node.name().to_string(), Value::Object(payload));
    }

    Ok(json!({
        "schema_version": SCHEMA_VERSION,
        "periods": periods,
        "nodes": nodes,
    }))
}

/// Rebuilds a registry and period list from a `graph_dict`.
pub(crate) fn import(dict: &Value) -> Result<(NodeRegistry, Vec<String>)> {
    let root = dict
        .as_object()
        .ok_or_else(|| ModelError::DataValidation("graph_dict must be an object".into()))?;

    if let Some(version) = root.get("schema_version") {
        if version.as_u64() != Some(SCHEMA_VERSION) {
            return Err(ModelError::DataValidation(format!(
                "unsupported graph_dict schema version {version}"
            )));
        }
    }

    let periods = string_list(root.get("periods"), "periods")?;
    let nodes = root
        .get("nodes")
        .and_then(Value::as_object)
        .ok_or_else(|| ModelError::DataValidation("graph_dict.nodes must be an object".into()))?;

    let mut registry = NodeRegistry::new();
    for (name, payload) in nodes {
        let node = import_node(name, payload, &periods)?;
        registry.insert(node);
    }

    Ok((registry, periods))
}

fn import_node(name: &str, payload: &Value, periods: &[String]) -> Result<Node> {
    let obj = payload
        .as_object()
        .ok_or_else(|| ModelError::DataValidation(format!("node '{name}' must be an object")))?;
    let kind = obj
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| ModelError::DataValidation(format!("node '{name}' is missing a kind")))?;

    match kind {
        "item" => {
            let mut values = BTreeMap::new();
            if let Some(raw) = obj.get("values") {
                let raw = raw.as_object().ok_or_else(|| {
                    ModelError::DataValidation(format!("node '{name}': values must be an object"))
                })?;
                for (period, value) in raw {
                    if !periods.iter().any(|p| p == period) {
                        return Err(ModelError::Period(format!(
                            "node '{name}' stores a value for undeclared period '{period}'"
                        )));
                    }
                    let value = value.as_f64().ok_or_else(|| {
                        ModelError::DataValidation(format!(
                            "node '{name}': value for period '{period}' is not numeric"
                        ))
                    })?;
                    values.insert(period.clone(), value);
                }
            }
            Ok(Node::item(name, values))
        }
        "calculation" => {
            let operation = require_str(obj, "operation", name)?;
            let inputs = string_list(obj.get("inputs"), "inputs")?;
            let weights = match obj.get("weights") {
                Some(raw) => Some(f64_list(raw, name)?),
                None => None,
            };
            let strategy = Strategy::from_key(operation, weights)?;
            let description = obj
                .get("description")
                .and_then(Value::as_str)
                .map(str::to_string);
            Ok(Node::Calculation {
                name: name.to_string(),
                inputs,
                strategy,
                description,
            })
        }
        "formula" => {
            let source = require_str(obj, "formula", name)?;
            Node::formula(name, source, string_map(obj.get("variables"), name)?)
        }
        "metric" => {
            let source = require_str(obj, "formula", name)?;
            let base = Node::formula(name, source, string_map(obj.get("variables"), name)?)?;
            let metric_name = require_str(obj, "metric", name)?.to_string();
            let metric_description = obj
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            match base {
                Node::Formula {
                    name,
                    source,
                    expr,
                    variables,
                } => Ok(Node::Metric {
                    name,
                    metric_name,
                    metric_description,
                    source,
                    expr,
                    variables,
                }),
                _ => unreachable!("Node::formula builds formula nodes"),
            }
        }
        "forecast" => {
            let input = require_str(obj, "input", name)?;
            let base_period = require_str(obj, "base_period", name)?;
            let forecast_periods = string_list(obj.get("forecast_periods"), "forecast_periods")?;
            let policy = import_policy(name, obj.get("policy"))?;
            let state = ForecastState::new(input, base_period, forecast_periods, policy)?;
            Ok(Node::Forecast {
                name: name.to_string(),
                state,
            })
        }
        other => Err(ModelError::DataValidation(format!(
            "node '{name}' has unknown kind '{other}'"
        ))),
    }
}

fn import_policy(name: &str, raw: Option<&Value>) -> Result<GrowthPolicy> {
    let obj = raw.and_then(Value::as_object).ok_or_else(|| {
        ModelError::DataValidation(format!("node '{name}': forecast policy must be an object"))
    })?;
    let method = obj.get("method").and_then(Value::as_str).ok_or_else(|| {
        ModelError::DataValidation(format!("node '{name}': forecast policy needs a method"))
    })?;
    match method {
        "fixed" => Ok(GrowthPolicy::Fixed(require_f64(obj, "rate", name)?)),
        "curve" => {
            let rates = obj.get("rates").ok_or_else(|| {
                ModelError::DataValidation(format!("node '{name}': curve policy needs rates"))
            })?;
            Ok(GrowthPolicy::Curve(f64_list(rates, name)?))
        }
        "historical_average" => Ok(GrowthPolicy::HistoricalAverage(require_f64(
            obj, "rate", name,
        )?)),
        "average_value" => Ok(GrowthPolicy::AverageValue(require_f64(obj, "value", name)?)),
        other => Err(ModelError::DataValidation(format!(
            "node '{name}': growth method '{other}' cannot be rehydrated"
        ))),
    }
}

fn require_str<'a>(obj: &'a Map<String, Value>, key: &str, node: &str) -> Result<&'a str> {
    obj.get(key).and_then(Value::as_str).ok_or_else(|| {
        ModelError::DataValidation(format!("node '{node}' is missing string field '{key}'"))
    })
}

fn require_f64(obj: &Map<String, Value>, key: &str, node: &str) -> Result<f64> {
    obj.get(key).and_then(Value::as_f64).ok_or_else(|| {
        ModelError::DataValidation(format!("node '{node}' is missing numeric field '{key}'"))
    })
}

fn f64_list(raw: &Value, node: &str) -> Result<Vec<f64>> {
    raw.as_array()
        .map(|items| items.iter().map(Value::as_f64).collect::<Option<Vec<f64>>>())
        .flatten()
        .ok_or_else(|| {
            ModelError::DataValidation(format!("node '{node}': expected a numeric array"))
        })
}

fn string_list(raw: Option<&Value>, field: &str) -> Result<Vec<String>> {
    raw.and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|v| v.as_str().map(str::to_string))
                .collect::<Option<Vec<String>>>()
        })
        .flatten()
        .ok_or_else(|| {
            ModelError::DataValidation(format!("'{field}' must be an array of strings"))
        })
}

fn string_map(raw: Option<&Value>, node: &str) -> Result<BTreeMap<String, String>> {
    let obj = raw.and_then(Value::as_object).ok_or_else(|| {
        ModelError::DataValidation(format!("node '{node}': variables must be an object"))
    })?;
    let mut out = BTreeMap::new();
    for (key, value) in obj {
        let value = value.as_str().ok_or_else(|| {
            ModelError::DataValidation(format!(
                "node '{node}': variable '{key}' must map to a node name"
            ))
        })?;
        out.insert(key.clone(), value.to_string());
    }
    Ok(out)
}
