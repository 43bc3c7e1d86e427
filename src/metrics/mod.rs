//! Registered metric definitions.
//!
//! The registry is an explicitly constructed object passed to callers that
//! need it, not ambient global state. Its lifecycle is two-phase: populate
//! (built-ins plus any explicit `register` calls), then read-only — the
//! first lookup seals it, and registration afterwards is a metric error.

use std::cell::Cell;
use std::collections::BTreeMap;

use crate::error::{ModelError, Result};

/// A named metric: the inputs it requires, the formula combining them, and
/// a human-readable description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricDef {
    pub name: String,
    pub inputs: Vec<String>,
    pub formula: String,
    pub description: String,
}

impl MetricDef {
    pub fn new(
        name: impl Into<String>,
        inputs: &[&str],
        formula: impl Into<String>,
        description: impl Into<String>,
    ) -> MetricDef {
        MetricDef {
            name: name.into(),
            inputs: inputs.iter().map(|i| i.to_string()).collect(),
            formula: formula.into(),
            description: description.into(),
        }
    }
}

#[derive(Debug, Default)]
pub struct MetricRegistry {
    defs: BTreeMap<String, MetricDef>,
    sealed: Cell<bool>,
}

impl MetricRegistry {
    /// An empty registry, open for registration.
    pub fn empty() -> MetricRegistry {
        MetricRegistry::default()
    }

    /// The built-in metric set.
    pub fn builtin() -> MetricRegistry {
        let mut registry = MetricRegistry::empty();
        let defs = [
            MetricDef::new(
                "gross_profit_margin",
                &["revenue", "cogs"],
                "(revenue - cogs) / revenue",
                "Share of revenue left after direct production costs",
            ),
            MetricDef::new(
                "net_profit_margin",
                &["net_income", "revenue"],
                "net_income / revenue",
                "Bottom-line profitability per unit of revenue",
            ),
            MetricDef::new(
                "operating_margin",
                &["operating_income", "revenue"],
                "operating_income / revenue",
                "Profitability of core operations",
            ),
            MetricDef::new(
                "current_ratio",
                &["current_assets", "current_liabilities"],
                "current_assets / current_liabilities",
                "Short-term liquidity coverage",
            ),
            MetricDef::new(
                "quick_ratio",
                &["current_assets", "inventory", "current_liabilities"],
                "(current_assets - inventory) / current_liabilities",
                "Liquidity coverage excluding inventory",
            ),
            MetricDef::new(
                "debt_to_equity",
                &["total_debt", "total_equity"],
                "total_debt / total_equity",
                "Leverage: debt financing relative to equity",
            ),
            MetricDef::new(
                "return_on_assets",
                &["net_income", "total_assets"],
                "net_income / total_assets",
                "Earnings generated per unit of assets",
            ),
            MetricDef::new(
                "return_on_equity",
                &["net_income", "total_equity"],
                "net_income / total_equity",
                "Earnings generated per unit of shareholder equity",
            ),
            MetricDef::new(
                "asset_turnover",
                &["revenue", "total_assets"],
                "revenue / total_assets",
                "Revenue generated per unit of assets",
            ),
            MetricDef::new(
                "interest_coverage",
                &["operating_income", "interest_expense"],
                "operating_income / interest_expense",
                "Ability to service interest from operating earnings",
            ),
        ];
        for def in defs {
            registry
                .register(def)
                .expect("built-in metric definitions are unique");
        }
        registry
    }

    /// Adds a definition. Fails once the registry has served a lookup, and
    /// on duplicate names.
    pub fn register(&mut self, def: MetricDef) -> Result<()> {
        if self.sealed.get() {
            return Err(ModelError::Metric(format!(
                "cannot register '{}': the registry is sealed after first lookup",
                def.name
            )));
        }
        if self.defs.contains_key(&def.name) {
            return Err(ModelError::Metric(format!(
                "metric '{}' is already registered",
                def.name
            )));
        }
        self.defs.insert(def.name.clone(), def);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&MetricDef> {
        self.sealed.set(true);
        self.defs.get(name)
    }

    /// All metric names, sorted.
    pub fn list(&self) -> Vec<&str> {
        self.sealed.set(true);
        self.defs.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_definitions_resolve() {
        let registry = MetricRegistry::builtin();
        let def = registry.get("net_profit_margin").unwrap();
        assert_eq!(def.inputs, vec!["net_income", "revenue"]);
        assert_eq!(def.formula, "net_income / revenue");
        assert!(registry.list().len() >= 10);
    }

    #[test]
    fn test_registration_allowed_before_first_lookup() {
        let mut registry = MetricRegistry::builtin();
        registry
            .register(MetricDef::new(
                "cash_ratio",
                &["cash", "current_liabilities"],
                "cash / current_liabilities",
                "Liquidity from cash alone",
            ))
            .unwrap();
        assert!(registry.get("cash_ratio").is_some());
    }

    #[test]
    fn test_sealed_after_first_lookup() {
        let mut registry = MetricRegistry::builtin();
        assert!(registry.get("current_ratio").is_some());

        let err = registry
            .register(MetricDef::new("late", &["a"], "a", ""))
            .unwrap_err();
        assert!(matches!(err, ModelError::Metric(_)));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = MetricRegistry::empty();
        registry
            .register(MetricDef::new("m", &["a"], "a", ""))
            .unwrap();
        assert!(registry.register(MetricDef::new("m", &["a"], "a", "")).is_err());
    }
}
