//! Calculation strategies for calculation nodes.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{ModelError, Result};

/// A caller-supplied calculation over a map of input name to value.
pub type CustomFn = Arc<dyn Fn(&BTreeMap<String, f64>) -> Result<f64> + Send + Sync>;

/// How a calculation node combines its input values. The input order is
/// significant for the non-commutative strategies (subtraction, division).
#[derive(Clone)]
pub enum Strategy {
    Addition,
    Subtraction,
    Multiplication,
    Division,
    /// Weighted mean. `None` means uniform weights; an explicit weight list
    /// must match the input count.
    WeightedAverage { weights: Option<Vec<f64>> },
    CustomFormula(CustomFn),
}

impl fmt::Debug for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::WeightedAverage { weights } => {
                f.debug_struct("WeightedAverage").field("weights", weights).finish()
            }
            Strategy::CustomFormula(_) => f.write_str("CustomFormula(<fn>)"),
            other => f.write_str(other.key()),
        }
    }
}

impl Strategy {
    /// The stable string key used in exports and method-change requests.
    pub fn key(&self) -> &'static str {
        match self {
            Strategy::Addition => "addition",
            Strategy::Subtraction => "subtraction",
            Strategy::Multiplication => "multiplication",
            Strategy::Division => "division",
            Strategy::WeightedAverage { .. } => "weighted_average",
            Strategy::CustomFormula(_) => "custom_formula",
        }
    }

    /// Resolves a method key back to a strategy. Custom formulas carry a
    /// function handle and cannot be named by key.
    pub fn from_key(key: &str, weights: Option<Vec<f64>>) -> Result<Strategy> {
        match key {
            "addition" => Ok(Strategy::Addition),
            "subtraction" => Ok(Strategy::Subtraction),
            "multiplication" => Ok(Strategy::Multiplication),
            "division" => Ok(Strategy::Division),
            "weighted_average" => Ok(Strategy::WeightedAverage { weights }),
            other => Err(ModelError::Strategy(format!(
                "unknown calculation method '{other}'"
            ))),
        }
    }

    /// Combines the input values. `names` and `values` are positionally
    /// aligned; names are only consulted by custom formulas.
    pub fn apply(&self, names: &[String], values: &[f64]) -> Result<f64> {
        match self {
            Strategy::Addition => Ok(values.iter().sum()),
            Strategy::Subtraction => match values.split_first() {
                Some((first, rest)) => Ok(first - rest.iter().sum::<f64>()),
                None => Ok(0.0),
            },
            Strategy::Multiplication => Ok(values.iter().product()),
            Strategy::Division => {
                let Some((first, rest)) = values.split_first() else {
                    return Ok(0.0);
                };
                let mut acc = *first;
                for &divisor in rest {
                    if divisor == 0.0 {
                        return Err(ModelError::DivisionByZero);
                    }
                    acc /= divisor;
                }
                Ok(acc)
            }
            Strategy::WeightedAverage { weights } => {
                let weighted: f64;
                let total: f64;
                match weights {
                    Some(w) => {
                        if w.len() != values.len() {
                            return Err(ModelError::Strategy(format!(
                                "weighted_average expects {} weights, got {}",
                                values.len(),
                                w.len()
                            )));
                        }
                        weighted = w.iter().zip(values).map(|(w, v)| w * v).sum();
                        total = w.iter().sum();
                    }
                    None => {
                        weighted = values.iter().sum();
                        total = values.len() as f64;
                    }
                }
                if total == 0.0 {
                    return Err(ModelError::DivisionByZero);
                }
                Ok(weighted / total)
            }
            Strategy::CustomFormula(func) => {
                let by_name: BTreeMap<String, f64> = names
                    .iter()
                    .cloned()
                    .zip(values.iter().copied())
                    .collect();
                func(&by_name)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("n{i}")).collect()
    }

    #[rstest]
    #[case(Strategy::Addition, vec![1.0, 2.0, 3.0], 6.0)]
    #[case(Strategy::Subtraction, vec![10.0, 3.0, 2.0], 5.0)]
    #[case(Strategy::Multiplication, vec![2.0, 3.0, 4.0], 24.0)]
    #[case(Strategy::Division, vec![24.0, 3.0, 2.0], 4.0)]
    #[case(Strategy::WeightedAverage { weights: None }, vec![2.0, 4.0], 3.0)]
    fn test_basic_strategies(
        #[case] strategy: Strategy,
        #[case] values: Vec<f64>,
        #[case] expected: f64,
    ) {
        let result = strategy.apply(&names(values.len()), &values).unwrap();
        assert_eq!(result, expected);
    }

    #[test]
    fn test_division_by_zero_is_an_error() {
        let err = Strategy::Division
            .apply(&names(2), &[1.0, 0.0])
            .unwrap_err();
        assert_eq!(err, ModelError::DivisionByZero);
    }

    #[test]
    fn test_explicit_weights() {
        let strategy = Strategy::WeightedAverage {
            weights: Some(vec![3.0, 1.0]),
        };
        assert_eq!(strategy.apply(&names(2), &[100.0, 20.0]).unwrap(), 80.0);
    }

    #[test]
    fn test_weight_count_mismatch() {
        let strategy = Strategy::WeightedAverage {
            weights: Some(vec![1.0]),
        };
        let err = strategy.apply(&names(2), &[1.0, 2.0]).unwrap_err();
        assert!(matches!(err, ModelError::Strategy(_)), "got {err:?}");
    }

    #[test]
    fn test_custom_formula_sees_inputs_by_name() {
        let strategy = Strategy::CustomFormula(Arc::new(|inputs| {
            Ok(inputs["revenue"] * 0.1 + inputs["base"])
        }));
        let result = strategy
            .apply(
                &["revenue".to_string(), "base".to_string()],
                &[200.0, 5.0],
            )
            .unwrap();
        assert_eq!(result, 25.0);
    }

    #[test]
    fn test_custom_formula_error_propagates() {
        let strategy = Strategy::CustomFormula(Arc::new(|_| {
            Err(ModelError::Configuration("bad input".into()))
        }));
        let err = strategy.apply(&names(1), &[1.0]).unwrap_err();
        assert!(matches!(err, ModelError::Configuration(_)));
    }
}
