//! Forecast nodes: project future periods from a base node via a growth
//! policy.
//!
//! For any period at or before the base period the node is transparent and
//! returns the input node's historical value. For a forecast period it
//! returns `previous * (1 + growth)`, where `previous` is resolved
//! recursively and may itself be a forecasted period.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::error::{ModelError, Result};
use crate::node::ValueResolver;

/// A caller-supplied growth function of `(period, prev_period, prev_value)`.
pub type GrowthFn = Arc<dyn Fn(&str, &str, f64) -> Result<f64> + Send + Sync>;

/// A zero-argument sampler, invoked fresh for every forecast period.
pub type SamplerFn = Arc<dyn Fn() -> f64 + Send + Sync>;

#[derive(Clone)]
pub enum GrowthPolicy {
    /// Constant rate applied every forecast period (compounding).
    Fixed(f64),
    /// One rate per forecast period, positional.
    Curve(Vec<f64>),
    /// Sampled growth; a fresh draw per period. The node's own value memo
    /// keeps a period's value stable once computed.
    Statistical(SamplerFn),
    Custom(GrowthFn),
    /// Mean historical period-over-period growth, precomputed at
    /// construction via [`GrowthPolicy::historical_average`].
    HistoricalAverage(f64),
    /// Ignores growth entirely; every forecast period returns this constant.
    AverageValue(f64),
}

impl fmt::Debug for GrowthPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GrowthPolicy::Fixed(rate) => write!(f, "Fixed({rate})"),
            GrowthPolicy::Curve(rates) => write!(f, "Curve({rates:?})"),
            GrowthPolicy::Statistical(_) => f.write_str("Statistical(<fn>)"),
            GrowthPolicy::Custom(_) => f.write_str("Custom(<fn>)"),
            GrowthPolicy::HistoricalAverage(rate) => write!(f, "HistoricalAverage({rate})"),
            GrowthPolicy::AverageValue(value) => write!(f, "AverageValue({value})"),
        }
    }
}

impl GrowthPolicy {
    /// Mean period-over-period growth across a historical series, in period
    /// order. Transitions from an exactly-zero prior value are skipped. With
    /// fewer than two usable points the rate degenerates to 0.0 — logged,
    /// not raised.
    pub fn historical_average(history: &[f64]) -> GrowthPolicy {
        let mut rates = Vec::new();
        for window in history.windows(2) {
            if window[0] == 0.0 {
                continue;
            }
            rates.push(window[1] / window[0] - 1.0);
        }
        if rates.is_empty() {
            warn!(
                points = history.len(),
                "historical growth underdetermined, defaulting rate to 0.0"
            );
            return GrowthPolicy::HistoricalAverage(0.0);
        }
        let mean = rates.iter().sum::<f64>() / rates.len() as f64;
        GrowthPolicy::HistoricalAverage(mean)
    }

    /// Constant forecast value from the mean of a historical series.
    pub fn average_value(history: &[f64]) -> GrowthPolicy {
        if history.is_empty() {
            warn!("no historical values, defaulting forecast average to 0.0");
            return GrowthPolicy::AverageValue(0.0);
        }
        GrowthPolicy::AverageValue(history.iter().sum::<f64>() / history.len() as f64)
    }
}

/// The state of a forecast node: its input, the period split, the growth
/// policy, and a per-node value memo.
#[derive(Debug, Clone)]
pub struct ForecastState {
    pub input: String,
    pub base_period: String,
    pub forecast_periods: Vec<String>,
    pub policy: GrowthPolicy,
    // Periods are opaque sortable strings, so one value per period label.
    memo: RefCell<HashMap<String, f64>>,
}

impl ForecastState {
    pub fn new(
        input: impl Into<String>,
        base_period: impl Into<String>,
        forecast_periods: Vec<String>,
        policy: GrowthPolicy,
    ) -> Result<ForecastState> {
        if let GrowthPolicy::Curve(rates) = &policy {
            if rates.len() != forecast_periods.len() {
                return Err(ModelError::Configuration(format!(
                    "growth curve has {} rates for {} forecast periods",
                    rates.len(),
                    forecast_periods.len()
                )));
            }
        }
        Ok(ForecastState {
            input: input.into(),
            base_period: base_period.into(),
            forecast_periods,
            policy,
            memo: RefCell::new(HashMap::new()),
        })
    }

    pub fn clear_memo(&self) {
        self.memo.borrow_mut().clear();
    }

    pub(crate) fn evaluate(&self, resolver: &mut dyn ValueResolver, period: &str) -> Result<f64> {
        // Historical periods pass straight through to the input node.
        if period <= self.base_period.as_str() {
            return resolver.value_of(&self.input, period);
        }

        if let Some(&value) = self.memo.borrow().get(period) {
            return Ok(value);
        }

        let index = self
            .forecast_periods
            .iter()
            .position(|p| p == period)
            .ok_or_else(|| {
                ModelError::Period(format!(
                    "'{period}' is neither historical nor a forecast period of '{}'",
                    self.input
                ))
            })?;

        let (prev_period, prev_value) = if index == 0 {
            let value = resolver.value_of(&self.input, &self.base_period)?;
            (self.base_period.as_str(), value)
        } else {
            let prev = self.forecast_periods[index - 1].as_str();
            let value = self.evaluate(resolver, prev)?;
            (prev, value)
        };

        let value = match &self.policy {
            GrowthPolicy::AverageValue(constant) => *constant,
            GrowthPolicy::Fixed(rate) => prev_value * (1.0 + rate),
            GrowthPolicy::Curve(rates) => prev_value * (1.0 + rates[index]),
            GrowthPolicy::Statistical(sampler) => prev_value * (1.0 + sampler()),
            GrowthPolicy::Custom(func) => {
                prev_value * (1.0 + func(period, prev_period, prev_value)?)
            }
            GrowthPolicy::HistoricalAverage(rate) => prev_value * (1.0 + rate),
        };

        self.memo.borrow_mut().insert(period.to_string(), value);
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A resolver over a fixed value table, standing in for the engine.
    struct TableResolver(BTreeMap<(String, String), f64>);

    impl ValueResolver for TableResolver {
        fn value_of(&mut self, name: &str, period: &str) -> Result<f64> {
            self.0
                .get(&(name.to_string(), period.to_string()))
                .copied()
                .ok_or_else(|| ModelError::Node(format!("no value for {name}/{period}")))
        }
    }

    fn base_table() -> TableResolver {
        let mut table = BTreeMap::new();
        table.insert(("sales".to_string(), "2023".to_string()), 120.0);
        table.insert(("sales".to_string(), "2022".to_string()), 100.0);
        TableResolver(table)
    }

    fn periods(labels: &[&str]) -> Vec<String> {
        labels.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_fixed_growth_compounds() {
        let state = ForecastState::new(
            "sales",
            "2023",
            periods(&["2024", "2025"]),
            GrowthPolicy::Fixed(0.05),
        )
        .unwrap();
        let mut resolver = base_table();

        assert_relative_eq!(state.evaluate(&mut resolver, "2024").unwrap(), 126.0, epsilon = 1e-9);
        assert_relative_eq!(state.evaluate(&mut resolver, "2025").unwrap(), 132.3, epsilon = 1e-9);
    }

    #[test]
    fn test_historical_periods_pass_through() {
        let state = ForecastState::new(
            "sales",
            "2023",
            periods(&["2024"]),
            GrowthPolicy::Fixed(0.05),
        )
        .unwrap();
        let mut resolver = base_table();
        assert_eq!(state.evaluate(&mut resolver, "2022").unwrap(), 100.0);
        assert_eq!(state.evaluate(&mut resolver, "2023").unwrap(), 120.0);
    }

    #[test]
    fn test_curve_is_positional() {
        let state = ForecastState::new(
            "sales",
            "2023",
            periods(&["2024", "2025"]),
            GrowthPolicy::Curve(vec![0.10, -0.50]),
        )
        .unwrap();
        let mut resolver = base_table();
        assert_relative_eq!(state.evaluate(&mut resolver, "2024").unwrap(), 132.0, epsilon = 1e-9);
        assert_relative_eq!(state.evaluate(&mut resolver, "2025").unwrap(), 66.0, epsilon = 1e-9);
    }

    #[test]
    fn test_curve_length_mismatch_rejected_at_construction() {
        let err = ForecastState::new(
            "sales",
            "2023",
            periods(&["2024", "2025"]),
            GrowthPolicy::Curve(vec![0.10]),
        )
        .unwrap_err();
        assert!(matches!(err, ModelError::Configuration(_)));
    }

    #[test]
    fn test_statistical_sampled_once_per_period() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let sampler: SamplerFn = Arc::new(|| {
            CALLS.fetch_add(1, Ordering::SeqCst);
            0.0
        });
        let state = ForecastState::new(
            "sales",
            "2023",
            periods(&["2024"]),
            GrowthPolicy::Statistical(sampler),
        )
        .unwrap();
        let mut resolver = base_table();

        state.evaluate(&mut resolver, "2024").unwrap();
        state.evaluate(&mut resolver, "2024").unwrap();
        // The memo suppresses a second draw for the same period.
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_custom_policy_sees_previous_state() {
        let state = ForecastState::new(
            "sales",
            "2023",
            periods(&["2024"]),
            GrowthPolicy::Custom(Arc::new(|period, prev_period, prev_value| {
                assert_eq!(period, "2024");
                assert_eq!(prev_period, "2023");
                assert_eq!(prev_value, 120.0);
                Ok(0.5)
            })),
        )
        .unwrap();
        let mut resolver = base_table();
        assert_relative_eq!(state.evaluate(&mut resolver, "2024").unwrap(), 180.0, epsilon = 1e-9);
    }

    #[test]
    fn test_historical_average_skips_zero_transitions() {
        // 0 -> 50 skipped; 50 -> 100 is +100%; 100 -> 150 is +50%.
        let policy = GrowthPolicy::historical_average(&[0.0, 50.0, 100.0, 150.0]);
        match policy {
            GrowthPolicy::HistoricalAverage(rate) => assert_relative_eq!(rate, 0.75, epsilon = 1e-12),
            other => panic!("unexpected policy {other:?}"),
        }
    }

    #[test]
    fn test_historical_average_degenerates_to_zero() {
        for history in [&[][..], &[10.0][..], &[0.0, 1.0][..]] {
            match GrowthPolicy::historical_average(history) {
                GrowthPolicy::HistoricalAverage(rate) => assert_eq!(rate, 0.0),
                other => panic!("unexpected policy {other:?}"),
            }
        }
    }

    #[test]
    fn test_average_value_ignores_growth() {
        let state = ForecastState::new(
            "sales",
            "2023",
            periods(&["2024", "2025"]),
            GrowthPolicy::average_value(&[100.0, 120.0]),
        )
        .unwrap();
        let mut resolver = base_table();
        assert_relative_eq!(state.evaluate(&mut resolver, "2024").unwrap(), 110.0, epsilon = 1e-9);
        assert_relative_eq!(state.evaluate(&mut resolver, "2025").unwrap(), 110.0, epsilon = 1e-9);
    }

    #[test]
    fn test_unknown_future_period_is_a_period_error() {
        let state = ForecastState::new(
            "sales",
            "2023",
            periods(&["2024"]),
            GrowthPolicy::Fixed(0.05),
        )
        .unwrap();
        let mut resolver = base_table();
        let err = state.evaluate(&mut resolver, "2030").unwrap_err();
        assert!(matches!(err, ModelError::Period(_)));
    }
}
