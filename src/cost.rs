use crate::row::EPSILON;
use serde::{Deserialize, Serialize};

/// Contributions below this magnitude (in percent of the overall change) are
/// clamped to zero cost by the contribution-aware strategies.
pub const DEFAULT_MIN_CONTRIBUTION_PERCENT: f64 = 3.0;

/// Dataset-level totals every per-node percentage is computed against.
/// For additive metrics sizes equal values; for ratio metrics sizes are the
/// numerator+denominator traffic proxy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Totals {
    pub baseline_total: f64,
    pub current_total: f64,
    pub baseline_total_size: f64,
    pub current_total_size: f64,
}

impl Totals {
    /// Direction of the overall movement: true when the metric went up.
    pub fn side(&self) -> bool {
        self.current_total >= self.baseline_total
    }
}

/// The three per-node change metrics the cost functions score, all in
/// percent units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChangeStats {
    pub value_change_percent: f64,
    pub contribution_change_percent: f64,
    pub contribution_to_overall_change_percent: f64,
}

impl ChangeStats {
    pub fn compute(
        baseline_value: f64,
        current_value: f64,
        baseline_size: f64,
        current_size: f64,
        totals: &Totals,
    ) -> Self {
        let overall_change = totals.current_total - totals.baseline_total;
        // Equal totals leave the "share of overall change" undefined; report 0.
        let contribution_to_overall = if overall_change.abs() <= EPSILON {
            0.0
        } else {
            (current_value - baseline_value) / overall_change * 100.0
        };
        ChangeStats {
            value_change_percent: percentage_change(baseline_value, current_value),
            contribution_change_percent: (safe_fraction(current_size, totals.current_total_size)
                - safe_fraction(baseline_size, totals.baseline_total_size))
                * 100.0,
            contribution_to_overall_change_percent: contribution_to_overall,
        }
    }
}

/// Relative change in percent. A slice that appears from a negligible
/// baseline reports signed infinity; negligible on both sides reports 0.
pub fn percentage_change(baseline: f64, current: f64) -> f64 {
    if baseline.abs() > EPSILON {
        (current - baseline) / baseline * 100.0
    } else if current.abs() <= EPSILON {
        0.0
    } else if current > 0.0 {
        f64::INFINITY
    } else {
        f64::NEG_INFINITY
    }
}

fn safe_fraction(part: f64, whole: f64) -> f64 {
    if whole.abs() <= EPSILON {
        0.0
    } else {
        part / whole
    }
}

/// Pluggable "interestingness" strategy, injected into both finders; the
/// rest of the pipeline only consumes the resulting cost per node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CostFunction {
    ValueChange,
    ContributionChange,
    ContributionToOverall { min_contribution_percent: f64 },
    Balanced { min_contribution_percent: f64 },
}

impl Default for CostFunction {
    fn default() -> Self {
        CostFunction::Balanced {
            min_contribution_percent: DEFAULT_MIN_CONTRIBUTION_PERCENT,
        }
    }
}

impl CostFunction {
    /// Resolves a strategy by name, as supplied on the CLI or in a request.
    pub fn from_name(name: &str, min_contribution_percent: f64) -> Option<CostFunction> {
        match name {
            "value_change" => Some(CostFunction::ValueChange),
            "contribution_change" => Some(CostFunction::ContributionChange),
            "contribution_to_overall" => Some(CostFunction::ContributionToOverall {
                min_contribution_percent,
            }),
            "balanced" => Some(CostFunction::Balanced {
                min_contribution_percent,
            }),
            _ => None,
        }
    }

    /// Maps a node's change metrics to a non-negative ranking score.
    pub fn cost(&self, stats: &ChangeStats) -> f64 {
        let value = stats.value_change_percent.abs();
        let contribution = stats.contribution_change_percent.abs();
        let overall = stats.contribution_to_overall_change_percent.abs();
        let cost = match self {
            // A slice that appeared from nothing has unbounded relative
            // change; rank it first without poisoning later arithmetic.
            CostFunction::ValueChange => {
                if value.is_finite() {
                    value
                } else {
                    f64::MAX
                }
            }
            CostFunction::ContributionChange => contribution,
            CostFunction::ContributionToOverall {
                min_contribution_percent,
            } => {
                if overall < *min_contribution_percent {
                    0.0
                } else {
                    overall
                }
            }
            CostFunction::Balanced {
                min_contribution_percent,
            } => {
                if overall < *min_contribution_percent {
                    0.0
                } else {
                    overall + contribution
                }
            }
        };
        if cost.is_nan() {
            0.0
        } else {
            cost
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn totals() -> Totals {
        Totals {
            baseline_total: 1000.0,
            current_total: 1200.0,
            baseline_total_size: 1000.0,
            current_total_size: 1200.0,
        }
    }

    #[test]
    fn test_percentage_change_edges() {
        assert_eq!(percentage_change(100.0, 150.0), 50.0);
        assert_eq!(percentage_change(0.0, 0.0), 0.0);
        assert_eq!(percentage_change(0.0, 20.0), f64::INFINITY);
        assert_eq!(percentage_change(0.0, -20.0), f64::NEG_INFINITY);
    }

    #[test]
    fn test_stats_with_equal_totals_report_zero_overall_contribution() {
        let totals = Totals {
            baseline_total: 1000.0,
            current_total: 1000.0,
            baseline_total_size: 1000.0,
            current_total_size: 1000.0,
        };
        let stats = ChangeStats::compute(600.0, 700.0, 600.0, 700.0, &totals);
        assert_eq!(stats.contribution_to_overall_change_percent, 0.0);
    }

    #[test]
    fn test_contribution_to_overall_clamp() {
        let cost_fn = CostFunction::ContributionToOverall {
            min_contribution_percent: DEFAULT_MIN_CONTRIBUTION_PERCENT,
        };
        let mut stats = ChangeStats::compute(600.0, 900.0, 600.0, 900.0, &totals());
        assert!(cost_fn.cost(&stats) > 0.0);

        stats.contribution_to_overall_change_percent = 2.9;
        assert_eq!(cost_fn.cost(&stats), 0.0);
        stats.contribution_to_overall_change_percent = -2.9;
        assert_eq!(cost_fn.cost(&stats), 0.0);
    }

    #[test]
    fn test_balanced_clamp_and_sum() {
        let cost_fn = CostFunction::default();
        let stats = ChangeStats {
            value_change_percent: 50.0,
            contribution_change_percent: 15.0,
            contribution_to_overall_change_percent: 150.0,
        };
        assert_eq!(cost_fn.cost(&stats), 165.0);

        let below = ChangeStats {
            value_change_percent: 400.0,
            contribution_change_percent: 15.0,
            contribution_to_overall_change_percent: 2.0,
        };
        assert_eq!(cost_fn.cost(&below), 0.0);
    }

    #[test]
    fn test_value_change_handles_infinity() {
        let stats = ChangeStats {
            value_change_percent: f64::INFINITY,
            contribution_change_percent: 0.0,
            contribution_to_overall_change_percent: 0.0,
        };
        assert_eq!(CostFunction::ValueChange.cost(&stats), f64::MAX);
    }

    #[test]
    fn test_region_example_stats() {
        // US: 600 -> 900 against totals 1000 -> 1200.
        let stats = ChangeStats::compute(600.0, 900.0, 600.0, 900.0, &totals());
        assert!((stats.value_change_percent - 50.0).abs() < 1e-9);
        assert!((stats.contribution_to_overall_change_percent - 150.0).abs() < 1e-9);
        assert!((stats.contribution_change_percent - 15.0).abs() < 1e-9);
    }
}
