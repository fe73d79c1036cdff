use crate::api::SummaryResponseRow;
use crate::cost::{ChangeStats, CostFunction, Totals};
use crate::error::{AttributionError, Result};
use crate::row::{Dimensions, ALL};
use itertools::Itertools;
use std::collections::BTreeMap;
use tracing::debug;

/// One `(dimension, value)` slice of a single-level breakdown. `size` is the
/// traffic proxy used for contribution weighting; it equals `metric_value`
/// for additive metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakdownSlice {
    pub dimension: String,
    pub value: String,
    pub metric_value: f64,
    pub size: f64,
}

#[derive(Debug, Clone, Copy, Default)]
struct JoinedSlice {
    baseline: f64,
    current: f64,
    baseline_size: f64,
    current_size: f64,
}

/// Non-hierarchical fallback finder: scores one dimension value at a time
/// and never combines two dimensions in a single output row.
#[derive(Debug, Clone)]
pub struct SimpleContributorsFinder {
    cost_function: CostFunction,
}

impl SimpleContributorsFinder {
    pub fn new(cost_function: CostFunction) -> Self {
        SimpleContributorsFinder { cost_function }
    }

    /// Outer-joins the two breakdowns, scores every slice, and keeps the
    /// highest-cost `summary_size` rows. Empty windows are reported as
    /// structured failures with distinct diagnostics, since missing current
    /// data implies broken collection rather than a bad offset.
    pub fn find(
        &self,
        baseline_slices: &[BreakdownSlice],
        current_slices: &[BreakdownSlice],
        dimensions: &Dimensions,
        totals: &Totals,
        summary_size: usize,
        do_one_side_error: bool,
    ) -> Result<Vec<SummaryResponseRow>> {
        if baseline_slices.is_empty() {
            return Err(AttributionError::NoData(
                "no baseline data in the baseline window; check the baseline offset".to_string(),
            ));
        }
        if current_slices.is_empty() {
            return Err(AttributionError::NoData(
                "no current data in the current window; metric collection may be broken"
                    .to_string(),
            ));
        }

        // Outer join on (dimension, value), filling the missing side with 0.
        let mut joined: BTreeMap<(String, String), JoinedSlice> = BTreeMap::new();
        for slice in baseline_slices {
            let entry = joined
                .entry((slice.dimension.clone(), slice.value.clone()))
                .or_default();
            entry.baseline = slice.metric_value;
            entry.baseline_size = slice.size;
        }
        for slice in current_slices {
            let entry = joined
                .entry((slice.dimension.clone(), slice.value.clone()))
                .or_default();
            entry.current = slice.metric_value;
            entry.current_size = slice.size;
        }

        let overall_up = totals.side();
        let scored: Vec<((String, String), JoinedSlice, ChangeStats, f64)> = joined
            .into_iter()
            .filter(|(_, slice)| {
                if !do_one_side_error {
                    return true;
                }
                let change = slice.current - slice.baseline;
                if overall_up {
                    change >= 0.0
                } else {
                    change <= 0.0
                }
            })
            .map(|(key, slice)| {
                let stats = ChangeStats::compute(
                    slice.baseline,
                    slice.current,
                    slice.baseline_size,
                    slice.current_size,
                    totals,
                );
                let cost = self.cost_function.cost(&stats);
                (key, slice, stats, cost)
            })
            .filter(|(_, _, _, cost)| *cost > 0.0)
            .collect();

        debug!(candidates = scored.len(), "scored breakdown slices");

        // Ascending sort, highest-cost tail, reported best-first.
        let rows: Vec<SummaryResponseRow> = scored
            .into_iter()
            .sorted_by(|a, b| a.3.partial_cmp(&b.3).unwrap_or(std::cmp::Ordering::Equal))
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .take(summary_size.max(1))
            .map(|((dimension, value), slice, stats, cost)| {
                let mut names = vec![ALL.to_string(); dimensions.len()];
                if let Some(position) = dimensions.index_of(&dimension) {
                    names[position] = value;
                }
                SummaryResponseRow {
                    names,
                    cost,
                    baseline_value: slice.baseline,
                    current_value: slice.current,
                    change_percentage: stats.value_change_percent,
                    contribution_change_percentage: stats.contribution_change_percent,
                    contribution_to_overall_change_percentage: stats
                        .contribution_to_overall_change_percent,
                }
            })
            .collect();

        Ok(rows)
    }
}
