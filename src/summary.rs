use crate::api::SummaryResponseRow;
use crate::breakdown::BreakdownSlice;
use crate::cost::{ChangeStats, CostFunction, Totals};
use crate::cube::Cube;
use crate::error::{AttributionError, Result};
use crate::row::{DimensionValues, Dimensions, Row, RowStore, ALL};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Orders the dimension list for cube construction: most explanatory first
/// when per-dimension scores are available, then adjusted so every hierarchy
/// keeps its parent-before-child relative order.
pub fn order_dimensions(
    dimensions: &Dimensions,
    hierarchies: &[Vec<String>],
    scores: Option<&HashMap<String, f64>>,
) -> Dimensions {
    let mut names: Vec<String> = dimensions.names().to_vec();
    if let Some(scores) = scores {
        names.sort_by(|a, b| {
            let sa = scores.get(a).copied().unwrap_or(0.0);
            let sb = scores.get(b).copied().unwrap_or(0.0);
            sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
        });
    }
    for hierarchy in hierarchies {
        let present: Vec<String> = hierarchy
            .iter()
            .filter(|d| names.contains(d))
            .cloned()
            .collect();
        if present.len() < 2 {
            continue;
        }
        // Reassign the hierarchy's dimensions into their current slots in
        // the hierarchy's own order; everything else keeps its position.
        let mut slots: Vec<usize> = names
            .iter()
            .enumerate()
            .filter(|(_, n)| present.contains(n))
            .map(|(i, _)| i)
            .collect();
        slots.sort_unstable();
        for (slot, name) in slots.into_iter().zip(present.into_iter()) {
            names[slot] = name;
        }
    }
    Dimensions::new(names)
}

/// Scores each dimension by the summed cost of its single-dimension slices;
/// used to pick the drill-down order before deeper levels are fetched.
pub fn score_dimensions(
    baseline_slices: &[BreakdownSlice],
    current_slices: &[BreakdownSlice],
    totals: &Totals,
    cost_function: &CostFunction,
) -> HashMap<String, f64> {
    let mut joined: HashMap<(String, String), (f64, f64, f64, f64)> = HashMap::new();
    for slice in baseline_slices {
        let entry = joined
            .entry((slice.dimension.clone(), slice.value.clone()))
            .or_default();
        entry.0 = slice.metric_value;
        entry.2 = slice.size;
    }
    for slice in current_slices {
        let entry = joined
            .entry((slice.dimension.clone(), slice.value.clone()))
            .or_default();
        entry.1 = slice.metric_value;
        entry.3 = slice.size;
    }
    let mut scores: HashMap<String, f64> = HashMap::new();
    for ((dimension, _), (baseline, current, baseline_size, current_size)) in joined {
        let stats = ChangeStats::compute(baseline, current, baseline_size, current_size, totals);
        *scores.entry(dimension).or_insert(0.0) += cost_function.cost(&stats);
    }
    scores
}

/// Assembles the cube tree from fetched rows: level `l` nodes carry concrete
/// values for the first `l` dimensions of the (ordered) dimension list and
/// link to the prefix node one level up.
pub fn build_cube(dimensions: &Dimensions, depth: usize, store: &RowStore) -> Result<Cube> {
    let width = dimensions.len();
    let root_names = DimensionValues::all(width);
    let root_row = store
        .get(&root_names)
        .cloned()
        .ok_or_else(|| AttributionError::NoData("no overall aggregate data".to_string()))?;

    let mut cube = Cube::new(dimensions.clone(), root_row);
    let mut index_of: HashMap<DimensionValues, usize> = HashMap::new();
    index_of.insert(root_names, 0);

    for level in 1..=depth.min(width) {
        let mut rows: Vec<&Row> = store
            .rows_at_level(level)
            .into_iter()
            .filter(|row|

                // Concrete values must sit exactly on the level prefix.
                (0..width).all(|i| (i < level) == (row.names().get(i) != Some(ALL))))
            .collect();
        rows.sort_by(|a, b| a.names().values().cmp(b.names().values()));

        for row in rows {
            let mut parent_values: Vec<String> = row.names().values().to_vec();
            parent_values[level - 1] = ALL.to_string();
            let parent_names = DimensionValues::new(parent_values);
            let Some(&parent) = index_of.get(&parent_names) else {
                warn!(
                    names = ?row.names().values(),
                    "dropping row with no parent aggregate"
                );
                continue;
            };
            let index = cube.add_node(parent, row.clone());
            index_of.insert(row.names().clone(), index);
        }
    }

    debug!(nodes = cube.len(), "built cube");
    Ok(cube)
}

/// Dataset-level totals from the root's (still untouched) working values.
pub fn cube_totals(cube: &Cube) -> Totals {
    let root = cube.root();
    Totals {
        baseline_total: root.baseline_value(),
        current_total: root.current_value(),
        baseline_total_size: root.baseline_size(),
        current_total_size: root.current_size(),
    }
}

/// Greedy top-K selection over the cube: globally best nodes, no
/// double-explained volume, optional one-side restriction.
#[derive(Debug, Clone)]
pub struct SummarySelector {
    cost_function: CostFunction,
    summary_size: usize,
    do_one_side_error: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CandidateState {
    Eligible,
    Selected,
    Excluded,
}

impl SummarySelector {
    pub fn new(cost_function: CostFunction, summary_size: usize, do_one_side_error: bool) -> Self {
        SummarySelector {
            cost_function,
            // A caller asking for fewer than one row still gets one.
            summary_size: summary_size.max(1),
            do_one_side_error,
        }
    }

    /// Picks up to `summary_size` nodes. Selecting a node excludes its
    /// descendants (their volume is now explained) and moves its working
    /// values out of every strict ancestor, so an ancestor picked later
    /// represents only the remaining, unexplained volume at that level.
    /// Ties in cost go to the node closer to the root, then to arena order.
    pub fn select(&self, cube: &mut Cube, totals: &Totals) -> Result<Vec<SummaryResponseRow>> {
        let node_count = cube.len();
        let overall_up = totals.side();

        let mut states = vec![CandidateState::Eligible; node_count];
        states[0] = CandidateState::Excluded; // the root is reported via totals

        let mut stats: Vec<ChangeStats> = (0..node_count)
            .map(|i| self.node_stats(cube, i, totals))
            .collect();
        for i in 0..node_count {
            cube.node_mut(i).cost = self.cost_function.cost(&stats[i]);
        }

        let mut selected_rows = Vec::new();
        while selected_rows.len() < self.summary_size {
            let Some(best) = self.pick_best(cube, &states, overall_up) else {
                break;
            };
            states[best] = CandidateState::Selected;
            for descendant in cube.descendants(best) {
                if states[descendant] == CandidateState::Eligible {
                    states[descendant] = CandidateState::Excluded;
                }
            }

            selected_rows.push(self.render(cube, best, &stats[best]));
            debug!(
                names = ?cube.node(best).names().values(),
                cost = cube.node(best).cost,
                "selected summary node"
            );

            // Deduct the surfaced volume from every strict ancestor and
            // re-score the ones still in play.
            for ancestor in cube.ancestors(best) {
                cube.remove_node_values(ancestor, best)?;
                if states[ancestor] == CandidateState::Eligible {
                    stats[ancestor] = self.node_stats(cube, ancestor, totals);
                    cube.node_mut(ancestor).cost = self.cost_function.cost(&stats[ancestor]);
                }
            }
        }

        Ok(selected_rows)
    }

    fn node_stats(&self, cube: &Cube, index: usize, totals: &Totals) -> ChangeStats {
        let node = cube.node(index);
        ChangeStats::compute(
            node.baseline_value(),
            node.current_value(),
            node.baseline_size(),
            node.current_size(),
            totals,
        )
    }

    fn pick_best(
        &self,
        cube: &Cube,
        states: &[CandidateState],
        overall_up: bool,
    ) -> Option<usize> {
        let mut best: Option<usize> = None;
        for index in 0..cube.len() {
            if states[index] != CandidateState::Eligible {
                continue;
            }
            let node = cube.node(index);
            if node.cost <= 0.0 {
                continue;
            }
            if self.do_one_side_error && cube.side(index) != overall_up {
                continue;
            }
            best = match best {
                None => Some(index),
                Some(current_best) => {
                    let a = cube.node(index);
                    let b = cube.node(current_best);
                    // Higher cost wins; equal cost prefers the more general
                    // (root-closer) node, then insertion order.
                    if a.cost > b.cost || (a.cost == b.cost && a.level < b.level) {
                        Some(index)
                    } else {
                        Some(current_best)
                    }
                }
            };
        }
        best
    }

    fn render(&self, cube: &Cube, index: usize, stats: &ChangeStats) -> SummaryResponseRow {
        let node = cube.node(index);
        SummaryResponseRow {
            names: node.names().values().to_vec(),
            cost: node.cost,
            baseline_value: node.baseline_value(),
            current_value: node.current_value(),
            change_percentage: stats.value_change_percent,
            contribution_change_percentage: stats.contribution_change_percent,
            contribution_to_overall_change_percentage: stats.contribution_to_overall_change_percent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::DEFAULT_MIN_CONTRIBUTION_PERCENT;
    use crate::row::FetchTag;

    fn names(values: &[&str]) -> DimensionValues {
        DimensionValues::new(values.iter().map(|s| s.to_string()).collect())
    }

    fn balanced() -> CostFunction {
        CostFunction::Balanced {
            min_contribution_percent: DEFAULT_MIN_CONTRIBUTION_PERCENT,
        }
    }

    fn region_store() -> RowStore {
        let mut store = RowStore::new(Dimensions::new(["region"]), false);
        for (tag, values, v) in [
            (FetchTag::BaselineValue, vec![ALL], 1000.0),
            (FetchTag::CurrentValue, vec![ALL], 1200.0),
            (FetchTag::BaselineValue, vec!["US"], 600.0),
            (FetchTag::CurrentValue, vec!["US"], 900.0),
            (FetchTag::BaselineValue, vec!["EU"], 400.0),
            (FetchTag::CurrentValue, vec!["EU"], 300.0),
        ] {
            store.ingest(tag, names(&values), v);
        }
        store
    }

    #[test]
    fn test_order_dimensions_by_score_with_hierarchy() {
        let dims = Dimensions::new(["city", "country", "device"]);
        let scores = HashMap::from([
            ("city".to_string(), 90.0),
            ("country".to_string(), 50.0),
            ("device".to_string(), 70.0),
        ]);
        let hierarchies = vec![vec!["country".to_string(), "city".to_string()]];
        let ordered = order_dimensions(&dims, &hierarchies, Some(&scores));
        // Score order would be city, device, country; the hierarchy forces
        // country into the slot before city.
        assert_eq!(ordered.names(), &["country", "device", "city"]);
    }

    #[test]
    fn test_build_cube_links_prefix_parents() {
        let dims = Dimensions::new(["country", "device"]);
        let mut store = RowStore::new(dims.clone(), false);
        for (tag, values, v) in [
            (FetchTag::BaselineValue, vec![ALL, ALL], 1000.0),
            (FetchTag::CurrentValue, vec![ALL, ALL], 1200.0),
            (FetchTag::BaselineValue, vec!["US", ALL], 600.0),
            (FetchTag::CurrentValue, vec!["US", ALL], 900.0),
            (FetchTag::BaselineValue, vec!["US", "mobile"], 500.0),
            (FetchTag::CurrentValue, vec!["US", "mobile"], 800.0),
        ] {
            store.ingest(tag, names(&values), v);
        }
        let cube = build_cube(&dims, 2, &store).unwrap();
        assert_eq!(cube.len(), 3);
        let leaf = cube
            .nodes()
            .iter()
            .find(|n| n.names() == &names(&["US", "mobile"]))
            .unwrap();
        assert_eq!(leaf.level, 2);
        let parent = cube.node(leaf.parent.unwrap());
        assert_eq!(parent.names(), &names(&["US", ALL]));
    }

    #[test]
    fn test_region_example_top_one_selects_us() {
        let store = region_store();
        let dims = Dimensions::new(["region"]);
        let mut cube = build_cube(&dims, 1, &store).unwrap();
        let totals = cube_totals(&cube);
        assert_eq!(totals.baseline_total, 1000.0);
        assert_eq!(totals.current_total, 1200.0);

        let rows = SummarySelector::new(balanced(), 1, false)
            .select(&mut cube, &totals)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].names, vec!["US"]);
        assert!((rows[0].change_percentage - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_one_side_error_excludes_decreasing_nodes() {
        let store = region_store();
        let dims = Dimensions::new(["region"]);
        let mut cube = build_cube(&dims, 1, &store).unwrap();
        let totals = cube_totals(&cube);
        let rows = SummarySelector::new(balanced(), 10, true)
            .select(&mut cube, &totals)
            .unwrap();
        // Overall up: EU (400 -> 300) is ineligible.
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].names, vec!["US"]);
    }

    #[test]
    fn test_summary_size_below_one_coerced_to_one() {
        let store = region_store();
        let dims = Dimensions::new(["region"]);
        let mut cube = build_cube(&dims, 1, &store).unwrap();
        let totals = cube_totals(&cube);
        let rows = SummarySelector::new(balanced(), 0, false)
            .select(&mut cube, &totals)
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    fn two_level_store() -> (Dimensions, RowStore) {
        let dims = Dimensions::new(["country", "device"]);
        let mut store = RowStore::new(dims.clone(), false);
        for (tag, values, v) in [
            (FetchTag::BaselineValue, vec![ALL, ALL], 1000.0),
            (FetchTag::CurrentValue, vec![ALL, ALL], 1200.0),
            (FetchTag::BaselineValue, vec!["US", ALL], 600.0),
            (FetchTag::CurrentValue, vec!["US", ALL], 900.0),
            (FetchTag::BaselineValue, vec!["EU", ALL], 400.0),
            (FetchTag::CurrentValue, vec!["EU", ALL], 300.0),
            (FetchTag::BaselineValue, vec!["US", "mobile"], 500.0),
            (FetchTag::CurrentValue, vec!["US", "mobile"], 800.0),
            (FetchTag::BaselineValue, vec!["US", "desktop"], 100.0),
            (FetchTag::CurrentValue, vec!["US", "desktop"], 100.0),
            (FetchTag::BaselineValue, vec!["EU", "mobile"], 400.0),
            (FetchTag::CurrentValue, vec!["EU", "mobile"], 300.0),
        ] {
            store.ingest(tag, names(&values), v);
        }
        (dims, store)
    }

    #[test]
    fn test_selection_deducts_surfaced_volume_from_ancestors() {
        let (dims, store) = two_level_store();
        let mut cube = build_cube(&dims, 2, &store).unwrap();
        let totals = cube_totals(&cube);
        let rows = SummarySelector::new(balanced(), 3, false)
            .select(&mut cube, &totals)
            .unwrap();

        // US/mobile carries the whole movement of US, so after it is picked
        // the US remainder (desktop only, flat) scores zero and is never
        // surfaced; EU comes out ahead of it.
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].names, vec!["US", "mobile"]);
        assert_eq!(rows[1].names, vec!["EU", ALL]);

        let us = cube
            .nodes()
            .iter()
            .find(|n| n.names() == &names(&["US", ALL]))
            .unwrap();
        assert!((us.baseline_value() - 100.0).abs() < 1e-9);
        assert!((us.current_value() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_equal_cost_prefers_node_closer_to_root() {
        // The single child carries all of its parent's volume, so parent and
        // child have identical stats and costs; the parent must win.
        let dims = Dimensions::new(["country", "device"]);
        let mut store = RowStore::new(dims.clone(), false);
        for (tag, values, v) in [
            (FetchTag::BaselineValue, vec![ALL, ALL], 1000.0),
            (FetchTag::CurrentValue, vec![ALL, ALL], 1300.0),
            (FetchTag::BaselineValue, vec!["US", ALL], 600.0),
            (FetchTag::CurrentValue, vec!["US", ALL], 900.0),
            (FetchTag::BaselineValue, vec!["US", "mobile"], 600.0),
            (FetchTag::CurrentValue, vec!["US", "mobile"], 900.0),
        ] {
            store.ingest(tag, names(&values), v);
        }
        let mut cube = build_cube(&dims, 2, &store).unwrap();
        let totals = cube_totals(&cube);
        let rows = SummarySelector::new(balanced(), 1, false)
            .select(&mut cube, &totals)
            .unwrap();
        assert_eq!(rows[0].names, vec!["US", ALL]);
    }
}
