use crate::error::{AttributionError, Result};
use crate::row::{DimensionValues, Dimensions, Row, EPSILON};

/// Mutable working copy of a node's row values. The selector moves child
/// contributions in and out of ancestors through these fields; the row itself
/// is never touched.
#[derive(Debug, Clone, Copy, PartialEq)]
enum NodeValues {
    Additive {
        baseline: f64,
        current: f64,
    },
    Ratio {
        baseline_numerator: f64,
        baseline_denominator: f64,
        current_numerator: f64,
        current_denominator: f64,
    },
}

impl NodeValues {
    fn from_row(row: &Row) -> Self {
        match row {
            Row::Additive(r) => NodeValues::Additive {
                baseline: r.baseline_value,
                current: r.current_value,
            },
            Row::Ratio(r) => NodeValues::Ratio {
                baseline_numerator: r.baseline_numerator,
                baseline_denominator: r.baseline_denominator,
                current_numerator: r.current_numerator,
                current_denominator: r.current_denominator,
            },
        }
    }
}

/// One aggregation node of the cube. The parent link is a non-owning arena
/// index; the `Cube` owns every node in a flat vector.
#[derive(Debug, Clone)]
pub struct CubeNode {
    pub level: usize,
    pub index: usize,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    pub row: Row,
    values: NodeValues,
    pub cost: f64,
}

impl CubeNode {
    pub fn names(&self) -> &DimensionValues {
        self.row.names()
    }

    /// Reinitializes the working values from the untouched row.
    pub fn reset_values(&mut self) {
        self.values = NodeValues::from_row(&self.row);
    }

    pub fn baseline_value(&self) -> f64 {
        match self.values {
            NodeValues::Additive { baseline, .. } => baseline,
            NodeValues::Ratio {
                baseline_numerator,
                baseline_denominator,
                ..
            } => self.guarded_ratio(baseline_numerator, baseline_denominator),
        }
    }

    pub fn current_value(&self) -> f64 {
        match self.values {
            NodeValues::Additive { current, .. } => current,
            NodeValues::Ratio {
                current_numerator,
                current_denominator,
                ..
            } => self.guarded_ratio(current_numerator, current_denominator),
        }
    }

    /// Traffic/volume proxy used for contribution weighting; equals the
    /// value itself for additive nodes.
    pub fn baseline_size(&self) -> f64 {
        match self.values {
            NodeValues::Additive { baseline, .. } => baseline,
            NodeValues::Ratio {
                baseline_numerator,
                baseline_denominator,
                ..
            } => baseline_numerator + baseline_denominator,
        }
    }

    pub fn current_size(&self) -> f64 {
        match self.values {
            NodeValues::Additive { current, .. } => current,
            NodeValues::Ratio {
                current_numerator,
                current_denominator,
                ..
            } => current_numerator + current_denominator,
        }
    }

    pub fn original_baseline_value(&self) -> f64 {
        match &self.row {
            Row::Additive(r) => r.baseline_value,
            Row::Ratio(r) => self.guarded_ratio(r.baseline_numerator, r.baseline_denominator),
        }
    }

    pub fn original_current_value(&self) -> f64 {
        match &self.row {
            Row::Additive(r) => r.current_value,
            Row::Ratio(r) => self.guarded_ratio(r.current_numerator, r.current_denominator),
        }
    }

    /// `current / baseline` over the working values (cross-ratio of the four
    /// fields for ratio nodes).
    pub fn change_ratio(&self) -> f64 {
        match self.values {
            NodeValues::Additive { baseline, current } => current / baseline,
            NodeValues::Ratio {
                baseline_numerator,
                baseline_denominator,
                current_numerator,
                current_denominator,
            } => {
                (current_numerator * baseline_denominator)
                    / (baseline_numerator * current_denominator)
            }
        }
    }

    /// Same ratio computed on the untouched row, kept for auditing.
    pub fn original_change_ratio(&self) -> f64 {
        match &self.row {
            Row::Additive(r) => r.current_value / r.baseline_value,
            Row::Ratio(r) => {
                (r.current_numerator * r.baseline_denominator)
                    / (r.baseline_numerator * r.current_denominator)
            }
        }
    }

    fn guarded_ratio(&self, numerator: f64, denominator: f64) -> f64 {
        crate::row::guarded_ratio(
            numerator,
            denominator,
            self.current_size() + self.baseline_size(),
        )
    }

    fn check_non_negative(&self, context: &str) -> Result<()> {
        let fields: Vec<(&str, f64)> = match self.values {
            NodeValues::Additive { baseline, current } => {
                vec![("baseline", baseline), ("current", current)]
            }
            NodeValues::Ratio {
                baseline_numerator,
                baseline_denominator,
                current_numerator,
                current_denominator,
            } => vec![
                ("baseline_numerator", baseline_numerator),
                ("baseline_denominator", baseline_denominator),
                ("current_numerator", current_numerator),
                ("current_denominator", current_denominator),
            ],
        };
        for (name, value) in fields {
            if value < -EPSILON {
                return Err(AttributionError::Invariant(format!(
                    "{} left {} = {} on node {:?}; child volume exceeds its ancestor",
                    context,
                    name,
                    value,
                    self.names().values()
                )));
            }
        }
        Ok(())
    }
}

/// The dimension-combination tree for one request: a flat arena of nodes with
/// parent links stored as indices. Index 0 is always the root (dataset total).
#[derive(Debug)]
pub struct Cube {
    pub dimensions: Dimensions,
    nodes: Vec<CubeNode>,
}

impl Cube {
    pub fn new(dimensions: Dimensions, root_row: Row) -> Self {
        let values = NodeValues::from_row(&root_row);
        Cube {
            dimensions,
            nodes: vec![CubeNode {
                level: 0,
                index: 0,
                parent: None,
                children: Vec::new(),
                row: root_row,
                values,
                cost: 0.0,
            }],
        }
    }

    pub fn root(&self) -> &CubeNode {
        &self.nodes[0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: usize) -> &CubeNode {
        &self.nodes[index]
    }

    pub fn node_mut(&mut self, index: usize) -> &mut CubeNode {
        &mut self.nodes[index]
    }

    pub fn nodes(&self) -> &[CubeNode] {
        &self.nodes
    }

    pub fn add_node(&mut self, parent: usize, row: Row) -> usize {
        let index = self.nodes.len();
        let values = NodeValues::from_row(&row);
        let level = self.nodes[parent].level + 1;
        self.nodes.push(CubeNode {
            level,
            index,
            parent: Some(parent),
            children: Vec::new(),
            row,
            values,
            cost: 0.0,
        });
        self.nodes[parent].children.push(index);
        index
    }

    /// Moves the child's working contribution out of `node`'s working totals.
    /// Fails fast when any adjusted field drops below −ε, which indicates a
    /// data or algorithm bug rather than a recoverable condition.
    pub fn remove_node_values(&mut self, node: usize, child: usize) -> Result<()> {
        let child_values = self.nodes[child].values;
        self.apply(node, child_values, -1.0);
        self.nodes[node].check_non_negative("remove_node_values")
    }

    /// Exact inverse of `remove_node_values`.
    pub fn add_node_values(&mut self, node: usize, child: usize) {
        let child_values = self.nodes[child].values;
        self.apply(node, child_values, 1.0);
    }

    fn apply(&mut self, node: usize, child: NodeValues, sign: f64) {
        match (&mut self.nodes[node].values, child) {
            (
                NodeValues::Additive { baseline, current },
                NodeValues::Additive {
                    baseline: cb,
                    current: cc,
                },
            ) => {
                *baseline += sign * cb;
                *current += sign * cc;
            }
            (
                NodeValues::Ratio {
                    baseline_numerator,
                    baseline_denominator,
                    current_numerator,
                    current_denominator,
                },
                NodeValues::Ratio {
                    baseline_numerator: cbn,
                    baseline_denominator: cbd,
                    current_numerator: ccn,
                    current_denominator: ccd,
                },
            ) => {
                *baseline_numerator += sign * cbn;
                *baseline_denominator += sign * cbd;
                *current_numerator += sign * ccn;
                *current_denominator += sign * ccd;
            }
            // A cube never mixes node kinds; the engine builds all rows from
            // one metric classification.
            _ => unreachable!("mixed additive/ratio nodes in one cube"),
        }
    }

    /// Whether the node moved up (true) or down (false). Negligible values
    /// borrow the parent's opposite-window value as a proxy so a near-zero
    /// slice is not flagged spuriously; a fully negligible node delegates to
    /// its parent, and the root falls back to direct comparison.
    pub fn side(&self, index: usize) -> bool {
        let node = &self.nodes[index];
        let baseline = node.baseline_value();
        let current = node.current_value();
        let baseline_negligible = baseline.abs() <= EPSILON;
        let current_negligible = current.abs() <= EPSILON;
        match (baseline_negligible, current_negligible, node.parent) {
            (false, false, _) | (_, _, None) => current >= baseline,
            // Appeared: compare against the parent's baseline.
            (true, false, Some(p)) => current >= self.nodes[p].baseline_value(),
            // Vanished: compare the parent's current against our baseline.
            (false, true, Some(p)) => self.nodes[p].current_value() >= baseline,
            (true, true, Some(p)) => self.side(p),
        }
    }

    /// Strict ancestors of a node, nearest first, ending at the root.
    pub fn ancestors(&self, index: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut cursor = self.nodes[index].parent;
        while let Some(p) = cursor {
            out.push(p);
            cursor = self.nodes[p].parent;
        }
        out
    }

    /// Strict descendants of a node, depth-first.
    pub fn descendants(&self, index: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut stack: Vec<usize> = self.nodes[index].children.clone();
        while let Some(next) = stack.pop() {
            out.push(next);
            stack.extend(self.nodes[next].children.iter().copied());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::{AdditiveRow, RatioRow, ALL};

    fn additive_row(values: &[&str], baseline: f64, current: f64) -> Row {
        Row::Additive(AdditiveRow {
            names: DimensionValues::new(values.iter().map(|s| s.to_string()).collect()),
            baseline_value: baseline,
            current_value: current,
        })
    }

    fn ratio_row(values: &[&str], bn: f64, bd: f64, cn: f64, cd: f64) -> Row {
        Row::Ratio(RatioRow {
            names: DimensionValues::new(values.iter().map(|s| s.to_string()).collect()),
            baseline_numerator: bn,
            baseline_denominator: bd,
            current_numerator: cn,
            current_denominator: cd,
        })
    }

    fn two_level_cube() -> Cube {
        let dims = Dimensions::new(["country"]);
        let mut cube = Cube::new(dims, additive_row(&[ALL], 1000.0, 1200.0));
        cube.add_node(0, additive_row(&["US"], 600.0, 900.0));
        cube.add_node(0, additive_row(&["EU"], 400.0, 300.0));
        cube
    }

    #[test]
    fn test_remove_then_add_restores_within_epsilon() {
        let mut cube = two_level_cube();
        let before = (cube.root().baseline_value(), cube.root().current_value());
        cube.remove_node_values(0, 1).unwrap();
        assert!((cube.root().baseline_value() - 400.0).abs() < EPSILON);
        assert!((cube.root().current_value() - 300.0).abs() < EPSILON);
        cube.add_node_values(0, 1);
        assert!((cube.root().baseline_value() - before.0).abs() < EPSILON);
        assert!((cube.root().current_value() - before.1).abs() < EPSILON);
    }

    #[test]
    fn test_remove_below_zero_fails_fast() {
        let dims = Dimensions::new(["country"]);
        let mut cube = Cube::new(dims, additive_row(&[ALL], 100.0, 100.0));
        let child = cube.add_node(0, additive_row(&["US"], 600.0, 50.0));
        let err = cube.remove_node_values(0, child).unwrap_err();
        assert!(matches!(err, AttributionError::Invariant(_)));
    }

    #[test]
    fn test_reset_values_restores_row() {
        let mut cube = two_level_cube();
        cube.remove_node_values(0, 1).unwrap();
        cube.node_mut(0).reset_values();
        assert_eq!(cube.root().baseline_value(), 1000.0);
        assert_eq!(cube.root().current_value(), 1200.0);
    }

    #[test]
    fn test_ratio_value_guards() {
        let dims = Dimensions::new(["country"]);
        // Both numerator and denominator negligible: treated as missing.
        let cube = Cube::new(dims.clone(), ratio_row(&[ALL], 0.0, 0.0, 0.0, 0.0));
        assert_eq!(cube.root().baseline_value(), 0.0);
        assert_eq!(cube.root().current_value(), 0.0);

        // Plain division when the denominator is meaningful.
        let cube = Cube::new(dims.clone(), ratio_row(&[ALL], 10.0, 100.0, 30.0, 100.0));
        assert!((cube.root().baseline_value() - 0.1).abs() < EPSILON);
        assert!((cube.root().current_value() - 0.3).abs() < EPSILON);
        assert_eq!(cube.root().baseline_size(), 110.0);
        assert_eq!(cube.root().current_size(), 130.0);

        // Negligible denominator with meaningful numerator: traffic-scaled
        // fallback, not infinity.
        let cube = Cube::new(dims, ratio_row(&[ALL], 10.0, 0.0, 20.0, 100.0));
        let value = cube.root().baseline_value();
        assert!(value.is_finite());
        assert!((value - 10.0 / 130.0).abs() < EPSILON);
    }

    #[test]
    fn test_side_direct_comparison() {
        let cube = two_level_cube();
        assert!(cube.side(1)); // 600 -> 900
        assert!(!cube.side(2)); // 400 -> 300
        assert!(cube.side(0)); // overall up
    }

    #[test]
    fn test_side_negligible_cases() {
        let dims = Dimensions::new(["country"]);
        let mut cube = Cube::new(dims, additive_row(&[ALL], 1000.0, 800.0));
        // Appeared: the parent's baseline stands in for the missing one, so
        // the slice counts as up only when its current clears it.
        let appeared_low = cube.add_node(0, additive_row(&["XX"], 0.0, 50.0));
        let appeared_high = cube.add_node(0, additive_row(&["XY"], 0.0, 1100.0));
        // Vanished: the parent's current stands in for the missing current.
        let vanished_small = cube.add_node(0, additive_row(&["YY"], 30.0, 0.0));
        let vanished_large = cube.add_node(0, additive_row(&["ZZ"], 900.0, 0.0));
        // Fully negligible: delegates to the parent (overall down).
        let empty = cube.add_node(0, additive_row(&["WW"], 0.0, 0.0));

        assert!(!cube.side(appeared_low)); // 50 < parent baseline 1000
        assert!(cube.side(appeared_high)); // 1100 >= parent baseline 1000
        assert!(cube.side(vanished_small)); // parent current 800 >= 30
        assert!(!cube.side(vanished_large)); // parent current 800 < 900
        assert!(!cube.side(empty));
    }

    #[test]
    fn test_change_ratio() {
        let cube = two_level_cube();
        assert!((cube.node(1).change_ratio() - 1.5).abs() < EPSILON);
        assert!((cube.node(1).original_change_ratio() - 1.5).abs() < EPSILON);

        let dims = Dimensions::new(["country"]);
        let cube = Cube::new(dims, ratio_row(&[ALL], 10.0, 100.0, 30.0, 100.0));
        assert!((cube.root().change_ratio() - 3.0).abs() < EPSILON);
    }

    #[test]
    fn test_ancestors_and_descendants() {
        let dims = Dimensions::new(["country", "device"]);
        let mut cube = Cube::new(dims, additive_row(&[ALL, ALL], 1000.0, 1200.0));
        let us = cube.add_node(0, additive_row(&["US", ALL], 600.0, 900.0));
        let us_mobile = cube.add_node(us, additive_row(&["US", "mobile"], 500.0, 800.0));
        assert_eq!(cube.ancestors(us_mobile), vec![us, 0]);
        assert_eq!(cube.descendants(0), vec![us, us_mobile]);
        assert_eq!(cube.node(us_mobile).level, 2);
    }
}
