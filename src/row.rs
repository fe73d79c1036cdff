use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Wildcard sentinel for "not broken down by this dimension".
pub const ALL: &str = "(ALL)";

/// Single fuzzy-comparison epsilon; governs the cube invariants and the
/// negligible-value guards in the ratio node getters.
pub const EPSILON: f64 = 1e-4;

/// Ordered, duplicate-free sequence of dimension names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions(Vec<String>);

impl Dimensions {
    /// Builds the dimension list, dropping duplicates while preserving the
    /// first occurrence's position.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = Vec::new();
        for name in names {
            let name = name.into();
            if !seen.contains(&name) {
                seen.push(name);
            }
        }
        Dimensions(seen)
    }

    pub fn names(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.0.iter().position(|d| d == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|d| d == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.0.iter()
    }

    /// First `n` dimension names, used for prefix group-bys during cube
    /// construction.
    pub fn prefix(&self, n: usize) -> Vec<String> {
        self.0.iter().take(n).cloned().collect()
    }
}

/// Concrete values aligned positionally to a `Dimensions` list; positions the
/// row is not broken down by hold the `(ALL)` wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DimensionValues(Vec<String>);

impl DimensionValues {
    pub fn new(values: Vec<String>) -> Self {
        DimensionValues(values)
    }

    /// All-wildcard tuple of the given width (the dataset-total row).
    pub fn all(width: usize) -> Self {
        DimensionValues(vec![ALL.to_string(); width])
    }

    pub fn values(&self) -> &[String] {
        &self.0
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.0.get(index).map(|s| s.as_str())
    }

    /// Number of concrete (non-wildcard) positions; equals the cube level the
    /// row belongs to when dimensions are expanded in prefix order.
    pub fn level(&self) -> usize {
        self.0.iter().filter(|v| v.as_str() != ALL).count()
    }

    /// True when every concrete position of this tuple matches `other`, i.e.
    /// `other` refines this tuple by naming additional dimensions.
    pub fn covers(&self, other: &DimensionValues) -> bool {
        if self.0.len() != other.0.len() {
            return false;
        }
        self.0
            .iter()
            .zip(other.0.iter())
            .all(|(a, b)| a == ALL || a == b)
    }
}

/// Which of the tagged aggregate fetches a raw value belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchTag {
    BaselineValue,
    CurrentValue,
    BaselineNumerator,
    BaselineDenominator,
    CurrentNumerator,
    CurrentDenominator,
}

impl FetchTag {
    pub fn is_baseline(&self) -> bool {
        matches!(
            self,
            FetchTag::BaselineValue | FetchTag::BaselineNumerator | FetchTag::BaselineDenominator
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdditiveRow {
    pub names: DimensionValues,
    pub baseline_value: f64,
    pub current_value: f64,
}

/// Ratio rows carry four independently-tagged fields, each filled from its
/// own fetch. Fields stay 0 until a positive, finite value arrives.
#[derive(Debug, Clone, PartialEq)]
pub struct RatioRow {
    pub names: DimensionValues,
    pub baseline_numerator: f64,
    pub baseline_denominator: f64,
    pub current_numerator: f64,
    pub current_denominator: f64,
}

impl RatioRow {
    pub fn baseline_value(&self) -> f64 {
        guarded_ratio(self.baseline_numerator, self.baseline_denominator, self.volume())
    }

    pub fn current_value(&self) -> f64 {
        guarded_ratio(self.current_numerator, self.current_denominator, self.volume())
    }

    pub fn baseline_size(&self) -> f64 {
        self.baseline_numerator + self.baseline_denominator
    }

    pub fn current_size(&self) -> f64 {
        self.current_numerator + self.current_denominator
    }

    fn volume(&self) -> f64 {
        self.baseline_size() + self.current_size()
    }
}

/// Ratio with the near-zero-denominator guards: both parts negligible reads
/// as 0 ("missing"); a negligible denominator alone falls back to dividing by
/// the traffic volume so the value stays comparably scaled instead of
/// blowing up.
pub(crate) fn guarded_ratio(numerator: f64, denominator: f64, volume: f64) -> f64 {
    if denominator.abs() > EPSILON {
        numerator / denominator
    } else if numerator.abs() <= EPSILON || volume.abs() <= EPSILON {
        0.0
    } else {
        numerator / volume
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Row {
    Additive(AdditiveRow),
    Ratio(RatioRow),
}

impl Row {
    pub fn names(&self) -> &DimensionValues {
        match self {
            Row::Additive(r) => &r.names,
            Row::Ratio(r) => &r.names,
        }
    }

    pub fn level(&self) -> usize {
        self.names().level()
    }
}

/// Per-request accumulator mapping dimension-value tuples to rows as tagged
/// fetch results stream in.
#[derive(Debug)]
pub struct RowStore {
    pub dimensions: Dimensions,
    is_ratio: bool,
    rows: HashMap<DimensionValues, Row>,
}

impl RowStore {
    pub fn new(dimensions: Dimensions, is_ratio: bool) -> Self {
        RowStore {
            dimensions,
            is_ratio,
            rows: HashMap::new(),
        }
    }

    /// Records one fetched aggregate. Additive values are accepted whenever
    /// finite; ratio values only when positive and finite, modelling "no
    /// meaningful numerator/denominator data for this slice" rather than a
    /// hard zero.
    pub fn ingest(&mut self, tag: FetchTag, names: DimensionValues, value: f64) {
        if self.is_ratio {
            if !(value.is_finite() && value > 0.0) {
                return;
            }
            let row = self.rows.entry(names.clone()).or_insert_with(|| {
                Row::Ratio(RatioRow {
                    names,
                    baseline_numerator: 0.0,
                    baseline_denominator: 0.0,
                    current_numerator: 0.0,
                    current_denominator: 0.0,
                })
            });
            if let Row::Ratio(r) = row {
                match tag {
                    FetchTag::BaselineNumerator => r.baseline_numerator = value,
                    FetchTag::BaselineDenominator => r.baseline_denominator = value,
                    FetchTag::CurrentNumerator => r.current_numerator = value,
                    FetchTag::CurrentDenominator => r.current_denominator = value,
                    // Additive tags are never issued for ratio metrics.
                    FetchTag::BaselineValue | FetchTag::CurrentValue => {}
                }
            }
        } else {
            if !value.is_finite() {
                return;
            }
            let row = self.rows.entry(names.clone()).or_insert_with(|| {
                Row::Additive(AdditiveRow {
                    names,
                    baseline_value: 0.0,
                    current_value: 0.0,
                })
            });
            if let Row::Additive(r) = row {
                match tag {
                    FetchTag::BaselineValue => r.baseline_value = value,
                    FetchTag::CurrentValue => r.current_value = value,
                    _ => {}
                }
            }
        }
    }

    pub fn get(&self, names: &DimensionValues) -> Option<&Row> {
        self.rows.get(names)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows whose concrete-position count equals `level`, in unspecified
    /// order; callers sort before building the cube.
    pub fn rows_at_level(&self, level: usize) -> Vec<&Row> {
        self.rows.values().filter(|r| r.level() == level).collect()
    }
}
