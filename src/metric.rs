use crate::error::{AttributionError, Result};
use crate::row::Dimensions;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

lazy_static! {
    /// A metric is a "simple ratio metric" iff its derived expression is
    /// exactly `id<digits>/id<digits>`. Expressions with extra operators
    /// (e.g. `id123*100/id456`) are not simple ratios.
    static ref SIMPLE_RATIO_RE: Regex =
        Regex::new(r"^id(?P<numerator>\d*)/id(?P<denominator>\d*)$").unwrap();
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub name: String,
    /// Default group-by dimensions used when a request leaves the list blank.
    pub dimensions: Vec<String>,
    pub metrics: Vec<MetricConfig>,
}

impl DatasetConfig {
    pub fn get_metric(&self, name: &str) -> Option<&MetricConfig> {
        self.metrics.iter().find(|m| m.name == name)
    }

    pub fn get_metric_by_id(&self, id: u64) -> Option<&MetricConfig> {
        self.metrics.iter().find(|m| m.id == id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricConfig {
    pub id: u64,
    pub name: String,
    /// Derived-metric expression over metric ids, e.g. `id123/id456`.
    /// Absent for plain additive metrics.
    #[serde(default)]
    pub derived_metric_expression: Option<String>,
}

/// How the engine treats the requested metric's aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Additive { metric_id: u64 },
    Ratio { numerator_id: u64, denominator_id: u64 },
}

impl MetricType {
    pub fn is_ratio(&self) -> bool {
        matches!(self, MetricType::Ratio { .. })
    }
}

pub fn is_simple_ratio_metric(expression: &str) -> bool {
    SIMPLE_RATIO_RE.is_match(expression)
}

/// Extracts `(numerator_id, denominator_id)` from a simple ratio expression.
/// Returns `None` when the expression does not match the guard at all.
pub fn parse_ratio_expression(expression: &str) -> Option<Result<(u64, u64)>> {
    let captures = SIMPLE_RATIO_RE.captures(expression)?;
    let parse = |name: &str| {
        captures
            .name(name)
            .and_then(|m| m.as_str().parse::<u64>().ok())
    };
    match (parse("numerator"), parse("denominator")) {
        (Some(n), Some(d)) => Some(Ok((n, d))),
        // The guard matched but an id is empty or out of range; this is a
        // configuration error, not an additive metric.
        _ => Some(Err(AttributionError::Metric(format!(
            "ratio expression '{}' matched the simple-ratio guard but its metric ids are unparsable",
            expression
        )))),
    }
}

/// Classifies a metric as additive or ratio based on its derived expression.
pub fn classify_metric(dataset: &DatasetConfig, metric: &MetricConfig) -> Result<MetricType> {
    match metric.derived_metric_expression.as_deref() {
        Some(expr) => match parse_ratio_expression(expr) {
            Some(ids) => {
                let (numerator_id, denominator_id) = ids?;
                for id in [numerator_id, denominator_id] {
                    if dataset.get_metric_by_id(id).is_none() {
                        return Err(AttributionError::Metric(format!(
                            "ratio expression '{}' references unknown metric id {}",
                            expr, id
                        )));
                    }
                }
                Ok(MetricType::Ratio {
                    numerator_id,
                    denominator_id,
                })
            }
            // Derived but not a simple ratio: fall through to additive
            // handling of the metric itself.
            None => Ok(MetricType::Additive {
                metric_id: metric.id,
            }),
        },
        None => Ok(MetricType::Additive {
            metric_id: metric.id,
        }),
    }
}

fn split_names(list: &str) -> Vec<String> {
    list.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// Resolves the request's dimension list: the explicit group-by when given,
/// otherwise the dataset defaults, in both cases minus the excluded names.
pub fn resolve_dimensions(
    dataset: &DatasetConfig,
    group_by_dimensions: &str,
    excluded_dimensions: &str,
) -> Result<Dimensions> {
    let requested = split_names(group_by_dimensions);
    let excluded = split_names(excluded_dimensions);
    let base = if requested.is_empty() {
        dataset.dimensions.clone()
    } else {
        requested
    };
    let dims = Dimensions::new(base.into_iter().filter(|d| !excluded.contains(d)));
    if dims.is_empty() {
        return Err(AttributionError::Dataset(format!(
            "dataset '{}' has no usable dimensions after exclusions",
            dataset.name
        )));
    }
    Ok(dims)
}
