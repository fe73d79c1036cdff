use crate::api::DimensionAnalysisResult;
use crate::breakdown::{BreakdownSlice, SimpleContributorsFinder};
use crate::cost::{CostFunction, Totals};
use crate::datasource::{AggregateRequest, AggregateRow, AggregationClient, Filters, TimeWindow};
use crate::error::{AttributionError, Result};
use crate::metric::{classify_metric, resolve_dimensions, DatasetConfig, MetricType};
use crate::row::{guarded_ratio, DimensionValues, Dimensions, FetchTag, RowStore, ALL};
use crate::summary::{
    build_cube, cube_totals, order_dimensions, score_dimensions, SummarySelector,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, error, info, warn};

fn default_fetch_timeout_secs() -> u64 {
    60
}

fn default_breakdown_row_limit() -> usize {
    100
}

fn default_min_contribution_percent() -> f64 {
    crate::cost::DEFAULT_MIN_CONTRIBUTION_PERCENT
}

fn default_auto_dimension_order() -> bool {
    true
}

/// Engine-level tuning knobs; every field has a sensible default so a config
/// file only needs to name what it overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    #[serde(default = "default_breakdown_row_limit")]
    pub breakdown_row_limit: usize,

    #[serde(default = "default_min_contribution_percent")]
    pub min_contribution_percent: f64,

    /// Reorder dimensions by explanatory power before drilling down.
    #[serde(default = "default_auto_dimension_order")]
    pub auto_dimension_order: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            fetch_timeout_secs: default_fetch_timeout_secs(),
            breakdown_row_limit: default_breakdown_row_limit(),
            min_contribution_percent: default_min_contribution_percent(),
            auto_dimension_order: default_auto_dimension_order(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[default]
    Hierarchical,
    Breakdown,
}

/// Inbound request, typically deserialized by an HTTP/RPC handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributionRequest {
    pub metric: String,
    pub dataset: String,
    pub current_start: i64,
    pub current_end: i64,
    pub baseline_start: i64,
    pub baseline_end: i64,
    /// Comma-separated; blank means "dataset defaults minus excluded".
    #[serde(default)]
    pub group_by_dimensions: String,
    #[serde(default)]
    pub excluded_dimensions: String,
    /// JSON object of `name -> value | [values]`.
    #[serde(default)]
    pub filters_json: String,
    #[serde(default = "default_summary_size")]
    pub summary_size: usize,
    #[serde(default = "default_depth")]
    pub depth: usize,
    /// JSON array of dimension-name arrays, parent before child.
    #[serde(default)]
    pub hierarchies_json: String,
    #[serde(default)]
    pub do_one_side_error: bool,
    /// IANA timezone id; blank defaults to UTC.
    #[serde(default)]
    pub timezone: String,
    #[serde(default)]
    pub algorithm: Algorithm,
}

fn default_summary_size() -> usize {
    10
}

fn default_depth() -> usize {
    3
}

impl AttributionRequest {
    pub fn new(metric: impl Into<String>, dataset: impl Into<String>) -> Self {
        AttributionRequest {
            metric: metric.into(),
            dataset: dataset.into(),
            current_start: 0,
            current_end: 0,
            baseline_start: 0,
            baseline_end: 0,
            group_by_dimensions: String::new(),
            excluded_dimensions: String::new(),
            filters_json: String::new(),
            summary_size: default_summary_size(),
            depth: default_depth(),
            hierarchies_json: String::new(),
            do_one_side_error: false,
            timezone: String::new(),
            algorithm: Algorithm::default(),
        }
    }
}

/// One tag's fetched aggregates: the requested group-by and the rows the
/// data layer returned for it.
type TagResults = Vec<(Vec<String>, Vec<AggregateRow>)>;

/// Per-request fetch parameters shared by every tagged query.
struct FetchContext<'a> {
    dataset: &'a str,
    filters: &'a Filters,
    timezone: &'a str,
    limit: Option<usize>,
}

/// The attribution engine: classifies the metric, fetches tagged aggregates
/// concurrently, and runs the selected finder. Holds no mutable state;
/// concurrent requests are independent.
pub struct AttributionEngine<C: AggregationClient> {
    client: C,
    datasets: HashMap<String, DatasetConfig>,
    config: EngineConfig,
    cost_function: CostFunction,
}

impl<C: AggregationClient> AttributionEngine<C> {
    pub fn new(
        client: C,
        datasets: Vec<DatasetConfig>,
        config: EngineConfig,
        cost_function: CostFunction,
    ) -> Self {
        AttributionEngine {
            client,
            datasets: datasets.into_iter().map(|d| (d.name.clone(), d)).collect(),
            config,
            cost_function,
        }
    }

    /// Public entry point: all failures come back as the NOT_AVAILABLE
    /// sentinel annotated with a diagnostic, never as an error.
    pub async fn analyze(&self, request: &AttributionRequest) -> DimensionAnalysisResult {
        match self.run(request).await {
            Ok(result) => result,
            Err(e) => {
                match &e {
                    AttributionError::Invariant(_) => {
                        error!(metric = %request.metric, error = %e, "attribution failed")
                    }
                    _ => warn!(metric = %request.metric, error = %e, "attribution not available"),
                }
                DimensionAnalysisResult::not_available(
                    &request.metric,
                    &request.dataset,
                    Some(e.to_string()),
                )
            }
        }
    }

    async fn run(&self, request: &AttributionRequest) -> Result<DimensionAnalysisResult> {
        // Step 1: resolve dataset and metric identity
        let dataset = self.datasets.get(&request.dataset).ok_or_else(|| {
            AttributionError::Dataset(format!("unknown dataset '{}'", request.dataset))
        })?;
        let metric = dataset.get_metric(&request.metric).ok_or_else(|| {
            AttributionError::Metric(format!(
                "unknown metric '{}' in dataset '{}'",
                request.metric, request.dataset
            ))
        })?;

        // Step 2: classify as additive or simple ratio
        let metric_type = classify_metric(dataset, metric)?;

        // Step 3: resolve and coerce request inputs
        let dimensions = resolve_dimensions(
            dataset,
            &request.group_by_dimensions,
            &request.excluded_dimensions,
        )?;
        let filters = Filters::from_json(&request.filters_json)?;
        let hierarchies = parse_hierarchies(&request.hierarchies_json)?;
        let timezone = if request.timezone.trim().is_empty() {
            "UTC"
        } else {
            request.timezone.trim()
        };
        let summary_size = request.summary_size.max(1);
        let depth = request.depth.clamp(1, dimensions.len());
        let baseline_window = TimeWindow::new(request.baseline_start, request.baseline_end);
        let current_window = TimeWindow::new(request.current_start, request.current_end);
        info!(
            metric = %request.metric,
            dataset = %request.dataset,
            ratio = metric_type.is_ratio(),
            baseline = %baseline_window,
            current = %current_window,
            "running dimension attribution"
        );

        let context = FetchContext {
            dataset: &request.dataset,
            filters: &filters,
            timezone,
            limit: Some(self.config.breakdown_row_limit),
        };

        // Step 4: phase-one fetches: overall totals plus every
        // single-dimension breakdown, all tags concurrent under one timeout
        let mut group_bys: Vec<Vec<String>> = vec![Vec::new()];
        group_bys.extend(dimensions.iter().map(|d| vec![d.clone()]));
        let phase_one = self
            .fetch_tagged(&metric_type, &context, baseline_window, current_window, &group_bys)
            .await?;

        let totals = compute_totals(&metric_type, &phase_one);
        let (baseline_slices, current_slices) =
            build_breakdown_slices(&metric_type, &phase_one);

        // Step 5: run the selected finder
        let (ordered_dimensions, response_rows) = match request.algorithm {
            Algorithm::Breakdown => {
                let finder = SimpleContributorsFinder::new(self.cost_function);
                let rows = finder.find(
                    &baseline_slices,
                    &current_slices,
                    &dimensions,
                    &totals,
                    summary_size,
                    request.do_one_side_error,
                )?;
                (dimensions, rows)
            }
            Algorithm::Hierarchical => {
                let scores = self.config.auto_dimension_order.then(|| {
                    score_dimensions(
                        &baseline_slices,
                        &current_slices,
                        &totals,
                        &self.cost_function,
                    )
                });
                let ordered = order_dimensions(&dimensions, &hierarchies, scores.as_ref());
                debug!(order = ?ordered.names(), "drill-down dimension order");

                // Deeper prefix levels depend on the final order, so they are
                // fetched in a second concurrent phase.
                let deep_group_bys: Vec<Vec<String>> =
                    (2..=depth).map(|l| ordered.prefix(l)).collect();
                let phase_two = if deep_group_bys.is_empty() {
                    Vec::new()
                } else {
                    self.fetch_tagged(
                        &metric_type,
                        &context,
                        baseline_window,
                        current_window,
                        &deep_group_bys,
                    )
                    .await?
                };

                let mut store = RowStore::new(ordered.clone(), metric_type.is_ratio());
                for results in [&phase_one, &phase_two] {
                    ingest_tag_results(&mut store, &ordered, results);
                }

                let mut cube = build_cube(&ordered, depth, &store)?;
                let totals = cube_totals(&cube);
                let selector = SummarySelector::new(
                    self.cost_function,
                    summary_size,
                    request.do_one_side_error,
                );
                let rows = selector.select(&mut cube, &totals)?;
                (ordered, rows)
            }
        };

        Ok(DimensionAnalysisResult {
            metric: request.metric.clone(),
            dataset: request.dataset.clone(),
            baseline_total: totals.baseline_total,
            current_total: totals.current_total,
            baseline_total_size: totals.baseline_total_size,
            current_total_size: totals.current_total_size,
            dimensions: ordered_dimensions.names().to_vec(),
            response_rows,
            message: None,
        })
    }

    /// Issues the metric's tagged queries (two for additive, four for ratio)
    /// as concurrent futures joined under the configured timeout. A timeout
    /// or fetch failure aborts the whole request; results are never partial.
    async fn fetch_tagged(
        &self,
        metric_type: &MetricType,
        context: &FetchContext<'_>,
        baseline_window: TimeWindow,
        current_window: TimeWindow,
        group_bys: &[Vec<String>],
    ) -> Result<Vec<(FetchTag, TagResults)>> {
        let timeout = Duration::from_secs(self.config.fetch_timeout_secs);
        let fetched = match *metric_type {
            MetricType::Additive { metric_id } => {
                let joined = tokio::time::timeout(
                    timeout,
                    async {
                        tokio::try_join!(
                            self.fetch_tag(FetchTag::BaselineValue, metric_id, baseline_window, context, group_bys),
                            self.fetch_tag(FetchTag::CurrentValue, metric_id, current_window, context, group_bys),
                        )
                    },
                )
                .await;
                let (baseline, current) = unwrap_timeout(joined, timeout)?;
                vec![baseline, current]
            }
            MetricType::Ratio {
                numerator_id,
                denominator_id,
            } => {
                let joined = tokio::time::timeout(
                    timeout,
                    async {
                        tokio::try_join!(
                            self.fetch_tag(FetchTag::BaselineNumerator, numerator_id, baseline_window, context, group_bys),
                            self.fetch_tag(FetchTag::BaselineDenominator, denominator_id, baseline_window, context, group_bys),
                            self.fetch_tag(FetchTag::CurrentNumerator, numerator_id, current_window, context, group_bys),
                            self.fetch_tag(FetchTag::CurrentDenominator, denominator_id, current_window, context, group_bys),
                        )
                    },
                )
                .await;
                let (bn, bd, cn, cd) = unwrap_timeout(joined, timeout)?;
                vec![bn, bd, cn, cd]
            }
        };
        Ok(fetched)
    }

    async fn fetch_tag(
        &self,
        tag: FetchTag,
        metric_id: u64,
        window: TimeWindow,
        context: &FetchContext<'_>,
        group_bys: &[Vec<String>],
    ) -> Result<(FetchTag, TagResults)> {
        let mut results = Vec::with_capacity(group_bys.len());
        for group_by in group_bys {
            let request = AggregateRequest {
                dataset: context.dataset.to_string(),
                metric_id,
                window,
                group_by: group_by.clone(),
                filters: context.filters.clone(),
                timezone: context.timezone.to_string(),
                limit: context.limit,
            };
            let rows = self.client.fetch_aggregates(&request).await?;
            debug!(?tag, group_by = ?group_by, rows = rows.len(), "fetched aggregates");
            results.push((group_by.clone(), rows));
        }
        Ok((tag, results))
    }
}

fn unwrap_timeout<T>(
    joined: std::result::Result<Result<T>, tokio::time::error::Elapsed>,
    timeout: Duration,
) -> Result<T> {
    match joined {
        Ok(inner) => inner,
        Err(_) => Err(AttributionError::Timeout(format!(
            "aggregate fetches exceeded {:?}",
            timeout
        ))),
    }
}

fn parse_hierarchies(json: &str) -> Result<Vec<Vec<String>>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str::<Vec<Vec<String>>>(json).map_err(|e| {
        AttributionError::Hierarchy(format!("malformed hierarchies '{}': {}", json, e))
    })
}

/// Dataset totals from the tag results' empty-group-by rows.
fn compute_totals(metric_type: &MetricType, results: &[(FetchTag, TagResults)]) -> Totals {
    let total_of = |wanted: FetchTag| -> f64 {
        results
            .iter()
            .filter(|(tag, _)| *tag == wanted)
            .flat_map(|(_, per_group)| per_group.iter())
            .filter(|(group_by, _)| group_by.is_empty())
            .flat_map(|(_, rows)| rows.iter())
            .map(|row| row.value)
            .sum()
    };
    match metric_type {
        MetricType::Additive { .. } => {
            let baseline = total_of(FetchTag::BaselineValue);
            let current = total_of(FetchTag::CurrentValue);
            Totals {
                baseline_total: baseline,
                current_total: current,
                baseline_total_size: baseline,
                current_total_size: current,
            }
        }
        MetricType::Ratio { .. } => {
            let bn = total_of(FetchTag::BaselineNumerator);
            let bd = total_of(FetchTag::BaselineDenominator);
            let cn = total_of(FetchTag::CurrentNumerator);
            let cd = total_of(FetchTag::CurrentDenominator);
            let volume = bn + bd + cn + cd;
            Totals {
                baseline_total: guarded_ratio(bn, bd, volume),
                current_total: guarded_ratio(cn, cd, volume),
                baseline_total_size: bn + bd,
                current_total_size: cn + cd,
            }
        }
    }
}

/// Flattens the single-dimension tag results into per-window breakdown
/// slices, applying the ratio acceptance rule (positive and finite only).
fn build_breakdown_slices(
    metric_type: &MetricType,
    results: &[(FetchTag, TagResults)],
) -> (Vec<BreakdownSlice>, Vec<BreakdownSlice>) {
    match metric_type {
        MetricType::Additive { .. } => {
            let collect = |wanted: FetchTag| -> Vec<BreakdownSlice> {
                results
                    .iter()
                    .filter(|(tag, _)| *tag == wanted)
                    .flat_map(|(_, per_group)| per_group.iter())
                    .filter(|(group_by, _)| group_by.len() == 1)
                    .flat_map(|(group_by, rows)| {
                        let dimension = group_by[0].clone();
                        rows.iter().filter(|r| r.value.is_finite()).map(move |r| {
                            BreakdownSlice {
                                dimension: dimension.clone(),
                                value: r.names[0].clone(),
                                metric_value: r.value,
                                size: r.value,
                            }
                        })
                    })
                    .collect()
            };
            (
                collect(FetchTag::BaselineValue),
                collect(FetchTag::CurrentValue),
            )
        }
        MetricType::Ratio { .. } => {
            // (dimension, value) -> [bn, bd, cn, cd]
            let mut parts: BTreeMap<(String, String), [f64; 4]> = BTreeMap::new();
            for (tag, per_group) in results {
                let slot = match tag {
                    FetchTag::BaselineNumerator => 0,
                    FetchTag::BaselineDenominator => 1,
                    FetchTag::CurrentNumerator => 2,
                    FetchTag::CurrentDenominator => 3,
                    _ => continue,
                };
                for (group_by, rows) in per_group {
                    if group_by.len() != 1 {
                        continue;
                    }
                    for row in rows {
                        if !(row.value.is_finite() && row.value > 0.0) {
                            continue;
                        }
                        parts
                            .entry((group_by[0].clone(), row.names[0].clone()))
                            .or_insert([0.0; 4])[slot] = row.value;
                    }
                }
            }
            let mut baseline = Vec::new();
            let mut current = Vec::new();
            for ((dimension, value), [bn, bd, cn, cd]) in parts {
                let volume = bn + bd + cn + cd;
                if bn + bd > 0.0 {
                    baseline.push(BreakdownSlice {
                        dimension: dimension.clone(),
                        value: value.clone(),
                        metric_value: guarded_ratio(bn, bd, volume),
                        size: bn + bd,
                    });
                }
                if cn + cd > 0.0 {
                    current.push(BreakdownSlice {
                        dimension,
                        value,
                        metric_value: guarded_ratio(cn, cd, volume),
                        size: cn + cd,
                    });
                }
            }
            (baseline, current)
        }
    }
}

/// Widens each tag row to the full dimension width (wildcards everywhere the
/// group-by did not expand) and feeds it to the row store.
fn ingest_tag_results(
    store: &mut RowStore,
    dimensions: &Dimensions,
    results: &[(FetchTag, TagResults)],
) {
    for (tag, per_group) in results {
        for (group_by, rows) in per_group {
            let positions: Vec<Option<usize>> =
                group_by.iter().map(|d| dimensions.index_of(d)).collect();
            for row in rows {
                let mut names = vec![ALL.to_string(); dimensions.len()];
                for (position, value) in positions.iter().zip(row.names.iter()) {
                    match position {
                        Some(p) => names[*p] = value.clone(),
                        None => {
                            warn!(dimension = ?group_by, "row names a dimension outside the request");
                        }
                    }
                }
                store.ingest(*tag, DimensionValues::new(names), row.value);
            }
        }
    }
}
