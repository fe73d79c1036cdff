use crate::error::{AttributionError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::debug;

/// Half-open `[start, end)` window in epoch millis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: i64,
    pub end: i64,
}

impl TimeWindow {
    pub fn new(start: i64, end: i64) -> Self {
        TimeWindow { start, end }
    }
}

impl std::fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (
            chrono::DateTime::from_timestamp_millis(self.start),
            chrono::DateTime::from_timestamp_millis(self.end),
        ) {
            (Some(s), Some(e)) => write!(f, "[{} .. {})", s.to_rfc3339(), e.to_rfc3339()),
            _ => write!(f, "[{} .. {})", self.start, self.end),
        }
    }
}

/// Dimension filters as an ordered multimap: a slice matches when, for every
/// named dimension, its value is one of the allowed values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filters(BTreeMap<String, Vec<String>>);

impl Filters {
    pub fn new() -> Self {
        Filters::default()
    }

    /// Parses a JSON object of `name -> value | [values]`.
    pub fn from_json(json: &str) -> Result<Filters> {
        if json.trim().is_empty() {
            return Ok(Filters::default());
        }
        let value: serde_json::Value = serde_json::from_str(json)?;
        let object = value.as_object().ok_or_else(|| {
            AttributionError::Filter(format!("filters must be a JSON object, got: {}", json))
        })?;
        let mut map = BTreeMap::new();
        for (name, entry) in object {
            let values = match entry {
                serde_json::Value::String(s) => vec![s.clone()],
                serde_json::Value::Array(items) => items
                    .iter()
                    .map(|v| {
                        v.as_str().map(|s| s.to_string()).ok_or_else(|| {
                            AttributionError::Filter(format!(
                                "filter '{}' has a non-string value",
                                name
                            ))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?,
                _ => {
                    return Err(AttributionError::Filter(format!(
                        "filter '{}' must map to a string or array of strings",
                        name
                    )))
                }
            };
            map.insert(name.clone(), values);
        }
        Ok(Filters(map))
    }

    pub fn insert(&mut self, dimension: impl Into<String>, values: Vec<String>) {
        self.0.insert(dimension.into(), values);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.0.iter()
    }
}

/// One tagged aggregate fetch: a single metric over a single window, grouped
/// by the given dimensions.
#[derive(Debug, Clone)]
pub struct AggregateRequest {
    pub dataset: String,
    pub metric_id: u64,
    pub window: TimeWindow,
    /// Dimensions to expand; everything else is rolled up.
    pub group_by: Vec<String>,
    pub filters: Filters,
    pub timezone: String,
    /// Optional row cap; the client keeps the largest aggregates.
    pub limit: Option<usize>,
}

/// One aggregate returned by the data layer; `names` aligns positionally to
/// the request's `group_by`.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRow {
    pub names: Vec<String>,
    pub value: f64,
}

/// Seam to the external data layer. Implementations execute the query however
/// they like (SQL, files, in-memory); the engine only issues logical
/// group-by-and-sum requests.
#[allow(async_fn_in_trait)]
pub trait AggregationClient {
    async fn fetch_aggregates(&self, request: &AggregateRequest) -> Result<Vec<AggregateRow>>;
}

#[derive(Debug, Clone)]
struct Leaf {
    values: Vec<String>,
    /// metric id -> (baseline value, current value)
    metrics: HashMap<u64, (f64, f64)>,
}

/// Leaf-granularity aggregate table shared by the in-memory and CSV clients;
/// roll-ups are computed on request.
#[derive(Debug, Clone)]
struct LeafTable {
    dimensions: Vec<String>,
    baseline_window: TimeWindow,
    current_window: TimeWindow,
    leaves: Vec<Leaf>,
}

impl LeafTable {
    fn aggregate(&self, request: &AggregateRequest) -> Result<Vec<AggregateRow>> {
        let slot = if request.window == self.baseline_window {
            0
        } else if request.window == self.current_window {
            1
        } else {
            debug!(window = %request.window, "no data registered for window");
            return Ok(Vec::new());
        };

        let positions: Vec<usize> = request
            .group_by
            .iter()
            .map(|name| {
                self.dimensions
                    .iter()
                    .position(|d| d == name)
                    .ok_or_else(|| {
                        AttributionError::Fetch(format!(
                            "unknown dimension '{}' in dataset '{}'",
                            name, request.dataset
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        let filter_positions: Vec<(usize, &Vec<String>)> = request
            .filters
            .iter()
            .filter_map(|(name, allowed)| {
                self.dimensions
                    .iter()
                    .position(|d| d == name)
                    .map(|p| (p, allowed))
            })
            .collect();

        let mut groups: BTreeMap<Vec<String>, f64> = BTreeMap::new();
        for leaf in &self.leaves {
            let matches = filter_positions
                .iter()
                .all(|(p, allowed)| allowed.contains(&leaf.values[*p]));
            if !matches {
                continue;
            }
            let Some(&(baseline, current)) = leaf.metrics.get(&request.metric_id) else {
                continue;
            };
            let value = if slot == 0 { baseline } else { current };
            let key: Vec<String> = positions.iter().map(|&p| leaf.values[p].clone()).collect();
            *groups.entry(key).or_insert(0.0) += value;
        }

        let mut rows: Vec<AggregateRow> = groups
            .into_iter()
            .map(|(names, value)| AggregateRow { names, value })
            .collect();
        if let Some(limit) = request.limit {
            rows.sort_by(|a, b| b.value.partial_cmp(&a.value).unwrap_or(std::cmp::Ordering::Equal));
            rows.truncate(limit);
        }
        Ok(rows)
    }
}

/// In-memory client over explicit leaf aggregates; used by fixtures and the
/// integration tests.
#[derive(Debug, Clone)]
pub struct StaticAggregationClient {
    table: LeafTable,
}

impl StaticAggregationClient {
    pub fn new<S: Into<String>>(
        dimensions: Vec<S>,
        baseline_window: TimeWindow,
        current_window: TimeWindow,
    ) -> Self {
        StaticAggregationClient {
            table: LeafTable {
                dimensions: dimensions.into_iter().map(|d| d.into()).collect(),
                baseline_window,
                current_window,
                leaves: Vec::new(),
            },
        }
    }

    /// Registers one leaf combination with per-metric (baseline, current)
    /// values; chainable for fixture building.
    pub fn with_leaf(mut self, values: &[&str], metrics: &[(u64, f64, f64)]) -> Self {
        self.table.leaves.push(Leaf {
            values: values.iter().map(|v| v.to_string()).collect(),
            metrics: metrics
                .iter()
                .map(|&(id, baseline, current)| (id, (baseline, current)))
                .collect(),
        });
        self
    }
}

impl AggregationClient for StaticAggregationClient {
    async fn fetch_aggregates(&self, request: &AggregateRequest) -> Result<Vec<AggregateRow>> {
        self.table.aggregate(request)
    }
}

/// CSV-backed client for the CLI. Expects dimension columns followed by
/// metric columns named `<metric_id>.baseline` / `<metric_id>.current`, one
/// row per leaf dimension-value combination:
///
/// ```csv
/// country,device,1.baseline,1.current
/// US,mobile,400,700
/// ```
#[derive(Debug, Clone)]
pub struct CsvAggregationClient {
    table: LeafTable,
}

impl CsvAggregationClient {
    pub fn from_path(
        path: &Path,
        baseline_window: TimeWindow,
        current_window: TimeWindow,
    ) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)?;
        let headers = reader.headers()?.clone();

        let mut dimensions = Vec::new();
        // (column index, metric id, is_baseline)
        let mut metric_columns: Vec<(usize, u64, bool)> = Vec::new();
        for (idx, header) in headers.iter().enumerate() {
            match header.split_once('.') {
                Some((id, slot @ ("baseline" | "current"))) => {
                    let metric_id = id.parse::<u64>().map_err(|_| {
                        AttributionError::Fetch(format!(
                            "metric column '{}' does not start with a numeric metric id",
                            header
                        ))
                    })?;
                    metric_columns.push((idx, metric_id, slot == "baseline"));
                }
                _ => {
                    if !metric_columns.is_empty() {
                        return Err(AttributionError::Fetch(format!(
                            "dimension column '{}' appears after metric columns",
                            header
                        )));
                    }
                    dimensions.push(header.to_string());
                }
            }
        }
        if metric_columns.is_empty() {
            return Err(AttributionError::Fetch(
                "CSV has no '<metric_id>.baseline' / '<metric_id>.current' columns".to_string(),
            ));
        }

        let mut leaves = Vec::new();
        for record in reader.records() {
            let record = record?;
            let values: Vec<String> = (0..dimensions.len())
                .map(|i| record.get(i).unwrap_or("").to_string())
                .collect();
            let mut metrics: HashMap<u64, (f64, f64)> = HashMap::new();
            for &(idx, metric_id, is_baseline) in &metric_columns {
                let raw = record.get(idx).unwrap_or("0").trim();
                let value: f64 = raw.parse().map_err(|_| {
                    AttributionError::Fetch(format!("non-numeric value '{}' in CSV", raw))
                })?;
                let entry = metrics.entry(metric_id).or_insert((0.0, 0.0));
                if is_baseline {
                    entry.0 = value;
                } else {
                    entry.1 = value;
                }
            }
            leaves.push(Leaf { values, metrics });
        }
        debug!(leaves = leaves.len(), "loaded CSV aggregate table");

        Ok(CsvAggregationClient {
            table: LeafTable {
                dimensions,
                baseline_window,
                current_window,
                leaves,
            },
        })
    }

    pub fn dimensions(&self) -> &[String] {
        &self.table.dimensions
    }
}

impl AggregationClient for CsvAggregationClient {
    async fn fetch_aggregates(&self, request: &AggregateRequest) -> Result<Vec<AggregateRow>> {
        self.table.aggregate(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn baseline() -> TimeWindow {
        TimeWindow::new(0, 1000)
    }

    fn current() -> TimeWindow {
        TimeWindow::new(1000, 2000)
    }

    fn client() -> StaticAggregationClient {
        StaticAggregationClient::new(vec!["country", "device"], baseline(), current())
            .with_leaf(&["US", "mobile"], &[(1, 400.0, 700.0)])
            .with_leaf(&["US", "desktop"], &[(1, 200.0, 200.0)])
            .with_leaf(&["EU", "mobile"], &[(1, 400.0, 300.0)])
    }

    fn request(group_by: &[&str], window: TimeWindow) -> AggregateRequest {
        AggregateRequest {
            dataset: "pageviews".to_string(),
            metric_id: 1,
            window,
            group_by: group_by.iter().map(|s| s.to_string()).collect(),
            filters: Filters::new(),
            timezone: "UTC".to_string(),
            limit: None,
        }
    }

    #[tokio::test]
    async fn test_rollup_to_total() {
        let rows = client()
            .fetch_aggregates(&request(&[], baseline()))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, 1000.0);
    }

    #[tokio::test]
    async fn test_group_by_one_dimension() {
        let rows = client()
            .fetch_aggregates(&request(&["country"], current()))
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        let us = rows.iter().find(|r| r.names == vec!["US"]).unwrap();
        assert_eq!(us.value, 900.0);
    }

    #[tokio::test]
    async fn test_filters_restrict_leaves() {
        let mut req = request(&["device"], baseline());
        req.filters.insert("country", vec!["US".to_string()]);
        let rows = client().fetch_aggregates(&req).await.unwrap();
        assert_eq!(rows.len(), 2);
        let mobile = rows.iter().find(|r| r.names == vec!["mobile"]).unwrap();
        assert_eq!(mobile.value, 400.0);
    }

    #[tokio::test]
    async fn test_limit_keeps_largest() {
        let mut req = request(&["country", "device"], baseline());
        req.limit = Some(1);
        let rows = client().fetch_aggregates(&req).await.unwrap();
        assert_eq!(rows.len(), 1);
        // US/mobile and EU/mobile tie at 400; the cap keeps one of them.
        assert_eq!(rows[0].value, 400.0);
    }

    #[tokio::test]
    async fn test_unknown_window_is_empty() {
        let rows = client()
            .fetch_aggregates(&request(&[], TimeWindow::new(5, 6)))
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_filters_from_json() {
        let filters = Filters::from_json(r#"{"country": ["US", "EU"], "device": "mobile"}"#).unwrap();
        let entries: Vec<_> = filters.iter().collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "country");
        assert_eq!(entries[0].1, &vec!["US".to_string(), "EU".to_string()]);

        assert!(Filters::from_json("").unwrap().is_empty());
        assert!(Filters::from_json("[1,2]").is_err());
        assert!(Filters::from_json(r#"{"country": 5}"#).is_err());
    }

    #[tokio::test]
    async fn test_csv_client_parses_leaf_table() {
        let dir = std::env::temp_dir().join("dimension-rca-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("aggregates.csv");
        std::fs::write(
            &path,
            "country,device,1.baseline,1.current\nUS,mobile,400,700\nUS,desktop,200,200\nEU,mobile,400,300\n",
        )
        .unwrap();

        let client = CsvAggregationClient::from_path(&path, baseline(), current()).unwrap();
        assert_eq!(client.dimensions(), &["country", "device"]);

        let rows = client
            .fetch_aggregates(&request(&["country"], baseline()))
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        let us = rows.iter().find(|r| r.names == vec!["US"]).unwrap();
        assert_eq!(us.value, 600.0);
    }
}
