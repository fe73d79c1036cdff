//! Dimensional root-cause attribution for metric anomalies.
//!
//! Given a metric that moved between a baseline and a current time window,
//! the engine fetches aggregates broken down by dimension combinations,
//! scores each slice with a pluggable cost function, and reports the
//! combinations that explain the movement best. Additive metrics and simple
//! `numerator/denominator` ratio metrics are supported; ratio slices are
//! weighted by their traffic volume rather than their raw value.

pub mod api;
pub mod breakdown;
pub mod cost;
pub mod cube;
pub mod datasource;
pub mod engine;
pub mod error;
pub mod metric;
pub mod row;
pub mod summary;

pub use api::{DimensionAnalysisResult, SummaryResponseRow, NOT_AVAILABLE};
pub use cost::{ChangeStats, CostFunction, Totals};
pub use datasource::{
    AggregateRequest, AggregateRow, AggregationClient, CsvAggregationClient, Filters,
    StaticAggregationClient, TimeWindow,
};
pub use engine::{Algorithm, AttributionEngine, AttributionRequest, EngineConfig};
pub use error::{AttributionError, Result};
pub use metric::{DatasetConfig, MetricConfig, MetricType};
pub use row::{Dimensions, ALL};
