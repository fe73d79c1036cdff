use anyhow::{anyhow, Result};
use clap::Parser;
use dimension_rca::{
    Algorithm, AttributionEngine, AttributionRequest, CostFunction, CsvAggregationClient,
    DatasetConfig, EngineConfig, MetricConfig, TimeWindow,
};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "dimension-rca")]
#[command(about = "Dimensional root-cause attribution over a CSV aggregate table")]
struct Args {
    /// CSV with dimension columns followed by `<id>.baseline`/`<id>.current`
    /// metric columns, one row per leaf dimension combination
    csv: PathBuf,

    /// Metric name to analyze
    #[arg(short, long, default_value = "metric")]
    metric: String,

    /// Numeric id of the metric's columns in the CSV
    #[arg(long, default_value_t = 1)]
    metric_id: u64,

    /// Derived expression for ratio metrics, e.g. `id1/id2`
    #[arg(long)]
    expression: Option<String>,

    /// Extra metric ids referenced by the expression
    #[arg(long, value_delimiter = ',')]
    extra_metric_ids: Vec<u64>,

    /// Number of contributors to report
    #[arg(short, long, default_value_t = 10)]
    summary_size: usize,

    /// Maximum dimension-combination depth
    #[arg(short, long, default_value_t = 3)]
    depth: usize,

    /// Only report slices moving in the overall direction
    #[arg(long)]
    one_side: bool,

    /// `hierarchical` or `breakdown`
    #[arg(short, long, default_value = "hierarchical")]
    algorithm: String,

    /// `balanced`, `value_change`, `contribution_change` or
    /// `contribution_to_overall`
    #[arg(short, long, default_value = "balanced")]
    cost_function: String,

    /// Minimum contribution (percent of overall change) to score a slice
    #[arg(long, default_value_t = 3.0)]
    min_contribution: f64,

    /// Dimension filters as JSON, e.g. `{"country": ["US", "EU"]}`
    #[arg(short, long, default_value = "")]
    filters: String,

    /// Dimension hierarchies as JSON, e.g. `[["country", "city"]]`
    #[arg(long, default_value = "")]
    hierarchies: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    // The CSV carries both windows side by side, so the window bounds are
    // synthetic labels rather than real timestamps.
    let baseline_window = TimeWindow::new(0, 1);
    let current_window = TimeWindow::new(1, 2);
    let client = CsvAggregationClient::from_path(&args.csv, baseline_window, current_window)?;
    info!(csv = %args.csv.display(), dimensions = ?client.dimensions(), "loaded aggregates");

    let mut metrics = vec![MetricConfig {
        id: args.metric_id,
        name: args.metric.clone(),
        derived_metric_expression: args.expression.clone(),
    }];
    for id in &args.extra_metric_ids {
        metrics.push(MetricConfig {
            id: *id,
            name: format!("metric_{}", id),
            derived_metric_expression: None,
        });
    }
    let dataset = DatasetConfig {
        name: "csv".to_string(),
        dimensions: client.dimensions().to_vec(),
        metrics,
    };

    let cost_function = CostFunction::from_name(&args.cost_function, args.min_contribution)
        .ok_or_else(|| anyhow!("unknown cost function '{}'", args.cost_function))?;
    let algorithm = match args.algorithm.as_str() {
        "hierarchical" => Algorithm::Hierarchical,
        "breakdown" => Algorithm::Breakdown,
        other => return Err(anyhow!("unknown algorithm '{}'", other)),
    };

    let engine = AttributionEngine::new(
        client,
        vec![dataset],
        EngineConfig::default(),
        cost_function,
    );

    let mut request = AttributionRequest::new(&args.metric, "csv");
    request.baseline_start = baseline_window.start;
    request.baseline_end = baseline_window.end;
    request.current_start = current_window.start;
    request.current_end = current_window.end;
    request.summary_size = args.summary_size;
    request.depth = args.depth;
    request.do_one_side_error = args.one_side;
    request.filters_json = args.filters;
    request.hierarchies_json = args.hierarchies;
    request.algorithm = algorithm;

    let result = engine.analyze(&request).await;

    println!("{}", result);

    Ok(())
}
