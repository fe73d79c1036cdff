use thiserror::Error;

#[derive(Error, Debug)]
pub enum AttributionError {
    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Metric error: {0}")]
    Metric(String),

    #[error("Hierarchy error: {0}")]
    Hierarchy(String),

    #[error("Filter error: {0}")]
    Filter(String),

    #[error("Fetch error: {0}")]
    Fetch(String),

    #[error("Fetch timed out: {0}")]
    Timeout(String),

    #[error("No data: {0}")]
    NoData(String),

    #[error("Invariant violation: {0}")]
    Invariant(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, AttributionError>;
