use serde::{Deserialize, Serialize};

/// Placeholder dimension list of the failure sentinel.
pub const NOT_AVAILABLE: &str = "(NOT_AVAILABLE)";

/// One selected cube node or breakdown row, rendered for the caller.
/// `names` aligns positionally to the result's `dimensions` list, with the
/// `(ALL)` wildcard at every position the row is not broken down by.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryResponseRow {
    pub names: Vec<String>,
    pub cost: f64,
    pub baseline_value: f64,
    pub current_value: f64,
    pub change_percentage: f64,
    pub contribution_change_percentage: f64,
    pub contribution_to_overall_change_percentage: f64,
}

/// Outbound shape of one attribution request. Failures use the same shape
/// (see `not_available`) so callers never distinguish internal errors from
/// empty results through exceptions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionAnalysisResult {
    pub metric: String,
    pub dataset: String,
    pub baseline_total: f64,
    pub current_total: f64,
    pub baseline_total_size: f64,
    pub current_total_size: f64,
    pub dimensions: Vec<String>,
    pub response_rows: Vec<SummaryResponseRow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl DimensionAnalysisResult {
    /// Failure sentinel annotated with the originally-requested identity and,
    /// when available, a human-readable diagnostic.
    pub fn not_available(metric: &str, dataset: &str, message: Option<String>) -> Self {
        DimensionAnalysisResult {
            metric: metric.to_string(),
            dataset: dataset.to_string(),
            baseline_total: 0.0,
            current_total: 0.0,
            baseline_total_size: 0.0,
            current_total_size: 0.0,
            dimensions: vec![NOT_AVAILABLE.to_string()],
            response_rows: Vec::new(),
            message,
        }
    }

    pub fn is_not_available(&self) -> bool {
        self.dimensions == [NOT_AVAILABLE]
    }
}

impl std::fmt::Display for DimensionAnalysisResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Dimension analysis for: {} ({})", self.metric, self.dataset)?;
        if self.is_not_available() {
            writeln!(f, "NOT AVAILABLE")?;
            if let Some(message) = &self.message {
                writeln!(f, "  {}", message)?;
            }
            return Ok(());
        }

        writeln!(
            f,
            "Overall: {:.2} -> {:.2} (sizes {:.2} -> {:.2})",
            self.baseline_total, self.current_total, self.baseline_total_size, self.current_total_size
        )?;
        writeln!(f, "Dimensions: {}", self.dimensions.join(", "))?;

        writeln!(f, "\n=== Top contributors ===")?;
        for row in &self.response_rows {
            writeln!(f, "- {}", row.names.join(" | "))?;
            writeln!(
                f,
                "  cost={:.4} value {:.2} -> {:.2} change {:.2}% contribution {:+.2}% of overall change {:+.2}%",
                row.cost,
                row.baseline_value,
                row.current_value,
                row.change_percentage,
                row.contribution_change_percentage,
                row.contribution_to_overall_change_percentage
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_available_sentinel_shape() {
        let result =
            DimensionAnalysisResult::not_available("pageviews", "web", Some("boom".to_string()));
        assert!(result.is_not_available());
        assert_eq!(result.dimensions, vec![NOT_AVAILABLE.to_string()]);
        assert_eq!(result.baseline_total, 0.0);
        assert_eq!(result.current_total, 0.0);
        assert!(result.response_rows.is_empty());
        assert_eq!(result.metric, "pageviews");
    }

    #[test]
    fn test_message_skipped_when_absent() {
        let result = DimensionAnalysisResult::not_available("m", "d", None);
        let json = serde_json::to_string(&result).unwrap();
        assert!(!json.contains("message"));
    }
}
