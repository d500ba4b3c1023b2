//! Step and run outcomes: statuses, metrics, and aggregated results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, RecordError};

// ── Step outcomes ───────────────────────────────────────────────────

/// Lifecycle status of a single step within a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    #[default]
    Idle,
    Pending,
    Running,
    Success,
    Error,
    Skipped,
    Cancelled,
}

/// Per-step counters and timing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepMetrics {
    pub input_count: u64,
    pub output_count: u64,
    pub error_count: u64,
    pub dropped_count: u64,
    pub duration_ms: u64,
    /// Output records per second over the step's wall time.
    pub records_per_sec: f64,
}

/// Outcome of executing one step against one batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_key: String,
    pub status: StepStatus,
    pub metrics: StepMetrics,
    /// Record-level errors observed during the step.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<RecordError>,
    /// Step-level failure, if the step itself failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<PipelineError>,
}

impl StepResult {
    pub fn skipped(step_key: impl Into<String>) -> Self {
        Self {
            step_key: step_key.into(),
            status: StepStatus::Skipped,
            ..Self::default()
        }
    }
}

// ── Run outcomes ────────────────────────────────────────────────────

/// Lifecycle status of a pipeline run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Success,
    Error,
    Cancelled,
}

impl RunStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Cancelled)
    }
}

/// Counters aggregated over every step of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMetrics {
    pub records_in: u64,
    pub records_out: u64,
    pub error_count: u64,
    pub dropped_count: u64,
    pub dead_letter_count: u64,
    pub duration_ms: u64,
}

/// One pipeline execution, created when a trigger fires and mutated by
/// the orchestrator until terminal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRun {
    pub id: String,
    pub pipeline: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub metrics: RunMetrics,
    /// Terminal error for failed runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PipelineError>,
    /// Last result for every step that ran, in execution order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub step_results: Vec<StepResult>,
}

// ── Queue statistics ────────────────────────────────────────────────

/// Per-pipeline consumer/run counters exposed by `queue_stats`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineQueueStats {
    pub pipeline: String,
    pub processed: u64,
    pub failed: u64,
    pub active: bool,
}

/// Installation-wide queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending: u64,
    pub running: u64,
    pub failed: u64,
    pub completed_today: u64,
    #[serde(default)]
    pub by_pipeline: Vec<PipelineQueueStats>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_terminality() {
        assert!(RunStatus::Success.is_terminal());
        assert!(RunStatus::Error.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn step_result_serde_roundtrip() {
        let result = StepResult {
            step_key: "validate".into(),
            status: StepStatus::Success,
            metrics: StepMetrics {
                input_count: 3,
                output_count: 2,
                error_count: 1,
                dropped_count: 0,
                duration_ms: 12,
                records_per_sec: 166.6,
            },
            errors: vec![RecordError::new("REQUIRED", "missing 'quantity'").at_index(1)],
            failure: None,
        };
        let json = serde_json::to_string(&result).unwrap();
        let back: StepResult = serde_json::from_str(&json).unwrap();
        assert_eq!(result, back);
    }

    #[test]
    fn statuses_serialize_screaming() {
        assert_eq!(
            serde_json::to_value(StepStatus::Cancelled).unwrap(),
            serde_json::json!("CANCELLED")
        );
        assert_eq!(
            serde_json::to_value(RunStatus::Error).unwrap(),
            serde_json::json!("ERROR")
        );
    }
}
