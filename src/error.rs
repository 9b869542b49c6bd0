//! Error types for the pipeline orchestrator.

use thiserror::Error;

/// Errors that can occur while orchestrating a pipeline run.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Malformed pipeline description or matrix (e.g., an exclude row
    /// referencing an undeclared dimension). Fatal before any job starts.
    #[error("Invalid pipeline configuration: {0}")]
    Configuration(String),

    /// Version-control history could not be queried (e.g., shallow clone,
    /// missing reference branch tip). Fatal to publish-gated steps.
    #[error("History unavailable: {0}")]
    HistoryUnavailable(String),

    /// A gate condition referenced an upstream output that was never bound.
    #[error("Unbound output reference in gate condition: {0}")]
    UnboundReference(String),

    /// A job or step exceeded its wall-clock budget.
    #[error("Execution timeout exceeded: {0}")]
    Timeout(String),

    /// A step's external command exited non-zero.
    #[error("Step failed: {0}")]
    StepFailed(String),

    /// A step's external command could not be spawned or driven.
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    /// The destination tree changed between snapshot and commit.
    /// Retryable by the caller with bounded attempts.
    #[error("Publish conflict at {path}: expected revision {expected}, found {found}")]
    PublishConflict {
        path: String,
        expected: u64,
        found: u64,
    },

    /// No payload was registered for a publish step.
    #[error("Missing publish payload: {0}")]
    MissingPayload(String),

    /// The run was cancelled before completion.
    #[error("Run cancelled: {0}")]
    Cancelled(String),

    /// YAML parsing error in the pipeline description.
    #[error("YAML parsing error: {0}")]
    YamlParse(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    /// Short machine-readable kind, used in run reports.
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::Configuration(_) => "configuration",
            OrchestratorError::HistoryUnavailable(_) => "history_unavailable",
            OrchestratorError::UnboundReference(_) => "unbound_reference",
            OrchestratorError::Timeout(_) => "timeout",
            OrchestratorError::StepFailed(_) => "step_failed",
            OrchestratorError::ExecutionFailed(_) => "execution_failed",
            OrchestratorError::PublishConflict { .. } => "publish_conflict",
            OrchestratorError::MissingPayload(_) => "missing_payload",
            OrchestratorError::Cancelled(_) => "cancelled",
            OrchestratorError::YamlParse(_) => "yaml_parse",
            OrchestratorError::Io(_) => "io",
        }
    }
}

/// Result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;
