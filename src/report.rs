//! Run reporting: per-job and per-step terminal states plus the
//! aggregated run-level result.

use serde::{Deserialize, Serialize};

/// A unique identifier for a pipeline run.
pub type RunId = String;

/// A unique identifier for a job within a run.
pub type JobReportId = String;

/// Status of a run, job, or step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Waiting to be executed
    Queued,
    /// Currently executing
    InProgress,
    /// Execution completed
    Completed,
    /// Cancelled before completion
    Cancelled,
}

impl RunStatus {
    /// Check if this status represents an active run.
    pub fn is_active(&self) -> bool {
        matches!(self, RunStatus::Queued | RunStatus::InProgress)
    }

    /// Check if this status represents a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Cancelled)
    }
}

/// Final conclusion of a run, job, step, or publish attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Conclusion {
    /// Everything succeeded
    Success,
    /// One or more steps failed
    Failure,
    /// Skipped (gate evaluated false, or an earlier step failed)
    Skipped,
    /// Cancelled mid-flight
    Cancelled,
    /// Exceeded the wall-clock budget
    TimedOut,
    /// An internal error, not a command failure
    Error,
}

impl Conclusion {
    /// Check if this is a successful conclusion.
    pub fn is_success(&self) -> bool {
        matches!(self, Conclusion::Success | Conclusion::Skipped)
    }

    /// Check if this is a failure conclusion.
    pub fn is_failure(&self) -> bool {
        matches!(self, Conclusion::Failure | Conclusion::TimedOut | Conclusion::Error)
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Terminal state of one step within a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    /// Step number (0-indexed)
    pub number: u32,
    /// Display name
    pub name: String,
    /// Current status
    pub status: RunStatus,
    /// Final conclusion
    pub conclusion: Option<Conclusion>,
    /// Exit code of the external command, if it ran
    pub exit_code: Option<i32>,
    /// When execution started
    pub started_at: Option<u64>,
    /// When execution completed
    pub completed_at: Option<u64>,
}

impl StepReport {
    /// Create a queued step report.
    pub fn new(number: u32, name: String) -> Self {
        Self {
            number,
            name,
            status: RunStatus::Queued,
            conclusion: None,
            exit_code: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Start the step.
    pub fn start(&mut self) {
        self.status = RunStatus::InProgress;
        self.started_at = Some(now_secs());
    }

    /// Complete the step.
    pub fn complete(&mut self, conclusion: Conclusion) {
        self.status = RunStatus::Completed;
        self.conclusion = Some(conclusion);
        self.completed_at = Some(now_secs());
    }
}

/// Terminal state of one expanded job configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    /// Unique identifier for this job execution
    pub id: JobReportId,
    /// Job label from the expanded matrix (e.g., "linux-3.9-x64")
    pub label: String,
    /// Index of the configuration within the expanded matrix
    pub index: usize,
    /// Current status
    pub status: RunStatus,
    /// Final conclusion
    pub conclusion: Option<Conclusion>,
    /// Step execution states
    pub steps: Vec<StepReport>,
    /// Originating error kind for failed/skipped jobs
    pub error_kind: Option<String>,
    /// Originating error message for failed/skipped jobs
    pub error: Option<String>,
    /// When execution started
    pub started_at: Option<u64>,
    /// When execution completed
    pub completed_at: Option<u64>,
}

impl JobReport {
    /// Create a new queued job report with one queued step per step name.
    pub fn new(id: JobReportId, label: String, index: usize, step_names: &[String]) -> Self {
        Self {
            id,
            label,
            index,
            status: RunStatus::Queued,
            conclusion: None,
            steps: step_names
                .iter()
                .enumerate()
                .map(|(i, name)| StepReport::new(i as u32, name.clone()))
                .collect(),
            error_kind: None,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Start the job.
    pub fn start(&mut self) {
        self.status = RunStatus::InProgress;
        self.started_at = Some(now_secs());
    }

    /// Complete the job.
    pub fn complete(&mut self, conclusion: Conclusion) {
        self.status = RunStatus::Completed;
        self.conclusion = Some(conclusion);
        self.completed_at = Some(now_secs());
    }

    /// Record the originating error for a failed or skipped job.
    pub fn record_error(&mut self, kind: &str, message: impl Into<String>) {
        self.error_kind = Some(kind.to_string());
        self.error = Some(message.into());
    }

    /// Get the duration of the job in seconds.
    pub fn duration_seconds(&self) -> Option<u64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end.saturating_sub(start)),
            (Some(start), None) => Some(now_secs().saturating_sub(start)),
            _ => None,
        }
    }
}

/// Outcome of a single publish step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishOutcome {
    /// Publish step name from the pipeline description
    pub name: String,
    /// Final conclusion (Success, Skipped, or a failure)
    pub conclusion: Conclusion,
    /// Destination path, when a commit happened
    pub path: Option<String>,
    /// Originating error kind, when failed
    pub error_kind: Option<String>,
    /// Originating error message, when failed
    pub error: Option<String>,
}

/// The aggregated result of one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Unique identifier for this run
    pub id: RunId,
    /// Pipeline name
    pub pipeline_name: String,
    /// Head commit SHA
    pub sha: String,
    /// Current status
    pub status: RunStatus,
    /// Final conclusion
    pub conclusion: Option<Conclusion>,
    /// Per-job reports, in matrix expansion order
    pub jobs: Vec<JobReport>,
    /// Per-publish-step outcomes
    pub publishes: Vec<PublishOutcome>,
    /// When execution started
    pub started_at: Option<u64>,
    /// When execution completed
    pub completed_at: Option<u64>,
    /// When this report was created
    pub created_at: u64,
}

impl RunReport {
    /// Create a new queued run report.
    pub fn new(id: RunId, pipeline_name: String, sha: String) -> Self {
        Self {
            id,
            pipeline_name,
            sha,
            status: RunStatus::Queued,
            conclusion: None,
            jobs: Vec::new(),
            publishes: Vec::new(),
            started_at: None,
            completed_at: None,
            created_at: now_secs(),
        }
    }

    /// Start the run.
    pub fn start(&mut self) {
        self.status = RunStatus::InProgress;
        self.started_at = Some(now_secs());
    }

    /// Complete the run with a conclusion.
    pub fn complete(&mut self, conclusion: Conclusion) {
        self.status = RunStatus::Completed;
        self.conclusion = Some(conclusion);
        self.completed_at = Some(now_secs());
    }

    /// Calculate the overall conclusion from job and publish conclusions.
    ///
    /// Success only if every job's step sequence and every attempted publish
    /// succeeded; a single failure marks the whole run failed.
    pub fn calculate_conclusion(&self) -> Conclusion {
        let mut has_failure = false;
        let mut has_cancelled = false;

        for job in &self.jobs {
            match job.conclusion {
                Some(c) if c.is_failure() => has_failure = true,
                Some(Conclusion::Cancelled) => has_cancelled = true,
                _ => {}
            }
        }
        for publish in &self.publishes {
            if publish.conclusion.is_failure() {
                has_failure = true;
            }
        }

        if has_failure {
            Conclusion::Failure
        } else if has_cancelled {
            Conclusion::Cancelled
        } else {
            Conclusion::Success
        }
    }

    /// Get the duration of the run in seconds.
    pub fn duration_seconds(&self) -> Option<u64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end.saturating_sub(start)),
            (Some(start), None) => Some(now_secs().saturating_sub(start)),
            _ => None,
        }
    }
}
