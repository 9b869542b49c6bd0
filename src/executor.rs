//! Job execution: runs one expanded configuration's ordered step sequence
//! against external commands.
//!
//! The install/lint/test/package executables are opaque collaborators; the
//! executor owns ordering, environment, output capture, timeouts, and
//! cooperative cancellation. A job failure never propagates to siblings.

use crate::context::RunContext;
use crate::error::{OrchestratorError, Result};
use crate::gate;
use crate::matrix::JobConfiguration;
use crate::pipeline::StepSpec;
use crate::report::{Conclusion, JobReport};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Execution context shared by every step of a job.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Workspace root the job runs in
    pub work_dir: PathBuf,
    /// Environment variables for all steps
    pub env: HashMap<String, String>,
}

impl ExecutionContext {
    /// Create a new execution context.
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            env: HashMap::new(),
        }
    }

    /// Add environment variables.
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    /// Full environment for one step: shared env, built-in variables, the
    /// job's matrix values, then step-specific overrides.
    pub fn step_env(
        &self,
        run: &RunContext,
        job: &JobConfiguration,
        step_env: &HashMap<String, String>,
    ) -> HashMap<String, String> {
        let mut env = self.env.clone();
        env.insert("GANTRY_SHA".to_string(), run.sha.clone());
        env.insert("GANTRY_REF".to_string(), run.ref_name.clone());
        env.insert("GANTRY_JOB".to_string(), job.label.clone());
        env.insert(
            "GANTRY_WORKSPACE".to_string(),
            self.work_dir.display().to_string(),
        );
        for (dim, value) in &job.values {
            let key = format!(
                "GANTRY_MATRIX_{}",
                dim.to_uppercase().replace('-', "_")
            );
            env.insert(key, value.clone());
        }
        env.extend(step_env.clone());
        env
    }
}

/// Output captured from one step's command.
#[derive(Debug, Clone, Default)]
pub struct StepOutput {
    /// Exit code of the command
    pub exit_code: i32,
    /// Captured stdout (bounded)
    pub stdout: String,
    /// Captured stderr (bounded)
    pub stderr: String,
    /// Artifact paths the command announced via `GANTRY_ARTIFACT=<path>`
    pub artifacts: Vec<PathBuf>,
}

/// Result of executing one job configuration.
#[derive(Debug)]
pub struct JobExecutionResult {
    /// Final job report
    pub report: JobReport,
    /// Conclusion
    pub conclusion: Conclusion,
    /// Artifact paths collected across all steps
    pub artifacts: Vec<PathBuf>,
}

/// Executes one job's step sequence.
pub struct JobExecutor {
    /// Whole-job wall-clock budget in seconds
    job_timeout_secs: u64,
    /// Maximum captured output size in bytes
    max_output_size: usize,
}

impl Default for JobExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl JobExecutor {
    /// Create a new executor with a 1 hour job budget and 10MB output cap.
    pub fn new() -> Self {
        Self {
            job_timeout_secs: 60 * 60,
            max_output_size: 10 * 1024 * 1024,
        }
    }

    /// Override the whole-job wall-clock budget.
    pub fn with_job_timeout(mut self, secs: u64) -> Self {
        self.job_timeout_secs = secs;
        self
    }

    /// Execute a job's ordered step sequence. Errors are recorded in the
    /// returned report rather than propagated, so one job's failure cannot
    /// abort its siblings.
    pub async fn execute_job(
        &self,
        job: &JobConfiguration,
        steps: &[StepSpec],
        run: &RunContext,
        context: &ExecutionContext,
        mut cancel: watch::Receiver<bool>,
    ) -> JobExecutionResult {
        let step_names: Vec<String> = steps.iter().map(|s| s.display_name()).collect();
        let mut report = JobReport::new(
            uuid::Uuid::new_v4().to_string(),
            job.label.clone(),
            job.index,
            &step_names,
        );
        report.start();
        info!("starting job '{}'", job.label);

        let deadline = Instant::now() + Duration::from_secs(self.job_timeout_secs);
        let mut overall_success = true;
        let mut cancelled = false;
        let mut artifacts = Vec::new();
        // Gate bindings: the aggregate flags plus one `step:<name>` entry
        // per completed prior step.
        let mut outputs = HashMap::from([("always".to_string(), true)]);

        for (idx, step) in steps.iter().enumerate() {
            if cancelled || *cancel.borrow() {
                cancelled = true;
                report.steps[idx].complete(Conclusion::Skipped);
                outputs.insert(step_output_name(step), false);
                continue;
            }

            outputs.insert("success".to_string(), overall_success);
            let should_run = match &step.condition {
                None => overall_success,
                Some(condition) => match gate::evaluate(condition, run, &outputs) {
                    Ok(run_it) => run_it,
                    Err(e) => {
                        report.steps[idx].complete(Conclusion::Error);
                        outputs.insert(step_output_name(step), false);
                        report.record_error(e.kind(), e.to_string());
                        overall_success = false;
                        continue;
                    }
                },
            };
            if !should_run {
                debug!("skipping step '{}'", step.display_name());
                report.steps[idx].complete(Conclusion::Skipped);
                outputs.insert(step_output_name(step), false);
                continue;
            }

            report.steps[idx].start();
            info!("running step '{}'", step.display_name());

            let remaining = deadline.saturating_duration_since(Instant::now());
            let budget = match step.timeout_secs {
                Some(secs) => remaining.min(Duration::from_secs(secs)),
                None => remaining,
            };

            let result = self
                .run_step(step, run, job, context, budget, &mut cancel)
                .await;

            let conclusion = match result {
                Ok(output) => {
                    report.steps[idx].exit_code = Some(output.exit_code);
                    artifacts.extend(output.artifacts.iter().cloned());
                    if output.exit_code == 0 {
                        Conclusion::Success
                    } else {
                        warn!(
                            "step '{}' failed with exit code {}",
                            step.display_name(),
                            output.exit_code
                        );
                        if step.continue_on_error {
                            Conclusion::Failure
                        } else {
                            overall_success = false;
                            report.record_error(
                                "step_failed",
                                format!(
                                    "step '{}' exited with code {}",
                                    step.display_name(),
                                    output.exit_code
                                ),
                            );
                            Conclusion::Failure
                        }
                    }
                }
                Err(e @ OrchestratorError::Timeout(_)) => {
                    warn!("step '{}' timed out", step.display_name());
                    overall_success = false;
                    report.record_error(e.kind(), e.to_string());
                    Conclusion::TimedOut
                }
                Err(e @ OrchestratorError::Cancelled(_)) => {
                    cancelled = true;
                    report.record_error(e.kind(), e.to_string());
                    Conclusion::Cancelled
                }
                Err(e) => {
                    overall_success = false;
                    report.record_error(e.kind(), e.to_string());
                    Conclusion::Error
                }
            };

            report.steps[idx].complete(conclusion);
            outputs.insert(step_output_name(step), conclusion == Conclusion::Success);
        }

        let conclusion = if cancelled {
            Conclusion::Cancelled
        } else if report
            .steps
            .iter()
            .any(|s| s.conclusion == Some(Conclusion::TimedOut))
        {
            Conclusion::TimedOut
        } else if overall_success {
            Conclusion::Success
        } else {
            Conclusion::Failure
        };

        report.complete(conclusion);
        info!("job '{}' completed: {:?}", job.label, conclusion);

        JobExecutionResult {
            report,
            conclusion,
            artifacts,
        }
    }

    /// Run a single step's command with a wall-clock budget and a cancel
    /// signal. The child is killed on timeout or cancellation.
    async fn run_step(
        &self,
        step: &StepSpec,
        run: &RunContext,
        job: &JobConfiguration,
        context: &ExecutionContext,
        budget: Duration,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<StepOutput> {
        let work_dir = step
            .working_directory
            .as_ref()
            .map(|d| context.work_dir.join(d))
            .unwrap_or_else(|| context.work_dir.clone());
        let env = context.step_env(run, job, &step.env);

        debug!("executing command: {}", step.run);

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&step.run)
            .current_dir(&work_dir)
            .envs(&env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| OrchestratorError::ExecutionFailed(e.to_string()))?;

        let max_output = self.max_output_size;
        let drive = drive_child(child, max_output);

        tokio::select! {
            result = tokio::time::timeout(budget, drive) => match result {
                Ok(output) => output,
                // Dropping the drive future drops the child, which kills
                // the process (kill_on_drop).
                Err(_) => Err(OrchestratorError::Timeout(format!(
                    "step '{}' exceeded {}s",
                    step.display_name(),
                    budget.as_secs()
                ))),
            },
            _ = cancelled(cancel) => Err(OrchestratorError::Cancelled(format!(
                "step '{}' cancelled",
                step.display_name()
            ))),
        }
    }
}

/// Gate binding name for a step's own result.
fn step_output_name(step: &StepSpec) -> String {
    format!("step:{}", step.display_name())
}

/// Resolves when the cancel flag flips to true; pends forever if the
/// sender goes away without cancelling.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}

/// Stream the child's output (bounded) and wait for its exit status.
async fn drive_child(mut child: Child, max_output: usize) -> Result<StepOutput> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| OrchestratorError::ExecutionFailed("stdout not captured".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| OrchestratorError::ExecutionFailed("stderr not captured".into()))?;

    let mut stdout_reader = BufReader::new(stdout).lines();
    let mut stderr_reader = BufReader::new(stderr).lines();

    let mut stdout_output = String::new();
    let mut stderr_output = String::new();

    loop {
        tokio::select! {
            line = stdout_reader.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if stdout_output.len() + line.len() < max_output {
                            stdout_output.push_str(&line);
                            stdout_output.push('\n');
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("error reading stdout: {}", e);
                        break;
                    }
                }
            }
            line = stderr_reader.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if stderr_output.len() + line.len() < max_output {
                            stderr_output.push_str(&line);
                            stderr_output.push('\n');
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!("error reading stderr: {}", e);
                    }
                }
            }
        }
    }

    // Collect remaining stderr
    while let Ok(Some(line)) = stderr_reader.next_line().await {
        if stderr_output.len() + line.len() < max_output {
            stderr_output.push_str(&line);
            stderr_output.push('\n');
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|e| OrchestratorError::ExecutionFailed(e.to_string()))?;
    let exit_code = status.code().unwrap_or(-1);

    let artifacts = parse_artifacts(&stdout_output);

    Ok(StepOutput {
        exit_code,
        stdout: stdout_output,
        stderr: stderr_output,
        artifacts,
    })
}

/// Parse `GANTRY_ARTIFACT=<path>` announcements from a step's stdout.
fn parse_artifacts(output: &str) -> Vec<PathBuf> {
    output
        .lines()
        .filter_map(|line| line.strip_prefix("GANTRY_ARTIFACT="))
        .map(|path| Path::new(path.trim()).to_path_buf())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::EventKind;
    use crate::gate::GateCondition;
    use crate::matrix::{expand, Dimension};

    fn test_job() -> JobConfiguration {
        let dims = vec![Dimension::new("platform", &["linux"])];
        expand(&dims, &[], &[]).unwrap().remove(0)
    }

    fn test_run_context() -> RunContext {
        RunContext {
            event: EventKind::Push,
            ref_name: "refs/heads/master".to_string(),
            base_ref: None,
            sha: "abc123".to_string(),
            on_reference_branch: true,
        }
    }

    fn step(name: &str, run: &str) -> StepSpec {
        StepSpec {
            name: Some(name.to_string()),
            run: run.to_string(),
            working_directory: None,
            env: HashMap::new(),
            timeout_secs: None,
            condition: None,
            continue_on_error: false,
        }
    }

    fn no_cancel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[test]
    fn test_step_env_contains_builtins() {
        let ctx = ExecutionContext::new("/tmp/work");
        let env = ctx.step_env(&test_run_context(), &test_job(), &HashMap::new());
        assert_eq!(env.get("GANTRY_SHA"), Some(&"abc123".to_string()));
        assert_eq!(env.get("GANTRY_JOB"), Some(&"linux".to_string()));
        assert_eq!(env.get("GANTRY_MATRIX_PLATFORM"), Some(&"linux".to_string()));
    }

    #[test]
    fn test_parse_artifacts() {
        let out = "building\nGANTRY_ARTIFACT=dist/pkg.whl\nGANTRY_ARTIFACT=dist/pkg.tar.gz\ndone\n";
        let artifacts = parse_artifacts(out);
        assert_eq!(artifacts.len(), 2);
        assert_eq!(artifacts[0], PathBuf::from("dist/pkg.whl"));
    }

    #[tokio::test]
    async fn test_successful_job() {
        let (_tx, rx) = no_cancel();
        let executor = JobExecutor::new();
        let ctx = ExecutionContext::new(std::env::temp_dir());
        let steps = vec![step("Echo", "echo hello"), step("True", "true")];

        let result = executor
            .execute_job(&test_job(), &steps, &test_run_context(), &ctx, rx)
            .await;
        assert_eq!(result.conclusion, Conclusion::Success);
        assert_eq!(result.report.steps.len(), 2);
        assert_eq!(result.report.steps[0].exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_failing_step_skips_remainder() {
        let (_tx, rx) = no_cancel();
        let executor = JobExecutor::new();
        let ctx = ExecutionContext::new(std::env::temp_dir());
        let steps = vec![
            step("Fail", "exit 3"),
            step("Never", "echo unreachable"),
        ];

        let result = executor
            .execute_job(&test_job(), &steps, &test_run_context(), &ctx, rx)
            .await;
        assert_eq!(result.conclusion, Conclusion::Failure);
        assert_eq!(result.report.steps[0].exit_code, Some(3));
        assert_eq!(result.report.steps[0].conclusion, Some(Conclusion::Failure));
        assert_eq!(result.report.steps[1].conclusion, Some(Conclusion::Skipped));
        assert_eq!(result.report.error_kind.as_deref(), Some("step_failed"));
    }

    #[tokio::test]
    async fn test_always_condition_runs_after_failure() {
        let (_tx, rx) = no_cancel();
        let executor = JobExecutor::new();
        let ctx = ExecutionContext::new(std::env::temp_dir());
        let mut cleanup = step("Cleanup", "echo cleaning");
        cleanup.condition = Some(GateCondition::Output("always".to_string()));
        let steps = vec![step("Fail", "exit 1"), cleanup];

        let result = executor
            .execute_job(&test_job(), &steps, &test_run_context(), &ctx, rx)
            .await;
        assert_eq!(result.conclusion, Conclusion::Failure);
        assert_eq!(result.report.steps[1].conclusion, Some(Conclusion::Success));
    }

    #[tokio::test]
    async fn test_prior_step_results_bound_for_gates() {
        let (_tx, rx) = no_cancel();
        let executor = JobExecutor::new();
        let ctx = ExecutionContext::new(std::env::temp_dir());

        let mut lint = step("Lint", "exit 1");
        lint.continue_on_error = true;
        let mut on_fail = step("Report", "echo reporting lint failure");
        on_fail.condition = Some(GateCondition::Not(Box::new(GateCondition::Output(
            "step:Lint".to_string(),
        ))));
        let mut on_pass = step("Celebrate", "echo all clean");
        on_pass.condition = Some(GateCondition::Output("step:Lint".to_string()));
        let steps = vec![lint, on_fail, on_pass];

        let result = executor
            .execute_job(&test_job(), &steps, &test_run_context(), &ctx, rx)
            .await;
        assert_eq!(result.conclusion, Conclusion::Success);
        // The gate keyed on Lint's failure ran, its inverse was skipped
        assert_eq!(result.report.steps[1].conclusion, Some(Conclusion::Success));
        assert_eq!(result.report.steps[2].conclusion, Some(Conclusion::Skipped));
    }

    #[tokio::test]
    async fn test_unbound_condition_is_job_error() {
        let (_tx, rx) = no_cancel();
        let executor = JobExecutor::new();
        let ctx = ExecutionContext::new(std::env::temp_dir());
        let mut gated = step("Gated", "echo hi");
        gated.condition = Some(GateCondition::Output("no_such_output".to_string()));
        let steps = vec![gated];

        let result = executor
            .execute_job(&test_job(), &steps, &test_run_context(), &ctx, rx)
            .await;
        assert_eq!(result.conclusion, Conclusion::Failure);
        assert_eq!(
            result.report.error_kind.as_deref(),
            Some("unbound_reference")
        );
    }

    #[tokio::test]
    async fn test_step_timeout() {
        let (_tx, rx) = no_cancel();
        let executor = JobExecutor::new();
        let ctx = ExecutionContext::new(std::env::temp_dir());
        let mut slow = step("Sleep", "sleep 30");
        slow.timeout_secs = Some(1);
        let steps = vec![slow];

        let result = executor
            .execute_job(&test_job(), &steps, &test_run_context(), &ctx, rx)
            .await;
        assert_eq!(result.conclusion, Conclusion::TimedOut);
        assert_eq!(result.report.steps[0].conclusion, Some(Conclusion::TimedOut));
        assert_eq!(result.report.error_kind.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_cancellation() {
        let (tx, rx) = no_cancel();
        let executor = JobExecutor::new();
        let ctx = ExecutionContext::new(std::env::temp_dir());
        let steps = vec![step("Sleep", "sleep 30"), step("Never", "echo no")];

        let handle = {
            let job = test_job();
            let run = test_run_context();
            tokio::spawn(async move {
                executor.execute_job(&job, &steps, &run, &ctx, rx).await
            })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(true).unwrap();

        let result = handle.await.unwrap();
        assert_eq!(result.conclusion, Conclusion::Cancelled);
        assert_eq!(
            result.report.steps[0].conclusion,
            Some(Conclusion::Cancelled)
        );
        assert_eq!(result.report.steps[1].conclusion, Some(Conclusion::Skipped));
    }

    #[tokio::test]
    async fn test_working_directory_resolved_against_workspace() {
        let (_tx, rx) = no_cancel();
        let executor = JobExecutor::new();
        let workspace = tempfile::tempdir().unwrap();
        std::fs::create_dir(workspace.path().join("sub")).unwrap();
        let ctx = ExecutionContext::new(workspace.path());

        let mut write = step("Write", "echo marker > out.txt");
        write.working_directory = Some("sub".to_string());
        let steps = vec![write];

        let result = executor
            .execute_job(&test_job(), &steps, &test_run_context(), &ctx, rx)
            .await;
        assert_eq!(result.conclusion, Conclusion::Success);
        assert!(workspace.path().join("sub/out.txt").exists());
    }

    #[tokio::test]
    async fn test_artifact_collection() {
        let (_tx, rx) = no_cancel();
        let executor = JobExecutor::new();
        let ctx = ExecutionContext::new(std::env::temp_dir());
        let steps = vec![step("Package", "echo GANTRY_ARTIFACT=dist/out.whl")];

        let result = executor
            .execute_job(&test_job(), &steps, &test_run_context(), &ctx, rx)
            .await;
        assert_eq!(result.conclusion, Conclusion::Success);
        assert_eq!(result.artifacts, vec![PathBuf::from("dist/out.whl")]);
    }

    #[tokio::test]
    async fn test_continue_on_error() {
        let (_tx, rx) = no_cancel();
        let executor = JobExecutor::new();
        let ctx = ExecutionContext::new(std::env::temp_dir());
        let mut lint = step("Lint", "exit 1");
        lint.continue_on_error = true;
        let steps = vec![lint, step("Test", "echo testing")];

        let result = executor
            .execute_job(&test_job(), &steps, &test_run_context(), &ctx, rx)
            .await;
        // The job proceeds past the tolerated failure and succeeds
        assert_eq!(result.conclusion, Conclusion::Success);
        assert_eq!(result.report.steps[1].conclusion, Some(Conclusion::Success));
    }
}
