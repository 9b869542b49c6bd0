//! End-to-end pipeline run driver: matrix expansion, cache restore,
//! concurrent job execution, publish gating, and the final run report.

use crate::cache::{resolve_cache_key, CacheStore};
use crate::context::RunContext;
use crate::error::{OrchestratorError, Result};
use crate::executor::{ExecutionContext, JobExecutor};
use crate::gate;
use crate::pipeline::Pipeline;
use crate::publisher::{publish_with_retry, DestinationTree, PublishTarget, TreePayload};
use crate::report::{Conclusion, JobReport, PublishOutcome, RunReport};
use futures::future::join_all;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Options for one pipeline run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Workspace root jobs run in
    pub work_dir: PathBuf,
    /// Whole-job wall-clock budget in seconds
    pub job_timeout_secs: u64,
    /// Bounded attempts for conflicted publishes
    pub max_publish_attempts: u32,
    /// Initial backoff between publish attempts
    pub publish_backoff: Duration,
    /// Cooperative cancellation signal (e.g., superseded by a newer
    /// commit on the same ref)
    pub cancel: Option<watch::Receiver<bool>>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            work_dir: std::env::temp_dir(),
            job_timeout_secs: 60 * 60,
            max_publish_attempts: 3,
            publish_backoff: Duration::from_millis(100),
            cancel: None,
        }
    }
}

/// Execute a pipeline run end to end.
///
/// Expansion errors are fatal before any job starts. Expanded jobs run
/// concurrently with no ordering between siblings; a single job's failure
/// marks the run failed but never aborts the others. Publish steps run
/// after all jobs, each behind its own gate.
pub async fn run_pipeline(
    pipeline: &Pipeline,
    context: &RunContext,
    cache: &CacheStore,
    tree: &DestinationTree,
    payloads: &HashMap<String, TreePayload>,
    options: RunOptions,
) -> Result<RunReport> {
    let configs = pipeline.expand()?;

    let mut report = RunReport::new(
        uuid::Uuid::new_v4().to_string(),
        pipeline.name.clone(),
        context.sha.clone(),
    );
    report.start();
    info!(
        "run {} started: {} jobs expanded from pipeline '{}'",
        report.id,
        configs.len(),
        pipeline.name
    );

    // Held so a caller-less cancel channel stays open for the run.
    let _cancel_holder;
    let cancel = match &options.cancel {
        Some(rx) => rx.clone(),
        None => {
            let (tx, rx) = watch::channel(false);
            _cancel_holder = tx;
            rx
        }
    };

    // Restore dependency caches per job, most specific key first.
    let keys: Vec<_> = configs
        .iter()
        .map(|job| resolve_cache_key(job, &context.sha))
        .collect();
    for (job, key) in configs.iter().zip(&keys) {
        match cache.restore(key) {
            Some((hit, _)) => info!("job '{}': cache restored from '{}'", job.label, hit),
            None => info!("job '{}': cache miss", job.label),
        }
    }

    // Fan out: every configuration is an independent unit of work.
    let executor = Arc::new(JobExecutor::new().with_job_timeout(options.job_timeout_secs));
    let exec_context = ExecutionContext::new(options.work_dir.clone()).with_env(pipeline.env.clone());
    let handles: Vec<_> = configs
        .iter()
        .map(|job| {
            let executor = executor.clone();
            let job = job.clone();
            let steps = pipeline.steps.clone();
            let run = context.clone();
            let exec_context = exec_context.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                executor
                    .execute_job(&job, &steps, &run, &exec_context, cancel)
                    .await
            })
        })
        .collect();

    let results = join_all(handles).await;
    for ((job, key), joined) in configs.iter().zip(&keys).zip(results) {
        match joined {
            Ok(result) => {
                match result.conclusion {
                    Conclusion::Success => {
                        // Save the dependency cache under the exact key when
                        // this commit had no entry yet.
                        let marker = serde_json::to_vec(&result.artifacts).unwrap_or_default();
                        if cache
                            .restore(key)
                            .map(|(hit, _)| hit != key.exact())
                            .unwrap_or(true)
                        {
                            cache.put(key.exact(), marker);
                        }
                    }
                    Conclusion::Cancelled => {
                        // Partial writes from a cancelled job must not
                        // surface as valid fallback keys.
                        cache.discard_partial(key.exact());
                    }
                    _ => {}
                }
                report.jobs.push(result.report);
            }
            Err(e) => {
                warn!("job '{}' panicked: {}", job.label, e);
                let mut failed = JobReport::new(
                    uuid::Uuid::new_v4().to_string(),
                    job.label.clone(),
                    job.index,
                    &[],
                );
                failed.record_error("execution_failed", e.to_string());
                failed.complete(Conclusion::Error);
                report.jobs.push(failed);
            }
        }
    }

    let all_jobs_passed = report
        .jobs
        .iter()
        .all(|j| j.conclusion == Some(Conclusion::Success));
    let outputs = HashMap::from([
        ("on_master".to_string(), context.on_reference_branch),
        ("all_jobs_passed".to_string(), all_jobs_passed),
    ]);

    // Publish steps: each gate is evaluated independently, never cached.
    for spec in &pipeline.publish {
        let outcome = match gate::evaluate(&spec.condition, context, &outputs) {
            Err(e) => {
                warn!("publish '{}' gate failed: {}", spec.name, e);
                PublishOutcome {
                    name: spec.name.clone(),
                    conclusion: Conclusion::Error,
                    path: None,
                    error_kind: Some(e.kind().to_string()),
                    error: Some(e.to_string()),
                }
            }
            Ok(false) => {
                info!("publish '{}' skipped: gate evaluated false", spec.name);
                PublishOutcome {
                    name: spec.name.clone(),
                    conclusion: Conclusion::Skipped,
                    path: None,
                    error_kind: None,
                    error: None,
                }
            }
            Ok(true) => match PublishTarget::for_context(context) {
                None => {
                    info!(
                        "publish '{}' skipped: no publishable target for {}",
                        spec.name, context.ref_name
                    );
                    PublishOutcome {
                        name: spec.name.clone(),
                        conclusion: Conclusion::Skipped,
                        path: None,
                        error_kind: None,
                        error: None,
                    }
                }
                Some(target) => match payloads.get(&spec.name) {
                    None => {
                        let e = OrchestratorError::MissingPayload(spec.name.clone());
                        PublishOutcome {
                            name: spec.name.clone(),
                            conclusion: Conclusion::Error,
                            path: None,
                            error_kind: Some(e.kind().to_string()),
                            error: Some(e.to_string()),
                        }
                    }
                    Some(payload) => {
                        match publish_with_retry(
                            tree,
                            &target,
                            payload,
                            options.max_publish_attempts,
                            options.publish_backoff,
                        )
                        .await
                        {
                            Ok(result) => PublishOutcome {
                                name: spec.name.clone(),
                                conclusion: Conclusion::Success,
                                path: Some(result.path),
                                error_kind: None,
                                error: None,
                            },
                            Err(e) => PublishOutcome {
                                name: spec.name.clone(),
                                conclusion: Conclusion::Error,
                                path: Some(target.path()),
                                error_kind: Some(e.kind().to_string()),
                                error: Some(e.to_string()),
                            },
                        }
                    }
                },
            },
        };
        report.publishes.push(outcome);
    }

    let conclusion = report.calculate_conclusion();
    report.complete(conclusion);
    info!("run {} completed: {:?}", report.id, conclusion);

    Ok(report)
}
