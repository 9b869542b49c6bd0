//! # Gantry
//!
//! A CI pipeline orchestrator: matrix expansion, gated publishing, and
//! concurrent job execution against external commands.
//!
//! This crate turns a declarative pipeline description into a set of
//! concrete jobs, runs their step sequences with timeouts and cooperative
//! cancellation, and publishes gated outputs into a versioned destination
//! tree.
//!
//! ## Features
//!
//! - **Matrix Expansion**: dimensions × include/exclude rows → deduplicated
//!   job configurations with stable labels
//! - **Cache Keys**: hierarchical fallback chains so related job variants
//!   share restored dependency caches
//! - **Run Context**: event, ref, and ancestry resolution behind a
//!   pluggable history provider
//! - **Gates**: short-circuiting boolean conditions over the run context
//!   and named outputs
//! - **Job Execution**: ordered steps with per-step budgets, bounded output
//!   capture, and cancellation
//! - **Publishing**: path-scoped atomic replace into a multi-branch
//!   versioned tree, with conflict retry
//!
//! ## Pipeline Example
//!
//! ```yaml
//! name: ci
//!
//! matrix:
//!   dimensions:
//!     - name: platform
//!       values: [linux, mac, windows]
//!     - name: toolchain
//!       values: ["3.8", "3.9"]
//!   exclude:
//!     - platform: mac
//!       toolchain: "3.8"
//!
//! steps:
//!   - name: Install
//!     run: ./install-deps.sh
//!   - name: Test
//!     run: ./run-tests.sh
//!     timeout-secs: 1800
//!
//! publish:
//!   - name: docs
//!     if:
//!       all:
//!         - event_is: push
//!         - output: on_master
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use gantry::{resolve_cache_key, Pipeline, PublishTarget};
//! use gantry::{EventKind, RunContext};
//!
//! let yaml = r#"
//! name: ci
//! matrix:
//!   dimensions:
//!     - name: platform
//!       values: [linux, mac]
//! steps:
//!   - name: Test
//!     run: ./run-tests.sh
//! "#;
//! let pipeline = Pipeline::parse(yaml).unwrap();
//!
//! // Expand the matrix into concrete jobs
//! let jobs = pipeline.expand().unwrap();
//! assert_eq!(jobs.len(), 2);
//! assert_eq!(jobs[0].label, "linux");
//!
//! // Each job gets a cache key fallback chain
//! let key = resolve_cache_key(&jobs[0], "abc123");
//! assert_eq!(key.exact(), "linux-any-any-deps-v1-abc123");
//!
//! // Publish targets are derived from the run context
//! let context = RunContext {
//!     event: EventKind::Push,
//!     ref_name: "refs/heads/devel".to_string(),
//!     base_ref: None,
//!     sha: "abc123".to_string(),
//!     on_reference_branch: false,
//! };
//! let target = PublishTarget::for_context(&context).unwrap();
//! assert_eq!(target.path(), "branch/devel");
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Push/PR Event
//!      │
//!      ▼
//! ┌───────────────────┐
//! │ Context Resolver  │
//! │ (ref + ancestry)  │
//! └─────────┬─────────┘
//!           │
//!           ▼
//! ┌───────────────────┐
//! │ Matrix Expander   │
//! │ (dims × rows)     │
//! └─────────┬─────────┘
//!           │
//!           ▼
//! ┌───────────────────┐
//! │   Job Executor    │     ┌─────────────┐
//! │  ┌─────────────┐  │◄────┤ Cache Store │
//! │  │  Install    │  │     └─────────────┘
//! │  │  Test       │  │
//! │  │  Package    │  │
//! │  └─────────────┘  │
//! └─────────┬─────────┘
//!           │
//!           ▼
//! ┌───────────────────┐
//! │ Gated Publishers  │
//! │ (versioned tree)  │
//! └───────────────────┘
//! ```

pub mod cache;
pub mod context;
pub mod error;
pub mod executor;
pub mod gate;
pub mod matrix;
pub mod orchestrator;
pub mod pipeline;
pub mod publisher;
pub mod report;

// Re-export main types
pub use cache::{resolve_cache_key, CacheKey, CacheStore, CACHE_KEY_DIMENSIONS, CACHE_REVISION};
pub use context::{EventKind, HistoryProvider, MemoryHistory, RunContext};
pub use error::{OrchestratorError, Result};
pub use executor::{ExecutionContext, JobExecutionResult, JobExecutor, StepOutput};
pub use gate::{evaluate, GateCondition};
pub use matrix::{expand, Dimension, ExcludeRow, IncludeRow, JobConfiguration};
pub use orchestrator::{run_pipeline, RunOptions};
pub use pipeline::{MatrixSpec, Pipeline, PublishSpec, StepSpec};
pub use publisher::{
    publish, publish_with_retry, DestinationTree, PublishResult, PublishTarget, TreePayload,
    BRANCH_PREFIX,
};
pub use report::{
    Conclusion, JobReport, PublishOutcome, RunId, RunReport, RunStatus, StepReport,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
