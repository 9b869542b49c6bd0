//! Run-time context: the trigger event, refs, and the ancestry fact
//! publish gates depend on.

use crate::error::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::warn;

/// Kind of event that triggered the run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Push,
    PullRequest,
}

/// Abstracts version-control history traversal.
///
/// Implementations query the underlying repository; the in-memory
/// [`MemoryHistory`] backs tests and examples.
pub trait HistoryProvider: Send + Sync {
    /// Whether `branch_tip`'s history contains `commit`.
    fn is_ancestor(&self, commit: &str, branch_tip: &str) -> Result<bool>;

    /// Resolve a tag name to the commit it points at.
    fn resolve_tag(&self, name: &str) -> Result<String>;

    /// Resolve a branch name to its tip commit.
    fn branch_tip(&self, branch: &str) -> Result<String>;
}

/// Immutable facts about the current run, computed once at resolution time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunContext {
    /// What kind of event triggered the run
    pub event: EventKind,
    /// Full ref that triggered (e.g., "refs/heads/devel", "refs/tags/v1.2.3")
    pub ref_name: String,
    /// Target branch ref, for pull requests
    pub base_ref: Option<String>,
    /// Head commit SHA
    pub sha: String,
    /// Whether the triggering commit is reachable from the reference
    /// branch tip
    pub on_reference_branch: bool,
}

impl RunContext {
    /// Resolve a run context, computing the ancestry fact through the
    /// history provider. A history failure is fatal here; callers that can
    /// tolerate skipped publish gates use [`RunContext::resolve_lenient`].
    pub fn resolve(
        event: EventKind,
        ref_name: impl Into<String>,
        base_ref: Option<String>,
        sha: impl Into<String>,
        reference_branch: &str,
        history: &dyn HistoryProvider,
    ) -> Result<RunContext> {
        let ref_name = ref_name.into();
        let sha = sha.into();

        let commit = match tag_of(&ref_name) {
            Some(tag) => history.resolve_tag(tag)?,
            None => sha.clone(),
        };
        let tip = history.branch_tip(reference_branch)?;
        let on_reference_branch = history.is_ancestor(&commit, &tip)?;

        Ok(RunContext {
            event,
            ref_name,
            base_ref,
            sha,
            on_reference_branch,
        })
    }

    /// Like [`RunContext::resolve`], but a history failure degrades to
    /// `on_reference_branch = false` instead of failing the run. Publish
    /// gates keyed on the ancestry fact will then evaluate false.
    pub fn resolve_lenient(
        event: EventKind,
        ref_name: impl Into<String>,
        base_ref: Option<String>,
        sha: impl Into<String>,
        reference_branch: &str,
        history: &dyn HistoryProvider,
    ) -> RunContext {
        let ref_name = ref_name.into();
        let sha = sha.into();
        match Self::resolve(
            event,
            ref_name.clone(),
            base_ref.clone(),
            sha.clone(),
            reference_branch,
            history,
        ) {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!(
                    "history unavailable, treating {} as off {}: {}",
                    ref_name, reference_branch, e
                );
                RunContext {
                    event,
                    ref_name,
                    base_ref,
                    sha,
                    on_reference_branch: false,
                }
            }
        }
    }

    /// Branch name, if the ref is a branch.
    pub fn branch(&self) -> Option<&str> {
        self.ref_name.strip_prefix("refs/heads/")
    }

    /// Tag name, if the ref is a tag.
    pub fn tag(&self) -> Option<&str> {
        tag_of(&self.ref_name)
    }

    /// Whether the triggering ref is a tag.
    pub fn is_tag(&self) -> bool {
        self.tag().is_some()
    }
}

fn tag_of(ref_name: &str) -> Option<&str> {
    ref_name.strip_prefix("refs/tags/")
}

/// In-memory commit graph for tests and examples.
#[derive(Debug, Default)]
pub struct MemoryHistory {
    /// commit -> parent commits
    parents: HashMap<String, Vec<String>>,
    /// tag name -> commit
    tags: HashMap<String, String>,
    /// branch name -> tip commit
    branches: HashMap<String, String>,
}

impl MemoryHistory {
    /// Create an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a commit with its parents.
    pub fn commit(&mut self, sha: impl Into<String>, parents: &[&str]) -> &mut Self {
        self.parents
            .insert(sha.into(), parents.iter().map(|p| p.to_string()).collect());
        self
    }

    /// Point a tag at a commit.
    pub fn tag(&mut self, name: impl Into<String>, sha: impl Into<String>) -> &mut Self {
        self.tags.insert(name.into(), sha.into());
        self
    }

    /// Point a branch tip at a commit.
    pub fn branch(&mut self, name: impl Into<String>, sha: impl Into<String>) -> &mut Self {
        self.branches.insert(name.into(), sha.into());
        self
    }
}

impl HistoryProvider for MemoryHistory {
    fn is_ancestor(&self, commit: &str, branch_tip: &str) -> Result<bool> {
        if !self.parents.contains_key(branch_tip) {
            return Err(OrchestratorError::HistoryUnavailable(format!(
                "unknown commit: {}",
                branch_tip
            )));
        }
        // Walk first-parent and merge parents from the tip backwards.
        let mut queue: VecDeque<&str> = VecDeque::from([branch_tip]);
        let mut seen: HashSet<&str> = HashSet::new();
        while let Some(current) = queue.pop_front() {
            if current == commit {
                return Ok(true);
            }
            if !seen.insert(current) {
                continue;
            }
            if let Some(parents) = self.parents.get(current) {
                for parent in parents {
                    queue.push_back(parent);
                }
            }
        }
        Ok(false)
    }

    fn resolve_tag(&self, name: &str) -> Result<String> {
        self.tags.get(name).cloned().ok_or_else(|| {
            OrchestratorError::HistoryUnavailable(format!("unknown tag: {}", name))
        })
    }

    fn branch_tip(&self, branch: &str) -> Result<String> {
        self.branches.get(branch).cloned().ok_or_else(|| {
            OrchestratorError::HistoryUnavailable(format!(
                "reference branch tip not resolvable: {}",
                branch
            ))
        })
    }
}
