//! Artifact publishing into a persistent multi-version destination tree.
//!
//! The tree models a version-controlled directory supporting atomic
//! multi-file commit-and-push: a snapshot carries a revision, and a commit
//! only applies if the revision is unchanged. Publishing is path-scoped:
//! replacing one branch's directory never touches its siblings.

use crate::context::{EventKind, RunContext};
use crate::error::{OrchestratorError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};

/// Files to publish: relative path → content.
pub type TreePayload = BTreeMap<String, Vec<u8>>;

/// Subtree reserved for branch-scoped output.
pub const BRANCH_PREFIX: &str = "branch/";

/// Destination within the tree that a run's output should replace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PublishTarget {
    /// Branch-named subdirectory under `branch/`
    Branch(String),
    /// Root-level payload (tagged releases on the reference branch)
    Root,
}

impl PublishTarget {
    /// Compute the publish target for a run context, or `None` when the
    /// run must not publish: pull requests never publish, and a tag whose
    /// commit is not on the reference branch is never publishable.
    pub fn for_context(context: &RunContext) -> Option<PublishTarget> {
        if context.event != EventKind::Push {
            return None;
        }
        if context.is_tag() {
            if context.on_reference_branch {
                return Some(PublishTarget::Root);
            }
            return None;
        }
        context
            .branch()
            .map(|b| PublishTarget::Branch(b.to_string()))
    }

    /// Destination path inside the tree ("" for the root target).
    pub fn path(&self) -> String {
        match self {
            PublishTarget::Branch(branch) => format!("{}{}", BRANCH_PREFIX, branch),
            PublishTarget::Root => String::new(),
        }
    }
}

/// Result of a publish attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishResult {
    /// Whether a commit happened
    pub committed: bool,
    /// Destination path that was replaced
    pub path: String,
    /// Tree revision after the commit
    pub revision: u64,
    /// Content hash of the committed tree state
    pub commit_id: String,
}

#[derive(Debug, Default)]
struct TreeState {
    files: BTreeMap<String, Vec<u8>>,
    revision: u64,
    commit_id: String,
}

/// In-memory versioned destination tree.
#[derive(Debug, Default)]
pub struct DestinationTree {
    state: Mutex<TreeState>,
}

impl DestinationTree {
    /// Create an empty tree at revision 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the current revision and file listing.
    pub fn snapshot(&self) -> (u64, BTreeMap<String, Vec<u8>>) {
        let state = self.state.lock();
        (state.revision, state.files.clone())
    }

    /// Current revision.
    pub fn revision(&self) -> u64 {
        self.state.lock().revision
    }

    /// Content of a single file, if present.
    pub fn read(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().files.get(path).cloned()
    }

    /// Paths currently in the tree.
    pub fn paths(&self) -> Vec<String> {
        self.state.lock().files.keys().cloned().collect()
    }

    /// Apply a change set atomically against an expected revision.
    ///
    /// `None` content deletes a path. Fails with
    /// [`OrchestratorError::PublishConflict`] if the tree moved past
    /// `expected_revision` since the snapshot was taken.
    pub fn commit(
        &self,
        expected_revision: u64,
        changes: Vec<(String, Option<Vec<u8>>)>,
    ) -> Result<(u64, String)> {
        let mut state = self.state.lock();
        if state.revision != expected_revision {
            return Err(OrchestratorError::PublishConflict {
                path: changes
                    .first()
                    .map(|(p, _)| p.clone())
                    .unwrap_or_default(),
                expected: expected_revision,
                found: state.revision,
            });
        }
        for (path, content) in changes {
            match content {
                Some(bytes) => {
                    state.files.insert(path, bytes);
                }
                None => {
                    state.files.remove(&path);
                }
            }
        }
        state.revision += 1;

        let mut hasher = Sha256::new();
        hasher.update(state.revision.to_be_bytes());
        for (path, content) in &state.files {
            hasher.update(path.as_bytes());
            hasher.update([0]);
            hasher.update(content);
        }
        state.commit_id = hex::encode(hasher.finalize());

        Ok((state.revision, state.commit_id.clone()))
    }
}

/// Atomically replace the target's subtree with `payload`, leaving every
/// sibling path untouched.
///
/// For a branch target the `branch/<name>/` subtree is replaced; for the
/// root target everything outside `branch/` is replaced. Directories for
/// branches or tags not part of this run are never deleted.
pub fn publish(
    tree: &DestinationTree,
    target: &PublishTarget,
    payload: &TreePayload,
) -> Result<PublishResult> {
    let (revision, files) = tree.snapshot();

    let mut changes: Vec<(String, Option<Vec<u8>>)> = Vec::new();
    match target {
        PublishTarget::Branch(branch) => {
            let dir = format!("{}{}/", BRANCH_PREFIX, branch);
            for path in files.keys() {
                if path.starts_with(&dir) {
                    changes.push((path.clone(), None));
                }
            }
            for (path, content) in payload {
                changes.push((format!("{}{}", dir, path), Some(content.clone())));
            }
        }
        PublishTarget::Root => {
            for path in files.keys() {
                if !path.starts_with(BRANCH_PREFIX) {
                    changes.push((path.clone(), None));
                }
            }
            for (path, content) in payload {
                changes.push((path.clone(), Some(content.clone())));
            }
        }
    }

    let (revision, commit_id) = tree.commit(revision, changes)?;
    info!("published {} files to '{}'", payload.len(), target.path());

    Ok(PublishResult {
        committed: true,
        path: target.path(),
        revision,
        commit_id,
    })
}

/// Publish with bounded retries on conflict, backing off between attempts.
/// After exhausting retries the conflict surfaces as a fatal failure.
pub async fn publish_with_retry(
    tree: &DestinationTree,
    target: &PublishTarget,
    payload: &TreePayload,
    max_attempts: u32,
    backoff: Duration,
) -> Result<PublishResult> {
    let mut delay = backoff;
    let mut attempt = 1;
    loop {
        match publish(tree, target, payload) {
            Ok(result) => return Ok(result),
            Err(e @ OrchestratorError::PublishConflict { .. }) => {
                if attempt >= max_attempts {
                    return Err(e);
                }
                warn!(
                    "publish conflict on '{}' (attempt {}/{}), retrying",
                    target.path(),
                    attempt,
                    max_attempts
                );
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(pairs: &[(&str, &str)]) -> TreePayload {
        pairs
            .iter()
            .map(|(p, c)| (p.to_string(), c.as_bytes().to_vec()))
            .collect()
    }

    fn push_ctx(ref_name: &str, on_reference_branch: bool) -> RunContext {
        RunContext {
            event: EventKind::Push,
            ref_name: ref_name.to_string(),
            base_ref: None,
            sha: "abc123".to_string(),
            on_reference_branch,
        }
    }

    #[test]
    fn test_target_for_branch_push() {
        let target = PublishTarget::for_context(&push_ctx("refs/heads/devel", false)).unwrap();
        assert_eq!(target, PublishTarget::Branch("devel".to_string()));
        assert_eq!(target.path(), "branch/devel");
    }

    #[test]
    fn test_target_for_tag_on_reference_branch() {
        let target = PublishTarget::for_context(&push_ctx("refs/tags/v1.2.3", true)).unwrap();
        assert_eq!(target, PublishTarget::Root);
        assert_eq!(target.path(), "");
    }

    #[test]
    fn test_tag_off_reference_branch_never_publishes() {
        assert!(PublishTarget::for_context(&push_ctx("refs/tags/v1.2.3", false)).is_none());
    }

    #[test]
    fn test_pull_request_never_publishes() {
        let ctx = RunContext {
            event: EventKind::PullRequest,
            ref_name: "refs/heads/feature".to_string(),
            base_ref: Some("refs/heads/master".to_string()),
            sha: "abc".to_string(),
            on_reference_branch: true,
        };
        assert!(PublishTarget::for_context(&ctx).is_none());
    }

    #[test]
    fn test_sibling_branches_stay_distinct() {
        let tree = DestinationTree::new();

        publish(
            &tree,
            &PublishTarget::Branch("devel".to_string()),
            &payload(&[("index.html", "devel v1")]),
        )
        .unwrap();
        publish(
            &tree,
            &PublishTarget::Branch("master".to_string()),
            &payload(&[("index.html", "master v1")]),
        )
        .unwrap();

        assert_eq!(
            tree.read("branch/devel/index.html").unwrap(),
            b"devel v1".to_vec()
        );
        assert_eq!(
            tree.read("branch/master/index.html").unwrap(),
            b"master v1".to_vec()
        );

        // Republishing devel only changes branch/devel
        publish(
            &tree,
            &PublishTarget::Branch("devel".to_string()),
            &payload(&[("index.html", "devel v2")]),
        )
        .unwrap();
        assert_eq!(
            tree.read("branch/devel/index.html").unwrap(),
            b"devel v2".to_vec()
        );
        assert_eq!(
            tree.read("branch/master/index.html").unwrap(),
            b"master v1".to_vec()
        );
    }

    #[test]
    fn test_branch_replace_drops_stale_files() {
        let tree = DestinationTree::new();
        publish(
            &tree,
            &PublishTarget::Branch("devel".to_string()),
            &payload(&[("index.html", "v1"), ("old-page.html", "gone soon")]),
        )
        .unwrap();
        publish(
            &tree,
            &PublishTarget::Branch("devel".to_string()),
            &payload(&[("index.html", "v2")]),
        )
        .unwrap();

        assert!(tree.read("branch/devel/old-page.html").is_none());
        assert_eq!(tree.read("branch/devel/index.html").unwrap(), b"v2".to_vec());
    }

    #[test]
    fn test_root_publish_leaves_branch_subtree() {
        let tree = DestinationTree::new();
        publish(
            &tree,
            &PublishTarget::Branch("devel".to_string()),
            &payload(&[("index.html", "devel")]),
        )
        .unwrap();
        publish(
            &tree,
            &PublishTarget::Root,
            &payload(&[("index.html", "release v1.2.3")]),
        )
        .unwrap();

        assert_eq!(
            tree.read("index.html").unwrap(),
            b"release v1.2.3".to_vec()
        );
        assert_eq!(
            tree.read("branch/devel/index.html").unwrap(),
            b"devel".to_vec()
        );

        // A later root publish replaces only root-level files
        publish(
            &tree,
            &PublishTarget::Root,
            &payload(&[("index.html", "release v1.3.0")]),
        )
        .unwrap();
        assert_eq!(
            tree.read("branch/devel/index.html").unwrap(),
            b"devel".to_vec()
        );
    }

    #[test]
    fn test_stale_commit_conflicts() {
        let tree = DestinationTree::new();
        let (revision, _) = tree.snapshot();

        // Another publisher wins the race
        tree.commit(revision, vec![("other".to_string(), Some(b"x".to_vec()))])
            .unwrap();

        let result = tree.commit(revision, vec![("mine".to_string(), Some(b"y".to_vec()))]);
        assert!(matches!(
            result,
            Err(OrchestratorError::PublishConflict { expected: 0, found: 1, .. })
        ));
        // The losing change was not applied
        assert!(tree.read("mine").is_none());
    }

    #[test]
    fn test_commit_id_tracks_content() {
        let tree = DestinationTree::new();
        let first = publish(
            &tree,
            &PublishTarget::Branch("devel".to_string()),
            &payload(&[("a", "1")]),
        )
        .unwrap();
        let second = publish(
            &tree,
            &PublishTarget::Branch("devel".to_string()),
            &payload(&[("a", "2")]),
        )
        .unwrap();
        assert_ne!(first.commit_id, second.commit_id);
        assert_eq!(second.revision, first.revision + 1);
    }

    #[tokio::test]
    async fn test_concurrent_publishers_both_land() {
        use std::sync::Arc;

        let tree = Arc::new(DestinationTree::new());
        let mut handles = Vec::new();
        for branch in ["devel", "master"] {
            let tree = tree.clone();
            handles.push(tokio::spawn(async move {
                publish_with_retry(
                    &tree,
                    &PublishTarget::Branch(branch.to_string()),
                    &payload(&[("index.html", branch)]),
                    5,
                    Duration::from_millis(1),
                )
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // A losing racer retries against the new revision and lands too
        assert_eq!(tree.read("branch/devel/index.html").unwrap(), b"devel".to_vec());
        assert_eq!(
            tree.read("branch/master/index.html").unwrap(),
            b"master".to_vec()
        );
        assert_eq!(tree.revision(), 2);
    }

    #[tokio::test]
    async fn test_publish_with_retry_succeeds_without_contention() {
        let tree = DestinationTree::new();
        let result = publish_with_retry(
            &tree,
            &PublishTarget::Branch("devel".to_string()),
            &payload(&[("index.html", "ok")]),
            3,
            Duration::from_millis(1),
        )
        .await
        .unwrap();
        assert!(result.committed);
        assert_eq!(result.path, "branch/devel");
    }
}
