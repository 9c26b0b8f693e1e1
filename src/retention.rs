//! Retention policy sweeps.
//!
//! Retention composes the squash and collection machinery into a policy
//! pass: per-branch history is truncated to `max_commits` by collapsing
//! the oldest prefix into a single checkpoint commit, and objects older
//! than `max_age_secs` that no ref can reach are collected. The sweep is
//! idempotent: re-running it against a repository already within policy
//! changes nothing, and a run interrupted mid-way resumes naturally
//! because every step re-derives its work from current state.

use std::collections::HashSet;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    errors::VcsError,
    gc::{GcPolicy, GcReport, collect},
    hash::ObjectHash,
    internal::object::commit::{ActionType, Commit},
    repository::Repository,
};

/// Limits applied by a retention sweep.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Collect unreachable commits older than this.
    #[serde(default)]
    pub max_age_secs: Option<u64>,
    /// Truncate each branch's first-parent history to this many commits.
    #[serde(default)]
    pub max_commits: Option<usize>,
    /// Branches exempt from truncation (and always reachable for the
    /// age-based collection).
    #[serde(default)]
    pub keep_branches: HashSet<String>,
}

/// Outcome of one retention sweep.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetentionReport {
    pub truncated_branches: u64,
    pub gc: Option<GcReport>,
}

impl Repository {
    /// Apply a retention policy to every branch, then collect what fell
    /// out of reach.
    pub async fn retention_sweep(
        &self,
        policy: &RetentionPolicy,
    ) -> Result<RetentionReport, VcsError> {
        let _gate = self.exclusive_gate().await;
        let mut report = RetentionReport::default();
        if let Some(max_commits) = policy.max_commits {
            // Truncation below zero-length history is meaningless; one
            // commit is the floor.
            let max_commits = max_commits.max(1);
            for (branch, tip) in self.refs().list_branches().await? {
                if policy.keep_branches.contains(&branch) {
                    continue;
                }
                if self.truncate_branch(&branch, &tip, max_commits).await? {
                    report.truncated_branches += 1;
                }
            }
        }
        if let Some(max_age) = policy.max_age_secs {
            let cutoff = Utc::now() - Duration::seconds(max_age as i64);
            let gc_policy = GcPolicy {
                keep_branches: policy.keep_branches.clone(),
                keep_last_n: 0,
                dry_run: false,
            };
            let gc_report = collect(self.store(), self.refs(), &gc_policy, Some(cutoff)).await?;
            report.gc = Some(gc_report);
        }
        self.audit()
            .append(
                "system",
                "retention",
                None,
                json!({
                    "policy": policy,
                    "truncated_branches": report.truncated_branches,
                }),
            )
            .await?;
        Ok(report)
    }

    /// Rewrite one branch so its first-parent history has at most
    /// `max_commits` entries: the oldest prefix collapses into a single
    /// checkpoint commit, the newer commits are replayed on top with
    /// their trees, messages, and timestamps intact. Returns whether the
    /// branch changed.
    async fn truncate_branch(
        &self,
        branch: &str,
        tip: &ObjectHash,
        max_commits: usize,
    ) -> Result<bool, VcsError> {
        let depth_limit = self.config().merge_base_depth_limit;
        let mut chain: Vec<Commit> = Vec::new();
        let mut cursor = Some(*tip);
        while let Some(hash) = cursor {
            if chain.len() > depth_limit {
                return Err(VcsError::DepthLimitExceeded(depth_limit));
            }
            let commit = self.store().get_commit(&hash).await?;
            cursor = commit.parent_hashes.first().copied();
            chain.push(commit);
        }
        if chain.len() <= max_commits {
            return Ok(false);
        }

        // Oldest `len - max + 1` commits collapse into one checkpoint.
        let keep = max_commits - 1;
        let (replay, squashed) = chain.split_at(keep);
        let message = squashed
            .iter()
            .map(|c| c.message.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let head_of_squashed = &squashed[0];
        let checkpoint = Commit::new(
            head_of_squashed.tree_hash,
            Vec::new(),
            message,
            head_of_squashed.author.clone(),
            head_of_squashed.timestamp,
            ActionType::Checkpoint,
        )?;
        self.store().put_commit(&checkpoint).await?;

        // Replay the surviving commits oldest-first; merge side parents
        // beyond the first are preserved.
        let mut parent = checkpoint.id;
        for old in replay.iter().rev() {
            let mut parents = vec![parent];
            parents.extend(old.parent_hashes.iter().skip(1).copied());
            let rewritten = Commit::new(
                old.tree_hash,
                parents,
                old.message.clone(),
                old.author.clone(),
                old.timestamp,
                old.action_type,
            )?;
            self.store().put_commit(&rewritten).await?;
            parent = rewritten.id;
        }
        self.refs().advance(branch, Some(tip), &parent).await?;
        tracing::info!(
            branch,
            kept = max_commits,
            squashed = squashed.len(),
            "branch history truncated"
        );
        Ok(true)
    }
}
