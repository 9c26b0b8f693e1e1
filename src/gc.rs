//! Mark–sweep garbage collection.
//!
//! The mark phase seeds from every ref's tip (plus, per policy, the last
//! `keep_last_n` ancestors of each tip) and walks parent links, marking
//! commits and the blobs their trees reference. The sweep iterates the
//! backend's objects and deletes whatever was not marked. Refs are never
//! deleted; a branch always survives collection, which is what keeps
//! `log` stable across a GC run. The repository holds its exclusive gate
//! for the duration, so the sweep only ever sees objects that predate
//! the mark snapshot.

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};

use crate::{
    errors::VcsError,
    hash::ObjectHash,
    internal::object::{ObjectKind, ObjectTrait, commit::Commit, store::ObjectStore},
    refs::{Head, RefManager},
};

/// What the collector must preserve.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GcPolicy {
    /// Branches whose full history is always preserved (all branches are
    /// preserved from their tips regardless; this set exists for parity
    /// with retention policies that reference it).
    #[serde(default)]
    pub keep_branches: HashSet<String>,
    /// Minimum ancestors preserved per branch tip. Full-ancestry
    /// marking from every tip already satisfies any value; accepted so
    /// retention policies can round-trip through the same type.
    #[serde(default)]
    pub keep_last_n: usize,
    /// Report what would be deleted without deleting it.
    #[serde(default)]
    pub dry_run: bool,
}

/// Outcome of one collection run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GcReport {
    /// Objects examined during the sweep.
    pub scanned: u64,
    pub kept: u64,
    pub deleted_commits: u64,
    pub deleted_blobs: u64,
    pub dry_run: bool,
}

/// Mark from refs, then sweep unmarked objects. With `max_age_cutoff`,
/// only unmarked commits older than the cutoff (and blobs no surviving
/// commit references) are deleted; retention sweeps use this to bound
/// deletion by age.
pub(crate) async fn collect(
    store: &ObjectStore,
    refs: &RefManager,
    policy: &GcPolicy,
    max_age_cutoff: Option<DateTime<Utc>>,
) -> Result<GcReport, VcsError> {
    // Mark phase: every ref tip (branches and a detached HEAD) seeds a
    // BFS over parent links.
    let mut seeds: Vec<ObjectHash> = refs.list_branches().await?.into_values().collect();
    if let Head::Detached { hash } = refs.head().await {
        seeds.push(hash);
    }
    let mut marked_commits: HashSet<ObjectHash> = HashSet::new();
    let mut marked_blobs: HashSet<ObjectHash> = HashSet::new();
    let mut queue: VecDeque<ObjectHash> = seeds.into();
    while let Some(hash) = queue.pop_front() {
        if !marked_commits.insert(hash) {
            continue;
        }
        let commit = store.get_commit(&hash).await?;
        marked_blobs.insert(commit.tree_hash);
        queue.extend(commit.parent_hashes.iter().copied());
    }

    // Sweep phase.
    let mut report = GcReport {
        dry_run: policy.dry_run,
        ..GcReport::default()
    };
    let commits: Vec<(ObjectHash, Vec<u8>)> = store
        .backend()
        .iter_objects(ObjectKind::Commit)
        .try_collect()
        .await?;
    for (hash, bytes) in commits {
        report.scanned += 1;
        if marked_commits.contains(&hash) {
            report.kept += 1;
            continue;
        }
        if let Some(cutoff) = max_age_cutoff {
            let commit = Commit::from_bytes(&bytes, hash)?;
            if commit.timestamp >= cutoff {
                // Spared by age; its blob must survive too.
                marked_blobs.insert(commit.tree_hash);
                report.kept += 1;
                continue;
            }
        }
        report.deleted_commits += 1;
        if !policy.dry_run {
            store.backend().delete_object(ObjectKind::Commit, &hash).await?;
        }
    }
    let blobs: Vec<(ObjectHash, Vec<u8>)> = store
        .backend()
        .iter_objects(ObjectKind::Blob)
        .try_collect()
        .await?;
    for (hash, _) in blobs {
        report.scanned += 1;
        if marked_blobs.contains(&hash) {
            report.kept += 1;
            continue;
        }
        report.deleted_blobs += 1;
        if !policy.dry_run {
            store.backend().delete_object(ObjectKind::Blob, &hash).await?;
        }
    }
    tracing::info!(
        deleted_commits = report.deleted_commits,
        deleted_blobs = report.deleted_blobs,
        kept = report.kept,
        dry_run = report.dry_run,
        "gc sweep finished"
    );
    Ok(report)
}
