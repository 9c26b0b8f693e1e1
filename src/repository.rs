//! The repository orchestrator.
//!
//! `Repository` wires one tenant's storage backend, object store,
//! reference manager, and audit log together and exposes the versioning
//! operations: commit, branch, checkout, diff, merge, revert, log,
//! status, squash, chain verification, and garbage collection. It owns
//! the storage handle; objects and refs are borrowed from the store for
//! the duration of a single operation.
//!
//! Concurrency: callers may invoke operations from multiple threads.
//! Branch advances serialize through the backend's `cas_ref`; a CAS loss
//! surfaces as `Conflict` and is never retried here (the caller
//! re-resolves HEAD and retries). The only internal lock is a
//! read-write gate that lets commits proceed concurrently while giving
//! the garbage collector exclusivity; it is never held across a
//! suspension point outside the guarded operation itself.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio::sync::RwLock;

use crate::{
    config::RepositoryConfig,
    diff::{StateDiff, diff_states},
    errors::VcsError,
    gc::{GcPolicy, GcReport, collect},
    hash::ObjectHash,
    internal::{
        audit::{AuditEntry, AuditLog},
        object::{
            ObjectKind,
            commit::{ActionType, Commit},
            state::AgentState,
            store::ObjectStore,
        },
        storage::{StorageBackend, open_backend},
    },
    merge::{MergeStrategy, merge_base, three_way},
    refs::{Head, RefManager},
};

/// Snapshot of the repository's position.
#[derive(Debug, Clone, Serialize)]
pub struct RepoStatus {
    /// Commit HEAD resolves to; `None` before the first commit.
    pub head: Option<ObjectHash>,
    /// Attached branch; `None` in detached mode.
    pub current_branch: Option<String>,
    pub branches: BTreeMap<String, ObjectHash>,
}

/// Result of a merge: the new commit plus any conflict paths that were
/// resolved to the current branch's side.
#[derive(Debug, Clone, Serialize)]
pub struct MergeOutcome {
    pub commit: ObjectHash,
    pub conflicts: Vec<Vec<String>>,
}

/// One tenant's content-addressed version history.
pub struct Repository {
    config: RepositoryConfig,
    backend: Arc<dyn StorageBackend>,
    store: ObjectStore,
    refs: RefManager,
    audit: AuditLog,
    /// Commits take this shared; GC takes it exclusive.
    op_gate: RwLock<()>,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Repository {
    /// Open (and initialize, if needed) the repository for the tenant
    /// selected by `config`.
    pub async fn open(config: RepositoryConfig) -> Result<Self, VcsError> {
        if config.tenant_id.trim().is_empty() {
            return Err(VcsError::InvalidName("tenant_id must be non-empty".into()));
        }
        let backend = open_backend(&config).await?;
        let store = ObjectStore::new(backend.clone());
        let refs = RefManager::open(backend.clone()).await?;
        let audit = AuditLog::new(backend.clone());
        tracing::debug!(tenant = %config.tenant_id, "repository opened");
        Ok(Self {
            config,
            backend,
            store,
            refs,
            audit,
            op_gate: RwLock::new(()),
        })
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    pub(crate) fn store(&self) -> &ObjectStore {
        &self.store
    }

    pub(crate) fn refs(&self) -> &RefManager {
        &self.refs
    }

    /// Backend handle, for migration between repositories.
    pub fn backend(&self) -> Arc<dyn StorageBackend> {
        self.backend.clone()
    }

    pub async fn close(&self) -> Result<(), VcsError> {
        self.backend.close().await
    }

    pub async fn healthcheck(&self) -> Result<(), VcsError> {
        self.backend.healthcheck().await
    }

    /// Snapshot `state` as a new commit on the current branch (or the
    /// detached HEAD). Exactly one new commit object, at most one new
    /// blob, one ref update, one audit entry. Fails with `Conflict` when
    /// a concurrent writer advanced the branch first.
    pub async fn commit(
        &self,
        state: &AgentState,
        message: &str,
        action_type: ActionType,
        author: &str,
    ) -> Result<ObjectHash, VcsError> {
        state.validate()?;
        let _gate = self.op_gate.read().await;
        let tree_hash = self.store.put_state(state).await?;
        let head = self.refs.head().await;
        let parent = self.refs.resolve_head().await?;
        let commit = Commit::new(
            tree_hash,
            parent.into_iter().collect(),
            message,
            author,
            Utc::now(),
            action_type,
        )?;
        self.store.put_commit(&commit).await?;
        match &head {
            Head::Attached { branch } => {
                self.refs.advance(branch, parent.as_ref(), &commit.id).await?;
                if parent.is_none() {
                    // The initial commit births the branch; persist the
                    // attachment so reopening lands on it.
                    self.refs.attach(branch).await?;
                }
            }
            Head::Detached { .. } => self.refs.move_detached(&commit.id).await?,
        }
        self.audit
            .append(
                author,
                "commit",
                Some(commit.id),
                json!({"message": message, "action_type": action_type}),
            )
            .await?;
        tracing::info!(commit = %commit.id, action = %action_type, "committed");
        Ok(commit.id)
    }

    /// Create a branch at `from` (a branch name, a commit hash, or the
    /// default: HEAD).
    pub async fn branch(&self, name: &str, from: Option<&str>) -> Result<(), VcsError> {
        let target = match from {
            None => self
                .refs
                .resolve_head()
                .await?
                .ok_or_else(|| VcsError::NotFound("HEAD has no commit yet".into()))?,
            Some(source) => self.resolve_commitish(source).await?,
        };
        self.refs.create_branch(name, &target).await?;
        self.audit
            .append(
                "system",
                "branch",
                Some(target),
                json!({"name": name, "from": from}),
            )
            .await?;
        tracing::info!(branch = name, at = %target, "branch created");
        Ok(())
    }

    /// Delete a branch; refuses the currently attached branch.
    pub async fn delete_branch(&self, name: &str) -> Result<(), VcsError> {
        self.refs.delete_branch(name).await?;
        self.audit
            .append("system", "delete_branch", None, json!({"name": name}))
            .await?;
        Ok(())
    }

    /// Check out a branch (attaching HEAD) or a commit hash (detaching
    /// it) and return the state at that position.
    pub async fn checkout(&self, target: &str) -> Result<AgentState, VcsError> {
        let tip = if self.refs.resolve_branch(target).await?.is_some() {
            self.refs.checkout_branch(target).await?
        } else {
            let hash: ObjectHash = target
                .parse()
                .map_err(|_| VcsError::NotFound(target.to_string()))?;
            if !self.store.exists(ObjectKind::Commit, &hash).await? {
                return Err(VcsError::NotFound(target.to_string()));
            }
            self.refs.checkout_detached(&hash).await?;
            hash
        };
        let state = self.state_at(&tip).await?;
        self.audit
            .append("system", "checkout", Some(tip), json!({"target": target}))
            .await?;
        Ok(state)
    }

    /// Structural diff between the states of two commits.
    pub async fn diff(&self, base: &ObjectHash, target: &ObjectHash) -> Result<StateDiff, VcsError> {
        let base_state = self.state_at(base).await?;
        let target_state = self.state_at(target).await?;
        Ok(StateDiff {
            base: *base,
            target: *target,
            entries: diff_states(&base_state, &target_state)?,
        })
    }

    /// Merge `branch` into the current position with the default
    /// lossless conflict policy.
    pub async fn merge(
        &self,
        branch: &str,
        strategy: MergeStrategy,
        author: &str,
    ) -> Result<MergeOutcome, VcsError> {
        self.merge_opts(branch, strategy, author, false).await
    }

    /// Merge with an explicit conflict policy. In strict mode a
    /// three-way conflict fails with `MergeConflict` instead of
    /// resolving to the current side.
    pub async fn merge_opts(
        &self,
        branch: &str,
        strategy: MergeStrategy,
        author: &str,
        strict: bool,
    ) -> Result<MergeOutcome, VcsError> {
        let _gate = self.op_gate.read().await;
        let head = self.refs.head().await;
        let ours_tip = self
            .refs
            .resolve_head()
            .await?
            .ok_or_else(|| VcsError::NotFound("HEAD has no commit yet".into()))?;
        let theirs_tip = self
            .refs
            .resolve_branch(branch)
            .await?
            .ok_or_else(|| VcsError::BranchNotFound(branch.to_string()))?;
        let ours_state = self.state_at(&ours_tip).await?;
        let theirs_state = self.state_at(&theirs_tip).await?;

        let (merged_state, conflicts) = match strategy {
            MergeStrategy::Ours => (ours_state, Vec::new()),
            MergeStrategy::Theirs => (theirs_state, Vec::new()),
            MergeStrategy::ThreeWay => {
                let base = merge_base(
                    &self.store,
                    ours_tip,
                    theirs_tip,
                    self.config.merge_base_depth_limit,
                )
                .await?;
                let base_value = match &base {
                    Some(hash) => Some(self.state_at(hash).await?.canonical_value()?),
                    None => None,
                };
                let merged = three_way(
                    base_value.as_ref(),
                    &ours_state.canonical_value()?,
                    &theirs_state.canonical_value()?,
                    strict,
                )?;
                if !merged.conflicts.is_empty() {
                    tracing::warn!(
                        branch,
                        conflicts = merged.conflicts.len(),
                        "merge conflicts resolved to current side"
                    );
                }
                (AgentState::from_value(merged.value)?, merged.conflicts)
            }
        };

        let tree_hash = self.store.put_state(&merged_state).await?;
        let commit = Commit::new(
            tree_hash,
            vec![ours_tip, theirs_tip],
            format!("Merge branch '{branch}'"),
            author,
            Utc::now(),
            ActionType::Merge,
        )?;
        self.store.put_commit(&commit).await?;
        match &head {
            Head::Attached { branch } => {
                self.refs.advance(branch, Some(&ours_tip), &commit.id).await?;
            }
            Head::Detached { .. } => self.refs.move_detached(&commit.id).await?,
        }
        self.audit
            .append(
                author,
                "merge",
                Some(commit.id),
                json!({
                    "branch": branch,
                    "strategy": strategy,
                    "conflicts": conflicts,
                }),
            )
            .await?;
        tracing::info!(commit = %commit.id, branch, "merged");
        Ok(MergeOutcome {
            commit: commit.id,
            conflicts,
        })
    }

    /// Restore the state of an earlier commit as a new commit on top of
    /// the current HEAD. History is never rewritten.
    pub async fn revert(&self, target: &ObjectHash, author: &str) -> Result<AgentState, VcsError> {
        let _gate = self.op_gate.read().await;
        let target_commit = self.store.get_commit(target).await?;
        let state = self.store.get_state(&target_commit.tree_hash).await?;
        let head = self.refs.head().await;
        let parent = self.refs.resolve_head().await?;
        let commit = Commit::new(
            target_commit.tree_hash,
            parent.into_iter().collect(),
            format!("Revert to {target}"),
            author,
            Utc::now(),
            ActionType::Rollback,
        )?;
        self.store.put_commit(&commit).await?;
        match &head {
            Head::Attached { branch } => {
                self.refs.advance(branch, parent.as_ref(), &commit.id).await?;
                if parent.is_none() {
                    self.refs.attach(branch).await?;
                }
            }
            Head::Detached { .. } => self.refs.move_detached(&commit.id).await?,
        }
        self.audit
            .append(author, "revert", Some(commit.id), json!({"target": target}))
            .await?;
        tracing::info!(commit = %commit.id, target = %target, "reverted");
        Ok(state)
    }

    /// History from a branch tip (default HEAD): breadth-first over
    /// parents, each commit visited once, sorted by timestamp descending,
    /// truncated to `limit`.
    pub async fn log(
        &self,
        branch: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<Commit>, VcsError> {
        let limit = limit.unwrap_or(self.config.log_limit_default);
        let tip = match branch {
            Some(name) => Some(
                self.refs
                    .resolve_branch(name)
                    .await?
                    .ok_or_else(|| VcsError::BranchNotFound(name.to_string()))?,
            ),
            None => self.refs.resolve_head().await?,
        };
        let Some(tip) = tip else {
            return Ok(Vec::new());
        };
        let mut visited: HashSet<ObjectHash> = HashSet::new();
        let mut queue = VecDeque::from([tip]);
        let mut commits = Vec::new();
        while let Some(hash) = queue.pop_front() {
            if !visited.insert(hash) {
                continue;
            }
            // Defends against cycles in a corrupted store.
            if visited.len() > self.config.merge_base_depth_limit {
                return Err(VcsError::DepthLimitExceeded(
                    self.config.merge_base_depth_limit,
                ));
            }
            let commit = self.store.get_commit(&hash).await?;
            queue.extend(commit.parent_hashes.iter().copied());
            commits.push(commit);
        }
        commits.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        commits.truncate(limit);
        Ok(commits)
    }

    pub async fn status(&self) -> Result<RepoStatus, VcsError> {
        Ok(RepoStatus {
            head: self.refs.resolve_head().await?,
            current_branch: self.refs.current_branch().await,
            branches: self.refs.list_branches().await?,
        })
    }

    /// Commit HEAD currently resolves to.
    pub async fn head(&self) -> Result<Option<ObjectHash>, VcsError> {
        self.refs.resolve_head().await
    }

    /// State stored at a commit.
    pub async fn state_at(&self, commit: &ObjectHash) -> Result<AgentState, VcsError> {
        let commit = self.store.get_commit(commit).await?;
        self.store.get_state(&commit.tree_hash).await
    }

    /// Commit record by hash.
    pub async fn commit_at(&self, hash: &ObjectHash) -> Result<Commit, VcsError> {
        self.store.get_commit(hash).await
    }

    /// Collapse the newest `n` commits of `branch` into one commit with
    /// the same tree, parented on the `(n+1)`-th ancestor. The
    /// superseded commits become garbage for a later collection.
    pub async fn squash(&self, branch: &str, n: usize) -> Result<ObjectHash, VcsError> {
        let _gate = self.op_gate.read().await;
        let tip = self
            .refs
            .resolve_branch(branch)
            .await?
            .ok_or_else(|| VcsError::BranchNotFound(branch.to_string()))?;
        if n < 2 {
            return Ok(tip);
        }
        // First-parent chain only: merge side history stays reachable
        // through the squashed commit's replacement parent.
        let mut chain = Vec::with_capacity(n);
        let mut cursor = Some(tip);
        while chain.len() < n {
            let Some(hash) = cursor else { break };
            let commit = self.store.get_commit(&hash).await?;
            cursor = commit.parent_hashes.first().copied();
            chain.push(commit);
        }
        let tip_commit = &chain[0];
        let message = chain
            .iter()
            .map(|c| c.message.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let squashed = Commit::new(
            tip_commit.tree_hash,
            cursor.into_iter().collect(),
            message,
            tip_commit.author.clone(),
            Utc::now(),
            ActionType::Checkpoint,
        )?;
        self.store.put_commit(&squashed).await?;
        self.refs.advance(branch, Some(&tip), &squashed.id).await?;
        self.audit
            .append(
                "system",
                "squash",
                Some(squashed.id),
                json!({"branch": branch, "count": chain.len()}),
            )
            .await?;
        tracing::info!(branch, commits = chain.len(), new = %squashed.id, "squashed");
        Ok(squashed.id)
    }

    /// Mark–sweep collection of unreachable objects. Takes the exclusive
    /// gate, so concurrent commits on this instance wait.
    pub async fn gc(&self, policy: &GcPolicy) -> Result<GcReport, VcsError> {
        let _gate = self.op_gate.write().await;
        let report = collect(&self.store, &self.refs, policy, None).await?;
        if !policy.dry_run {
            self.audit
                .append("system", "gc", None, serde_json::to_value(&report)?)
                .await?;
        }
        Ok(report)
    }

    /// Verify the audit chain; see [`AuditLog::verify_chain`].
    pub async fn verify_chain(
        &self,
        from_seq: Option<u64>,
        to_seq: Option<u64>,
    ) -> Result<u64, VcsError> {
        self.audit.verify_chain(from_seq, to_seq).await
    }

    /// Read raw audit entries.
    pub async fn audit_entries(
        &self,
        start_seq: u64,
        limit: usize,
    ) -> Result<Vec<AuditEntry>, VcsError> {
        self.audit.read(start_seq, limit).await
    }

    pub(crate) fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub(crate) async fn exclusive_gate(&self) -> tokio::sync::RwLockWriteGuard<'_, ()> {
        self.op_gate.write().await
    }

    /// Delete every object, ref, and audit entry of this tenant.
    pub async fn destroy_tenant(&self) -> Result<(), VcsError> {
        let _gate = self.op_gate.write().await;
        self.backend.purge_tenant().await
    }

    async fn resolve_commitish(&self, source: &str) -> Result<ObjectHash, VcsError> {
        if let Some(tip) = self.refs.resolve_branch(source).await? {
            return Ok(tip);
        }
        let hash: ObjectHash = source
            .parse()
            .map_err(|_| VcsError::NotFound(source.to_string()))?;
        if !self.store.exists(ObjectKind::Commit, &hash).await? {
            return Err(VcsError::NotFound(source.to_string()));
        }
        Ok(hash)
    }
}
