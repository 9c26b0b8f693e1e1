//! Tamper-evident audit logging.
//!
//! Every state-mutating operation appends one entry to a per-tenant,
//! append-only log. Entries are hash-chained: `self_hash` commits to the
//! previous entry's `self_hash` plus the canonical encoding of the entry
//! body, so truncation, reordering, or in-place edits are detectable by
//! re-walking the chain. The first entry chains from an all-zero
//! sentinel.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::{
    canonical,
    errors::VcsError,
    hash::ObjectHash,
    internal::storage::StorageBackend,
};

/// Bound on re-chaining attempts when concurrent appenders race on the
/// next sequence number.
const MAX_APPEND_ATTEMPTS: usize = 8;

/// One hash-chained audit record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    /// Position in the tenant's log, starting at 0.
    pub seq: u64,
    /// `self_hash` of the previous entry; all-zero sentinel for seq 0.
    pub prev_hash: ObjectHash,
    pub timestamp: DateTime<Utc>,
    /// Who performed the operation (commit author or system identity).
    pub actor: String,
    /// Operation name: `commit`, `merge`, `revert`, `branch`, `gc`, ...
    pub action: String,
    /// Commit produced by the operation, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<ObjectHash>,
    /// Operation-specific payload.
    pub details: Value,
    /// `SHA-256(prev_hash_hex ‖ canonical(body))`.
    pub self_hash: ObjectHash,
}

impl AuditEntry {
    /// Build the entry following `prev` (or the chain head when `None`)
    /// and seal it with its chained hash.
    pub fn chained(
        prev: Option<&AuditEntry>,
        actor: impl Into<String>,
        action: impl Into<String>,
        commit_hash: Option<ObjectHash>,
        details: Value,
    ) -> Self {
        let (seq, prev_hash) = match prev {
            Some(p) => (p.seq + 1, p.self_hash),
            None => (0, ObjectHash::ZERO),
        };
        let mut entry = AuditEntry {
            seq,
            prev_hash,
            timestamp: Utc::now(),
            actor: actor.into(),
            action: action.into(),
            commit_hash,
            details,
            self_hash: ObjectHash::ZERO,
        };
        entry.self_hash = entry.compute_self_hash();
        entry
    }

    /// The canonical body the chained hash commits to: every field except
    /// `prev_hash` and `self_hash`.
    fn body_value(&self) -> Value {
        let mut body = json!({
            "seq": self.seq,
            "timestamp": self.timestamp,
            "actor": self.actor,
            "action": self.action,
            "details": self.details,
        });
        if let Some(hash) = &self.commit_hash {
            body["commit_hash"] = json!(hash);
        }
        body
    }

    /// Recompute the chained hash from the entry's contents.
    pub fn compute_self_hash(&self) -> ObjectHash {
        let mut hasher = Sha256::new();
        hasher.update(self.prev_hash.to_hex().as_bytes());
        hasher.update(canonical::canonical_bytes(&self.body_value()));
        ObjectHash::new(hasher.finalize().into())
    }

    /// True when `self_hash` matches the entry's contents.
    pub fn is_sealed(&self) -> bool {
        self.compute_self_hash() == self.self_hash
    }
}

/// Append and verification operations over a tenant's audit chain.
pub struct AuditLog {
    backend: Arc<dyn StorageBackend>,
}

impl AuditLog {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Append one entry, re-chaining and retrying a bounded number of
    /// times if a concurrent appender claims the next sequence number
    /// first. Appends are linearizable with respect to reads.
    pub async fn append(
        &self,
        actor: &str,
        action: &str,
        commit_hash: Option<ObjectHash>,
        details: Value,
    ) -> Result<AuditEntry, VcsError> {
        let mut last_err = None;
        for _ in 0..MAX_APPEND_ATTEMPTS {
            let prev = self.backend.last_log_entry().await?;
            let entry =
                AuditEntry::chained(prev.as_ref(), actor, action, commit_hash, details.clone());
            match self.backend.append_log(&entry).await {
                Ok(()) => {
                    tracing::debug!(seq = entry.seq, action, "audit entry appended");
                    return Ok(entry);
                }
                Err(err @ VcsError::Conflict { .. }) => {
                    last_err = Some(err);
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            VcsError::BackendUnavailable("audit append retries exhausted".into())
        }))
    }

    /// Read entries in sequence order.
    pub async fn read(&self, start_seq: u64, limit: usize) -> Result<Vec<AuditEntry>, VcsError> {
        self.backend.read_log(start_seq, limit).await
    }

    /// Recompute every chained hash in `[from_seq, to_seq]` (defaulting to
    /// the full chain) and check linkage. Returns the number of entries
    /// verified; fails with `ChainBroken(seq)` at the first mismatch.
    pub async fn verify_chain(
        &self,
        from_seq: Option<u64>,
        to_seq: Option<u64>,
    ) -> Result<u64, VcsError> {
        // Start one entry early so the first requested entry's prev_hash
        // linkage can be checked too.
        let start = from_seq.unwrap_or(0).saturating_sub(1);
        let mut cursor = start;
        let mut prev: Option<AuditEntry> = None;
        let mut verified = 0u64;
        loop {
            let batch = self.backend.read_log(cursor, 256).await?;
            if batch.is_empty() {
                break;
            }
            for entry in batch {
                if let Some(to) = to_seq {
                    if entry.seq > to {
                        return Ok(verified);
                    }
                }
                if !entry.is_sealed() {
                    return Err(VcsError::ChainBroken(entry.seq));
                }
                match &prev {
                    Some(p) => {
                        if entry.seq != p.seq + 1 || entry.prev_hash != p.self_hash {
                            return Err(VcsError::ChainBroken(entry.seq));
                        }
                    }
                    None => {
                        if entry.seq == 0 && entry.prev_hash != ObjectHash::ZERO {
                            return Err(VcsError::ChainBroken(0));
                        }
                    }
                }
                cursor = entry.seq + 1;
                prev = Some(entry);
                verified += 1;
            }
        }
        Ok(verified)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn first_entry_chains_from_zero_sentinel() {
        let entry = AuditEntry::chained(None, "agent", "commit", None, json!({}));
        assert_eq!(entry.seq, 0);
        assert_eq!(entry.prev_hash, ObjectHash::ZERO);
        assert!(entry.is_sealed());
    }

    #[test]
    fn chain_links_consecutive_entries() {
        let a = AuditEntry::chained(None, "agent", "commit", None, json!({"n": 1}));
        let b = AuditEntry::chained(Some(&a), "agent", "commit", None, json!({"n": 2}));
        assert_eq!(b.seq, 1);
        assert_eq!(b.prev_hash, a.self_hash);
        assert!(b.is_sealed());
    }

    #[test]
    fn tampered_details_break_the_seal() {
        let mut entry = AuditEntry::chained(None, "agent", "commit", None, json!({"n": 1}));
        entry.details = json!({"n": 2});
        assert!(!entry.is_sealed());
    }

    #[test]
    fn commit_hash_participates_in_the_seal() {
        let with = AuditEntry::chained(
            None,
            "agent",
            "commit",
            Some(ObjectHash::compute(b"c")),
            json!({}),
        );
        let mut without = with.clone();
        without.commit_hash = None;
        assert!(!without.is_sealed());
    }
}
