//! Branch references and the HEAD selector.
//!
//! Branches are mutable name → commit mappings stored through the
//! backend's ref primitives; HEAD is the distinguished ref selecting the
//! current position, either attached to a branch (symbolic `ref: <name>`
//! value) or detached at a commit hash. Branch advances go through
//! `cas_ref` with the expected previous tip, so two writers racing on the
//! same branch produce exactly one success and one `Conflict`.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::{errors::VcsError, hash::ObjectHash, internal::storage::StorageBackend};

/// Name of the distinguished selector ref.
pub const HEAD_REF: &str = "HEAD";
/// Branch auto-created by the initial commit.
pub const DEFAULT_BRANCH: &str = "main";
const SYMBOLIC_PREFIX: &str = "ref: ";

/// Current position in the commit DAG.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Head {
    /// HEAD follows a branch; commits advance the branch tip.
    Attached { branch: String },
    /// HEAD points at a fixed commit; commits move HEAD itself.
    Detached { hash: ObjectHash },
}

/// Internal refs never name branches: the HEAD selector and the
/// dot-prefixed markers the storage layer reserves for itself (such as
/// the encryption marker).
pub(crate) fn is_internal_ref(name: &str) -> bool {
    name == HEAD_REF || name.starts_with('.')
}

/// Reject names that are empty, contain whitespace, shadow an internal
/// ref, or could be mistaken for a commit hash during checkout
/// resolution.
pub fn validate_branch_name(name: &str) -> Result<(), VcsError> {
    if name.is_empty()
        || name.chars().any(char::is_whitespace)
        || is_internal_ref(name)
        || ObjectHash::is_valid(name)
    {
        return Err(VcsError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Branch bookkeeping for one repository instance.
pub struct RefManager {
    backend: Arc<dyn StorageBackend>,
    head: RwLock<Head>,
}

impl RefManager {
    /// Load the persisted HEAD, defaulting to an unborn `main`.
    pub async fn open(backend: Arc<dyn StorageBackend>) -> Result<Self, VcsError> {
        let head = match backend.get_ref(HEAD_REF).await? {
            Some(value) => match value.strip_prefix(SYMBOLIC_PREFIX) {
                Some(branch) => Head::Attached {
                    branch: branch.to_string(),
                },
                None => Head::Detached {
                    hash: value
                        .parse()
                        .map_err(|_| VcsError::Corrupt(format!("HEAD value `{value}`")))?,
                },
            },
            None => Head::Attached {
                branch: DEFAULT_BRANCH.to_string(),
            },
        };
        Ok(Self {
            backend,
            head: RwLock::new(head),
        })
    }

    pub async fn head(&self) -> Head {
        self.head.read().await.clone()
    }

    /// Branch HEAD is attached to, if any.
    pub async fn current_branch(&self) -> Option<String> {
        match &*self.head.read().await {
            Head::Attached { branch } => Some(branch.clone()),
            Head::Detached { .. } => None,
        }
    }

    /// Commit HEAD points at; `None` while the attached branch is unborn.
    pub async fn resolve_head(&self) -> Result<Option<ObjectHash>, VcsError> {
        match self.head().await {
            Head::Attached { branch } => self.resolve_branch(&branch).await,
            Head::Detached { hash } => Ok(Some(hash)),
        }
    }

    pub async fn resolve_branch(&self, name: &str) -> Result<Option<ObjectHash>, VcsError> {
        if is_internal_ref(name) {
            return Ok(None);
        }
        match self.backend.get_ref(name).await? {
            Some(value) => Ok(Some(value.parse().map_err(|_| {
                VcsError::Corrupt(format!("branch `{name}` value `{value}`"))
            })?)),
            None => Ok(None),
        }
    }

    /// Unconditional branch write.
    pub async fn set_branch(&self, name: &str, hash: &ObjectHash) -> Result<(), VcsError> {
        validate_branch_name(name)?;
        self.backend.set_ref(name, &hash.to_hex()).await
    }

    /// Advance a branch from the expected previous tip.
    pub async fn advance(
        &self,
        name: &str,
        expected: Option<&ObjectHash>,
        new: &ObjectHash,
    ) -> Result<(), VcsError> {
        let expected_hex = expected.map(ObjectHash::to_hex);
        self.backend
            .cas_ref(name, expected_hex.as_deref(), &new.to_hex())
            .await
    }

    /// Create a branch pointing at `from`; atomic against concurrent
    /// creation of the same name.
    pub async fn create_branch(&self, name: &str, from: &ObjectHash) -> Result<(), VcsError> {
        validate_branch_name(name)?;
        match self.backend.cas_ref(name, None, &from.to_hex()).await {
            Ok(()) => Ok(()),
            Err(VcsError::Conflict { .. }) => Err(VcsError::AlreadyExists(name.to_string())),
            Err(err) => Err(err),
        }
    }

    /// Delete a branch; refuses the branch HEAD is attached to.
    pub async fn delete_branch(&self, name: &str) -> Result<(), VcsError> {
        if self.current_branch().await.as_deref() == Some(name) {
            return Err(VcsError::Conflict {
                reference: HEAD_REF.to_string(),
                expected: None,
                actual: Some(name.to_string()),
            });
        }
        if self.backend.get_ref(name).await?.is_none() {
            return Err(VcsError::BranchNotFound(name.to_string()));
        }
        self.backend.delete_ref(name).await
    }

    /// Every branch and its tip; internal refs excluded.
    pub async fn list_branches(&self) -> Result<BTreeMap<String, ObjectHash>, VcsError> {
        let mut out = BTreeMap::new();
        for (name, value) in self.backend.list_refs().await? {
            if is_internal_ref(&name) {
                continue;
            }
            let hash = value.parse().map_err(|_| {
                VcsError::Corrupt(format!("branch `{name}` value `{value}`"))
            })?;
            out.insert(name, hash);
        }
        Ok(out)
    }

    /// Attach HEAD to a branch and return its tip.
    pub async fn checkout_branch(&self, name: &str) -> Result<ObjectHash, VcsError> {
        let Some(tip) = self.resolve_branch(name).await? else {
            return Err(VcsError::BranchNotFound(name.to_string()));
        };
        let mut head = self.head.write().await;
        self.backend
            .set_ref(HEAD_REF, &format!("{SYMBOLIC_PREFIX}{name}"))
            .await?;
        *head = Head::Attached {
            branch: name.to_string(),
        };
        Ok(tip)
    }

    /// Detach HEAD at a specific commit. The caller has already verified
    /// the commit exists.
    pub async fn checkout_detached(&self, hash: &ObjectHash) -> Result<(), VcsError> {
        let mut head = self.head.write().await;
        self.backend.set_ref(HEAD_REF, &hash.to_hex()).await?;
        *head = Head::Detached { hash: *hash };
        Ok(())
    }

    /// Move a detached HEAD to a new commit (used when committing in
    /// detached mode). Detached HEAD is not CAS-protected: last write
    /// wins.
    pub async fn move_detached(&self, hash: &ObjectHash) -> Result<(), VcsError> {
        self.checkout_detached(hash).await
    }

    /// Persist the attachment of HEAD to `branch` without resolving it
    /// (used when the initial commit births the default branch).
    pub async fn attach(&self, branch: &str) -> Result<(), VcsError> {
        validate_branch_name(branch)?;
        let mut head = self.head.write().await;
        self.backend
            .set_ref(HEAD_REF, &format!("{SYMBOLIC_PREFIX}{branch}"))
            .await?;
        *head = Head::Attached {
            branch: branch.to_string(),
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_name_validation() {
        assert!(validate_branch_name("main").is_ok());
        assert!(validate_branch_name("feature/x-1").is_ok());
        assert!(validate_branch_name("").is_err());
        assert!(validate_branch_name("has space").is_err());
        assert!(validate_branch_name("tab\there").is_err());
        assert!(validate_branch_name("HEAD").is_err());
        assert!(validate_branch_name(".encryption").is_err());
        // 64 hex chars would be ambiguous with a commit hash at checkout.
        assert!(validate_branch_name(&"a".repeat(64)).is_err());
        assert!(validate_branch_name(&"a".repeat(63)).is_ok());
    }
}
