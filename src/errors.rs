//! Error types for the agent-vcs crate.
//!
//! This module defines a unified error enumeration used across hashing,
//! object storage, reference management, merging, and audit verification.
//! It integrates with `thiserror` to provide rich `Display` implementations
//! and error source chaining where applicable.
//!
//! Notes:
//! - Each variant maps to exactly one failure condition; callers receive
//!   them unchanged and decide whether to retry (only `Conflict` is safe
//!   to retry after re-resolving HEAD).
//! - `Corrupt` and `ChainBroken` are fatal for the affected tenant and
//!   should quiesce writes.

use thiserror::Error;

#[derive(Error, Debug)]
/// Unified error enumeration for the agent-vcs library.
pub enum VcsError {
    /// Requested object, ref, or commit is absent from the store.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Branch creation collided with an existing branch.
    #[error("Branch `{0}` already exists")]
    AlreadyExists(String),

    /// Malformed branch name (empty, whitespace, reserved, or hash-shaped).
    #[error("Invalid branch name: `{0}`")]
    InvalidName(String),

    /// Stored bytes do not rehash to the expected value, or an AEAD tag
    /// check failed on decryption.
    #[error("Corrupt object: {0}")]
    Corrupt(String),

    /// Compare-and-set on a reference lost to a concurrent writer.
    #[error("Conflict on ref `{reference}`: expected {expected:?}, actual {actual:?}")]
    Conflict {
        reference: String,
        expected: Option<String>,
        actual: Option<String>,
    },

    /// Merge or delete targeted a branch that does not exist.
    #[error("Branch not found: `{0}`")]
    BranchNotFound(String),

    /// Strict three-way merge encountered irreconcilable paths.
    #[error("Merge conflict at paths {0:?}")]
    MergeConflict(Vec<String>),

    /// Ancestor traversal exceeded the configured depth bound.
    #[error("Ancestor traversal exceeded depth limit of {0}")]
    DepthLimitExceeded(usize),

    /// Audit chain verification failed at the given sequence number.
    #[error("Audit chain broken at seq {0}")]
    ChainBroken(u64),

    /// Transient I/O, connection, or service error from a storage backend.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The tenant was initialized with encryption but no passphrase was
    /// supplied when opening the repository.
    #[error("Tenant requires an encryption passphrase that was not supplied")]
    EncryptionKeyMissing,
}

impl From<sea_orm::DbErr> for VcsError {
    fn from(err: sea_orm::DbErr) -> Self {
        VcsError::BackendUnavailable(err.to_string())
    }
}

impl From<std::io::Error> for VcsError {
    fn from(err: std::io::Error) -> Self {
        VcsError::BackendUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for VcsError {
    fn from(err: serde_json::Error) -> Self {
        VcsError::Corrupt(err.to_string())
    }
}
