//! Object model definitions for agent-vcs: state blobs, commits, and the
//! supporting traits that let the storage layer create strongly typed
//! values from raw canonical bytes.
//!
//! All objects are immutable values addressed by the SHA-256 hash of
//! their canonical JSON encoding. A [`Blob`](blob::Blob) carries one
//! serialized [`AgentState`](state::AgentState); a
//! [`Commit`](commit::Commit) links a blob to zero, one, or two parent
//! commits and records who produced the snapshot and why.

pub mod blob;
pub mod commit;
pub mod state;
pub mod store;

use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::{errors::VcsError, hash::ObjectHash};

/// Storage namespace discriminator for content-addressed objects.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Blob,
    Commit,
}

impl ObjectKind {
    /// Lowercase name used in storage keys and table columns.
    pub const fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Blob => "blob",
            ObjectKind::Commit => "commit",
        }
    }
}

impl Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ObjectKind {
    type Err = VcsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blob" => Ok(ObjectKind::Blob),
            "commit" => Ok(ObjectKind::Commit),
            other => Err(VcsError::Corrupt(format!("unknown object kind `{other}`"))),
        }
    }
}

/// **The Object Trait**
///
/// Common interface for all content-addressed object types. An object can
/// be reconstructed from its canonical bytes plus the hash it was stored
/// under, and can render the canonical bytes its identity is computed
/// over.
pub trait ObjectTrait: Send + Sync + Display {
    /// Creates an object from its canonical byte encoding. `hash` is the
    /// address the bytes were fetched by; implementations adopt it as
    /// their identity without recomputing (the store verifies integrity
    /// before calling this).
    fn from_bytes(data: &[u8], hash: ObjectHash) -> Result<Self, VcsError>
    where
        Self: Sized;

    /// Canonical byte encoding; the input to content addressing.
    fn to_data(&self) -> Result<Vec<u8>, VcsError>;

    /// Storage namespace of the object.
    fn kind(&self) -> ObjectKind;

    /// Computes the object hash from the canonical encoding.
    fn object_hash(&self) -> Result<ObjectHash, VcsError> {
        Ok(ObjectHash::compute(&self.to_data()?))
    }
}
