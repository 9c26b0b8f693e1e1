//! The Blob object stores one serialized agent state.
//!
//! A blob is the canonical byte encoding of an [`AgentState`], addressed
//! by the SHA-256 of those bytes. Two logically identical states always
//! freeze into the same blob, which is what makes repeated commits of an
//! unchanged state idempotent at the object layer.

use std::fmt::Display;

use crate::{
    errors::VcsError,
    hash::ObjectHash,
    internal::object::{ObjectKind, ObjectTrait, state::AgentState},
};

/// A content-addressed, immutable state payload.
#[derive(Eq, Debug, Clone)]
pub struct Blob {
    pub id: ObjectHash,
    pub data: Vec<u8>,
}

impl PartialEq for Blob {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Display for Blob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "blob {} ({} bytes)", self.id, self.data.len())
    }
}

impl Blob {
    /// Freeze a state into its blob form.
    pub fn from_state(state: &AgentState) -> Result<Self, VcsError> {
        let data = state.canonical_bytes()?;
        let id = ObjectHash::compute(&data);
        Ok(Self { id, data })
    }

    /// Decode the stored state.
    pub fn to_state(&self) -> Result<AgentState, VcsError> {
        let state: AgentState = serde_json::from_slice(&self.data)?;
        state.validate()?;
        Ok(state)
    }
}

impl ObjectTrait for Blob {
    fn from_bytes(data: &[u8], hash: ObjectHash) -> Result<Self, VcsError> {
        Ok(Self {
            id: hash,
            data: data.to_vec(),
        })
    }

    fn to_data(&self) -> Result<Vec<u8>, VcsError> {
        Ok(self.data.clone())
    }

    fn kind(&self) -> ObjectKind {
        ObjectKind::Blob
    }
}
