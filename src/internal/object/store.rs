//! Typed object access over a storage backend.
//!
//! The store is the only layer that converts between typed objects and
//! stored bytes. Reads verify that the fetched bytes rehash to the
//! requested address before decoding; a mismatch is `Corrupt`, unless the
//! payload is an unopened encryption envelope, which means the repository
//! was opened without the tenant's passphrase.

use std::sync::Arc;

use crate::{
    errors::VcsError,
    hash::ObjectHash,
    internal::{
        object::{ObjectKind, ObjectTrait, blob::Blob, commit::Commit, state::AgentState},
        storage::{StorageBackend, encrypted},
    },
};

/// Content-addressed reads and writes of blobs and commits.
pub struct ObjectStore {
    backend: Arc<dyn StorageBackend>,
}

impl ObjectStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Freeze a state into a blob and store it. Idempotent: an identical
    /// state writes nothing new and returns the same hash.
    pub async fn put_state(&self, state: &AgentState) -> Result<ObjectHash, VcsError> {
        let blob = Blob::from_state(state)?;
        self.backend
            .put_object(ObjectKind::Blob, &blob.id, &blob.data)
            .await?;
        Ok(blob.id)
    }

    /// Load and decode the state stored under `tree_hash`.
    pub async fn get_state(&self, tree_hash: &ObjectHash) -> Result<AgentState, VcsError> {
        let bytes = self.verified_read(ObjectKind::Blob, tree_hash).await?;
        Blob::from_bytes(&bytes, *tree_hash)?.to_state()
    }

    pub async fn put_commit(&self, commit: &Commit) -> Result<ObjectHash, VcsError> {
        let data = commit.to_data()?;
        self.backend
            .put_object(ObjectKind::Commit, &commit.id, &data)
            .await?;
        Ok(commit.id)
    }

    pub async fn get_commit(&self, hash: &ObjectHash) -> Result<Commit, VcsError> {
        let bytes = self.verified_read(ObjectKind::Commit, hash).await?;
        Commit::from_bytes(&bytes, *hash)
    }

    pub async fn exists(&self, kind: ObjectKind, hash: &ObjectHash) -> Result<bool, VcsError> {
        self.backend.has_object(kind, hash).await
    }

    async fn verified_read(&self, kind: ObjectKind, hash: &ObjectHash) -> Result<Vec<u8>, VcsError> {
        let bytes = self.backend.get_object(kind, hash).await?;
        if !hash.verify(&bytes) {
            if encrypted::looks_encrypted(&bytes) {
                return Err(VcsError::EncryptionKeyMissing);
            }
            return Err(VcsError::Corrupt(format!("{kind} {hash}")));
        }
        Ok(bytes)
    }
}
