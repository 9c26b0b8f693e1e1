//! Persistent storage for objects, refs, and the audit log.
//!
//! One capability set, three substrates: an embedded single-file SQLite
//! store, a pooled Postgres store, and an S3-compatible blob store. The
//! orchestrator holds the backend as `Arc<dyn StorageBackend>` and never
//! branches on the concrete kind; encryption is a wrapping layer that
//! implements the same trait and delegates to an inner backend.
//!
//! Every operation is scoped to the tenant fixed at construction. Writes
//! must be durable before returning success. `cas_ref` is the only
//! primitive that serializes concurrent branch advances; everything else
//! composes on top of it.

pub mod blob_store;
pub mod encrypted;
pub mod schema;
pub mod sql;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::{
    config::{BackendConfig, RepositoryConfig},
    errors::VcsError,
    hash::ObjectHash,
    internal::{audit::AuditEntry, object::ObjectKind},
};

pub use blob_store::BlobStoreBackend;
pub use encrypted::EncryptedBackend;
pub use sql::SqlBackend;

/// The storage capability set implemented by every substrate.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Idempotent schema/bucket setup.
    async fn initialize(&self) -> Result<(), VcsError>;

    /// Release connections. Further calls may fail with
    /// `BackendUnavailable`.
    async fn close(&self) -> Result<(), VcsError>;

    /// Cheap liveness probe against the substrate.
    async fn healthcheck(&self) -> Result<(), VcsError>;

    /// Store a content-addressed object. Idempotent: re-writing an
    /// existing hash is a no-op.
    async fn put_object(
        &self,
        kind: ObjectKind,
        hash: &ObjectHash,
        bytes: &[u8],
    ) -> Result<(), VcsError>;

    /// Fetch an object's bytes; `NotFound` when absent.
    async fn get_object(&self, kind: ObjectKind, hash: &ObjectHash) -> Result<Vec<u8>, VcsError>;

    async fn has_object(&self, kind: ObjectKind, hash: &ObjectHash) -> Result<bool, VcsError>;

    /// Remove an object. Removing an absent object is a no-op; only the
    /// garbage collector calls this.
    async fn delete_object(&self, kind: ObjectKind, hash: &ObjectHash) -> Result<(), VcsError>;

    /// Lazily yield every `(hash, bytes)` pair of the given kind.
    fn iter_objects(
        &self,
        kind: ObjectKind,
    ) -> BoxStream<'_, Result<(ObjectHash, Vec<u8>), VcsError>>;

    /// Current value of a ref, or `None` when unset. Values are either a
    /// 64-char hex commit hash or a symbolic `ref: <branch>` marker.
    async fn get_ref(&self, name: &str) -> Result<Option<String>, VcsError>;

    /// Unconditional ref write.
    async fn set_ref(&self, name: &str, value: &str) -> Result<(), VcsError>;

    async fn delete_ref(&self, name: &str) -> Result<(), VcsError>;

    async fn list_refs(&self) -> Result<BTreeMap<String, String>, VcsError>;

    /// Compare-and-set: succeed only if the current value equals
    /// `expected` (`None` = ref must not exist). Fails with `Conflict`
    /// carrying the actual value otherwise.
    async fn cas_ref(
        &self,
        name: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<(), VcsError>;

    /// Append one audit entry at its sequence position. Fails with
    /// `Conflict` if the position is already taken, which the audit layer
    /// uses to linearize concurrent appends.
    async fn append_log(&self, entry: &AuditEntry) -> Result<(), VcsError>;

    /// Read entries ordered by sequence, starting at `start_seq`.
    async fn read_log(&self, start_seq: u64, limit: usize) -> Result<Vec<AuditEntry>, VcsError>;

    /// The entry with the highest sequence number, if any.
    async fn last_log_entry(&self) -> Result<Option<AuditEntry>, VcsError>;

    /// Delete every object, ref, and log entry of this tenant. The only
    /// path that destroys audit entries.
    async fn purge_tenant(&self) -> Result<(), VcsError>;
}

/// Construct the backend selected by `config`, wrapped in the encryption
/// layer when a passphrase is configured.
pub async fn open_backend(config: &RepositoryConfig) -> Result<Arc<dyn StorageBackend>, VcsError> {
    let inner: Arc<dyn StorageBackend> = match &config.backend {
        BackendConfig::Embedded { path } => {
            Arc::new(SqlBackend::open_embedded(path, &config.tenant_id).await?)
        }
        BackendConfig::Relational { url, pool_max } => {
            Arc::new(SqlBackend::open_relational(url, *pool_max, &config.tenant_id).await?)
        }
        BackendConfig::BlobStore {
            bucket,
            prefix,
            region,
            endpoint_url,
            compress_threshold_bytes,
            sqs_notify_url,
        } => Arc::new(
            BlobStoreBackend::open(
                bucket,
                prefix,
                region.as_deref(),
                endpoint_url.as_deref(),
                *compress_threshold_bytes,
                sqs_notify_url.clone(),
                &config.tenant_id,
            )
            .await?,
        ),
    };
    inner.initialize().await?;
    let marker = inner.get_ref(encrypted::MARKER_REF).await?;
    let backend: Arc<dyn StorageBackend> = match &config.encryption_passphrase {
        Some(passphrase) => {
            let wrapped = Arc::new(EncryptedBackend::new(inner, passphrase)?);
            if marker.is_none() {
                wrapped
                    .set_ref(encrypted::MARKER_REF, encrypted::MARKER_VALUE)
                    .await?;
            }
            wrapped
        }
        None => {
            // A tenant that was initialized with encryption refuses to
            // open without the passphrase.
            if marker.is_some() {
                return Err(VcsError::EncryptionKeyMissing);
            }
            inner
        }
    };
    Ok(backend)
}
