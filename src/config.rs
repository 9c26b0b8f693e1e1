//! Repository and backend configuration.
//!
//! Configuration is plain data: serde-deserializable structs with defaults
//! matching the documented knobs. The core performs no environment-variable
//! or CLI parsing; collaborators construct these values and hand them to
//! [`Repository::open`](crate::repository::Repository::open).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration for opening a repository.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RepositoryConfig {
    /// Storage substrate selection and connection parameters.
    pub backend: BackendConfig,
    /// Namespacing key; every object, ref, and log entry is scoped to it.
    pub tenant_id: String,
    /// Enables per-tenant at-rest encryption when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_passphrase: Option<String>,
    /// Cap on ancestor traversal during merge-base discovery.
    #[serde(default = "default_merge_base_depth_limit")]
    pub merge_base_depth_limit: usize,
    /// Default `limit` for history listing.
    #[serde(default = "default_log_limit")]
    pub log_limit_default: usize,
}

impl RepositoryConfig {
    /// Convenience constructor for an embedded repository.
    pub fn embedded(path: impl Into<PathBuf>, tenant_id: impl Into<String>) -> Self {
        Self {
            backend: BackendConfig::Embedded { path: path.into() },
            tenant_id: tenant_id.into(),
            encryption_passphrase: None,
            merge_base_depth_limit: default_merge_base_depth_limit(),
            log_limit_default: default_log_limit(),
        }
    }
}

/// Backend selection. Tagged so a config file reads
/// `{ "kind": "embedded", "path": "..." }`.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Single-file SQLite store. `:memory:` is accepted for tests.
    Embedded { path: PathBuf },
    /// Pooled Postgres store.
    Relational {
        url: String,
        #[serde(default = "default_pool_max")]
        pool_max: u32,
    },
    /// S3-compatible blob store.
    BlobStore {
        bucket: String,
        /// Key prefix inside the bucket; may be empty.
        #[serde(default)]
        prefix: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        region: Option<String>,
        /// Custom endpoint for S3-compatible services (MinIO, LocalStack).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint_url: Option<String>,
        /// Payloads at or above this size are zstd-compressed.
        #[serde(default = "default_compress_threshold")]
        compress_threshold_bytes: usize,
        /// Optional queue endpoint notified on every log append.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sqs_notify_url: Option<String>,
    },
}

pub(crate) fn default_merge_base_depth_limit() -> usize {
    10_000
}

pub(crate) fn default_log_limit() -> usize {
    50
}

pub(crate) fn default_pool_max() -> u32 {
    16
}

pub(crate) fn default_compress_threshold() -> usize {
    1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_from_partial_json() {
        let cfg: RepositoryConfig = serde_json::from_str(
            r#"{"backend":{"kind":"embedded","path":"/tmp/vcs.db"},"tenant_id":"t1"}"#,
        )
        .unwrap();
        assert_eq!(cfg.merge_base_depth_limit, 10_000);
        assert_eq!(cfg.log_limit_default, 50);
        assert!(cfg.encryption_passphrase.is_none());
    }

    #[test]
    fn config_relational_pool_default() {
        let cfg: BackendConfig = serde_json::from_str(
            r#"{"kind":"relational","url":"postgres://localhost/vcs"}"#,
        )
        .unwrap();
        match cfg {
            BackendConfig::Relational { pool_max, .. } => assert_eq!(pool_max, 16),
            _ => panic!("expected relational"),
        }
    }
}
