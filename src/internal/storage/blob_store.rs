//! S3-compatible blob storage.
//!
//! Layout under the configured prefix:
//!
//! ```text
//! <prefix><tenant>/objects/<kind>/<hash>
//! <prefix><tenant>/refs/<name>
//! <prefix><tenant>/logs/<seq, zero-padded>.json
//! ```
//!
//! Payloads at or above the compression threshold are zstd-compressed
//! behind a 4-byte frame marker. Ref compare-and-set rides on S3
//! conditional writes (`If-None-Match: *` for create, `If-Match: <etag>`
//! for replace); callers must tolerate higher `Conflict` rates than on
//! the SQL backends. Object reads rely on S3 read-after-write
//! consistency, never on listing. Zero-padded log keys keep the bucket's
//! lexicographic order aligned with sequence order.

use std::collections::{BTreeMap, VecDeque};

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use futures::stream::BoxStream;

use crate::{
    errors::VcsError,
    hash::ObjectHash,
    internal::{audit::AuditEntry, object::ObjectKind, storage::StorageBackend},
};

/// Frame marker for zstd-compressed payloads. Canonical JSON and
/// encryption envelopes always start with a JSON byte, so the marker is
/// unambiguous.
const ZSTD_MARKER: &[u8; 4] = b"zst1";
const ZSTD_LEVEL: i32 = 3;
/// Width of the zero-padded sequence number in log keys.
const LOG_SEQ_WIDTH: usize = 20;
const DELETE_BATCH: usize = 1000;

/// Storage over an S3-compatible bucket.
pub struct BlobStoreBackend {
    client: aws_sdk_s3::Client,
    sqs: Option<aws_sdk_sqs::Client>,
    bucket: String,
    root: String,
    tenant: String,
    compress_threshold: usize,
    notify_url: Option<String>,
}

fn unavailable<E>(err: E) -> VcsError
where
    E: std::error::Error + Send + Sync + 'static,
{
    VcsError::BackendUnavailable(aws_sdk_s3::error::DisplayErrorContext(err).to_string())
}

fn is_precondition_failed<E: ProvideErrorMetadata>(err: &SdkError<E>) -> bool {
    matches!(
        err.as_service_error().and_then(ProvideErrorMetadata::code),
        Some("PreconditionFailed") | Some("ConditionalRequestConflict")
    )
}

impl BlobStoreBackend {
    pub async fn open(
        bucket: &str,
        prefix: &str,
        region: Option<&str>,
        endpoint_url: Option<&str>,
        compress_threshold: usize,
        notify_url: Option<String>,
        tenant: &str,
    ) -> Result<Self, VcsError> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(Region::new(region.to_string()));
        }
        if let Some(endpoint) = endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let shared = loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&shared)
            // Path-style addressing keeps MinIO/LocalStack endpoints working.
            .force_path_style(true)
            .build();
        let client = aws_sdk_s3::Client::from_conf(s3_config);
        let sqs = notify_url
            .as_ref()
            .map(|_| aws_sdk_sqs::Client::new(&shared));
        let mut root = prefix.trim_matches('/').to_string();
        if !root.is_empty() {
            root.push('/');
        }
        Ok(Self {
            client,
            sqs,
            bucket: bucket.to_string(),
            root,
            tenant: tenant.to_string(),
            compress_threshold,
            notify_url,
        })
    }

    fn object_key(&self, kind: ObjectKind, hash: &ObjectHash) -> String {
        format!("{}{}/objects/{}/{}", self.root, self.tenant, kind, hash)
    }

    fn object_prefix(&self, kind: ObjectKind) -> String {
        format!("{}{}/objects/{}/", self.root, self.tenant, kind)
    }

    fn ref_key(&self, name: &str) -> String {
        format!("{}{}/refs/{}", self.root, self.tenant, name)
    }

    fn log_key(&self, seq: u64) -> String {
        format!(
            "{}{}/logs/{:0width$}.json",
            self.root,
            self.tenant,
            seq,
            width = LOG_SEQ_WIDTH
        )
    }

    fn encode_payload(&self, bytes: &[u8]) -> Result<Vec<u8>, VcsError> {
        if bytes.len() < self.compress_threshold {
            return Ok(bytes.to_vec());
        }
        let compressed = zstd::encode_all(bytes, ZSTD_LEVEL)?;
        let mut framed = Vec::with_capacity(ZSTD_MARKER.len() + compressed.len());
        framed.extend_from_slice(ZSTD_MARKER);
        framed.extend_from_slice(&compressed);
        Ok(framed)
    }

    fn decode_payload(&self, bytes: Vec<u8>) -> Result<Vec<u8>, VcsError> {
        match bytes.strip_prefix(ZSTD_MARKER) {
            Some(compressed) => {
                zstd::decode_all(compressed).map_err(|e| VcsError::Corrupt(format!("zstd: {e}")))
            }
            None => Ok(bytes),
        }
    }

    async fn get_key(&self, key: &str) -> Result<Option<(Vec<u8>, Option<String>)>, VcsError> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;
        match resp {
            Ok(output) => {
                let etag = output.e_tag().map(str::to_string);
                let body = output
                    .body
                    .collect()
                    .await
                    .map_err(unavailable)?
                    .into_bytes()
                    .to_vec();
                Ok(Some((body, etag)))
            }
            Err(err) => {
                if err
                    .as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                {
                    Ok(None)
                } else {
                    Err(unavailable(err))
                }
            }
        }
    }

    async fn put_key(&self, key: &str, bytes: Vec<u8>) -> Result<(), VcsError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    /// Every key of the tenant's namespace matching `prefix`, in
    /// lexicographic order.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, VcsError> {
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);
            if let Some(t) = &token {
                req = req.continuation_token(t);
            }
            let page = req.send().await.map_err(unavailable)?;
            for object in page.contents() {
                if let Some(key) = object.key() {
                    keys.push(key.to_string());
                }
            }
            match page.next_continuation_token() {
                Some(t) => token = Some(t.to_string()),
                None => break,
            }
        }
        Ok(keys)
    }

    fn notify_append(&self, entry: &AuditEntry) {
        let (Some(sqs), Some(url)) = (&self.sqs, &self.notify_url) else {
            return;
        };
        let sqs = sqs.clone();
        let url = url.clone();
        let body = serde_json::json!({
            "tenant": self.tenant,
            "seq": entry.seq,
            "action": entry.action,
            "commit_hash": entry.commit_hash,
        })
        .to_string();
        // Fire-and-forget: the commit path never waits on the queue.
        tokio::spawn(async move {
            if let Err(err) = sqs
                .send_message()
                .queue_url(url)
                .message_body(body)
                .send()
                .await
            {
                tracing::warn!(error = %aws_sdk_s3::error::DisplayErrorContext(err), "log append notification failed");
            }
        });
    }
}

#[async_trait]
impl StorageBackend for BlobStoreBackend {
    async fn initialize(&self) -> Result<(), VcsError> {
        let head = self
            .client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await;
        match head {
            Ok(_) => Ok(()),
            Err(err)
                if err
                    .as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false) =>
            {
                match self
                    .client
                    .create_bucket()
                    .bucket(&self.bucket)
                    .send()
                    .await
                {
                    Ok(_) => Ok(()),
                    Err(err)
                        if err
                            .as_service_error()
                            .map(|e| e.is_bucket_already_owned_by_you())
                            .unwrap_or(false) =>
                    {
                        Ok(())
                    }
                    Err(err) => Err(unavailable(err)),
                }
            }
            Err(err) => Err(unavailable(err)),
        }
    }

    async fn close(&self) -> Result<(), VcsError> {
        Ok(())
    }

    async fn healthcheck(&self) -> Result<(), VcsError> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn put_object(
        &self,
        kind: ObjectKind,
        hash: &ObjectHash,
        bytes: &[u8],
    ) -> Result<(), VcsError> {
        // Re-putting an existing hash rewrites identical content; no
        // conditional needed for idempotence.
        let payload = self.encode_payload(bytes)?;
        self.put_key(&self.object_key(kind, hash), payload).await
    }

    async fn get_object(&self, kind: ObjectKind, hash: &ObjectHash) -> Result<Vec<u8>, VcsError> {
        match self.get_key(&self.object_key(kind, hash)).await? {
            Some((bytes, _)) => self.decode_payload(bytes),
            None => Err(VcsError::NotFound(format!("{kind} {hash}"))),
        }
    }

    async fn has_object(&self, kind: ObjectKind, hash: &ObjectHash) -> Result<bool, VcsError> {
        let resp = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.object_key(kind, hash))
            .send()
            .await;
        match resp {
            Ok(_) => Ok(true),
            Err(err)
                if err
                    .as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false) =>
            {
                Ok(false)
            }
            Err(err) => Err(unavailable(err)),
        }
    }

    async fn delete_object(&self, kind: ObjectKind, hash: &ObjectHash) -> Result<(), VcsError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.object_key(kind, hash))
            .send()
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    fn iter_objects(
        &self,
        kind: ObjectKind,
    ) -> BoxStream<'_, Result<(ObjectHash, Vec<u8>), VcsError>> {
        let prefix = self.object_prefix(kind);
        let stream = futures::stream::try_unfold(
            None,
            move |keys: Option<VecDeque<String>>| {
                let prefix = prefix.clone();
                async move {
                    let mut pending = match keys {
                        Some(pending) => pending,
                        None => self.list_keys(&prefix).await?.into(),
                    };
                    let Some(key) = pending.pop_front() else {
                        return Ok(None);
                    };
                    let hash: ObjectHash = key
                        .rsplit('/')
                        .next()
                        .unwrap_or_default()
                        .parse()
                        .map_err(VcsError::Corrupt)?;
                    let bytes = match self.get_key(&key).await? {
                        // Deleted between listing and fetch.
                        None => return Err(VcsError::NotFound(key)),
                        Some((bytes, _)) => self.decode_payload(bytes)?,
                    };
                    Ok(Some(((hash, bytes), Some(pending))))
                }
            },
        );
        Box::pin(stream)
    }

    async fn get_ref(&self, name: &str) -> Result<Option<String>, VcsError> {
        Ok(self
            .get_key(&self.ref_key(name))
            .await?
            .map(|(bytes, _)| String::from_utf8_lossy(&bytes).into_owned()))
    }

    async fn set_ref(&self, name: &str, value: &str) -> Result<(), VcsError> {
        self.put_key(&self.ref_key(name), value.as_bytes().to_vec())
            .await
    }

    async fn delete_ref(&self, name: &str) -> Result<(), VcsError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.ref_key(name))
            .send()
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn list_refs(&self) -> Result<BTreeMap<String, String>, VcsError> {
        let prefix = format!("{}{}/refs/", self.root, self.tenant);
        let mut out = BTreeMap::new();
        for key in self.list_keys(&prefix).await? {
            let name = key[prefix.len()..].to_string();
            if let Some((bytes, _)) = self.get_key(&key).await? {
                out.insert(name, String::from_utf8_lossy(&bytes).into_owned());
            }
        }
        Ok(out)
    }

    async fn cas_ref(
        &self,
        name: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<(), VcsError> {
        let key = self.ref_key(name);
        let conflict = |actual: Option<String>| VcsError::Conflict {
            reference: name.to_string(),
            expected: expected.map(str::to_string),
            actual,
        };
        match expected {
            None => {
                let resp = self
                    .client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(&key)
                    .body(ByteStream::from(new.as_bytes().to_vec()))
                    .if_none_match("*")
                    .send()
                    .await;
                match resp {
                    Ok(_) => Ok(()),
                    Err(err) if is_precondition_failed(&err) => {
                        let actual = self.get_ref(name).await?;
                        Err(conflict(actual))
                    }
                    Err(err) => Err(unavailable(err)),
                }
            }
            Some(expected_value) => {
                let Some((bytes, etag)) = self.get_key(&key).await? else {
                    return Err(conflict(None));
                };
                let current = String::from_utf8_lossy(&bytes).into_owned();
                if current != expected_value {
                    return Err(conflict(Some(current)));
                }
                let Some(etag) = etag else {
                    return Err(VcsError::BackendUnavailable(
                        "ref object returned no etag; conditional writes unsupported".into(),
                    ));
                };
                let resp = self
                    .client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(&key)
                    .body(ByteStream::from(new.as_bytes().to_vec()))
                    .if_match(etag)
                    .send()
                    .await;
                match resp {
                    Ok(_) => Ok(()),
                    Err(err) if is_precondition_failed(&err) => {
                        let actual = self.get_ref(name).await?;
                        Err(conflict(actual))
                    }
                    Err(err) => Err(unavailable(err)),
                }
            }
        }
    }

    async fn append_log(&self, entry: &AuditEntry) -> Result<(), VcsError> {
        let key = self.log_key(entry.seq);
        let body = serde_json::to_vec(entry)?;
        let resp = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(body))
            .if_none_match("*")
            .send()
            .await;
        match resp {
            Ok(_) => {
                self.notify_append(entry);
                Ok(())
            }
            Err(err) if is_precondition_failed(&err) => Err(VcsError::Conflict {
                reference: format!("audit seq {}", entry.seq),
                expected: None,
                actual: Some(entry.seq.to_string()),
            }),
            Err(err) => Err(unavailable(err)),
        }
    }

    async fn read_log(&self, start_seq: u64, limit: usize) -> Result<Vec<AuditEntry>, VcsError> {
        // Direct key construction; no listing on the read path.
        let mut entries = Vec::new();
        let mut seq = start_seq;
        while entries.len() < limit {
            match self.get_key(&self.log_key(seq)).await? {
                Some((bytes, _)) => {
                    entries.push(serde_json::from_slice(&bytes)?);
                    seq += 1;
                }
                None => break,
            }
        }
        Ok(entries)
    }

    async fn last_log_entry(&self) -> Result<Option<AuditEntry>, VcsError> {
        let prefix = format!("{}{}/logs/", self.root, self.tenant);
        let keys = self.list_keys(&prefix).await?;
        let Some(last) = keys.last() else {
            return Ok(None);
        };
        match self.get_key(last).await? {
            Some((bytes, _)) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn purge_tenant(&self) -> Result<(), VcsError> {
        let prefix = format!("{}{}/", self.root, self.tenant);
        let keys = self.list_keys(&prefix).await?;
        for batch in keys.chunks(DELETE_BATCH) {
            let mut identifiers = Vec::with_capacity(batch.len());
            for key in batch {
                identifiers.push(
                    ObjectIdentifier::builder()
                        .key(key)
                        .build()
                        .map_err(unavailable)?,
                );
            }
            let delete = Delete::builder()
                .set_objects(Some(identifiers))
                .build()
                .map_err(unavailable)?;
            self.client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(unavailable)?;
        }
        tracing::info!(tenant = %self.tenant, keys = keys.len(), "tenant purged");
        Ok(())
    }
}
