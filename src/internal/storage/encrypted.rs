//! Optional at-rest encryption.
//!
//! `EncryptedBackend` implements the storage trait and delegates to an
//! inner backend, sealing blob payloads and audit `details` in an
//! authenticated envelope `{algorithm, salt, nonce, ciphertext, tag}`.
//! Keys are derived from the tenant passphrase with Argon2id over a
//! random per-tenant salt; the salt travels inside each envelope, so any
//! holder of the passphrase can open an object standalone and derived
//! keys can be cached per salt. Commit objects and refs stay in
//! plaintext: DAG traversal and CAS must work without the key.
//!
//! Encryption never changes an object's content address. The hash is
//! computed over plaintext canonical bytes; the envelope is storage-layer
//! metadata only. A reserved `.encryption` ref marks the tenant as
//! sealed, so reopening it without the passphrase is refused up front.

use std::collections::BTreeMap;
use std::sync::Arc;

use argon2::{Algorithm, Argon2, Params, Version};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::BoxStream;
use futures::StreamExt;
use ring::aead::{Aad, CHACHA20_POLY1305, LessSafeKey, Nonce, UnboundKey};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::{
    errors::VcsError,
    hash::ObjectHash,
    internal::{audit::AuditEntry, object::ObjectKind, storage::StorageBackend},
};

const ALGORITHM: &str = "chacha20-poly1305";
/// Reserved ref recording that this tenant's blobs are sealed. Written on
/// the first encrypted open; its presence makes a later open without a
/// passphrase fail eagerly instead of on the first blob read. The dot
/// prefix keeps it out of the branch namespace.
pub(crate) const MARKER_REF: &str = ".encryption";
pub(crate) const MARKER_VALUE: &str = ALGORITHM;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
/// Argon2id cost parameters: 19 MiB memory, 2 passes, 1 lane.
const ARGON2_MEMORY_KIB: u32 = 19_456;
const ARGON2_ITERATIONS: u32 = 2;
const ARGON2_LANES: u32 = 1;

/// The at-rest framing around an encrypted payload.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Envelope {
    pub algorithm: String,
    /// Hex, `SALT_LEN` bytes; input to key derivation.
    pub salt: String,
    /// Hex, `NONCE_LEN` bytes; random per object.
    pub nonce: String,
    /// Hex-encoded ciphertext.
    pub ciphertext: String,
    /// Hex-encoded 16-byte authentication tag.
    pub tag: String,
}

/// Heuristic used by the object store to distinguish "missing key" from
/// genuine corruption when plaintext decoding fails.
pub(crate) fn looks_encrypted(bytes: &[u8]) -> bool {
    serde_json::from_slice::<Envelope>(bytes)
        .map(|env| env.algorithm == ALGORITHM)
        .unwrap_or(false)
}

fn derive_key(passphrase: &[u8], salt: &[u8]) -> Result<Zeroizing<[u8; 32]>, VcsError> {
    let params = Params::new(ARGON2_MEMORY_KIB, ARGON2_ITERATIONS, ARGON2_LANES, Some(32))
        .map_err(|e| VcsError::BackendUnavailable(format!("argon2 params: {e}")))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut key = Zeroizing::new([0u8; 32]);
    argon
        .hash_password_into(passphrase, salt, &mut key[..])
        .map_err(|e| VcsError::BackendUnavailable(format!("argon2: {e}")))?;
    Ok(key)
}

/// Same-trait wrapper encrypting blob payloads and audit details.
pub struct EncryptedBackend {
    inner: Arc<dyn StorageBackend>,
    passphrase: Zeroizing<Vec<u8>>,
    /// Salt used for envelopes written by this instance.
    write_salt: [u8; SALT_LEN],
    /// Derived keys cached by hex salt for the repository's lifetime.
    keys: DashMap<String, Zeroizing<[u8; 32]>>,
    rng: SystemRandom,
}

impl EncryptedBackend {
    pub fn new(inner: Arc<dyn StorageBackend>, passphrase: &str) -> Result<Self, VcsError> {
        let rng = SystemRandom::new();
        let mut write_salt = [0u8; SALT_LEN];
        rng.fill(&mut write_salt)
            .map_err(|_| VcsError::BackendUnavailable("rng failure".into()))?;
        let backend = Self {
            inner,
            passphrase: Zeroizing::new(passphrase.as_bytes().to_vec()),
            write_salt,
            keys: DashMap::new(),
            rng,
        };
        // Derive the write key eagerly so a pathological passphrase or
        // cost misconfiguration fails at open, not mid-commit.
        backend.key_for_salt(&backend.write_salt)?;
        Ok(backend)
    }

    fn key_for_salt(&self, salt: &[u8]) -> Result<Zeroizing<[u8; 32]>, VcsError> {
        let cache_key = hex::encode(salt);
        if let Some(key) = self.keys.get(&cache_key) {
            return Ok(key.value().clone());
        }
        let key = derive_key(&self.passphrase, salt)?;
        self.keys.insert(cache_key, key.clone());
        Ok(key)
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, VcsError> {
        let key = self.key_for_salt(&self.write_salt)?;
        let mut nonce = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce)
            .map_err(|_| VcsError::BackendUnavailable("rng failure".into()))?;
        let unbound = UnboundKey::new(&CHACHA20_POLY1305, &key[..])
            .map_err(|_| VcsError::BackendUnavailable("aead key setup failed".into()))?;
        let sealing = LessSafeKey::new(unbound);
        let mut in_out = plaintext.to_vec();
        sealing
            .seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut in_out)
            .map_err(|_| VcsError::BackendUnavailable("aead seal failed".into()))?;
        let tag = in_out.split_off(in_out.len() - TAG_LEN);
        let envelope = Envelope {
            algorithm: ALGORITHM.to_string(),
            salt: hex::encode(self.write_salt),
            nonce: hex::encode(nonce),
            ciphertext: hex::encode(&in_out),
            tag: hex::encode(&tag),
        };
        serde_json::to_vec(&envelope).map_err(VcsError::from)
    }

    fn open(&self, bytes: &[u8]) -> Result<Vec<u8>, VcsError> {
        // Objects written before encryption was enabled pass through.
        if !looks_encrypted(bytes) {
            return Ok(bytes.to_vec());
        }
        let envelope: Envelope = serde_json::from_slice(bytes)?;
        self.open_envelope(&envelope)
    }

    fn open_envelope(&self, envelope: &Envelope) -> Result<Vec<u8>, VcsError> {
        let corrupt = |what: &str| VcsError::Corrupt(format!("encryption envelope: {what}"));
        let salt = hex::decode(&envelope.salt).map_err(|_| corrupt("salt"))?;
        let nonce_bytes = hex::decode(&envelope.nonce).map_err(|_| corrupt("nonce"))?;
        let nonce: [u8; NONCE_LEN] = nonce_bytes
            .try_into()
            .map_err(|_| corrupt("nonce length"))?;
        let mut in_out = hex::decode(&envelope.ciphertext).map_err(|_| corrupt("ciphertext"))?;
        in_out.extend(hex::decode(&envelope.tag).map_err(|_| corrupt("tag"))?);
        let key = self.key_for_salt(&salt)?;
        let unbound = UnboundKey::new(&CHACHA20_POLY1305, &key[..])
            .map_err(|_| VcsError::BackendUnavailable("aead key setup failed".into()))?;
        let opening = LessSafeKey::new(unbound);
        let plaintext = opening
            .open_in_place(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut in_out)
            .map_err(|_| corrupt("authentication failed"))?;
        Ok(plaintext.to_vec())
    }

    fn seal_entry(&self, entry: &AuditEntry) -> Result<AuditEntry, VcsError> {
        let plaintext = crate::canonical::canonical_bytes(&entry.details);
        let sealed = self.seal(&plaintext)?;
        let mut stored = entry.clone();
        stored.details = serde_json::from_slice(&sealed)?;
        Ok(stored)
    }

    fn open_entry(&self, mut entry: AuditEntry) -> Result<AuditEntry, VcsError> {
        if let Ok(envelope) = serde_json::from_value::<Envelope>(entry.details.clone()) {
            if envelope.algorithm == ALGORITHM {
                let plaintext = self.open_envelope(&envelope)?;
                entry.details = serde_json::from_slice(&plaintext)?;
            }
        }
        Ok(entry)
    }
}

#[async_trait]
impl StorageBackend for EncryptedBackend {
    async fn initialize(&self) -> Result<(), VcsError> {
        self.inner.initialize().await
    }

    async fn close(&self) -> Result<(), VcsError> {
        // Dropping the Zeroizing values wipes the cached key material.
        self.keys.clear();
        self.inner.close().await
    }

    async fn healthcheck(&self) -> Result<(), VcsError> {
        self.inner.healthcheck().await
    }

    async fn put_object(
        &self,
        kind: ObjectKind,
        hash: &ObjectHash,
        bytes: &[u8],
    ) -> Result<(), VcsError> {
        match kind {
            ObjectKind::Blob => {
                let sealed = self.seal(bytes)?;
                self.inner.put_object(kind, hash, &sealed).await
            }
            ObjectKind::Commit => self.inner.put_object(kind, hash, bytes).await,
        }
    }

    async fn get_object(&self, kind: ObjectKind, hash: &ObjectHash) -> Result<Vec<u8>, VcsError> {
        let bytes = self.inner.get_object(kind, hash).await?;
        match kind {
            ObjectKind::Blob => self.open(&bytes),
            ObjectKind::Commit => Ok(bytes),
        }
    }

    async fn has_object(&self, kind: ObjectKind, hash: &ObjectHash) -> Result<bool, VcsError> {
        self.inner.has_object(kind, hash).await
    }

    async fn delete_object(&self, kind: ObjectKind, hash: &ObjectHash) -> Result<(), VcsError> {
        self.inner.delete_object(kind, hash).await
    }

    fn iter_objects(
        &self,
        kind: ObjectKind,
    ) -> BoxStream<'_, Result<(ObjectHash, Vec<u8>), VcsError>> {
        let stream = self.inner.iter_objects(kind).map(move |item| {
            let (hash, bytes) = item?;
            let bytes = match kind {
                ObjectKind::Blob => self.open(&bytes)?,
                ObjectKind::Commit => bytes,
            };
            Ok((hash, bytes))
        });
        Box::pin(stream)
    }

    async fn get_ref(&self, name: &str) -> Result<Option<String>, VcsError> {
        self.inner.get_ref(name).await
    }

    async fn set_ref(&self, name: &str, value: &str) -> Result<(), VcsError> {
        self.inner.set_ref(name, value).await
    }

    async fn delete_ref(&self, name: &str) -> Result<(), VcsError> {
        self.inner.delete_ref(name).await
    }

    async fn list_refs(&self) -> Result<BTreeMap<String, String>, VcsError> {
        self.inner.list_refs().await
    }

    async fn cas_ref(
        &self,
        name: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<(), VcsError> {
        self.inner.cas_ref(name, expected, new).await
    }

    async fn append_log(&self, entry: &AuditEntry) -> Result<(), VcsError> {
        let sealed = self.seal_entry(entry)?;
        self.inner.append_log(&sealed).await
    }

    async fn read_log(&self, start_seq: u64, limit: usize) -> Result<Vec<AuditEntry>, VcsError> {
        let entries = self.inner.read_log(start_seq, limit).await?;
        entries.into_iter().map(|e| self.open_entry(e)).collect()
    }

    async fn last_log_entry(&self) -> Result<Option<AuditEntry>, VcsError> {
        let entry = self.inner.last_log_entry().await?;
        entry.map(|e| self.open_entry(e)).transpose()
    }

    async fn purge_tenant(&self) -> Result<(), VcsError> {
        self.inner.purge_tenant().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_detection_matches_only_sealed_payloads() {
        let envelope = Envelope {
            algorithm: ALGORITHM.to_string(),
            salt: "00".repeat(SALT_LEN),
            nonce: "00".repeat(NONCE_LEN),
            ciphertext: "ff".to_string(),
            tag: "00".repeat(TAG_LEN),
        };
        let bytes = serde_json::to_vec(&envelope).unwrap();
        assert!(looks_encrypted(&bytes));
        assert!(!looks_encrypted(br#"{"memory":{},"cost":0}"#));
        assert!(!looks_encrypted(b"not json"));
    }

    #[test]
    fn derived_keys_are_salt_sensitive() {
        let a = derive_key(b"passphrase", &[0u8; SALT_LEN]).unwrap();
        let b = derive_key(b"passphrase", &[1u8; SALT_LEN]).unwrap();
        assert_ne!(&a[..], &b[..]);
    }
}
