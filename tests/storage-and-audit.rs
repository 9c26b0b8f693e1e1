//! Backend-level behavior: CAS semantics, audit chain integrity,
//! encryption at rest, garbage collection, and migration fidelity.

use std::collections::HashSet;
use std::str::FromStr;

use futures::TryStreamExt;
use serde_json::json;
use tempfile::TempDir;

use agent_vcs::{
    ActionType, AgentState, AuditEntry, GcPolicy, ObjectHash, Repository, RepositoryConfig,
    RetentionPolicy, VcsError, migrate,
};
use agent_vcs::internal::object::ObjectKind;
use agent_vcs::internal::storage::{SqlBackend, StorageBackend};

async fn open_repo(tenant: &str) -> Repository {
    Repository::open(RepositoryConfig::embedded(":memory:", tenant))
        .await
        .expect("open repository")
}

fn state(memory: serde_json::Value) -> AgentState {
    AgentState::new(memory, json!({}))
}

#[tokio::test]
async fn cas_ref_rejects_stale_expected_value() {
    let repo = open_repo("t-cas").await;
    let backend = repo.backend();
    let a = ObjectHash::compute(b"a").to_hex();
    let b = ObjectHash::compute(b"b").to_hex();
    let c = ObjectHash::compute(b"c").to_hex();

    backend.cas_ref("topic", None, &a).await.unwrap();
    // Creating again must conflict and report the actual value.
    match backend.cas_ref("topic", None, &b).await.unwrap_err() {
        VcsError::Conflict { actual, .. } => assert_eq!(actual.as_deref(), Some(a.as_str())),
        other => panic!("expected Conflict, got {other:?}"),
    }
    backend.cas_ref("topic", Some(&a), &b).await.unwrap();
    // The old expected value is now stale.
    assert!(matches!(
        backend.cas_ref("topic", Some(&a), &c).await.unwrap_err(),
        VcsError::Conflict { .. }
    ));
    assert_eq!(backend.get_ref("topic").await.unwrap().as_deref(), Some(b.as_str()));
}

#[tokio::test]
async fn object_reads_verify_hashes() {
    let repo = open_repo("t-verify").await;
    let backend = repo.backend();
    let bogus = ObjectHash::compute(b"claimed");
    backend
        .put_object(ObjectKind::Commit, &bogus, br#"{"tampered":true}"#)
        .await
        .unwrap();
    assert!(matches!(
        repo.commit_at(&bogus).await.unwrap_err(),
        VcsError::Corrupt(_)
    ));
}

#[tokio::test]
async fn audit_chain_verifies_and_detects_breaks() {
    let repo = open_repo("t-audit").await;
    for i in 0..5 {
        repo.commit(
            &state(json!({"n": i})),
            &format!("c{i}"),
            ActionType::ToolCall,
            "agent-1",
        )
        .await
        .unwrap();
    }
    let verified = repo.verify_chain(None, None).await.unwrap();
    assert_eq!(verified, 5);

    let entries = repo.audit_entries(0, 10).await.unwrap();
    assert_eq!(entries.len(), 5);
    assert_eq!(entries[0].prev_hash, ObjectHash::ZERO);
    for pair in entries.windows(2) {
        assert_eq!(pair[1].prev_hash, pair[0].self_hash);
    }

    // Append an entry whose linkage lies about its predecessor.
    let backend = repo.backend();
    let mut forged = AuditEntry::chained(None, "intruder", "commit", None, json!({}));
    forged.seq = 5;
    forged.self_hash = forged.compute_self_hash();
    backend.append_log(&forged).await.unwrap();
    assert!(matches!(
        repo.verify_chain(None, None).await.unwrap_err(),
        VcsError::ChainBroken(5)
    ));
}

#[tokio::test]
async fn audit_range_verification_checks_boundary_linkage() {
    let repo = open_repo("t-audit-range").await;
    for i in 0..4 {
        repo.commit(
            &state(json!({"n": i})),
            &format!("c{i}"),
            ActionType::ToolCall,
            "a",
        )
        .await
        .unwrap();
    }
    assert_eq!(repo.verify_chain(Some(2), Some(3)).await.unwrap(), 3);
    assert_eq!(repo.verify_chain(Some(1), None).await.unwrap(), 4);
}

#[tokio::test]
async fn encryption_round_trips_and_requires_the_passphrase() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vault.db");
    let mut config = RepositoryConfig::embedded(&path, "t-enc");
    config.encryption_passphrase = Some("correct horse battery".into());

    let repo = Repository::open(config.clone()).await.unwrap();
    let hash = repo
        .commit(
            &state(json!({"secret": "payload"})),
            "enc",
            ActionType::ToolCall,
            "a",
        )
        .await
        .unwrap();
    let loaded = repo.state_at(&hash).await.unwrap();
    assert_eq!(loaded.memory, json!({"secret": "payload"}));
    repo.verify_chain(None, None).await.unwrap();
    // The encryption marker ref never shows up as a branch.
    let status = repo.status().await.unwrap();
    assert_eq!(status.branches.keys().collect::<Vec<_>>(), vec!["main"]);

    let tree = repo.commit_at(&hash).await.unwrap().tree_hash;
    repo.close().await.unwrap();

    // At rest, the blob is an envelope, not plaintext.
    let raw_backend = SqlBackend::open_embedded(&path, "t-enc").await.unwrap();
    let raw = raw_backend
        .get_object(ObjectKind::Blob, &tree)
        .await
        .unwrap();
    assert!(!raw.windows(7).any(|w| w == b"payload"));
    raw_backend.close().await.unwrap();

    // A previously-encrypted tenant refuses to open without the key.
    let mut plain_config = config.clone();
    plain_config.encryption_passphrase = None;
    assert!(matches!(
        Repository::open(plain_config).await.unwrap_err(),
        VcsError::EncryptionKeyMissing
    ));
}

#[tokio::test]
async fn gc_removes_only_unreachable_objects() {
    let repo = open_repo("t-gc").await;
    for i in 0..3 {
        repo.commit(
            &state(json!({"n": i})),
            &format!("keep{i}"),
            ActionType::ToolCall,
            "a",
        )
        .await
        .unwrap();
    }
    // Orphan a side branch.
    repo.branch("scratch", None).await.unwrap();
    repo.checkout("scratch").await.unwrap();
    let orphan = repo
        .commit(
            &state(json!({"orphan": true})),
            "orphan",
            ActionType::ToolCall,
            "a",
        )
        .await
        .unwrap();
    let orphan_tree = repo.commit_at(&orphan).await.unwrap().tree_hash;
    repo.checkout("main").await.unwrap();
    repo.delete_branch("scratch").await.unwrap();

    let before = repo.log(Some("main"), Some(10)).await.unwrap();
    let dry = repo
        .gc(&GcPolicy {
            dry_run: true,
            ..GcPolicy::default()
        })
        .await
        .unwrap();
    assert_eq!(dry.deleted_commits, 1);
    // Dry run deleted nothing.
    assert!(repo.commit_at(&orphan).await.is_ok());

    let report = repo.gc(&GcPolicy::default()).await.unwrap();
    assert_eq!(report.deleted_commits, 1);
    assert_eq!(report.deleted_blobs, 1);
    assert!(matches!(
        repo.commit_at(&orphan).await.unwrap_err(),
        VcsError::NotFound(_)
    ));
    assert!(!repo
        .backend()
        .has_object(ObjectKind::Blob, &orphan_tree)
        .await
        .unwrap());

    // Every ref still resolves and history is unchanged.
    let after = repo.log(Some("main"), Some(10)).await.unwrap();
    let before_ids: Vec<_> = before.iter().map(|c| c.id).collect();
    let after_ids: Vec<_> = after.iter().map(|c| c.id).collect();
    assert_eq!(before_ids, after_ids);
    for commit in &after {
        assert!(repo.state_at(&commit.id).await.is_ok());
    }
}

#[tokio::test]
async fn retention_truncates_branch_history() {
    let repo = open_repo("t-retention").await;
    for i in 0..6 {
        repo.commit(
            &state(json!({"n": i})),
            &format!("c{i}"),
            ActionType::ToolCall,
            "a",
        )
        .await
        .unwrap();
    }
    let tip_state = repo.checkout("main").await.unwrap();

    let report = repo
        .retention_sweep(&RetentionPolicy {
            max_commits: Some(3),
            ..RetentionPolicy::default()
        })
        .await
        .unwrap();
    assert_eq!(report.truncated_branches, 1);

    let log = repo.log(Some("main"), Some(10)).await.unwrap();
    assert_eq!(log.len(), 3);
    assert_eq!(log[0].message, "c5");
    assert_eq!(log[1].message, "c4");
    // The checkpoint carries the joined messages of the squashed prefix.
    assert_eq!(log[2].message, "c3\nc2\nc1\nc0");
    assert_eq!(log[2].parent_hashes, vec![]);
    // Tip state is untouched by truncation.
    let head = repo.head().await.unwrap().unwrap();
    assert_eq!(repo.state_at(&head).await.unwrap().memory, tip_state.memory);

    // A second sweep with the same policy is a no-op.
    let report = repo
        .retention_sweep(&RetentionPolicy {
            max_commits: Some(3),
            ..RetentionPolicy::default()
        })
        .await
        .unwrap();
    assert_eq!(report.truncated_branches, 0);
}

#[tokio::test]
async fn migration_copies_objects_refs_and_logs() {
    let dir = TempDir::new().unwrap();
    let source_cfg = RepositoryConfig::embedded(dir.path().join("src.db"), "t-mig");
    let dest_cfg = RepositoryConfig::embedded(dir.path().join("dst.db"), "t-mig");

    let source = Repository::open(source_cfg).await.unwrap();
    for i in 0..4 {
        source
            .commit(
                &state(json!({"n": i})),
                &format!("c{i}"),
                ActionType::ToolCall,
                "a",
            )
            .await
            .unwrap();
    }
    source.branch("feature", None).await.unwrap();

    let destination = Repository::open(dest_cfg).await.unwrap();
    let src_backend = source.backend();
    let dst_backend = destination.backend();
    let progress = migrate(&src_backend, &dst_backend, None).await.unwrap();
    assert_eq!(progress.objects_total, progress.objects_copied);
    assert!(progress.refs_copied >= 3); // main, feature, HEAD
    assert_eq!(progress.logs_copied, 5);

    // Ref fidelity.
    for (name, value) in src_backend.list_refs().await.unwrap() {
        assert_eq!(dst_backend.get_ref(&name).await.unwrap(), Some(value));
    }
    // Object fidelity: everything present and rehashes to its key.
    for kind in [ObjectKind::Blob, ObjectKind::Commit] {
        let objects: Vec<(ObjectHash, Vec<u8>)> =
            src_backend.iter_objects(kind).try_collect().await.unwrap();
        for (hash, _) in objects {
            let bytes = dst_backend.get_object(kind, &hash).await.unwrap();
            assert!(hash.verify(&bytes));
        }
    }
    // Chain fidelity and idempotent re-run.
    destination.verify_chain(None, None).await.unwrap();
    let again = migrate(&src_backend, &dst_backend, None).await.unwrap();
    assert_eq!(again.logs_copied, 0);
}

#[tokio::test]
async fn iter_objects_pages_through_large_sets() {
    let repo = open_repo("t-paging").await;
    let backend = repo.backend();
    let mut expected = HashSet::new();
    for i in 0..300u32 {
        let bytes = serde_json::to_vec(&json!({"i": i})).unwrap();
        let hash = ObjectHash::compute(&bytes);
        backend
            .put_object(ObjectKind::Blob, &hash, &bytes)
            .await
            .unwrap();
        expected.insert(hash);
    }
    let seen: Vec<(ObjectHash, Vec<u8>)> = backend
        .iter_objects(ObjectKind::Blob)
        .try_collect()
        .await
        .unwrap();
    assert_eq!(seen.len(), expected.len());
    for (hash, bytes) in seen {
        assert!(expected.contains(&hash));
        assert!(hash.verify(&bytes));
    }
}

#[tokio::test]
async fn purge_tenant_leaves_other_tenants_intact() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("multi.db");
    let alpha = Repository::open(RepositoryConfig::embedded(&path, "alpha"))
        .await
        .unwrap();
    let beta = Repository::open(RepositoryConfig::embedded(&path, "beta"))
        .await
        .unwrap();
    let a_hash = alpha
        .commit(&state(json!({"who": "alpha"})), "a", ActionType::ToolCall, "x")
        .await
        .unwrap();
    let b_hash = beta
        .commit(&state(json!({"who": "beta"})), "b", ActionType::ToolCall, "x")
        .await
        .unwrap();

    // Tenants cannot see each other's objects.
    assert!(matches!(
        alpha.commit_at(&b_hash).await.unwrap_err(),
        VcsError::NotFound(_)
    ));

    alpha.destroy_tenant().await.unwrap();
    assert!(matches!(
        alpha.commit_at(&a_hash).await.unwrap_err(),
        VcsError::NotFound(_)
    ));
    assert!(beta.commit_at(&b_hash).await.is_ok());
    assert_eq!(beta.verify_chain(None, None).await.unwrap(), 1);
}

#[tokio::test]
async fn hash_parse_round_trip_via_fromstr() {
    let h = ObjectHash::compute(b"round-trip");
    assert_eq!(ObjectHash::from_str(&h.to_hex()).unwrap(), h);
}
