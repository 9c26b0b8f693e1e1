//! End-to-end repository scenarios over the embedded backend.

use std::sync::Arc;

use serde_json::json;

use agent_vcs::{
    ActionType, AgentState, ChangeEntry, MergeStrategy, Repository, RepositoryConfig, VcsError,
};

async fn open_repo(tenant: &str) -> Repository {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Repository::open(RepositoryConfig::embedded(":memory:", tenant))
        .await
        .expect("open repository")
}

fn state(memory: serde_json::Value) -> AgentState {
    AgentState::new(memory, json!({}))
}

#[tokio::test]
async fn initial_commit_creates_main() {
    let repo = open_repo("t-initial").await;
    let mut first = state(json!({"step": 1}));
    first.timestamp = "2025-01-01T00:00:00Z".parse().unwrap();
    let hash = repo
        .commit(&first, "first", ActionType::UserInput, "agent-1")
        .await
        .unwrap();

    let status = repo.status().await.unwrap();
    assert_eq!(status.head, Some(hash));
    assert_eq!(status.current_branch.as_deref(), Some("main"));
    assert_eq!(status.branches.get("main"), Some(&hash));

    let log = repo.log(None, Some(10)).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].message, "first");
    assert_eq!(log[0].parent_hashes, vec![]);
}

#[tokio::test]
async fn sequential_commits_order_in_log() {
    let repo = open_repo("t-sequential").await;
    repo.commit(&state(json!({"n": 1})), "one", ActionType::ToolCall, "a")
        .await
        .unwrap();
    repo.commit(&state(json!({"n": 2})), "two", ActionType::ToolCall, "a")
        .await
        .unwrap();

    let log = repo.log(None, Some(10)).await.unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].message, "two");
    assert_eq!(log[1].message, "one");
    assert_ne!(log[0].id, log[1].id);
    assert_eq!(log[0].parent_hashes, vec![log[1].id]);
}

#[tokio::test]
async fn merge_with_ours_strategy_keeps_current_state() {
    let repo = open_repo("t-merge-ours").await;
    repo.commit(&state(json!({"v": 0})), "base", ActionType::UserInput, "a")
        .await
        .unwrap();
    repo.branch("feature", None).await.unwrap();
    repo.checkout("feature").await.unwrap();
    repo.commit(&state(json!({"v": 2})), "theirs", ActionType::ToolCall, "a")
        .await
        .unwrap();
    repo.checkout("main").await.unwrap();
    repo.commit(&state(json!({"v": 1})), "ours", ActionType::ToolCall, "a")
        .await
        .unwrap();

    let outcome = repo.merge("feature", MergeStrategy::Ours, "a").await.unwrap();
    let head = repo.head().await.unwrap().unwrap();
    assert_eq!(outcome.commit, head);
    assert_eq!(repo.state_at(&head).await.unwrap().memory, json!({"v": 1}));
    let merge_commit = repo.commit_at(&head).await.unwrap();
    assert_eq!(merge_commit.parent_hashes.len(), 2);
    assert_eq!(merge_commit.action_type, ActionType::Merge);
}

#[tokio::test]
async fn merge_with_theirs_strategy_takes_branch_state() {
    let repo = open_repo("t-merge-theirs").await;
    repo.commit(&state(json!({"v": 0})), "base", ActionType::UserInput, "a")
        .await
        .unwrap();
    repo.branch("feature", None).await.unwrap();
    repo.checkout("feature").await.unwrap();
    repo.commit(&state(json!({"v": 2})), "theirs", ActionType::ToolCall, "a")
        .await
        .unwrap();
    repo.checkout("main").await.unwrap();
    repo.commit(&state(json!({"v": 1})), "ours", ActionType::ToolCall, "a")
        .await
        .unwrap();

    repo.merge("feature", MergeStrategy::Theirs, "a").await.unwrap();
    let head = repo.head().await.unwrap().unwrap();
    assert_eq!(repo.state_at(&head).await.unwrap().memory, json!({"v": 2}));
}

#[tokio::test]
async fn three_way_merge_combines_disjoint_edits() {
    let repo = open_repo("t-merge-3way").await;
    repo.commit(
        &state(json!({"a": 1, "b": 1})),
        "base",
        ActionType::UserInput,
        "a",
    )
    .await
    .unwrap();
    repo.branch("feature", None).await.unwrap();
    repo.checkout("feature").await.unwrap();
    repo.commit(
        &state(json!({"a": 1, "b": 9})),
        "edit b",
        ActionType::ToolCall,
        "a",
    )
    .await
    .unwrap();
    repo.checkout("main").await.unwrap();
    repo.commit(
        &state(json!({"a": 5, "b": 1})),
        "edit a",
        ActionType::ToolCall,
        "a",
    )
    .await
    .unwrap();

    let outcome = repo
        .merge("feature", MergeStrategy::ThreeWay, "a")
        .await
        .unwrap();
    // Disjoint memory edits combine; the only collision is the capture
    // timestamp both commits rewrote, which resolves to the current side.
    assert_eq!(outcome.conflicts, vec![vec!["timestamp".to_string()]]);
    let head = repo.head().await.unwrap().unwrap();
    assert_eq!(
        repo.state_at(&head).await.unwrap().memory,
        json!({"a": 5, "b": 9})
    );
}

#[tokio::test]
async fn merge_of_missing_branch_fails() {
    let repo = open_repo("t-merge-missing").await;
    repo.commit(&state(json!({})), "base", ActionType::UserInput, "a")
        .await
        .unwrap();
    let err = repo
        .merge("nope", MergeStrategy::ThreeWay, "a")
        .await
        .unwrap_err();
    assert!(matches!(err, VcsError::BranchNotFound(name) if name == "nope"));
}

#[tokio::test]
async fn diff_reports_changed_and_added_paths() {
    let repo = open_repo("t-diff").await;
    let h1 = repo
        .commit(
            &state(json!({"a": 1, "b": 2})),
            "one",
            ActionType::ToolCall,
            "a",
        )
        .await
        .unwrap();
    let h2 = repo
        .commit(
            &state(json!({"a": 1, "b": 3, "c": 4})),
            "two",
            ActionType::ToolCall,
            "a",
        )
        .await
        .unwrap();

    let diff = repo.diff(&h1, &h2).await.unwrap();
    let memory_entries: Vec<&ChangeEntry> = diff
        .entries
        .iter()
        .filter(|e| e.path().first().map(String::as_str) == Some("memory"))
        .collect();
    assert_eq!(memory_entries.len(), 2);
    assert!(memory_entries.iter().any(|e| matches!(
        e,
        ChangeEntry::Changed { path, old, new }
            if path == &vec!["memory".to_string(), "b".to_string()]
                && old == &json!(2)
                && new == &json!(3)
    )));
    assert!(memory_entries.iter().any(|e| matches!(
        e,
        ChangeEntry::Added { path, new }
            if path == &vec!["memory".to_string(), "c".to_string()] && new == &json!(4)
    )));
    assert!(!diff
        .entries
        .iter()
        .any(|e| e.path() == ["memory".to_string(), "a".to_string()]));
}

#[tokio::test]
async fn revert_restores_state_without_rewriting_history() {
    let repo = open_repo("t-revert").await;
    let h1 = repo
        .commit(&state(json!({"n": 1})), "one", ActionType::ToolCall, "a")
        .await
        .unwrap();
    let h2 = repo
        .commit(&state(json!({"n": 2})), "two", ActionType::ToolCall, "a")
        .await
        .unwrap();

    let restored = repo.revert(&h1, "a").await.unwrap();
    assert_eq!(restored.memory, json!({"n": 1}));

    let log = repo.log(None, Some(10)).await.unwrap();
    assert_eq!(log.len(), 3);
    assert_eq!(log[0].action_type, ActionType::Rollback);
    assert_eq!(log[0].parent_hashes, vec![h2]);
    let head = repo.head().await.unwrap().unwrap();
    assert_eq!(
        repo.state_at(&head).await.unwrap().memory,
        repo.state_at(&h1).await.unwrap().memory
    );
}

#[tokio::test]
async fn checkout_commit_hash_detaches_head() {
    let repo = open_repo("t-detach").await;
    let h1 = repo
        .commit(&state(json!({"n": 1})), "one", ActionType::ToolCall, "a")
        .await
        .unwrap();
    repo.commit(&state(json!({"n": 2})), "two", ActionType::ToolCall, "a")
        .await
        .unwrap();

    let detached = repo.checkout(&h1.to_hex()).await.unwrap();
    assert_eq!(detached.memory, json!({"n": 1}));
    let status = repo.status().await.unwrap();
    assert_eq!(status.head, Some(h1));
    assert_eq!(status.current_branch, None);

    // Committing in detached mode moves HEAD, not any branch.
    let h3 = repo
        .commit(&state(json!({"n": 3})), "three", ActionType::ToolCall, "a")
        .await
        .unwrap();
    let status = repo.status().await.unwrap();
    assert_eq!(status.head, Some(h3));
    assert_eq!(status.branches.get("main").copied(), repo
        .log(Some("main"), Some(1))
        .await
        .unwrap()
        .first()
        .map(|c| c.id));
}

#[tokio::test]
async fn branch_validation_and_collisions() {
    let repo = open_repo("t-branch").await;
    repo.commit(&state(json!({})), "base", ActionType::UserInput, "a")
        .await
        .unwrap();
    assert!(matches!(
        repo.branch("has space", None).await.unwrap_err(),
        VcsError::InvalidName(_)
    ));
    repo.branch("feature", None).await.unwrap();
    assert!(matches!(
        repo.branch("feature", None).await.unwrap_err(),
        VcsError::AlreadyExists(_)
    ));
    assert!(matches!(
        repo.delete_branch("ghost").await.unwrap_err(),
        VcsError::BranchNotFound(_)
    ));
    // Deleting the attached branch is refused.
    assert!(repo.delete_branch("main").await.is_err());
    repo.delete_branch("feature").await.unwrap();
}

#[tokio::test]
async fn identical_state_commits_share_one_blob() {
    let repo = open_repo("t-idempotent").await;
    let mut snapshot = state(json!({"fixed": true}));
    snapshot.timestamp = "2025-03-01T00:00:00Z".parse().unwrap();
    let h1 = repo
        .commit(&snapshot, "one", ActionType::Checkpoint, "a")
        .await
        .unwrap();
    let h2 = repo
        .commit(&snapshot, "two", ActionType::Checkpoint, "a")
        .await
        .unwrap();
    assert_ne!(h1, h2);
    let c1 = repo.commit_at(&h1).await.unwrap();
    let c2 = repo.commit_at(&h2).await.unwrap();
    assert_eq!(c1.tree_hash, c2.tree_hash);
}

#[tokio::test]
async fn concurrent_commits_linearize_on_one_branch() {
    let repo = Arc::new(open_repo("t-concurrent").await);
    repo.commit(&state(json!({"n": 0})), "base", ActionType::UserInput, "a")
        .await
        .unwrap();

    let left = {
        let repo = repo.clone();
        tokio::spawn(async move {
            repo.commit(&state(json!({"n": 1})), "left", ActionType::ToolCall, "a")
                .await
        })
    };
    let right = {
        let repo = repo.clone();
        tokio::spawn(async move {
            repo.commit(&state(json!({"n": 2})), "right", ActionType::ToolCall, "a")
                .await
        })
    };
    let results = [left.await.unwrap(), right.await.unwrap()];
    let successes = results.iter().filter(|r| r.is_ok()).count();
    assert!(successes >= 1);
    for result in &results {
        if let Err(err) = result {
            assert!(matches!(err, VcsError::Conflict { .. }), "got {err:?}");
        }
    }
    // Whatever the interleaving, the surviving history is linear.
    let log = repo.log(Some("main"), Some(10)).await.unwrap();
    for commit in &log {
        assert!(commit.parent_hashes.len() <= 1);
    }
    assert_eq!(log.len(), 1 + successes);
}

#[tokio::test]
async fn squash_collapses_newest_commits() {
    let repo = open_repo("t-squash").await;
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
    let before = repo.log(None, Some(10)).await.unwrap();
    assert_eq!(before.len(), 4);

    let squashed = repo.squash("main", 3).await.unwrap();
    let log = repo.log(None, Some(10)).await.unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].id, squashed);
    assert_eq!(log[0].message, "c3\nc2\nc1");
    assert_eq!(log[0].action_type, ActionType::Checkpoint);
    // The squashed commit carries the old tip's state.
    let head_state = repo.state_at(&squashed).await.unwrap();
    assert_eq!(head_state.memory, json!({"n": 3}));
}
