//! The Commit object records one version of an agent's state.
//!
//! Each commit links the blob holding the snapshot (`tree_hash`), zero,
//! one, or two parent commits (root, linear, merge), and metadata about
//! who produced the snapshot and through which kind of action. The commit
//! id is the SHA-256 of the canonical encoding of the record itself, so a
//! commit can never be altered without changing its identity. Chaining
//! parents this way represents the entire history of a tenant with a
//! single DAG rooted at its first commit.

use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    canonical,
    errors::VcsError,
    hash::ObjectHash,
    internal::object::{ObjectKind, ObjectTrait},
};

/// The kind of agent action that produced a commit. Closed enumeration;
/// encoded as a snake_case string at the wire boundary.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    ToolCall,
    LlmResponse,
    UserInput,
    SystemEvent,
    Retry,
    Rollback,
    Merge,
    Checkpoint,
}

impl ActionType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ActionType::ToolCall => "tool_call",
            ActionType::LlmResponse => "llm_response",
            ActionType::UserInput => "user_input",
            ActionType::SystemEvent => "system_event",
            ActionType::Retry => "retry",
            ActionType::Rollback => "rollback",
            ActionType::Merge => "merge",
            ActionType::Checkpoint => "checkpoint",
        }
    }
}

impl Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionType {
    type Err = VcsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tool_call" => Ok(ActionType::ToolCall),
            "llm_response" => Ok(ActionType::LlmResponse),
            "user_input" => Ok(ActionType::UserInput),
            "system_event" => Ok(ActionType::SystemEvent),
            "retry" => Ok(ActionType::Retry),
            "rollback" => Ok(ActionType::Rollback),
            "merge" => Ok(ActionType::Merge),
            "checkpoint" => Ok(ActionType::Checkpoint),
            other => Err(VcsError::Corrupt(format!("unknown action type `{other}`"))),
        }
    }
}

/// Wire form of a commit. The id is computed over this record and is not
/// part of it.
#[derive(Serialize, Deserialize)]
struct CommitRecord {
    tree_hash: ObjectHash,
    parent_hashes: Vec<ObjectHash>,
    message: String,
    author: String,
    timestamp: DateTime<Utc>,
    action_type: ActionType,
}

/// One version of an agent's state in the commit DAG.
#[derive(Eq, Debug, Clone, Serialize)]
pub struct Commit {
    /// Content address of this commit.
    pub id: ObjectHash,
    /// Blob holding the snapshot taken at this commit.
    pub tree_hash: ObjectHash,
    /// Zero (root), one (linear), or two (merge) parents, in input order.
    pub parent_hashes: Vec<ObjectHash>,
    pub message: String,
    pub author: String,
    pub timestamp: DateTime<Utc>,
    pub action_type: ActionType,
}

impl PartialEq for Commit {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Display for Commit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "tree: {}", self.tree_hash)?;
        for parent in self.parent_hashes.iter() {
            writeln!(f, "parent: {parent}")?;
        }
        writeln!(f, "author: {} {}", self.author, self.timestamp.to_rfc3339())?;
        writeln!(f, "action: {}", self.action_type)?;
        writeln!(f, "{}", self.message)
    }
}

impl Commit {
    /// Create a commit and compute its content address. A commit has at
    /// most two parents (root, linear, merge); the invariant holds at
    /// construction, not just at rehydration.
    pub fn new(
        tree_hash: ObjectHash,
        parent_hashes: Vec<ObjectHash>,
        message: impl Into<String>,
        author: impl Into<String>,
        timestamp: DateTime<Utc>,
        action_type: ActionType,
    ) -> Result<Commit, VcsError> {
        if parent_hashes.len() > 2 {
            return Err(VcsError::Corrupt(format!(
                "commit has {} parents",
                parent_hashes.len()
            )));
        }
        let mut commit = Commit {
            id: ObjectHash::ZERO,
            tree_hash,
            parent_hashes,
            message: message.into(),
            author: author.into(),
            timestamp,
            action_type,
        };
        commit.id = commit.object_hash()?;
        Ok(commit)
    }

    fn record_value(&self) -> Result<Value, VcsError> {
        let record = CommitRecord {
            tree_hash: self.tree_hash,
            parent_hashes: self.parent_hashes.clone(),
            message: self.message.clone(),
            author: self.author.clone(),
            timestamp: self.timestamp,
            action_type: self.action_type,
        };
        serde_json::to_value(&record).map_err(VcsError::from)
    }
}

impl ObjectTrait for Commit {
    fn from_bytes(data: &[u8], hash: ObjectHash) -> Result<Self, VcsError> {
        let record: CommitRecord = serde_json::from_slice(data)?;
        if record.parent_hashes.len() > 2 {
            return Err(VcsError::Corrupt(format!(
                "commit {hash} has {} parents",
                record.parent_hashes.len()
            )));
        }
        Ok(Commit {
            id: hash,
            tree_hash: record.tree_hash,
            parent_hashes: record.parent_hashes,
            message: record.message,
            author: record.author,
            timestamp: record.timestamp,
            action_type: record.action_type,
        })
    }

    fn to_data(&self) -> Result<Vec<u8>, VcsError> {
        Ok(canonical::canonical_bytes(&self.record_value()?))
    }

    fn kind(&self) -> ObjectKind {
        ObjectKind::Commit
    }
}
