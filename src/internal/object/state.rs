//! Agent state snapshots.
//!
//! An `AgentState` is the unit of versioning: one JSON-shaped snapshot of
//! an autonomous agent's memory and world model at a point in time. The
//! core treats `memory` and `world_state` as opaque JSON values; no schema
//! is imposed beyond the envelope fields below. States are values: callers
//! build them, the repository freezes them into blobs, and they are never
//! mutated afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{canonical, errors::VcsError, hash::ObjectHash};

/// One snapshot of agent memory and world state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentState {
    /// Arbitrary JSON value holding the agent's working memory.
    pub memory: Value,
    /// Arbitrary JSON value holding the agent's model of its environment.
    pub world_state: Value,
    /// Capture instant, UTC.
    pub timestamp: DateTime<Utc>,
    /// Cumulative cost attributed to producing this state. Non-negative.
    pub cost: f64,
    /// Optional caller-defined annotations. Omitted from the canonical
    /// encoding when absent, so `None` and `Some(Null)` hash differently.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl AgentState {
    /// Create a state stamped with the current time and zero cost.
    pub fn new(memory: Value, world_state: Value) -> Self {
        Self {
            memory,
            world_state,
            timestamp: Utc::now(),
            cost: 0.0,
            metadata: None,
        }
    }

    /// Check the envelope invariants: cost must be a finite, non-negative
    /// real (infinities and NaN have no canonical JSON form).
    pub fn validate(&self) -> Result<(), VcsError> {
        if !self.cost.is_finite() || self.cost < 0.0 {
            return Err(VcsError::Corrupt(format!(
                "cost must be a finite non-negative number, got {}",
                self.cost
            )));
        }
        Ok(())
    }

    /// Render the state as a plain JSON value for hashing and diffing.
    pub fn canonical_value(&self) -> Result<Value, VcsError> {
        self.validate()?;
        serde_json::to_value(self).map_err(VcsError::from)
    }

    /// Canonical byte encoding of the state.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, VcsError> {
        Ok(canonical::canonical_bytes(&self.canonical_value()?))
    }

    /// Content address of the state (the tree hash of a commit that
    /// snapshots it).
    pub fn state_hash(&self) -> Result<ObjectHash, VcsError> {
        Ok(ObjectHash::compute(&self.canonical_bytes()?))
    }

    /// Reconstruct a state from a JSON value (the inverse of
    /// [`canonical_value`](Self::canonical_value)).
    pub fn from_value(value: Value) -> Result<Self, VcsError> {
        let state: AgentState = serde_json::from_value(value)?;
        state.validate()?;
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn sample() -> AgentState {
        AgentState {
            memory: json!({"step": 1}),
            world_state: json!({}),
            timestamp: "2025-01-01T00:00:00Z".parse().unwrap(),
            cost: 0.25,
            metadata: None,
        }
    }

    #[test]
    fn state_hash_is_deterministic() {
        assert_eq!(sample().state_hash().unwrap(), sample().state_hash().unwrap());
    }

    #[test]
    fn state_hash_depends_on_memory() {
        let mut other = sample();
        other.memory = json!({"step": 2});
        assert_ne!(sample().state_hash().unwrap(), other.state_hash().unwrap());
    }

    #[test]
    fn state_rejects_negative_and_non_finite_cost() {
        let mut s = sample();
        s.cost = -1.0;
        assert!(s.validate().is_err());
        s.cost = f64::NAN;
        assert!(s.validate().is_err());
    }

    #[test]
    fn absent_metadata_and_null_metadata_differ() {
        let absent = sample();
        let mut null = sample();
        null.metadata = Some(Value::Null);
        assert_ne!(absent.state_hash().unwrap(), null.state_hash().unwrap());
    }

    #[test]
    fn state_value_round_trip() {
        let s = sample();
        let v = s.canonical_value().unwrap();
        assert_eq!(AgentState::from_value(v).unwrap(), s);
    }
}
