//! Frontier entries.
//!
//! The frontier is the persisted work queue of the tree builder. An entry
//! exists for every node whose status is expandable or claimed, and is
//! removed in the same write that makes the node terminal.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::node::NodeId;

/// Queue status of a frontier entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrontierStatus {
    Expandable,
    Claimed,
}

/// A node waiting to be expanded (or being expanded).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontierEntry {
    pub node_id: NodeId,

    pub depth: u32,

    pub status: FrontierStatus,

    /// Run id of the invocation holding the claim
    #[serde(default)]
    pub claimed_by: Option<String>,

    /// When the claim was taken
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub claimed_at: Option<DateTime<Utc>>,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub enqueued_at: DateTime<Utc>,
}

impl FrontierEntry {
    pub fn new(node_id: NodeId, depth: u32) -> Self {
        Self {
            node_id,
            depth,
            status: FrontierStatus::Expandable,
            claimed_by: None,
            claimed_at: None,
            enqueued_at: Utc::now(),
        }
    }

    pub fn is_claimed(&self) -> bool {
        self.status == FrontierStatus::Claimed
    }

    pub fn claim(&mut self, run_id: &str, now: DateTime<Utc>) {
        self.status = FrontierStatus::Claimed;
        self.claimed_by = Some(run_id.to_string());
        self.claimed_at = Some(now);
    }

    pub fn release(&mut self) {
        self.status = FrontierStatus::Expandable;
        self.claimed_by = None;
        self.claimed_at = None;
    }

    /// A claim older than `staleness` may be revoked by a sweep.
    pub fn is_stale(&self, now: DateTime<Utc>, staleness: Duration) -> bool {
        match (self.status, self.claimed_at) {
            (FrontierStatus::Claimed, Some(at)) => now - at > staleness,
            (FrontierStatus::Claimed, None) => true,
            _ => false,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
