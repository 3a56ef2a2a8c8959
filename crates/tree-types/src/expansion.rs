//! Expansion records.
//!
//! Written in the same batch that commits a node's children. The record is
//! keyed by parent id and carries the parent's generation, so re-running an
//! expansion that already committed is detected and turned into a no-op.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::node::NodeId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpansionRecord {
    pub parent_id: NodeId,

    /// Parent generation the children were created under
    pub generation: u32,

    /// Children in creation order
    pub child_ids: Vec<NodeId>,

    /// Sum of child member counts (equals the parent's member count)
    pub member_total: u64,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub committed_at: DateTime<Utc>,
}

impl ExpansionRecord {
    pub fn new(parent_id: NodeId, generation: u32, child_ids: Vec<NodeId>, member_total: u64) -> Self {
        Self {
            parent_id,
            generation,
            child_ids,
            member_total,
            committed_at: Utc::now(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
