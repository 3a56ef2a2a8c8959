//! Node allocation.
//!
//! The allocator is the only writer of node records, member index entries
//! and assignment edges. Node ids come from the storage counter and are
//! never reused; an id reserved for a batch that never commits is simply
//! skipped.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use tree_storage::db::{META_CORPUS, META_ROOT_ID};
use tree_storage::Storage;
use tree_types::{ClusterNode, ExpansionRecord, FrontierEntry, ItemId, NodeId, NodeStatus};

use crate::error::TreeError;
use crate::frontier::ensure_claim_owner;

/// One child-to-be: its centroid and the items it will hold.
#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    pub centroid: Vec<f32>,
    pub member_ids: Vec<ItemId>,
}

impl Partition {
    pub fn new(centroid: Vec<f32>, member_ids: Vec<ItemId>) -> Self {
        Self {
            centroid,
            member_ids,
        }
    }

    pub fn len(&self) -> usize {
        self.member_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.member_ids.is_empty()
    }
}

/// Issues node ids and persists nodes, member index entries and edges.
#[derive(Clone)]
pub struct NodeAllocator {
    storage: Arc<Storage>,
}

impl NodeAllocator {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Get underlying storage.
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Root id recorded for this store, if a root was ever allocated.
    pub fn root_id(&self) -> Result<Option<NodeId>, TreeError> {
        Ok(self.storage.get_meta_u64(META_ROOT_ID)?)
    }

    /// Corpus name recorded with the root.
    pub fn corpus(&self) -> Result<Option<String>, TreeError> {
        Ok(self
            .storage
            .get_meta(META_CORPUS)?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Create the single depth-0 node owning every item.
    ///
    /// Idempotent: if a root already exists for `corpus` it is returned
    /// unchanged and `item_ids` is ignored.
    #[instrument(skip(self, item_ids), fields(items = item_ids.len()))]
    pub fn allocate_root(&self, item_ids: &[ItemId], corpus: &str) -> Result<NodeId, TreeError> {
        let _guard = self.storage.write_lock();
        if let Some(root_id) = self.root_id()? {
            self.check_corpus(corpus)?;
            debug!(root_id, "Root already allocated");
            return Ok(root_id);
        }

        let mut items = item_ids.to_vec();
        items.sort_unstable();
        items.dedup();
        if items.is_empty() {
            return Err(TreeError::EmptyCorpus);
        }

        let root_id = self.storage.reserve_node_ids(1);
        let root = ClusterNode::new(root_id, None, 0, items.len() as u64).with_samples(&items);

        let mut batch = self.storage.batch();
        batch.put_node(&root)?;
        batch.put_frontier(&FrontierEntry::new(root_id, 0))?;
        for &item in &items {
            batch.put_member(root_id, item)?;
            batch.put_assignment(item, root_id)?;
        }
        batch.put_meta_u64(META_ROOT_ID, root_id)?;
        batch.put_meta(META_CORPUS, corpus.as_bytes())?;
        batch.record_next_node_id()?;
        self.storage.commit(batch)?;

        info!(root_id, items = items.len(), corpus, "Allocated root");
        Ok(root_id)
    }

    fn check_corpus(&self, corpus: &str) -> Result<(), TreeError> {
        match self.corpus()? {
            Some(stored) if stored != corpus => Err(TreeError::CorpusMismatch {
                stored,
                requested: corpus.to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Split `parent_id` into one child per partition.
    ///
    /// A single write batch creates the children with their frontier
    /// entries, moves every member's index entry and edge to its child,
    /// flips the parent to expanded, drops the parent's frontier entry and
    /// records the expansion. Re-invoking on an already expanded parent
    /// returns the recorded children without writing anything.
    ///
    /// No claim is checked; workers expanding claimed nodes use
    /// [`NodeAllocator::allocate_claimed_children`].
    #[instrument(skip(self, partitions), fields(partitions = partitions.len()))]
    pub fn allocate_children(
        &self,
        parent_id: NodeId,
        partitions: Vec<Partition>,
    ) -> Result<Vec<NodeId>, TreeError> {
        let _guard = self.storage.write_lock();
        self.commit_children(parent_id, None, partitions)
    }

    /// [`NodeAllocator::allocate_children`] for a parent claimed by
    /// `run_id`. Fails with `ClaimLost` if the claim was swept, whether or
    /// not another run has claimed the parent since.
    #[instrument(skip(self, partitions), fields(partitions = partitions.len()))]
    pub fn allocate_claimed_children(
        &self,
        parent_id: NodeId,
        run_id: &str,
        partitions: Vec<Partition>,
    ) -> Result<Vec<NodeId>, TreeError> {
        let _guard = self.storage.write_lock();
        self.commit_children(parent_id, Some(run_id), partitions)
    }

    fn commit_children(
        &self,
        parent_id: NodeId,
        claim: Option<&str>,
        partitions: Vec<Partition>,
    ) -> Result<Vec<NodeId>, TreeError> {
        let mut parent = self
            .storage
            .get_node(parent_id)?
            .ok_or(TreeError::NodeNotFound(parent_id))?;

        match parent.status {
            NodeStatus::Expanded => return self.recorded_children(&parent),
            NodeStatus::Leaf => {
                return Err(TreeError::InvalidState {
                    node_id: parent_id,
                    status: parent.status,
                    operation: "expand",
                })
            }
            NodeStatus::Expandable | NodeStatus::Claimed => {
                if let Some(run_id) = claim {
                    ensure_claim_owner(&self.storage, parent_id, run_id)?;
                }
            }
        }

        let partitions: Vec<Partition> = partitions.into_iter().filter(|p| !p.is_empty()).collect();
        self.check_coverage(&parent, &partitions)?;

        let first_id = self.storage.reserve_node_ids(partitions.len() as u64);
        let depth = parent.depth + 1;
        let mut child_ids = Vec::with_capacity(partitions.len());

        let mut batch = self.storage.batch();
        for (offset, partition) in partitions.into_iter().enumerate() {
            let child_id = first_id + offset as u64;
            let child = ClusterNode::new(child_id, Some(parent_id), depth, partition.len() as u64)
                .with_centroid(partition.centroid)
                .with_samples(&partition.member_ids);

            batch.put_node(&child)?;
            batch.put_frontier(&FrontierEntry::new(child_id, depth))?;
            for &item in &partition.member_ids {
                batch.delete_member(parent_id, item)?;
                batch.put_member(child_id, item)?;
                batch.put_assignment(item, child_id)?;
            }
            child_ids.push(child_id);
        }

        parent.transition(NodeStatus::Expanded)?;
        parent.child_count = child_ids.len() as u32;
        batch.put_node(&parent)?;
        batch.delete_frontier(parent_id)?;
        batch.put_expansion(&ExpansionRecord::new(
            parent_id,
            parent.generation,
            child_ids.clone(),
            parent.member_count,
        ))?;
        batch.record_next_node_id()?;
        let ops = self.storage.commit(batch)?;

        info!(
            parent_id,
            depth = parent.depth,
            children = child_ids.len(),
            members = parent.member_count,
            ops,
            "Committed expansion"
        );
        Ok(child_ids)
    }

    fn recorded_children(&self, parent: &ClusterNode) -> Result<Vec<NodeId>, TreeError> {
        match self.storage.get_expansion(parent.node_id)? {
            Some(record) if record.generation == parent.generation => {
                debug!(parent_id = parent.node_id, "Expansion already committed");
                Ok(record.child_ids)
            }
            Some(record) => Err(TreeError::AtomicityViolation {
                node_id: parent.node_id,
                detail: format!(
                    "expansion recorded for generation {}, node is at {}",
                    record.generation, parent.generation
                ),
            }),
            None => Err(TreeError::AtomicityViolation {
                node_id: parent.node_id,
                detail: "expanded without an expansion record".to_string(),
            }),
        }
    }

    /// Partitions must hold exactly the parent's current members.
    fn check_coverage(&self, parent: &ClusterNode, partitions: &[Partition]) -> Result<(), TreeError> {
        let mut proposed: Vec<ItemId> = partitions
            .iter()
            .flat_map(|p| p.member_ids.iter().copied())
            .collect();
        let found = proposed.len() as u64;
        proposed.sort_unstable();

        let current = self.storage.get_members(parent.node_id, None)?;
        if partitions.is_empty() || found != parent.member_count || proposed != current {
            warn!(
                parent_id = parent.node_id,
                expected = parent.member_count,
                found,
                indexed = current.len(),
                "Partitions do not cover parent membership"
            );
            return Err(TreeError::PartitionMismatch {
                node_id: parent.node_id,
                expected: parent.member_count,
                found,
            });
        }
        Ok(())
    }

    /// Get a node record.
    pub fn get_node(&self, node_id: NodeId) -> Result<Option<ClusterNode>, TreeError> {
        Ok(self.storage.get_node(node_id)?)
    }

    /// Children in creation order. Empty for nodes that were never expanded.
    pub fn get_children(&self, node_id: NodeId) -> Result<Vec<ClusterNode>, TreeError> {
        let Some(record) = self.storage.get_expansion(node_id)? else {
            return Ok(Vec::new());
        };
        let mut children = Vec::with_capacity(record.child_ids.len());
        for child_id in record.child_ids {
            match self.storage.get_node(child_id)? {
                Some(child) => children.push(child),
                None => warn!(node_id, child_id, "Expansion record names a missing child"),
            }
        }
        Ok(children)
    }

    /// Items under `node_id`. Expanded nodes are walked down to the nodes
    /// that currently hold their items.
    pub fn get_members(
        &self,
        node_id: NodeId,
        limit: Option<usize>,
    ) -> Result<Vec<ItemId>, TreeError> {
        let node = self
            .storage
            .get_node(node_id)?
            .ok_or(TreeError::NodeNotFound(node_id))?;

        let mut members = Vec::new();
        let mut stack = vec![node];
        while let Some(node) = stack.pop() {
            let remaining = limit.map(|l| l.saturating_sub(members.len()));
            if remaining == Some(0) {
                break;
            }
            if node.status.holds_items() {
                members.extend(self.storage.get_members(node.node_id, remaining)?);
            } else {
                let mut children = self.get_children(node.node_id)?;
                children.reverse();
                stack.extend(children);
            }
        }
        Ok(members)
    }

    /// Write a node's label. Labels never affect tree structure.
    #[instrument(skip(self, label))]
    pub fn set_label(&self, node_id: NodeId, label: Option<String>) -> Result<(), TreeError> {
        let _guard = self.storage.write_lock();
        let mut node = self
            .storage
            .get_node(node_id)?
            .ok_or(TreeError::NodeNotFound(node_id))?;
        node.label = label;
        self.storage.put_node(&node)?;
        debug!("Updated label");
        Ok(())
    }
}
