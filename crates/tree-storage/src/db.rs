//! RocksDB wrapper for cluster tree storage.
//!
//! Provides:
//! - Database open/close with column family setup
//! - Atomic multi-record writes through [`StoreBatch`]
//! - Typed reads for nodes, frontier entries, edges, members and vectors
//! - A monotonic node id counter restored on open

use rocksdb::{ColumnFamily, Direction, IteratorMode, Options, WriteBatch, DB};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use tree_types::{ClusterNode, ExpansionRecord, FrontierEntry, ItemId, NodeId};

use crate::codec::{decode_u64, decode_vector, encode_u64, encode_vector};
use crate::column_families::{
    build_cf_descriptors, ALL_CF_NAMES, CF_ASSIGNMENTS, CF_EXPANSIONS, CF_FRONTIER, CF_MEMBERS,
    CF_META, CF_NODES, CF_VECTORS, CF_VECTORS_3D,
};
use crate::error::StorageError;
use crate::keys::{ItemKey, MemberKey, NodeKey};

/// Meta key holding the next unissued node id
pub const META_NEXT_NODE_ID: &str = "next_node_id";

/// Meta key holding the root node id
pub const META_ROOT_ID: &str = "root_id";

/// Meta key holding the corpus name
pub const META_CORPUS: &str = "corpus";

/// Node ids start at 1 so that 0 never names a real node
const FIRST_NODE_ID: u64 = 1;

/// Main storage interface for the cluster tree
pub struct Storage {
    db: DB,
    /// Next node id to hand out; only ever increases
    next_node_id: AtomicU64,
    /// Serializes read-modify-write sequences on node and frontier records
    write_lock: Mutex<()>,
}

impl Storage {
    /// Open storage at the given path, creating if necessary
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        info!("Opening storage at {:?}", path);

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_background_jobs(4);

        let cf_descriptors = build_cf_descriptors();
        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        let next_node_id = Self::load_next_node_id(&db)?;
        debug!(next_node_id, "Restored node id counter");

        Ok(Self {
            db,
            next_node_id: AtomicU64::new(next_node_id),
            write_lock: Mutex::new(()),
        })
    }

    /// Highest of the persisted counter and the last stored node key + 1.
    fn load_next_node_id(db: &DB) -> Result<u64, StorageError> {
        let meta = db
            .cf_handle(CF_META)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(CF_META.to_string()))?;
        let nodes = db
            .cf_handle(CF_NODES)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(CF_NODES.to_string()))?;

        let persisted = match db.get_cf(meta, META_NEXT_NODE_ID)? {
            Some(bytes) => decode_u64(&bytes)?,
            None => FIRST_NODE_ID,
        };

        let mut iter = db.iterator_cf(nodes, IteratorMode::End);
        let from_nodes = match iter.next() {
            Some(item) => {
                let (key, _) = item?;
                NodeKey::from_bytes(&key)?.0 + 1
            }
            None => FIRST_NODE_ID,
        };

        Ok(persisted.max(from_nodes))
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily, StorageError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(name.to_string()))
    }

    // ==================== Node Ids ====================

    /// Reserve `count` consecutive node ids and return the first.
    ///
    /// Reserved ids are never handed out again, even if the batch that
    /// would have used them is never committed.
    pub fn reserve_node_ids(&self, count: u64) -> NodeId {
        self.next_node_id.fetch_add(count, Ordering::SeqCst)
    }

    /// The id the next reservation would start at.
    pub fn peek_next_node_id(&self) -> NodeId {
        self.next_node_id.load(Ordering::SeqCst)
    }

    /// Hold while reading a record and writing back a change to it.
    ///
    /// RocksDB is opened exclusively, so this lock covers every writer of
    /// the store. It is not reentrant.
    pub fn write_lock(&self) -> MutexGuard<'_, ()> {
        // The guarded data is (), so a poisoned lock is still usable
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ==================== Batches ====================

    /// Start an atomic batch.
    pub fn batch(&self) -> StoreBatch<'_> {
        StoreBatch {
            storage: self,
            batch: WriteBatch::default(),
        }
    }

    /// Commit a batch atomically. Returns the number of operations written.
    pub fn commit(&self, batch: StoreBatch<'_>) -> Result<usize, StorageError> {
        let ops = batch.batch.len();
        if ops == 0 {
            return Ok(0);
        }
        self.db.write(batch.batch)?;
        debug!(ops, "Committed batch");
        Ok(ops)
    }

    // ==================== Node Methods ====================

    /// Get a node record.
    pub fn get_node(&self, node_id: NodeId) -> Result<Option<ClusterNode>, StorageError> {
        match self.db.get_cf(self.cf(CF_NODES)?, NodeKey(node_id).to_bytes())? {
            Some(bytes) => Ok(Some(ClusterNode::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Write a single node record.
    pub fn put_node(&self, node: &ClusterNode) -> Result<(), StorageError> {
        let mut batch = self.batch();
        batch.put_node(node)?;
        self.commit(batch)?;
        Ok(())
    }

    /// All node records in creation order.
    pub fn list_nodes(&self) -> Result<Vec<ClusterNode>, StorageError> {
        let mut nodes = Vec::new();
        for item in self.db.iterator_cf(self.cf(CF_NODES)?, IteratorMode::Start) {
            let (_, value) = item?;
            nodes.push(ClusterNode::from_bytes(&value)?);
        }
        Ok(nodes)
    }

    // ==================== Frontier Methods ====================

    /// Get the frontier entry for a node, if it is on the frontier.
    pub fn get_frontier_entry(
        &self,
        node_id: NodeId,
    ) -> Result<Option<FrontierEntry>, StorageError> {
        match self
            .db
            .get_cf(self.cf(CF_FRONTIER)?, NodeKey(node_id).to_bytes())?
        {
            Some(bytes) => Ok(Some(FrontierEntry::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Frontier entries in creation order, stopping once `filter` has
    /// accepted `limit` entries.
    pub fn scan_frontier<F>(
        &self,
        limit: Option<usize>,
        filter: F,
    ) -> Result<Vec<FrontierEntry>, StorageError>
    where
        F: FnMut(&FrontierEntry) -> bool,
    {
        self.scan_frontier_from(FIRST_NODE_ID, limit, filter)
    }

    /// Like [`Storage::scan_frontier`], starting at node id `start`.
    pub fn scan_frontier_from<F>(
        &self,
        start: NodeId,
        limit: Option<usize>,
        mut filter: F,
    ) -> Result<Vec<FrontierEntry>, StorageError>
    where
        F: FnMut(&FrontierEntry) -> bool,
    {
        let start_key = NodeKey(start).to_bytes();
        let mode = IteratorMode::From(&start_key, Direction::Forward);
        let mut entries = Vec::new();
        for item in self.db.iterator_cf(self.cf(CF_FRONTIER)?, mode) {
            if limit.is_some_and(|l| entries.len() >= l) {
                break;
            }
            let (_, value) = item?;
            let entry = FrontierEntry::from_bytes(&value)?;
            if filter(&entry) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    // ==================== Assignment Methods ====================

    /// Node currently holding `item_id`.
    pub fn get_assignment(&self, item_id: ItemId) -> Result<Option<NodeId>, StorageError> {
        match self
            .db
            .get_cf(self.cf(CF_ASSIGNMENTS)?, ItemKey(item_id).to_bytes())?
        {
            Some(bytes) => Ok(Some(decode_u64(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Visit every assignment edge in item order.
    pub fn for_each_assignment<F>(&self, mut f: F) -> Result<(), StorageError>
    where
        F: FnMut(ItemId, NodeId),
    {
        for item in self
            .db
            .iterator_cf(self.cf(CF_ASSIGNMENTS)?, IteratorMode::Start)
        {
            let (key, value) = item?;
            f(ItemKey::from_bytes(&key)?.0, decode_u64(&value)?);
        }
        Ok(())
    }

    // ==================== Member Methods ====================

    /// Items indexed under `node_id`, in item order.
    pub fn get_members(
        &self,
        node_id: NodeId,
        limit: Option<usize>,
    ) -> Result<Vec<ItemId>, StorageError> {
        let prefix = MemberKey::prefix(node_id);
        let mut members = Vec::new();
        let iter = self.db.iterator_cf(
            self.cf(CF_MEMBERS)?,
            IteratorMode::From(&prefix, Direction::Forward),
        );

        for item in iter {
            if limit.is_some_and(|l| members.len() >= l) {
                break;
            }
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            members.push(MemberKey::from_bytes(&key)?.item_id);
        }
        Ok(members)
    }

    /// Visit every member index entry in (node, item) order.
    pub fn for_each_member<F>(&self, mut f: F) -> Result<(), StorageError>
    where
        F: FnMut(NodeId, ItemId),
    {
        for item in self.db.iterator_cf(self.cf(CF_MEMBERS)?, IteratorMode::Start) {
            let (key, _) = item?;
            let key = MemberKey::from_bytes(&key)?;
            f(key.node_id, key.item_id);
        }
        Ok(())
    }

    // ==================== Expansion Methods ====================

    pub fn get_expansion(
        &self,
        parent_id: NodeId,
    ) -> Result<Option<ExpansionRecord>, StorageError> {
        match self
            .db
            .get_cf(self.cf(CF_EXPANSIONS)?, NodeKey(parent_id).to_bytes())?
        {
            Some(bytes) => Ok(Some(ExpansionRecord::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn list_expansions(&self) -> Result<Vec<ExpansionRecord>, StorageError> {
        let mut records = Vec::new();
        for item in self
            .db
            .iterator_cf(self.cf(CF_EXPANSIONS)?, IteratorMode::Start)
        {
            let (_, value) = item?;
            records.push(ExpansionRecord::from_bytes(&value)?);
        }
        Ok(records)
    }

    // ==================== Vector Methods ====================

    /// Store an item's clustering-input vector.
    pub fn put_vector(&self, item_id: ItemId, vector: &[f32]) -> Result<(), StorageError> {
        self.db.put_cf(
            self.cf(CF_VECTORS)?,
            ItemKey(item_id).to_bytes(),
            encode_vector(vector),
        )?;
        Ok(())
    }

    /// Store an item's 3-D visualization vector.
    pub fn put_vector_3d(&self, item_id: ItemId, vector: &[f32; 3]) -> Result<(), StorageError> {
        self.db.put_cf(
            self.cf(CF_VECTORS_3D)?,
            ItemKey(item_id).to_bytes(),
            encode_vector(vector),
        )?;
        Ok(())
    }

    pub fn get_vector(&self, item_id: ItemId) -> Result<Option<Vec<f32>>, StorageError> {
        match self
            .db
            .get_cf(self.cf(CF_VECTORS)?, ItemKey(item_id).to_bytes())?
        {
            Some(bytes) => Ok(Some(decode_vector(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Load many vectors with one multi-get. Output order matches `item_ids`.
    pub fn get_vectors(&self, item_ids: &[ItemId]) -> Result<Vec<Option<Vec<f32>>>, StorageError> {
        let cf = self.cf(CF_VECTORS)?;
        let keys: Vec<Vec<u8>> = item_ids.iter().map(|id| ItemKey(*id).to_bytes()).collect();
        let mut vectors = Vec::with_capacity(item_ids.len());
        for result in self.db.multi_get_cf(keys.iter().map(|k| (cf, k))) {
            match result? {
                Some(bytes) => vectors.push(Some(decode_vector(&bytes)?)),
                None => vectors.push(None),
            }
        }
        Ok(vectors)
    }

    /// Ids of every item that has a clustering-input vector, in item order.
    pub fn vector_item_ids(&self) -> Result<Vec<ItemId>, StorageError> {
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(self.cf(CF_VECTORS)?, IteratorMode::Start) {
            let (key, _) = item?;
            ids.push(ItemKey::from_bytes(&key)?.0);
        }
        Ok(ids)
    }

    // ==================== Meta Methods ====================

    pub fn get_meta(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.db.get_cf(self.cf(CF_META)?, key.as_bytes())?)
    }

    pub fn get_meta_u64(&self, key: &str) -> Result<Option<u64>, StorageError> {
        match self.get_meta(key)? {
            Some(bytes) => Ok(Some(decode_u64(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_meta(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.db.put_cf(self.cf(CF_META)?, key.as_bytes(), value)?;
        Ok(())
    }

    // ===== Admin Operations =====

    /// Flush all column families to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        for cf_name in ALL_CF_NAMES {
            if let Some(cf) = self.db.cf_handle(cf_name) {
                self.db.flush_cf(cf)?;
            }
        }
        Ok(())
    }

    /// Trigger manual compaction on all column families.
    pub fn compact(&self) -> Result<(), StorageError> {
        info!("Starting full compaction...");
        for cf_name in ALL_CF_NAMES {
            if let Some(cf) = self.db.cf_handle(cf_name) {
                self.db.compact_range_cf::<&[u8], &[u8]>(cf, None, None);
            }
        }
        info!("Compaction complete");
        Ok(())
    }

    /// Get database statistics.
    pub fn get_stats(&self) -> Result<StorageStats, StorageError> {
        Ok(StorageStats {
            node_count: self.count_cf_entries(CF_NODES)?,
            frontier_count: self.count_cf_entries(CF_FRONTIER)?,
            assignment_count: self.count_cf_entries(CF_ASSIGNMENTS)?,
            expansion_count: self.count_cf_entries(CF_EXPANSIONS)?,
            vector_count: self.count_cf_entries(CF_VECTORS)?,
            disk_usage_bytes: self.get_disk_usage(),
        })
    }

    fn count_cf_entries(&self, cf_name: &str) -> Result<u64, StorageError> {
        let mut count = 0u64;
        for item in self.db.iterator_cf(self.cf(cf_name)?, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    fn get_disk_usage(&self) -> u64 {
        let mut total_size = 0u64;
        if let Ok(entries) = std::fs::read_dir(self.db.path()) {
            for entry in entries.flatten() {
                if let Ok(metadata) = entry.metadata() {
                    total_size += metadata.len();
                }
            }
        }
        total_size
    }
}

/// An atomic group of writes. Nothing is visible until [`Storage::commit`].
pub struct StoreBatch<'a> {
    storage: &'a Storage,
    batch: WriteBatch,
}

impl<'a> StoreBatch<'a> {
    fn cf(&self, name: &str) -> Result<&'a ColumnFamily, StorageError> {
        let storage: &'a Storage = self.storage;
        storage.cf(name)
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    pub fn put_node(&mut self, node: &ClusterNode) -> Result<(), StorageError> {
        let cf = self.cf(CF_NODES)?;
        self.batch
            .put_cf(cf, NodeKey(node.node_id).to_bytes(), node.to_bytes()?);
        Ok(())
    }

    pub fn delete_node(&mut self, node_id: NodeId) -> Result<(), StorageError> {
        let cf = self.cf(CF_NODES)?;
        self.batch.delete_cf(cf, NodeKey(node_id).to_bytes());
        Ok(())
    }

    pub fn put_frontier(&mut self, entry: &FrontierEntry) -> Result<(), StorageError> {
        let cf = self.cf(CF_FRONTIER)?;
        self.batch
            .put_cf(cf, NodeKey(entry.node_id).to_bytes(), entry.to_bytes()?);
        Ok(())
    }

    pub fn delete_frontier(&mut self, node_id: NodeId) -> Result<(), StorageError> {
        let cf = self.cf(CF_FRONTIER)?;
        self.batch.delete_cf(cf, NodeKey(node_id).to_bytes());
        Ok(())
    }

    pub fn put_assignment(&mut self, item_id: ItemId, node_id: NodeId) -> Result<(), StorageError> {
        let cf = self.cf(CF_ASSIGNMENTS)?;
        self.batch
            .put_cf(cf, ItemKey(item_id).to_bytes(), encode_u64(node_id));
        Ok(())
    }

    pub fn put_member(&mut self, node_id: NodeId, item_id: ItemId) -> Result<(), StorageError> {
        let cf = self.cf(CF_MEMBERS)?;
        self.batch
            .put_cf(cf, MemberKey::new(node_id, item_id).to_bytes(), []);
        Ok(())
    }

    pub fn delete_member(&mut self, node_id: NodeId, item_id: ItemId) -> Result<(), StorageError> {
        let cf = self.cf(CF_MEMBERS)?;
        self.batch
            .delete_cf(cf, MemberKey::new(node_id, item_id).to_bytes());
        Ok(())
    }

    pub fn put_expansion(&mut self, record: &ExpansionRecord) -> Result<(), StorageError> {
        let cf = self.cf(CF_EXPANSIONS)?;
        self.batch
            .put_cf(cf, NodeKey(record.parent_id).to_bytes(), record.to_bytes()?);
        Ok(())
    }

    pub fn delete_expansion(&mut self, parent_id: NodeId) -> Result<(), StorageError> {
        let cf = self.cf(CF_EXPANSIONS)?;
        self.batch.delete_cf(cf, NodeKey(parent_id).to_bytes());
        Ok(())
    }

    pub fn put_meta(&mut self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let cf = self.cf(CF_META)?;
        self.batch.put_cf(cf, key.as_bytes(), value);
        Ok(())
    }

    pub fn put_meta_u64(&mut self, key: &str, value: u64) -> Result<(), StorageError> {
        self.put_meta(key, &encode_u64(value))
    }

    /// Persist the current node id counter with this batch.
    pub fn record_next_node_id(&mut self) -> Result<(), StorageError> {
        let next = self.storage.peek_next_node_id();
        self.put_meta_u64(META_NEXT_NODE_ID, next)
    }
}

/// Statistics about the storage.
#[derive(Debug, Default)]
pub struct StorageStats {
    /// Number of node records
    pub node_count: u64,
    /// Number of expandable or claimed nodes
    pub frontier_count: u64,
    /// Number of assignment edges
    pub assignment_count: u64,
    /// Number of expansion records
    pub expansion_count: u64,
    /// Number of items with a clustering vector
    pub vector_count: u64,
    /// Total disk usage in bytes
    pub disk_usage_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tree_types::NodeStatus;

    fn create_test_storage() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::open(temp_dir.path()).unwrap();
        (storage, temp_dir)
    }

    #[test]
    fn test_open_creates_column_families() {
        let (storage, _temp) = create_test_storage();
        for cf_name in ALL_CF_NAMES {
            assert!(
                storage.db.cf_handle(cf_name).is_some(),
                "CF {} should exist",
                cf_name
            );
        }
    }

    #[test]
    fn test_node_roundtrip() {
        let (storage, _temp) = create_test_storage();
        let node = ClusterNode::new(1, None, 0, 7).with_status(NodeStatus::Leaf);
        storage.put_node(&node).unwrap();

        let retrieved = storage.get_node(1).unwrap().unwrap();
        assert_eq!(retrieved.member_count, 7);
        assert_eq!(retrieved.status, NodeStatus::Leaf);
        assert!(storage.get_node(2).unwrap().is_none());
    }

    #[test]
    fn test_node_ids_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let storage = Storage::open(temp_dir.path()).unwrap();
            assert_eq!(storage.reserve_node_ids(3), 1);
            let mut batch = storage.batch();
            batch.put_node(&ClusterNode::new(1, None, 0, 3)).unwrap();
            batch.record_next_node_id().unwrap();
            storage.commit(batch).unwrap();
        }

        let storage = Storage::open(temp_dir.path()).unwrap();
        assert_eq!(storage.reserve_node_ids(1), 4);
    }

    #[test]
    fn test_node_ids_restored_from_keys_without_counter() {
        let temp_dir = TempDir::new().unwrap();
        {
            let storage = Storage::open(temp_dir.path()).unwrap();
            storage.put_node(&ClusterNode::new(41, None, 0, 1)).unwrap();
        }
        let storage = Storage::open(temp_dir.path()).unwrap();
        assert_eq!(storage.peek_next_node_id(), 42);
    }

    #[test]
    fn test_uncommitted_batch_is_invisible() {
        let (storage, _temp) = create_test_storage();
        {
            let mut batch = storage.batch();
            batch.put_node(&ClusterNode::new(5, None, 0, 1)).unwrap();
            batch.put_assignment(10, 5).unwrap();
            assert_eq!(batch.len(), 2);
        }
        assert!(storage.get_node(5).unwrap().is_none());
        assert!(storage.get_assignment(10).unwrap().is_none());
    }

    #[test]
    fn test_members_are_scoped_by_prefix() {
        let (storage, _temp) = create_test_storage();
        let mut batch = storage.batch();
        for item in [3u64, 1, 2] {
            batch.put_member(1, item).unwrap();
        }
        batch.put_member(10, 99).unwrap();
        batch.put_member(11, 100).unwrap();
        storage.commit(batch).unwrap();

        assert_eq!(storage.get_members(1, None).unwrap(), vec![1, 2, 3]);
        assert_eq!(storage.get_members(1, Some(2)).unwrap(), vec![1, 2]);
        assert_eq!(storage.get_members(10, None).unwrap(), vec![99]);

        let mut batch = storage.batch();
        batch.delete_member(1, 2).unwrap();
        storage.commit(batch).unwrap();
        assert_eq!(storage.get_members(1, None).unwrap(), vec![1, 3]);

        let mut seen = Vec::new();
        storage
            .for_each_member(|node, item| seen.push((node, item)))
            .unwrap();
        assert_eq!(seen, vec![(1, 1), (1, 3), (10, 99), (11, 100)]);
    }

    #[test]
    fn test_frontier_scan_in_creation_order() {
        let (storage, _temp) = create_test_storage();
        let mut batch = storage.batch();
        for id in [12u64, 3, 7] {
            batch.put_frontier(&FrontierEntry::new(id, 1)).unwrap();
        }
        storage.commit(batch).unwrap();

        let all = storage.scan_frontier(None, |_| true).unwrap();
        let ids: Vec<_> = all.iter().map(|e| e.node_id).collect();
        assert_eq!(ids, vec![3, 7, 12]);

        let first_two = storage.scan_frontier(Some(2), |e| e.node_id != 3).unwrap();
        let ids: Vec<_> = first_two.iter().map(|e| e.node_id).collect();
        assert_eq!(ids, vec![7, 12]);

        let from_seven = storage.scan_frontier_from(7, Some(5), |_| true).unwrap();
        let ids: Vec<_> = from_seven.iter().map(|e| e.node_id).collect();
        assert_eq!(ids, vec![7, 12]);
        assert!(storage.scan_frontier_from(13, None, |_| true).unwrap().is_empty());
    }

    #[test]
    fn test_vectors_multi_get() {
        let (storage, _temp) = create_test_storage();
        storage.put_vector(1, &[0.1, 0.2]).unwrap();
        storage.put_vector(3, &[0.3, 0.4]).unwrap();
        storage.put_vector_3d(1, &[1.0, 2.0, 3.0]).unwrap();

        let vectors = storage.get_vectors(&[3, 2, 1]).unwrap();
        assert_eq!(vectors[0], Some(vec![0.3, 0.4]));
        assert_eq!(vectors[1], None);
        assert_eq!(vectors[2], Some(vec![0.1, 0.2]));
        assert_eq!(storage.vector_item_ids().unwrap(), vec![1, 3]);
    }

    #[test]
    fn test_assignments_and_stats() {
        let (storage, _temp) = create_test_storage();
        let mut batch = storage.batch();
        batch.put_assignment(1, 7).unwrap();
        batch.put_assignment(2, 7).unwrap();
        batch.put_assignment(1, 8).unwrap();
        storage.commit(batch).unwrap();

        assert_eq!(storage.get_assignment(1).unwrap(), Some(8));

        let mut seen = Vec::new();
        storage
            .for_each_assignment(|item, node| seen.push((item, node)))
            .unwrap();
        assert_eq!(seen, vec![(1, 8), (2, 7)]);

        let stats = storage.get_stats().unwrap();
        assert_eq!(stats.assignment_count, 2);
        assert_eq!(stats.node_count, 0);
    }

    #[test]
    fn test_expansion_roundtrip() {
        let (storage, _temp) = create_test_storage();
        let mut batch = storage.batch();
        batch
            .put_expansion(&ExpansionRecord::new(1, 0, vec![2, 3], 7))
            .unwrap();
        storage.commit(batch).unwrap();

        let record = storage.get_expansion(1).unwrap().unwrap();
        assert_eq!(record.child_ids, vec![2, 3]);
        assert_eq!(storage.list_expansions().unwrap().len(), 1);
    }

    #[test]
    fn test_empty_commit_is_noop() {
        let (storage, _temp) = create_test_storage();
        let batch = storage.batch();
        assert!(batch.is_empty());
        assert_eq!(storage.commit(batch).unwrap(), 0);
    }
}
