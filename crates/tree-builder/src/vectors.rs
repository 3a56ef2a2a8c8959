//! Vector store adapter.
//!
//! Clustering-input vectors are produced upstream (embedding followed by
//! dimensionality reduction). The tree only ever reads them. Items without
//! a vector are not part of the corpus until one is supplied.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tree_storage::Storage;
use tree_types::ItemId;

/// Errors from a vector store backend.
#[derive(Debug, Error)]
pub enum VectorStoreError {
    #[error("Storage error: {0}")]
    Storage(#[from] tree_storage::StorageError),

    #[error("Vector store unavailable: {0}")]
    Unavailable(String),
}

/// Read-only access to each item's clustering-input vector.
pub trait VectorStore: Send + Sync {
    /// Every item that currently has a clustering-input vector.
    fn item_ids(&self) -> Result<Vec<ItemId>, VectorStoreError>;

    /// Vectors for `item_ids`, in the same order. `None` marks an item
    /// whose vector is missing.
    fn get_vectors(&self, item_ids: &[ItemId]) -> Result<Vec<Option<Vec<f32>>>, VectorStoreError>;
}

/// Vector store backed by the `vectors` column family of the tree store.
pub struct StorageVectorStore {
    storage: Arc<Storage>,
}

impl StorageVectorStore {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl VectorStore for StorageVectorStore {
    fn item_ids(&self) -> Result<Vec<ItemId>, VectorStoreError> {
        Ok(self.storage.vector_item_ids()?)
    }

    fn get_vectors(&self, item_ids: &[ItemId]) -> Result<Vec<Option<Vec<f32>>>, VectorStoreError> {
        Ok(self.storage.get_vectors(item_ids)?)
    }
}

/// Vector store held entirely in memory.
#[derive(Debug, Default, Clone)]
pub struct InMemoryVectorStore {
    vectors: BTreeMap<ItemId, Vec<f32>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, item_id: ItemId, vector: Vec<f32>) {
        self.vectors.insert(item_id, vector);
    }

    pub fn remove(&mut self, item_id: ItemId) -> Option<Vec<f32>> {
        self.vectors.remove(&item_id)
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }
}

impl FromIterator<(ItemId, Vec<f32>)> for InMemoryVectorStore {
    fn from_iter<I: IntoIterator<Item = (ItemId, Vec<f32>)>>(iter: I) -> Self {
        Self {
            vectors: iter.into_iter().collect(),
        }
    }
}

impl VectorStore for InMemoryVectorStore {
    fn item_ids(&self) -> Result<Vec<ItemId>, VectorStoreError> {
        Ok(self.vectors.keys().copied().collect())
    }

    fn get_vectors(&self, item_ids: &[ItemId]) -> Result<Vec<Option<Vec<f32>>>, VectorStoreError> {
        Ok(item_ids
            .iter()
            .map(|id| self.vectors.get(id).cloned())
            .collect())
    }
}
