//! Partition primitive interface.
//!
//! `partition(vectors, k, seed) -> (assignment, centroids)` is the one place
//! external, possibly nondeterministic computation enters the builder.
//! Implementations may return fewer than `k` clusters; empty clusters are
//! always compacted away before the result reaches the builder.

use thiserror::Error;

/// Errors a partitioner may raise. All of them are confined to one node.
#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("No vectors to partition")]
    EmptyInput,

    #[error("Vector {index} has dimension {found}, expected {expected}")]
    DimensionMismatch {
        index: usize,
        expected: usize,
        found: usize,
    },

    #[error("Invalid cluster count: {0}")]
    InvalidK(usize),

    #[error("Vector {0} contains a non-finite value")]
    NonFinite(usize),

    #[error("Partition timed out after {0}s")]
    Timeout(u64),

    #[error("Partition cancelled")]
    Cancelled,

    #[error("Partition backend error: {0}")]
    Backend(String),
}

/// Result of a partition call.
#[derive(Debug, Clone, PartialEq)]
pub struct Partitioning {
    /// Cluster index for each input vector, in input order
    pub assignment: Vec<usize>,

    /// One centroid per cluster
    pub centroids: Vec<Vec<f32>>,
}

impl Partitioning {
    pub fn cluster_count(&self) -> usize {
        self.centroids.len()
    }

    /// Number of vectors assigned to each cluster.
    pub fn sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0usize; self.centroids.len()];
        for &cluster in &self.assignment {
            if let Some(size) = sizes.get_mut(cluster) {
                *size += 1;
            }
        }
        sizes
    }

    /// Drop empty clusters and renumber the rest in first-seen order.
    pub fn compact(self) -> Self {
        let mut remap: Vec<Option<usize>> = vec![None; self.centroids.len()];
        let mut centroids = Vec::new();
        let mut assignment = Vec::with_capacity(self.assignment.len());

        for &cluster in &self.assignment {
            let slot = match remap.get(cluster).copied().flatten() {
                Some(slot) => slot,
                None => {
                    let slot = centroids.len();
                    if let Some(entry) = remap.get_mut(cluster) {
                        *entry = Some(slot);
                    }
                    centroids.push(self.centroids.get(cluster).cloned().unwrap_or_default());
                    slot
                }
            };
            assignment.push(slot);
        }

        Self {
            assignment,
            centroids,
        }
    }

    /// Whether the split separated nothing.
    pub fn is_degenerate(&self) -> bool {
        self.cluster_count() <= 1
    }
}

/// Splits a set of vectors into at most `k` clusters.
pub trait Partitioner: Send + Sync {
    /// Partition `vectors` into at most `k` clusters using `seed`.
    ///
    /// The same inputs and seed must give the same result.
    fn partition(
        &self,
        vectors: &[Vec<f32>],
        k: usize,
        seed: u64,
    ) -> Result<Partitioning, PartitionError>;
}

/// Per-node seed: the base seed mixed with the node id through splitmix64.
///
/// Each node is partitioned with its own seed, so resuming an interrupted
/// run reproduces exactly the split an uninterrupted run would have made.
pub fn node_seed(base: u64, node_id: u64) -> u64 {
    let mut z = base ^ node_id.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Check shape and finiteness; returns the common dimension.
pub(crate) fn validate_input(vectors: &[Vec<f32>], k: usize) -> Result<usize, PartitionError> {
    if vectors.is_empty() {
        return Err(PartitionError::EmptyInput);
    }
    if k == 0 {
        return Err(PartitionError::InvalidK(k));
    }
    let dim = vectors[0].len();
    for (index, vector) in vectors.iter().enumerate() {
        if vector.len() != dim {
            return Err(PartitionError::DimensionMismatch {
                index,
                expected: dim,
                found: vector.len(),
            });
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(PartitionError::NonFinite(index));
        }
    }
    Ok(dim)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_drops_empty_clusters() {
        let partitioning = Partitioning {
            assignment: vec![2, 2, 0, 2],
            centroids: vec![vec![0.0], vec![5.0], vec![9.0]],
        };
        let compacted = partitioning.compact();
        assert_eq!(compacted.assignment, vec![0, 0, 1, 0]);
        assert_eq!(compacted.centroids, vec![vec![9.0], vec![0.0]]);
        assert_eq!(compacted.sizes(), vec![3, 1]);
        assert!(!compacted.is_degenerate());
    }

    #[test]
    fn test_node_seed_varies_by_node() {
        assert_eq!(node_seed(42, 7), node_seed(42, 7));
        assert_ne!(node_seed(42, 7), node_seed(42, 8));
        assert_ne!(node_seed(42, 7), node_seed(43, 7));
    }

    #[test]
    fn test_validate_input() {
        assert!(matches!(
            validate_input(&[], 2),
            Err(PartitionError::EmptyInput)
        ));
        assert!(matches!(
            validate_input(&[vec![1.0]], 0),
            Err(PartitionError::InvalidK(0))
        ));
        assert!(matches!(
            validate_input(&[vec![1.0, 2.0], vec![1.0]], 2),
            Err(PartitionError::DimensionMismatch { index: 1, .. })
        ));
        assert!(matches!(
            validate_input(&[vec![f32::NAN]], 2),
            Err(PartitionError::NonFinite(0))
        ));
        assert_eq!(validate_input(&[vec![1.0, 2.0]], 2).unwrap(), 2);
    }
}
