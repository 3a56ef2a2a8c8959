//! K-means partitioner.
//!
//! k-means++ seeding followed by Lloyd iterations. Centroids are fitted on
//! a seeded sample of at most `fit_sample_size` members; every member is
//! then assigned to its nearest centroid and the centroids are recomputed
//! as the mean of their final members.
//!
//! Seeding stops early when every remaining point coincides with an
//! existing center, so a set of identical vectors yields one cluster
//! regardless of `k`.

use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use tree_types::KMeansConfig;

use crate::partition::{validate_input, PartitionError, Partitioner, Partitioning};

/// Built-in [`Partitioner`] backed by k-means.
#[derive(Debug, Clone, Default)]
pub struct KMeansPartitioner {
    config: KMeansConfig,
    cancel: Option<CancellationToken>,
}

impl KMeansPartitioner {
    pub fn new(config: KMeansConfig) -> Self {
        Self {
            config,
            cancel: None,
        }
    }

    /// Abort fits between iterations once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn check_budget(&self, started: Instant) -> Result<(), PartitionError> {
        if self.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
            return Err(PartitionError::Cancelled);
        }
        if let Some(secs) = self.config.timeout_secs {
            if started.elapsed() > Duration::from_secs(secs) {
                return Err(PartitionError::Timeout(secs));
            }
        }
        Ok(())
    }
}

impl Partitioner for KMeansPartitioner {
    fn partition(
        &self,
        vectors: &[Vec<f32>],
        k: usize,
        seed: u64,
    ) -> Result<Partitioning, PartitionError> {
        let dim = validate_input(vectors, k)?;
        let started = Instant::now();
        let mut rng = StdRng::seed_from_u64(seed);

        let fit: Vec<&[f32]> = if vectors.len() > self.config.fit_sample_size {
            let mut picked =
                rand::seq::index::sample(&mut rng, vectors.len(), self.config.fit_sample_size)
                    .into_vec();
            picked.sort_unstable();
            picked.into_iter().map(|i| vectors[i].as_slice()).collect()
        } else {
            vectors.iter().map(|v| v.as_slice()).collect()
        };

        let mut centroids = kmeans_plus_plus_init(&fit, k.min(fit.len()), &mut rng);
        debug!(
            points = vectors.len(),
            fit_points = fit.len(),
            requested_k = k,
            seeded_k = centroids.len(),
            "Fitting k-means"
        );

        let mut labels = vec![0usize; fit.len()];
        for iteration in 0..self.config.max_iterations {
            self.check_budget(started)?;

            for (label, point) in labels.iter_mut().zip(&fit) {
                *label = nearest(point, &centroids);
            }
            let updated = compute_centroids(&fit, &labels, &centroids, dim);
            let shift = centroids
                .iter()
                .zip(&updated)
                .map(|(a, b)| squared_distance(a, b).sqrt())
                .fold(0.0f32, f32::max);
            centroids = updated;

            trace!(iteration, shift, "Lloyd iteration");
            if shift <= self.config.tolerance {
                break;
            }
        }

        self.check_budget(started)?;

        let points: Vec<&[f32]> = vectors.iter().map(|v| v.as_slice()).collect();
        let assignment: Vec<usize> = points.iter().map(|p| nearest(p, &centroids)).collect();
        let centroids = compute_centroids(&points, &assignment, &centroids, dim);

        Ok(Partitioning {
            assignment,
            centroids,
        }
        .compact())
    }
}

/// k-means++ seeding: each new center is drawn with probability
/// proportional to its squared distance from the nearest existing center.
fn kmeans_plus_plus_init(points: &[&[f32]], k: usize, rng: &mut StdRng) -> Vec<Vec<f32>> {
    let mut centroids: Vec<Vec<f32>> = Vec::with_capacity(k);
    if points.is_empty() || k == 0 {
        return centroids;
    }

    let first = rng.random_range(0..points.len());
    centroids.push(points[first].to_vec());

    let mut min_distances = vec![f64::MAX; points.len()];
    while centroids.len() < k {
        let last = &centroids[centroids.len() - 1];
        for (i, point) in points.iter().enumerate() {
            let d = squared_distance(point, last) as f64;
            if d < min_distances[i] {
                min_distances[i] = d;
            }
        }

        let total: f64 = min_distances.iter().sum();
        if total <= 0.0 {
            // Every point sits on a center already
            break;
        }

        let target = rng.random::<f64>() * total;
        let mut cumulative = 0.0;
        let mut chosen = points.len() - 1;
        for (i, d) in min_distances.iter().enumerate() {
            cumulative += d;
            if cumulative >= target && *d > 0.0 {
                chosen = i;
                break;
            }
        }
        centroids.push(points[chosen].to_vec());
    }

    centroids
}

/// Mean of the points in each cluster. Empty clusters keep their previous centroid.
fn compute_centroids(
    points: &[&[f32]],
    labels: &[usize],
    previous: &[Vec<f32>],
    dim: usize,
) -> Vec<Vec<f32>> {
    let mut sums = vec![vec![0.0f64; dim]; previous.len()];
    let mut counts = vec![0usize; previous.len()];

    for (point, &label) in points.iter().zip(labels) {
        counts[label] += 1;
        for (sum, value) in sums[label].iter_mut().zip(point.iter()) {
            *sum += *value as f64;
        }
    }

    sums.into_iter()
        .zip(counts)
        .zip(previous)
        .map(|((sum, count), prev)| {
            if count == 0 {
                prev.clone()
            } else {
                sum.into_iter().map(|s| (s / count as f64) as f32).collect()
            }
        })
        .collect()
}

fn nearest(point: &[f32], centroids: &[Vec<f32>]) -> usize {
    let mut best = 0;
    let mut best_distance = f32::MAX;
    for (i, centroid) in centroids.iter().enumerate() {
        let d = squared_distance(point, centroid);
        if d < best_distance {
            best_distance = d;
            best = i;
        }
    }
    best
}

pub(crate) fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}
