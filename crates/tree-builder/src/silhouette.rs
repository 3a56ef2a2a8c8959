//! Sampled silhouette score with cosine distance.
//!
//! Used as an optional quality gate: a split scoring below
//! `min_silhouette` is not worth committing and the node becomes a leaf.

use rand::rngs::StdRng;
use rand::SeedableRng;

/// Mean silhouette coefficient over a seeded sample of at most
/// `sample_size` points. Returns `None` when fewer than two clusters are
/// represented in the sample.
pub fn silhouette_score(
    vectors: &[Vec<f32>],
    assignment: &[usize],
    sample_size: usize,
    seed: u64,
) -> Option<f32> {
    let n = vectors.len().min(assignment.len());
    if n < 2 || sample_size < 2 {
        return None;
    }

    let indices: Vec<usize> = if n > sample_size {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut picked = rand::seq::index::sample(&mut rng, n, sample_size).into_vec();
        picked.sort_unstable();
        picked
    } else {
        (0..n).collect()
    };

    let cluster_count = indices.iter().map(|&i| assignment[i]).max()? + 1;
    let mut cluster_sizes = vec![0usize; cluster_count];
    for &i in &indices {
        cluster_sizes[assignment[i]] += 1;
    }
    if cluster_sizes.iter().filter(|&&s| s > 0).count() < 2 {
        return None;
    }

    let norms: Vec<f32> = indices.iter().map(|&i| norm(&vectors[i])).collect();

    let mut total = 0.0f64;
    for (a_pos, &a) in indices.iter().enumerate() {
        let own = assignment[a];
        if cluster_sizes[own] <= 1 {
            // Singleton clusters score zero
            continue;
        }

        let mut sums = vec![0.0f64; cluster_count];
        for (b_pos, &b) in indices.iter().enumerate() {
            if a_pos == b_pos {
                continue;
            }
            let d = cosine_distance(&vectors[a], norms[a_pos], &vectors[b], norms[b_pos]);
            sums[assignment[b]] += d as f64;
        }

        let intra = sums[own] / (cluster_sizes[own] - 1) as f64;
        let mut inter = f64::MAX;
        for (cluster, (&sum, &size)) in sums.iter().zip(&cluster_sizes).enumerate() {
            if cluster != own && size > 0 {
                inter = inter.min(sum / size as f64);
            }
        }

        let denom = intra.max(inter);
        if denom > 0.0 {
            total += (inter - intra) / denom;
        }
    }

    Some((total / indices.len() as f64) as f32)
}

fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

fn cosine_distance(a: &[f32], norm_a: f32, b: &[f32], norm_b: f32) -> f32 {
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    1.0 - dot / (norm_a * norm_b)
}
