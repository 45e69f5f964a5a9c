//! Planar k-means used to derive spatial blocks from sample locations.

use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use tracing::{debug, instrument};

use crate::error::SpatialError;
use crate::geo::PlanarPoint;

/// Lloyd iterations stop after this many rounds even without convergence.
const MAX_ITER: usize = 100;

/// Select `k` initial centroid indices with k-means++ seeding.
///
/// The first centroid is uniform; each subsequent one is drawn with
/// probability proportional to the squared distance to the nearest chosen
/// centroid. Callers guarantee at least `k` distinct points.
fn kmeans_plus_plus(points: &[PlanarPoint], k: usize, rng: &mut ChaCha8Rng) -> Vec<usize> {
    let n = points.len();
    let mut chosen: Vec<usize> = Vec::with_capacity(k);
    chosen.push(rng.gen_range(0..n));

    for _ in 1..k {
        let weights: Vec<f64> = points
            .par_iter()
            .map(|p| {
                chosen
                    .iter()
                    .map(|&j| p.distance(&points[j]).powi(2))
                    .fold(f64::INFINITY, f64::min)
            })
            .collect();

        let total: f64 = weights.iter().sum();
        if total == 0.0 {
            break;
        }
        let threshold = rng.gen_range(0.0..total);
        let mut cumsum = 0.0;
        let mut selected = n - 1;
        for (i, &w) in weights.iter().enumerate() {
            cumsum += w;
            if cumsum > threshold {
                selected = i;
                break;
            }
        }
        chosen.push(selected);
    }
    chosen
}

fn nearest(p: &PlanarPoint, centroids: &[PlanarPoint]) -> usize {
    centroids
        .iter()
        .enumerate()
        .min_by(|a, b| p.distance(a.1).total_cmp(&p.distance(b.1)))
        .map_or(0, |(i, _)| i)
}

/// Cluster planar points into `k` groups and return the centroids.
///
/// # Errors
///
/// | Variant | Condition |
/// |---|---|
/// | [`SpatialError::InvalidK`] | `k == 0` |
/// | [`SpatialError::TooFewPoints`] | fewer than `k` distinct points |
#[instrument(skip(points), fields(n = points.len()))]
pub(crate) fn kmeans(points: &[PlanarPoint], k: usize, seed: u64) -> Result<Vec<PlanarPoint>, SpatialError> {
    if k == 0 {
        return Err(SpatialError::InvalidK { k });
    }
    let mut distinct: Vec<(u64, u64)> = points.iter().map(|p| (p.x.to_bits(), p.y.to_bits())).collect();
    distinct.sort_unstable();
    distinct.dedup();
    if distinct.len() < k {
        return Err(SpatialError::TooFewPoints {
            n_points: distinct.len(),
            k,
        });
    }

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut centroids: Vec<PlanarPoint> = kmeans_plus_plus(points, k, &mut rng)
        .into_iter()
        .map(|i| points[i])
        .collect();
    let mut assignments = vec![usize::MAX; points.len()];

    for iteration in 0..MAX_ITER {
        let next: Vec<usize> = points.par_iter().map(|p| nearest(p, &centroids)).collect();
        let changed = next != assignments;
        assignments = next;

        let mut sums = vec![(0.0, 0.0, 0usize); centroids.len()];
        for (p, &c) in points.iter().zip(&assignments) {
            sums[c].0 += p.x;
            sums[c].1 += p.y;
            sums[c].2 += 1;
        }
        for (c, &(sx, sy, count)) in sums.iter().enumerate() {
            if count > 0 {
                centroids[c] = PlanarPoint::new(sx / count as f64, sy / count as f64);
            }
        }

        if !changed {
            debug!(iteration, "k-means converged");
            break;
        }
    }
    Ok(centroids)
}

#[cfg(test)]
mod tests {
    use super::kmeans;
    use crate::geo::PlanarPoint;

    fn blobs() -> Vec<PlanarPoint> {
        let mut pts = Vec::new();
        for &(cx, cy) in &[(0.0, 0.0), (1000.0, 0.0), (0.0, 1000.0)] {
            for i in 0..5 {
                pts.push(PlanarPoint::new(cx + i as f64, cy - i as f64));
            }
        }
        pts
    }

    #[test]
    fn finds_three_blobs() {
        let mut centroids = kmeans(&blobs(), 3, 42).unwrap();
        centroids.sort_by(|a, b| (a.x + 2.0 * a.y).total_cmp(&(b.x + 2.0 * b.y)));
        assert!(centroids[0].distance(&PlanarPoint::new(2.0, -2.0)) < 1e-9);
        assert!(centroids[1].distance(&PlanarPoint::new(1002.0, -2.0)) < 1e-9);
        assert!(centroids[2].distance(&PlanarPoint::new(2.0, 998.0)) < 1e-9);
    }

    #[test]
    fn deterministic_with_seed() {
        assert_eq!(kmeans(&blobs(), 3, 7).unwrap(), kmeans(&blobs(), 3, 7).unwrap());
    }

    #[test]
    fn too_few_distinct_points() {
        let pts = vec![PlanarPoint::new(1.0, 1.0); 4];
        assert!(kmeans(&pts, 2, 1).is_err());
        assert!(kmeans(&pts, 0, 1).is_err());
    }
}
