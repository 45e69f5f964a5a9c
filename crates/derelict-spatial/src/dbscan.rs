//! DBSCAN over confirmed points and the neighbourhood score derived from it.

use std::collections::VecDeque;

use rayon::prelude::*;
use tracing::{debug, instrument};

use crate::error::SpatialError;
use crate::geo::GeoPoint;
use crate::index::{IndexSnapshot, IndexVersion};
use crate::label::ClusterLabel;

/// Scores below this are clamped up so out-of-cluster locations keep a gradient.
const SCORE_FLOOR: f64 = 1e-12;

/// Neighbourhood parameters for DBSCAN and the cluster score.
///
/// # Defaults
///
/// | Parameter     | Default |
/// |---------------|---------|
/// | `eps_m`       | 500.0   |
/// | `min_samples` | 3       |
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ClusterParams {
    eps_m: f64,
    min_samples: usize,
}

impl ClusterParams {
    /// # Errors
    ///
    /// | Variant | Condition |
    /// |---|---|
    /// | [`SpatialError::InvalidLength`] | `eps_m` not positive and finite |
    /// | [`SpatialError::InvalidMinSamples`] | `min_samples == 0` |
    pub fn new(eps_m: f64, min_samples: usize) -> Result<Self, SpatialError> {
        if !(eps_m.is_finite() && eps_m > 0.0) {
            return Err(SpatialError::InvalidLength {
                name: "eps_m",
                value: eps_m,
            });
        }
        if min_samples == 0 {
            return Err(SpatialError::InvalidMinSamples { min_samples });
        }
        Ok(Self { eps_m, min_samples })
    }

    #[must_use]
    pub fn eps_m(&self) -> f64 {
        self.eps_m
    }

    #[must_use]
    pub fn min_samples(&self) -> usize {
        self.min_samples
    }
}

impl Default for ClusterParams {
    fn default() -> Self {
        Self {
            eps_m: 500.0,
            min_samples: 3,
        }
    }
}

/// Size and mean position of one DBSCAN cluster.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ClusterSummary {
    pub label: ClusterLabel,
    pub size: usize,
    pub centroid: GeoPoint,
}

/// DBSCAN labelling of one index snapshot.
#[derive(Debug, Clone)]
pub struct ClusterModel {
    version: IndexVersion,
    params: ClusterParams,
    labels: Vec<Option<ClusterLabel>>,
    clustered: Vec<usize>,
    n_clusters: usize,
}

impl ClusterModel {
    /// Run DBSCAN with haversine distance over the snapshot's points.
    ///
    /// A point is core when at least `min_samples` points, itself included,
    /// lie within `eps_m`. Clusters grow breadth-first through core points;
    /// border points join the first cluster that reaches them.
    #[instrument(skip_all, fields(version = %snapshot.version(), n_points = snapshot.len()))]
    pub fn build(snapshot: &IndexSnapshot, params: ClusterParams) -> Self {
        let points = snapshot.points();
        let neighbors: Vec<Vec<usize>> = points
            .par_iter()
            .map(|p| {
                snapshot
                    .within(&p.location, params.eps_m)
                    .into_iter()
                    .map(|(i, _)| i)
                    .collect()
            })
            .collect();
        let core: Vec<bool> = neighbors.iter().map(|n| n.len() >= params.min_samples).collect();

        let mut labels: Vec<Option<ClusterLabel>> = vec![None; points.len()];
        let mut n_clusters = 0;
        for seed in 0..points.len() {
            if !core[seed] || labels[seed].is_some() {
                continue;
            }
            let label = ClusterLabel::new(n_clusters);
            n_clusters += 1;
            labels[seed] = Some(label);
            let mut queue = VecDeque::from([seed]);
            while let Some(i) = queue.pop_front() {
                for &j in &neighbors[i] {
                    if labels[j].is_none() {
                        labels[j] = Some(label);
                        if core[j] {
                            queue.push_back(j);
                        }
                    }
                }
            }
        }

        let clustered: Vec<usize> = (0..points.len()).filter(|&i| labels[i].is_some()).collect();
        debug!(
            n_clusters,
            n_noise = points.len() - clustered.len(),
            "dbscan complete"
        );
        Self {
            version: snapshot.version(),
            params,
            labels,
            clustered,
            n_clusters,
        }
    }

    #[must_use]
    pub fn version(&self) -> IndexVersion {
        self.version
    }

    #[must_use]
    pub fn params(&self) -> ClusterParams {
        self.params
    }

    #[must_use]
    pub fn n_clusters(&self) -> usize {
        self.n_clusters
    }

    /// Label of the snapshot point at `index`; `None` for noise.
    #[must_use]
    pub fn label_of(&self, index: usize) -> Option<ClusterLabel> {
        self.labels.get(index).copied().flatten()
    }

    #[must_use]
    pub fn n_noise(&self) -> usize {
        self.labels.len() - self.clustered.len()
    }

    /// Per-cluster sizes and centroids, ordered by label.
    ///
    /// # Errors
    ///
    /// Returns [`SpatialError::IndexStale`] if `snapshot` is not the one this model was built from.
    pub fn summaries(&self, snapshot: &IndexSnapshot) -> Result<Vec<ClusterSummary>, SpatialError> {
        self.check_version(snapshot)?;
        let mut acc = vec![(0usize, 0.0, 0.0); self.n_clusters];
        for &i in &self.clustered {
            if let Some(label) = self.labels[i] {
                let p = snapshot.points()[i].location;
                let entry = &mut acc[label.index()];
                entry.0 += 1;
                entry.1 += p.lat;
                entry.2 += p.lon;
            }
        }
        Ok(acc
            .into_iter()
            .enumerate()
            .map(|(c, (size, lat, lon))| ClusterSummary {
                label: ClusterLabel::new(c),
                size,
                centroid: GeoPoint {
                    lat: lat / size as f64,
                    lon: lon / size as f64,
                },
            })
            .collect())
    }

    /// Neighbourhood score in `[0, 1]` for `query`.
    ///
    /// In-cluster (at least `min_samples` confirmed points within `eps`):
    /// `0.5 + 0.5·min(1, Σ(1 − (d/eps)²) / min_samples)`.
    /// Otherwise a half-life decay with half-life `eps`:
    /// `0.5·max(exp(−ln2·d_c/eps), 0.5·exp(−ln2·d_n/eps))` where `d_c` is the
    /// distance to the nearest clustered point and `d_n` to any confirmed
    /// point. An empty snapshot scores 0.
    ///
    /// # Errors
    ///
    /// Returns [`SpatialError::IndexStale`] if `snapshot` is not the one this model was built from.
    pub fn score(&self, snapshot: &IndexSnapshot, query: &GeoPoint) -> Result<f64, SpatialError> {
        self.check_version(snapshot)?;
        if snapshot.is_empty() {
            return Ok(0.0);
        }
        let eps = self.params.eps_m;
        let neighbors = snapshot.within(query, eps);
        if neighbors.len() >= self.params.min_samples {
            let density: f64 = neighbors.iter().map(|&(_, d)| 1.0 - (d / eps).powi(2)).sum();
            return Ok(0.5 + 0.5 * (density / self.params.min_samples as f64).min(1.0));
        }

        let decay = |d: f64| (-std::f64::consts::LN_2 * d / eps).exp();
        let to_cluster = snapshot
            .nearest(query, Some(&self.clustered))
            .map_or(0.0, |(_, d)| decay(d));
        let to_any = snapshot.nearest(query, None).map_or(0.0, |(_, d)| decay(d));
        Ok((0.5 * to_cluster.max(0.5 * to_any)).clamp(SCORE_FLOOR, 0.5))
    }

    fn check_version(&self, snapshot: &IndexSnapshot) -> Result<(), SpatialError> {
        if snapshot.version() != self.version {
            return Err(SpatialError::IndexStale {
                bound: snapshot.version(),
                current: self.version,
            });
        }
        Ok(())
    }
}
