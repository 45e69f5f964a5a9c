//! Out-of-fold base scores for every validation fold.
//!
//! Each fold fits its own forest and builds its own cluster and density
//! models from the fold's retained training samples only, then scores the
//! held-out samples. The weight search then only ever fuses these cached
//! scores.

use std::sync::Arc;

use derelict_rf::{Forest, ForestConfig};
use derelict_spatial::{
    ClusterModel, ClusterParams, ConfirmedPoint, DensityModel, DensityParams, IndexSnapshot, IndexVersion, ZoneLayout,
};
use rayon::prelude::*;
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancellationToken;
use crate::error::EnsembleError;
use crate::metrics::Metric;
use crate::sample::LabeledSample;
use crate::validator::Fold;

/// Parameters of the three base scorers.
///
/// # Defaults
///
/// | Parameter  | Default                   |
/// |------------|---------------------------|
/// | `forest`   | 100 trees, see `ForestConfig` |
/// | `cluster`  | eps 500 m, min_samples 3  |
/// | `density`  | bandwidth 1000 m          |
/// | `bucket_m` | 250.0                     |
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ScorerConfig {
    pub forest: ForestConfig,
    pub cluster: ClusterParams,
    pub density: DensityParams,
    /// Bucket edge of confirmed-point snapshots, in meters.
    pub bucket_m: f64,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            forest: ForestConfig::default(),
            cluster: ClusterParams::default(),
            density: DensityParams::default(),
            bucket_m: 250.0,
        }
    }
}

/// Base scores of one fold's held-out samples.
#[derive(Debug, Clone, PartialEq)]
pub struct FoldScores {
    pub index: usize,
    /// Positions of the scored samples in the training slice.
    pub sample_indices: Vec<usize>,
    pub labels: Vec<bool>,
    /// `[rf, spatial, kde]` per held-out sample.
    pub components: Vec<[f64; 3]>,
}

impl FoldScores {
    fn empty(index: usize) -> Self {
        Self {
            index,
            sample_indices: Vec::new(),
            labels: Vec::new(),
            components: Vec::new(),
        }
    }

    /// Fused scores under `weights`.
    #[must_use]
    pub fn fused(&self, weights: &[f64; 3]) -> Vec<f64> {
        self.components
            .iter()
            .map(|c| (c[0] * weights[0] + c[1] * weights[1] + c[2] * weights[2]).clamp(0.0, 1.0))
            .collect()
    }

    /// Metric of the fused scores; `None` when undefined for this fold.
    #[must_use]
    pub fn evaluate(&self, metric: Metric, weights: &[f64; 3]) -> Option<f64> {
        metric.evaluate(&self.fused(weights), &self.labels)
    }
}

/// Mean metric over the folds where it is defined.
#[must_use]
pub fn mean_metric(folds: &[FoldScores], metric: Metric, weights: &[f64; 3]) -> Option<f64> {
    let defined: Vec<f64> = folds.iter().filter_map(|f| f.evaluate(metric, weights)).collect();
    if defined.is_empty() {
        None
    } else {
        Some(defined.iter().sum::<f64>() / defined.len() as f64)
    }
}

/// Fit per-fold models and score each fold's held-out samples.
///
/// Cancellation is checked before each fold starts, never inside one.
///
/// # Errors
///
/// | Variant | Condition |
/// |---|---|
/// | [`EnsembleError::Cancelled`] | `cancel` was set at a fold boundary |
/// | [`EnsembleError::Forest`] | forest training failed |
/// | [`EnsembleError::Spatial`] | a spatial model could not score a sample |
#[instrument(skip_all, fields(n_folds = folds.len(), n_samples = samples.len()))]
pub fn precompute_folds(
    samples: &[LabeledSample],
    folds: &[Fold],
    layout: &Arc<ZoneLayout>,
    config: &ScorerConfig,
    cancel: &CancellationToken,
) -> Result<Vec<FoldScores>, EnsembleError> {
    let mut scored = Vec::with_capacity(folds.len());
    for fold in folds {
        if cancel.is_cancelled() {
            warn!(completed_folds = scored.len(), "training cancelled at fold boundary");
            return Err(EnsembleError::Cancelled {
                completed_folds: scored.len(),
            });
        }
        scored.push(score_fold(samples, fold, layout, config)?);
    }
    info!(n_folds = scored.len(), "out-of-fold scores ready");
    Ok(scored)
}

fn score_fold(
    samples: &[LabeledSample],
    fold: &Fold,
    layout: &Arc<ZoneLayout>,
    config: &ScorerConfig,
) -> Result<FoldScores, EnsembleError> {
    if fold.train.is_empty() || fold.test.is_empty() {
        warn!(
            fold = fold.index,
            zones = ?fold.test_zones,
            n_train = fold.train.len(),
            n_test = fold.test.len(),
            "fold skipped"
        );
        return Ok(FoldScores::empty(fold.index));
    }

    let train: Vec<&LabeledSample> = fold.train.iter().map(|&i| &samples[i]).collect();
    let models = FoldModels::fit(&train, layout, config, fold.index)?;
    let components = fold
        .test
        .par_iter()
        .map(|&i| models.score(&samples[i]))
        .collect::<Result<Vec<_>, EnsembleError>>()?;

    debug!(
        fold = fold.index,
        n_train = train.len(),
        n_confirmed = models.snapshot.len(),
        "fold scored"
    );
    Ok(FoldScores {
        index: fold.index,
        sample_indices: fold.test.clone(),
        labels: fold.test.iter().map(|&i| samples[i].abandoned).collect(),
        components,
    })
}

struct FoldModels {
    forest: Forest,
    snapshot: IndexSnapshot,
    cluster: ClusterModel,
    density: DensityModel,
}

impl FoldModels {
    fn fit(
        train: &[&LabeledSample],
        layout: &Arc<ZoneLayout>,
        config: &ScorerConfig,
        fold: usize,
    ) -> Result<Self, EnsembleError> {
        let features: Vec<Vec<f64>> = train.iter().map(|s| s.features.values().to_vec()).collect();
        let labels: Vec<bool> = train.iter().map(|s| s.abandoned).collect();
        let names = train[0].features.names();
        let forest = config
            .forest
            .clone()
            .with_seed(config.forest.seed().wrapping_add(fold as u64))
            .fit(&features, &labels, names)?
            .into_forest();

        let confirmed: Vec<ConfirmedPoint> = train
            .iter()
            .filter(|s| s.abandoned)
            .map(|s| ConfirmedPoint {
                location: s.location,
                confirmed_at: 0,
            })
            .collect();
        let snapshot = IndexSnapshot::build(IndexVersion::new(fold as u64 + 1), confirmed, config.bucket_m);
        let cluster = ClusterModel::build(&snapshot, config.cluster);
        let density = DensityModel::build(&snapshot, config.density, Some(Arc::clone(layout)));
        Ok(Self {
            forest,
            snapshot,
            cluster,
            density,
        })
    }

    fn score(&self, sample: &LabeledSample) -> Result<[f64; 3], EnsembleError> {
        Ok([
            self.forest.predict_proba(sample.features.values())?,
            self.cluster.score(&self.snapshot, &sample.location)?,
            self.density.score(&self.snapshot, &sample.location)?,
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::{FoldScores, mean_metric};
    use crate::metrics::Metric;

    fn fold(labels: Vec<bool>, components: Vec<[f64; 3]>) -> FoldScores {
        FoldScores {
            index: 0,
            sample_indices: (0..labels.len()).collect(),
            labels,
            components,
        }
    }

    #[test]
    fn fused_scores_follow_weights() {
        let f = fold(vec![true, false], vec![[1.0, 0.0, 0.5], [0.0, 1.0, 0.5]]);
        assert_eq!(f.fused(&[1.0, 0.0, 0.0]), vec![1.0, 0.0]);
        assert_eq!(f.fused(&[0.0, 1.0, 0.0]), vec![0.0, 1.0]);
        assert_eq!(f.evaluate(Metric::Auc, &[1.0, 0.0, 0.0]), Some(1.0));
        assert_eq!(f.evaluate(Metric::Auc, &[0.0, 1.0, 0.0]), Some(0.0));
    }

    #[test]
    fn undefined_folds_are_left_out_of_the_mean() {
        let good = fold(vec![true, false], vec![[0.9, 0.0, 0.0], [0.1, 0.0, 0.0]]);
        let single = fold(vec![true, true], vec![[0.2, 0.0, 0.0], [0.3, 0.0, 0.0]]);
        let w = [1.0, 0.0, 0.0];
        assert_eq!(mean_metric(&[good, single.clone()], Metric::Auc, &w), Some(1.0));
        assert_eq!(mean_metric(&[single], Metric::Auc, &w), None);
    }
}
