//! One training run: blocked validation, weight search and the final forest.

use std::sync::Arc;

use derelict_rf::Forest;
use derelict_spatial::{GeoPoint, ZoneLayout};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::cancel::CancellationToken;
use crate::engine::EngineConfig;
use crate::error::{ConvergenceError, EnsembleError};
use crate::metrics::Metric;
use crate::optimizer::WeightOptimizer;
use crate::precompute::{FoldScores, mean_metric, precompute_folds};
use crate::sample::LabeledSample;
use crate::validator::{Fold, FoldReport, SpatialValidator, ValidationReport, ZoneConfig};
use crate::weights::ModelWeights;

/// Everything a training run produces.
#[derive(Debug)]
pub struct TrainingOutcome {
    pub weights: ModelWeights,
    pub report: ValidationReport,
    /// Forest fitted on every sample, for scoring.
    pub forest: Arc<Forest>,
    pub layout: Arc<ZoneLayout>,
    /// Set when the weight search fell back to uniform weights.
    pub convergence: Option<ConvergenceError>,
}

/// Validate, search weights and fit the scoring forest.
///
/// `buffer_radius_m` overrides the configured validator buffer.
///
/// # Errors
///
/// | Variant | Condition |
/// |---|---|
/// | [`EnsembleError::EmptyTrainingSet`] | `samples` is empty |
/// | [`EnsembleError::MixedSchemas`] | samples disagree on feature names |
/// | [`EnsembleError::TooFewZones`] | samples occupy fewer than 2 zones |
/// | [`EnsembleError::Cancelled`] | `cancel` was set at a fold boundary |
/// | [`EnsembleError::Forest`] | forest training failed |
/// | [`EnsembleError::Spatial`] | invalid zones or buffer |
#[instrument(skip_all, fields(n_samples = samples.len(), buffer_radius_m = buffer_radius_m))]
pub fn run_training(
    samples: &[LabeledSample],
    zones: &ZoneConfig,
    buffer_radius_m: f64,
    config: &EngineConfig,
    cancel: &CancellationToken,
) -> Result<TrainingOutcome, EnsembleError> {
    let first = samples.first().ok_or(EnsembleError::EmptyTrainingSet)?;
    let schema = first.features.names();
    if let Some(odd) = samples.iter().find(|s| s.features.names()[..] != schema[..]) {
        return Err(EnsembleError::MixedSchemas {
            sample_id: odd.id.clone(),
        });
    }

    let run_id = Uuid::new_v4();
    let validator_config = config.validator.clone().with_buffer_radius_m(buffer_radius_m)?;
    let metric = validator_config.metric();
    let locations: Vec<GeoPoint> = samples.iter().map(|s| s.location).collect();
    let layout = Arc::new(zones.layout(&locations, validator_config.seed())?);
    let validator = SpatialValidator::new(Arc::clone(&layout), validator_config)?;
    let folds = validator.folds(&locations)?;
    info!(%run_id, n_zones = layout.len(), n_folds = folds.len(), "training run started");

    let scored = precompute_folds(samples, &folds, &layout, &config.scorers, cancel)?;
    let optimizer = WeightOptimizer::new(config.optimizer, metric)?;
    let (weights, convergence) = optimizer.optimize_or_uniform(&scored, run_id);

    if cancel.is_cancelled() {
        warn!(%run_id, completed_folds = scored.len(), "training cancelled before final fit");
        return Err(EnsembleError::Cancelled {
            completed_folds: scored.len(),
        });
    }

    let features: Vec<Vec<f64>> = samples.iter().map(|s| s.features.values().to_vec()).collect();
    let labels: Vec<bool> = samples.iter().map(|s| s.abandoned).collect();
    let forest = Arc::new(config.scorers.forest.clone().fit(&features, &labels, schema)?.into_forest());

    let chosen = weights.as_array();
    let uniform = ModelWeights::uniform(run_id).as_array();
    let mean = mean_metric(&scored, metric, &chosen);
    let weights = if convergence.is_some() {
        ModelWeights::from_array(chosen, run_id, mean)?
    } else {
        weights
    };

    let report = ValidationReport {
        run_id,
        metric,
        buffer_radius_m,
        folds: folds.iter().map(|f| fold_report(f, &scored, metric, &chosen)).collect(),
        mean_metric: mean,
        uniform_metric: mean_metric(&scored, metric, &uniform),
        fallback_reason: convergence.as_ref().map(ToString::to_string),
        zones: layout.zones().to_vec(),
    };
    info!(
        %run_id,
        rf = weights.rf(),
        spatial = weights.spatial(),
        kde = weights.kde(),
        mean_metric = ?report.mean_metric,
        fallback = convergence.is_some(),
        "training run finished"
    );

    Ok(TrainingOutcome {
        weights,
        report,
        forest,
        layout,
        convergence,
    })
}

fn fold_report(fold: &Fold, scored: &[FoldScores], metric: Metric, weights: &[f64; 3]) -> FoldReport {
    FoldReport {
        index: fold.index,
        test_zones: fold.test_zones.clone(),
        n_train: fold.train.len(),
        n_test: fold.test.len(),
        n_excluded: fold.excluded.len(),
        min_train_boundary_distance_m: fold.min_train_boundary_distance_m,
        metric: scored
            .iter()
            .find(|s| s.index == fold.index)
            .and_then(|s| s.evaluate(metric, weights)),
    }
}
