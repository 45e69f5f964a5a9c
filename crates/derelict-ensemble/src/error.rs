use derelict_rf::RfError;
use derelict_spatial::SpatialError;
use uuid::Uuid;

use crate::scorer::ScorerKind;

/// Errors from ensemble scoring, validation and training.
///
/// Only contract violations surface here. Recoverable conditions have their
/// own types ([`ConvergenceError`], [`EvidenceUnavailable`], [`FeatureUnavailable`])
/// and are absorbed where they occur.
#[derive(Debug, thiserror::Error)]
pub enum EnsembleError {
    /// Returned when a feature vector does not match the trained schema length.
    #[error("feature vector has {got} values, expected {expected}")]
    InputShape {
        /// Length of the trained schema.
        expected: usize,
        /// Length supplied.
        got: usize,
    },

    /// Returned when a feature vector's column names differ from the trained schema.
    #[error("feature {position} is '{got}', expected '{expected}'")]
    SchemaMismatch {
        /// Column position of the first difference.
        position: usize,
        /// Name in the trained schema.
        expected: String,
        /// Name supplied.
        got: String,
    },

    /// Returned when a base score is NaN or outside `[0, 1]`.
    #[error("{component} score {value} is outside [0, 1]")]
    ScoreRange {
        /// The component that produced the score.
        component: ScorerKind,
        /// The offending value.
        value: f64,
    },

    /// Returned when weights are negative, non-finite or do not sum to 1.
    #[error("weights ({rf}, {spatial}, {kde}) are not a point on the simplex")]
    InvalidWeights {
        /// Random-forest weight.
        rf: f64,
        /// DBSCAN weight.
        spatial: f64,
        /// KDE weight.
        kde: f64,
    },

    /// Returned when a threshold or cap is outside `[0, 1]`.
    #[error("{name} must be in [0, 1], got {value}")]
    InvalidThreshold {
        /// Parameter name.
        name: &'static str,
        /// The rejected value.
        value: f64,
    },

    /// Returned when fewer than 2 folds are requested.
    #[error("n_folds must be at least 2, got {n_folds}")]
    InvalidFoldCount {
        /// The invalid fold count.
        n_folds: usize,
    },

    /// Returned when fewer zones contain samples than are needed for validation.
    #[error("need samples in at least {required} zones, found {n_zones}")]
    TooFewZones {
        /// Zones that contain at least one sample.
        n_zones: usize,
        /// Minimum required.
        required: usize,
    },

    /// Returned when a concurrency bound or evaluation budget is zero.
    #[error("{name} must be at least 1")]
    ZeroBudget {
        /// Parameter name.
        name: &'static str,
    },

    /// Returned when no labeled samples are supplied.
    #[error("no labeled samples")]
    EmptyTrainingSet,

    /// Returned when training samples disagree on feature names.
    #[error("sample '{sample_id}' has a different feature schema")]
    MixedSchemas {
        /// Identifier of the first offending sample.
        sample_id: String,
    },

    /// Returned when a training run is cancelled at a fold boundary.
    #[error("training cancelled after {completed_folds} completed folds")]
    Cancelled {
        /// Folds finished before cancellation was observed.
        completed_folds: usize,
    },

    /// Returned when no trained model is active.
    #[error("no trained model is active")]
    NotTrained,

    /// Returned when rolling back to a run the registry has never seen.
    #[error("unknown training run {run_id}")]
    UnknownRun {
        /// The requested run id.
        run_id: Uuid,
    },

    /// Returned when an explanation reference is not in the explanation store.
    #[error("unknown explanation reference '{reference}'")]
    UnknownExplanation {
        /// The requested reference.
        reference: String,
    },

    /// Wraps forest training and prediction errors.
    #[error(transparent)]
    Forest(#[from] RfError),

    /// Wraps spatial errors that are not recovered by retrying.
    #[error(transparent)]
    Spatial(#[from] SpatialError),

    /// Returned when the evidence worker pool cannot be started.
    #[error("failed to start evidence worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// The weight search did not beat uniform weights.
///
/// Recovered by [`crate::WeightOptimizer::optimize_or_uniform`], which falls
/// back to [`crate::ModelWeights::uniform`] and logs a warning.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConvergenceError {
    /// Returned when validation labels contain a single class.
    #[error("validation labels are single-class ({n_positive} of {n_samples} positive)")]
    DegenerateLabels {
        /// Number of validation samples.
        n_samples: usize,
        /// Number of positive samples.
        n_positive: usize,
    },

    /// Returned when every fold's metric is undefined.
    #[error("none of the {n_folds} folds has a defined metric")]
    NoScorableFold {
        /// Number of folds examined.
        n_folds: usize,
    },

    /// Returned when the best weights found do not improve on uniform weights.
    #[error("best metric {best} does not improve on uniform {uniform} after {evaluations} evaluations")]
    NoImprovement {
        /// Metric achieved by uniform weights.
        uniform: f64,
        /// Best metric found.
        best: f64,
        /// Objective evaluations spent.
        evaluations: usize,
    },
}

/// An imagery collaborator could not supply evidence.
///
/// The funnel maps every variant to a neutral adjustment.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvidenceUnavailable {
    /// Returned when no imagery covers the location.
    #[error("no coverage")]
    NoCoverage,

    /// Returned when the latest imagery is obscured.
    #[error("cloud cover {percent}%")]
    CloudCover {
        /// Cloud cover percentage of the latest scene.
        percent: f64,
    },

    /// Returned when the upstream service failed.
    #[error("upstream failure: {message}")]
    Upstream {
        /// Upstream error message.
        message: String,
    },

    /// Returned when the call did not finish within the per-call timeout.
    #[error("timed out after {timeout_ms} ms")]
    TimedOut {
        /// The timeout that expired.
        timeout_ms: u64,
    },
}

/// The feature provider has no feature vector for a location.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("features unavailable: {reason}")]
pub struct FeatureUnavailable {
    pub reason: String,
}
