//! Ensemble abandonment-risk scoring.
//!
//! Three base scorers (a random forest over tabular features, a DBSCAN
//! neighbourhood score and a KDE hotspot score) are fused with weights found
//! by a derivative-free search over the simplex. The search objective is the
//! mean metric of spatially blocked cross-validation with a buffer around
//! every held-out zone. Fused scores above the broad threshold are refined by
//! a staged evidence funnel that queries imagery collaborators with bounded
//! concurrency and a per-call timeout.
//!
//! [`RiskEngine`] exposes the three operations: [`RiskEngine::score`],
//! [`RiskEngine::train`] and [`RiskEngine::explain`].

mod cancel;
mod combiner;
mod engine;
mod error;
mod funnel;
mod gateway;
mod metrics;
mod optimizer;
mod precompute;
mod sample;
mod scorer;
mod training;
mod validator;
mod weights;

pub use cancel::CancellationToken;
pub use combiner::{ComponentContribution, ComponentScores, EnsembleCombiner, Fusion};
pub use engine::{EngineConfig, Explanation, FeatureContribution, FeatureProvider, LocationRequest, RiskEngine, RiskScore};
pub use error::{ConvergenceError, EnsembleError, EvidenceUnavailable, FeatureUnavailable};
pub use funnel::{
    EvidenceFunnel, FunnelConfig, FunnelHistory, FunnelOutcome, FunnelStage, NoEvidence, SatelliteEvidence,
    SatelliteEvidenceSource, StageScore, StreetEvidence, StreetEvidenceSource, Transition, TransitionReason,
};
pub use gateway::EvidenceGateway;
pub use metrics::{ConfusionCounts, Metric, roc_auc};
pub use optimizer::{OptimizationOutcome, OptimizerConfig, WeightOptimizer};
pub use precompute::{FoldScores, ScorerConfig, mean_metric, precompute_folds};
pub use sample::{FeatureVector, LabeledSample};
pub use scorer::{BaseScorer, DensityScorer, RandomForestScorer, ScorerKind, ScoringInput, SpatialClusterScorer};
pub use training::{TrainingOutcome, run_training};
pub use validator::{Fold, FoldReport, SpatialValidator, ValidationReport, ValidatorConfig, ZoneConfig};
pub use weights::{ModelWeights, WEIGHT_TOLERANCE, WeightRegistry};
