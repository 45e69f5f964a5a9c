//! The scoring engine.
//!
//! A call to [`RiskEngine::score`] binds the active weights, the forest of
//! the run that produced them and one confirmed-point snapshot, then scores
//! every location against that binding. Locations finalized earlier under the
//! same inputs, run and snapshot are returned from the explanation store
//! unchanged. Results from superseded snapshots or runs are evicted.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, PoisonError, RwLock};

use derelict_rf::Forest;
use derelict_spatial::{
    ClusterModel, ConfirmedPoint, DensityModel, GeoPoint, IndexSnapshot, IndexVersion, SpatialError, SpatialIndex,
    VersionedCache, ZoneId, ZoneLayout,
};
use rayon::prelude::*;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::cancel::CancellationToken;
use crate::combiner::{ComponentScores, EnsembleCombiner, Fusion};
use crate::error::{EnsembleError, FeatureUnavailable};
use crate::funnel::{
    EvidenceFunnel, FunnelConfig, FunnelHistory, SatelliteEvidenceSource, StageScore, StreetEvidenceSource,
};
use crate::optimizer::OptimizerConfig;
use crate::precompute::ScorerConfig;
use crate::sample::{FeatureVector, LabeledSample};
use crate::scorer::{BaseScorer, DensityScorer, RandomForestScorer, ScoringInput, SpatialClusterScorer};
use crate::training::{TrainingOutcome, run_training};
use crate::validator::{ValidatorConfig, ZoneConfig};
use crate::weights::{ModelWeights, WeightRegistry};

/// Supplies the fixed-schema feature vector for a coordinate.
pub trait FeatureProvider: Send + Sync {
    /// # Errors
    ///
    /// Returns [`FeatureUnavailable`] when the location has no features.
    fn features(&self, location: &GeoPoint) -> Result<FeatureVector, FeatureUnavailable>;
}

/// Everything the engine is configured with.
///
/// # Defaults
///
/// | Parameter       | Default                     |
/// |-----------------|-----------------------------|
/// | `scorers`       | see [`ScorerConfig`]        |
/// | `validator`     | see [`ValidatorConfig`]     |
/// | `optimizer`     | see [`OptimizerConfig`]     |
/// | `funnel`        | see [`FunnelConfig`]        |
/// | `stale_retries` | 3                           |
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub scorers: ScorerConfig,
    pub validator: ValidatorConfig,
    pub optimizer: OptimizerConfig,
    pub funnel: FunnelConfig,
    /// Cached rebinds tried after a stale snapshot before models are built uncached.
    pub stale_retries: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scorers: ScorerConfig::default(),
            validator: ValidatorConfig::default(),
            optimizer: OptimizerConfig::default(),
            funnel: FunnelConfig::default(),
            stale_retries: 3,
        }
    }
}

impl EngineConfig {
    /// # Errors
    ///
    /// | Variant | Condition |
    /// |---|---|
    /// | [`EnsembleError::InvalidThreshold`] | a funnel threshold or cap is out of range |
    /// | [`EnsembleError::ZeroBudget`] | a concurrency bound or evaluation budget is zero |
    /// | [`EnsembleError::InvalidFoldCount`] | fewer than 2 folds |
    pub fn validate(&self) -> Result<(), EnsembleError> {
        self.funnel.validate()?;
        self.optimizer.validate()?;
        if self.validator.n_folds() < 2 {
            return Err(EnsembleError::InvalidFoldCount {
                n_folds: self.validator.n_folds(),
            });
        }
        Ok(())
    }
}

/// A location to score.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationRequest {
    pub id: String,
    pub location: GeoPoint,
}

/// The engine's verdict for one location.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct RiskScore {
    pub location_id: String,
    pub location: GeoPoint,
    pub base_confidence: f64,
    /// Scores after each stage the location passed through, `Broad` first.
    pub stage_scores: Vec<StageScore>,
    pub final_confidence: f64,
    /// Key for [`RiskEngine::explain`].
    pub explanation_ref: String,
    pub index_version: IndexVersion,
    pub run_id: Uuid,
}

/// One feature's share of the forest probability.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct FeatureContribution {
    pub name: String,
    pub contribution: f64,
}

/// How a [`RiskScore`] came about.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Explanation {
    pub explanation_ref: String,
    pub location_id: String,
    pub location: GeoPoint,
    /// Blocking zone of the location under the run's layout, if any.
    pub zone: Option<ZoneId>,
    pub index_version: IndexVersion,
    pub run_id: Uuid,
    /// Per-component prediction, weight and contribution.
    pub fusion: Fusion,
    /// Mean root value of the forest; `None` when the forest was dropped.
    pub forest_bias: Option<f64>,
    /// Decision-path contributions, largest magnitude first.
    pub feature_contributions: Vec<FeatureContribution>,
    /// Why the forest was dropped, if it was.
    pub feature_note: Option<String>,
    pub history: FunnelHistory,
    pub final_confidence: f64,
}

#[derive(Debug)]
struct TrainedRun {
    run_id: Uuid,
    forest: Arc<Forest>,
    layout: Option<Arc<ZoneLayout>>,
    densities: VersionedCache<DensityModel>,
}

#[derive(Debug)]
struct Finalized {
    score: RiskScore,
    explanation: Explanation,
}

/// Models and snapshot one `score` call is bound to.
struct Binding {
    snapshot: Arc<IndexSnapshot>,
    run: Arc<TrainedRun>,
    combiner: EnsembleCombiner,
    forest: RandomForestScorer,
    scorers: Vec<Box<dyn BaseScorer>>,
}

struct Pending {
    request: LocationRequest,
    explanation_ref: String,
    fusion: Fusion,
    forest_bias: Option<f64>,
    feature_contributions: Vec<FeatureContribution>,
    feature_note: Option<String>,
}

enum Prepared {
    Done(Arc<Finalized>),
    Pending(Box<Pending>),
}

/// Scores locations, trains weights and answers explanation lookups.
pub struct RiskEngine {
    config: EngineConfig,
    index: Arc<SpatialIndex>,
    features: Arc<dyn FeatureProvider>,
    funnel: EvidenceFunnel,
    funnel_pool: rayon::ThreadPool,
    registry: WeightRegistry,
    runs: RwLock<HashMap<Uuid, Arc<TrainedRun>>>,
    clusters: VersionedCache<ClusterModel>,
    finalized: RwLock<HashMap<String, Arc<Finalized>>>,
}

impl fmt::Debug for RiskEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RiskEngine")
            .field("config", &self.config)
            .field("index_version", &self.index.version())
            .field("funnel", &self.funnel)
            .finish_non_exhaustive()
    }
}

impl RiskEngine {
    /// # Errors
    ///
    /// | Variant | Condition |
    /// |---|---|
    /// | see [`EngineConfig::validate`] | invalid configuration |
    /// | [`EnsembleError::ThreadPool`] | the evidence worker pool cannot start |
    pub fn new(
        config: EngineConfig,
        index: Arc<SpatialIndex>,
        features: Arc<dyn FeatureProvider>,
        satellite: Arc<dyn SatelliteEvidenceSource>,
        street: Arc<dyn StreetEvidenceSource>,
    ) -> Result<Self, EnsembleError> {
        config.validate()?;
        let funnel = EvidenceFunnel::new(config.funnel, satellite, street)?;
        let funnel_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.funnel.max_in_flight())
            .thread_name(|i| format!("derelict-funnel-{i}"))
            .build()?;
        Ok(Self {
            config,
            index,
            features,
            funnel,
            funnel_pool,
            registry: WeightRegistry::new(),
            runs: RwLock::new(HashMap::new()),
            clusters: VersionedCache::new(),
            finalized: RwLock::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn index(&self) -> &Arc<SpatialIndex> {
        &self.index
    }

    #[must_use]
    pub fn registry(&self) -> &WeightRegistry {
        &self.registry
    }

    /// Replace the confirmed set under a new index version.
    ///
    /// # Errors
    ///
    /// Returns [`EnsembleError::Spatial`] if a point is out of range.
    pub fn publish_confirmed(&self, points: Vec<ConfirmedPoint>) -> Result<IndexVersion, EnsembleError> {
        Ok(self.index.publish(points)?)
    }

    /// Register a trained forest with its weights and make them active.
    ///
    /// `layout` is the run's blocking layout; density scores are normalised
    /// per zone when it is given.
    ///
    /// # Errors
    ///
    /// Returns [`EnsembleError::InvalidWeights`] if `weights` is not on the simplex.
    pub fn install(
        &self,
        forest: Arc<Forest>,
        weights: ModelWeights,
        layout: Option<Arc<ZoneLayout>>,
    ) -> Result<Arc<ModelWeights>, EnsembleError> {
        weights.validate()?;
        let run_id = weights.run_id();
        let run = Arc::new(TrainedRun {
            run_id,
            forest,
            layout,
            densities: VersionedCache::new(),
        });
        self.runs.write().unwrap_or_else(PoisonError::into_inner).insert(run_id, run);
        self.registry.register(weights)
    }

    /// Point the active weights back at an earlier run.
    ///
    /// # Errors
    ///
    /// Returns [`EnsembleError::UnknownRun`] if the run was never installed.
    pub fn activate(&self, run_id: Uuid) -> Result<Arc<ModelWeights>, EnsembleError> {
        self.registry.activate(run_id)
    }

    /// Run blocked validation and the weight search on `samples`, then
    /// install the result as the active model.
    ///
    /// A [`crate::ConvergenceError`] is not an error here: the run falls back
    /// to uniform weights and records why in the report.
    ///
    /// # Errors
    ///
    /// Same as [`run_training`], plus [`EnsembleError::InvalidWeights`] from installation.
    pub fn train(
        &self,
        samples: &[LabeledSample],
        zones: &ZoneConfig,
        buffer_radius_m: f64,
        cancel: &CancellationToken,
    ) -> Result<TrainingOutcome, EnsembleError> {
        let outcome = run_training(samples, zones, buffer_radius_m, &self.config, cancel)?;
        self.install(
            Arc::clone(&outcome.forest),
            outcome.weights.clone(),
            Some(Arc::clone(&outcome.layout)),
        )?;
        Ok(outcome)
    }

    /// Score `requests` with the active weights against the current snapshot.
    ///
    /// Locations progress through the funnel independently; results are in
    /// request order.
    ///
    /// # Errors
    ///
    /// | Variant | Condition |
    /// |---|---|
    /// | [`EnsembleError::NotTrained`] | no weights are active |
    /// | [`EnsembleError::InputShape`] | a feature vector has the wrong length |
    /// | [`EnsembleError::SchemaMismatch`] | a feature vector has the wrong column names |
    /// | [`EnsembleError::ScoreRange`] | a base scorer left `[0, 1]` |
    #[instrument(skip_all, fields(n_locations = requests.len()))]
    pub fn score(&self, requests: &[LocationRequest]) -> Result<Vec<RiskScore>, EnsembleError> {
        let weights = self.registry.active().ok_or(EnsembleError::NotTrained)?;
        let run = self
            .runs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&weights.run_id())
            .cloned()
            .ok_or(EnsembleError::NotTrained)?;
        let binding = self.bind(run, EnsembleCombiner::new((*weights).clone()))?;
        self.evict_superseded(&binding);

        let prepared = requests
            .par_iter()
            .map(|request| self.prepare(request, &binding))
            .collect::<Result<Vec<_>, EnsembleError>>()?;
        let finalized: Vec<Arc<Finalized>> = self.funnel_pool.install(|| {
            prepared
                .into_par_iter()
                .map(|p| match p {
                    Prepared::Done(done) => done,
                    Prepared::Pending(pending) => self.finalize(*pending, &binding),
                })
                .collect()
        });

        let escalated = finalized
            .iter()
            .filter(|f| f.explanation.history.evidence_requests() > 0)
            .count();
        info!(
            version = %binding.snapshot.version(),
            run_id = %binding.run.run_id,
            n_locations = finalized.len(),
            escalated,
            "batch scored"
        );
        Ok(finalized.iter().map(|f| f.score.clone()).collect())
    }

    /// Look up how a score was produced.
    ///
    /// Only scores from the snapshot and run of the latest `score` call
    /// resolve; publishing a new snapshot or activating another run makes
    /// earlier references unknown once the next batch is scored.
    ///
    /// # Errors
    ///
    /// Returns [`EnsembleError::UnknownExplanation`] if no score carries `reference`.
    pub fn explain(&self, reference: &str) -> Result<Explanation, EnsembleError> {
        self.finalized
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(reference)
            .map(|f| f.explanation.clone())
            .ok_or_else(|| EnsembleError::UnknownExplanation {
                reference: reference.to_string(),
            })
    }

    /// Drop stored results from older snapshots or other runs.
    ///
    /// Entries from a newer snapshot of the same run are kept for a
    /// concurrent call that bound after this one.
    fn evict_superseded(&self, binding: &Binding) {
        let version = binding.snapshot.version();
        let run_id = binding.run.run_id;
        let mut store = self.finalized.write().unwrap_or_else(PoisonError::into_inner);
        let before = store.len();
        store.retain(|_, f| f.score.run_id == run_id && f.score.index_version >= version);
        let evicted = before - store.len();
        if evicted > 0 {
            debug!(evicted, %version, %run_id, retained = store.len(), "superseded results evicted");
        }
    }

    /// Bind to the newest snapshot, rebinding when a concurrent call has
    /// already cached models for a newer one.
    fn bind(&self, run: Arc<TrainedRun>, combiner: EnsembleCombiner) -> Result<Binding, EnsembleError> {
        let cluster_params = self.config.scorers.cluster;
        let density_params = self.config.scorers.density;

        for attempt in 1..=self.config.stale_retries {
            let snapshot = self.index.snapshot();
            let cached = self
                .clusters
                .get_or_build(&snapshot, |s| Ok(ClusterModel::build(s, cluster_params)))
                .and_then(|cluster| {
                    run.densities
                        .get_or_build(&snapshot, |s| {
                            Ok(DensityModel::build(s, density_params, run.layout.clone()))
                        })
                        .map(|density| (cluster, density))
                });
            match cached {
                Ok((cluster, density)) => return Ok(Self::binding(snapshot, run, combiner, cluster, density)),
                Err(SpatialError::IndexStale { bound, current }) => {
                    warn!(attempt, %bound, %current, run_id = %run.run_id, "spatial index snapshot superseded; rebinding");
                }
                Err(err) => return Err(err.into()),
            }
        }

        let snapshot = self.index.snapshot();
        warn!(
            version = %snapshot.version(),
            run_id = %run.run_id,
            "building spatial models without caching"
        );
        let cluster = Arc::new(ClusterModel::build(&snapshot, cluster_params));
        let density = Arc::new(DensityModel::build(&snapshot, density_params, run.layout.clone()));
        Ok(Self::binding(snapshot, run, combiner, cluster, density))
    }

    fn binding(
        snapshot: Arc<IndexSnapshot>,
        run: Arc<TrainedRun>,
        combiner: EnsembleCombiner,
        cluster: Arc<ClusterModel>,
        density: Arc<DensityModel>,
    ) -> Binding {
        let forest = RandomForestScorer::new(Arc::clone(&run.forest));
        let scorers: Vec<Box<dyn BaseScorer>> = vec![
            Box::new(forest.clone()),
            Box::new(SpatialClusterScorer::new(Arc::clone(&snapshot), cluster)),
            Box::new(DensityScorer::new(Arc::clone(&snapshot), density)),
        ];
        debug!(version = %snapshot.version(), run_id = %run.run_id, "scorers bound");
        Binding {
            snapshot,
            run,
            combiner,
            forest,
            scorers,
        }
    }

    fn prepare(&self, request: &LocationRequest, binding: &Binding) -> Result<Prepared, EnsembleError> {
        let version = binding.snapshot.version();
        let (features, feature_note) = match self.features.features(&request.location) {
            Ok(features) => (Some(features), None),
            Err(reason) => {
                warn!(
                    location_id = %request.id,
                    %version,
                    run_id = %binding.run.run_id,
                    %reason,
                    "features unavailable; forest dropped"
                );
                (None, Some(reason.to_string()))
            }
        };

        let explanation_ref = explanation_ref(request, features.as_ref(), version, binding.run.run_id);
        if let Some(done) = self
            .finalized
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&explanation_ref)
        {
            return Ok(Prepared::Done(Arc::clone(done)));
        }

        let input = ScoringInput {
            location: &request.location,
            features: features.as_ref(),
        };
        let mut scores = ComponentScores::new();
        for scorer in &binding.scorers {
            if scorer.applicable(&input) {
                scores.set(scorer.kind(), scorer.score(&input)?);
            }
        }
        let fusion = binding.combiner.fuse(&scores)?;

        let (forest_bias, feature_contributions) = match &features {
            Some(features) => {
                let attribution = binding.forest.attribution(features)?;
                let ranked = attribution
                    .ranked(binding.forest.forest().feature_names())
                    .into_iter()
                    .map(|(name, contribution)| FeatureContribution { name, contribution })
                    .collect();
                (Some(attribution.bias), ranked)
            }
            None => (None, Vec::new()),
        };

        Ok(Prepared::Pending(Box::new(Pending {
            request: request.clone(),
            explanation_ref,
            fusion,
            forest_bias,
            feature_contributions,
            feature_note,
        })))
    }

    fn finalize(&self, pending: Pending, binding: &Binding) -> Arc<Finalized> {
        let Pending {
            request,
            explanation_ref,
            fusion,
            forest_bias,
            feature_contributions,
            feature_note,
        } = pending;
        let outcome = self.funnel.run(&request.id, &request.location, fusion.base_confidence);
        let index_version = binding.snapshot.version();
        let run_id = binding.run.run_id;

        let score = RiskScore {
            location_id: request.id.clone(),
            location: request.location,
            base_confidence: fusion.base_confidence,
            stage_scores: outcome.stage_scores,
            final_confidence: outcome.final_confidence,
            explanation_ref: explanation_ref.clone(),
            index_version,
            run_id,
        };
        let explanation = Explanation {
            explanation_ref: explanation_ref.clone(),
            location_id: request.id,
            location: request.location,
            zone: binding.run.layout.as_ref().and_then(|l| l.zone_of(&request.location)),
            index_version,
            run_id,
            fusion,
            forest_bias,
            feature_contributions,
            feature_note,
            history: outcome.history,
            final_confidence: outcome.final_confidence,
        };

        let mut store = self.finalized.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            store
                .entry(explanation_ref)
                .or_insert_with(|| Arc::new(Finalized { score, explanation })),
        )
    }
}

/// Stable key over everything a score depends on.
fn explanation_ref(
    request: &LocationRequest,
    features: Option<&FeatureVector>,
    version: IndexVersion,
    run_id: Uuid,
) -> String {
    let mut hasher = DefaultHasher::new();
    request.id.hash(&mut hasher);
    request.location.lat.to_bits().hash(&mut hasher);
    request.location.lon.to_bits().hash(&mut hasher);
    run_id.hash(&mut hasher);
    if let Some(features) = features {
        features.names().hash(&mut hasher);
        for value in features.values() {
            value.to_bits().hash(&mut hasher);
        }
    }
    format!("{version}-{:016x}", hasher.finish())
}
