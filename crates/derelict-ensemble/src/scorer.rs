//! The base-scorer capability and its three implementations.

use std::fmt;
use std::sync::Arc;

use derelict_rf::{Forest, PathAttribution, RankedFeature};
use derelict_spatial::{ClusterModel, DensityModel, GeoPoint, IndexSnapshot, IndexVersion};

use crate::error::EnsembleError;
use crate::sample::FeatureVector;

/// Identifies one of the three base scorers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScorerKind {
    Rf,
    Spatial,
    Kde,
}

impl ScorerKind {
    /// Every kind, in weight-array order.
    pub const ALL: [ScorerKind; 3] = [ScorerKind::Rf, ScorerKind::Spatial, ScorerKind::Kde];

    #[must_use]
    pub fn index(self) -> usize {
        match self {
            ScorerKind::Rf => 0,
            ScorerKind::Spatial => 1,
            ScorerKind::Kde => 2,
        }
    }
}

impl fmt::Display for ScorerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScorerKind::Rf => "rf",
            ScorerKind::Spatial => "spatial",
            ScorerKind::Kde => "kde",
        })
    }
}

/// What a base scorer sees for one location.
#[derive(Debug, Clone, Copy)]
pub struct ScoringInput<'a> {
    pub location: &'a GeoPoint,
    /// `None` when the feature provider had nothing for this location.
    pub features: Option<&'a FeatureVector>,
}

/// A model that maps one location to a score in `[0, 1]`.
pub trait BaseScorer: Send + Sync {
    fn kind(&self) -> ScorerKind;

    /// Whether this scorer can score `input` at all.
    fn applicable(&self, _input: &ScoringInput<'_>) -> bool {
        true
    }

    /// # Errors
    ///
    /// Implementations return contract violations only.
    fn score(&self, input: &ScoringInput<'_>) -> Result<f64, EnsembleError>;
}

/// Random forest over the location's feature vector.
#[derive(Debug, Clone)]
pub struct RandomForestScorer {
    forest: Arc<Forest>,
}

impl RandomForestScorer {
    #[must_use]
    pub fn new(forest: Arc<Forest>) -> Self {
        Self { forest }
    }

    #[must_use]
    pub fn forest(&self) -> &Forest {
        &self.forest
    }

    /// Global impurity importances, most important first.
    #[must_use]
    pub fn importances(&self) -> Vec<RankedFeature> {
        self.forest.ranked_importances()
    }

    /// Decision-path decomposition of the probability for `features`.
    ///
    /// # Errors
    ///
    /// Same as [`BaseScorer::score`].
    pub fn attribution(&self, features: &FeatureVector) -> Result<PathAttribution, EnsembleError> {
        features.check_schema(self.forest.feature_names())?;
        Ok(self.forest.attribution(features.values())?)
    }
}

impl BaseScorer for RandomForestScorer {
    fn kind(&self) -> ScorerKind {
        ScorerKind::Rf
    }

    fn applicable(&self, input: &ScoringInput<'_>) -> bool {
        input.features.is_some()
    }

    /// # Errors
    ///
    /// | Variant | Condition |
    /// |---|---|
    /// | [`EnsembleError::InputShape`] | no features, or wrong length |
    /// | [`EnsembleError::SchemaMismatch`] | column names differ from training |
    /// | [`EnsembleError::Forest`] | a non-finite feature value |
    fn score(&self, input: &ScoringInput<'_>) -> Result<f64, EnsembleError> {
        let features = input.features.ok_or(EnsembleError::InputShape {
            expected: self.forest.n_features(),
            got: 0,
        })?;
        features.check_schema(self.forest.feature_names())?;
        Ok(self.forest.predict_proba(features.values())?)
    }
}

/// DBSCAN neighbourhood score bound to one index snapshot.
#[derive(Debug, Clone)]
pub struct SpatialClusterScorer {
    snapshot: Arc<IndexSnapshot>,
    model: Arc<ClusterModel>,
}

impl SpatialClusterScorer {
    #[must_use]
    pub fn new(snapshot: Arc<IndexSnapshot>, model: Arc<ClusterModel>) -> Self {
        Self { snapshot, model }
    }

    #[must_use]
    pub fn version(&self) -> IndexVersion {
        self.snapshot.version()
    }
}

impl BaseScorer for SpatialClusterScorer {
    fn kind(&self) -> ScorerKind {
        ScorerKind::Spatial
    }

    fn score(&self, input: &ScoringInput<'_>) -> Result<f64, EnsembleError> {
        Ok(self.model.score(&self.snapshot, input.location)?)
    }
}

/// KDE hotspot score bound to one index snapshot.
#[derive(Debug, Clone)]
pub struct DensityScorer {
    snapshot: Arc<IndexSnapshot>,
    model: Arc<DensityModel>,
}

impl DensityScorer {
    #[must_use]
    pub fn new(snapshot: Arc<IndexSnapshot>, model: Arc<DensityModel>) -> Self {
        Self { snapshot, model }
    }

    #[must_use]
    pub fn version(&self) -> IndexVersion {
        self.snapshot.version()
    }
}

impl BaseScorer for DensityScorer {
    fn kind(&self) -> ScorerKind {
        ScorerKind::Kde
    }

    fn score(&self, input: &ScoringInput<'_>) -> Result<f64, EnsembleError> {
        Ok(self.model.score(&self.snapshot, input.location)?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use derelict_rf::{ForestConfig, MaxFeatures};
    use derelict_spatial::{ClusterModel, ClusterParams, ConfirmedPoint, GeoPoint, IndexSnapshot, IndexVersion};

    use super::{BaseScorer, RandomForestScorer, ScorerKind, ScoringInput, SpatialClusterScorer};
    use crate::error::EnsembleError;
    use crate::sample::FeatureVector;

    fn names() -> Arc<[String]> {
        vec!["vacancy_months".to_string(), "noise".to_string()].into()
    }

    fn rf() -> RandomForestScorer {
        let features: Vec<Vec<f64>> = (0..30).map(|i| vec![i as f64, (i % 4) as f64]).collect();
        let labels: Vec<bool> = (0..30).map(|i| i >= 20).collect();
        let forest = ForestConfig::new(10)
            .unwrap()
            .with_max_features(MaxFeatures::All)
            .fit(&features, &labels, &names())
            .unwrap()
            .into_forest();
        RandomForestScorer::new(Arc::new(forest))
    }

    #[test]
    fn kinds_index_the_weight_array() {
        for (i, kind) in ScorerKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
        assert_eq!(ScorerKind::Kde.to_string(), "kde");
    }

    #[test]
    fn forest_needs_features() {
        let scorer = rf();
        let here = GeoPoint::new(0.0, 0.0).unwrap();
        let input = ScoringInput {
            location: &here,
            features: None,
        };
        assert!(!scorer.applicable(&input));
        assert!(matches!(scorer.score(&input), Err(EnsembleError::InputShape { .. })));
    }

    #[test]
    fn forest_rejects_short_vector() {
        let scorer = rf();
        let here = GeoPoint::new(0.0, 0.0).unwrap();
        let short = FeatureVector::new(vec!["vacancy_months".to_string()].into(), vec![3.0]).unwrap();
        let input = ScoringInput {
            location: &here,
            features: Some(&short),
        };
        assert!(matches!(
            scorer.score(&input),
            Err(EnsembleError::InputShape { expected: 2, got: 1 })
        ));
    }

    #[test]
    fn forest_scores_in_unit_interval() {
        let scorer = rf();
        let here = GeoPoint::new(0.0, 0.0).unwrap();
        let high = FeatureVector::new(names(), vec![28.0, 1.0]).unwrap();
        let p = scorer
            .score(&ScoringInput {
                location: &here,
                features: Some(&high),
            })
            .unwrap();
        assert!(p > 0.5 && p <= 1.0);
        assert_eq!(scorer.importances()[0].name, "vacancy_months");
    }

    #[test]
    fn cluster_scorer_is_bound_to_its_snapshot() {
        let origin = GeoPoint::new(0.0, 0.0).unwrap();
        let points = (0..3)
            .map(|i| ConfirmedPoint {
                location: origin.offset_m(0.0, 10.0 * i as f64),
                confirmed_at: i,
            })
            .collect();
        let snapshot = Arc::new(IndexSnapshot::build(IndexVersion::new(4), points, 50.0));
        let model = Arc::new(ClusterModel::build(&snapshot, ClusterParams::new(50.0, 2).unwrap()));
        let scorer = SpatialClusterScorer::new(snapshot, model);
        assert_eq!(scorer.version(), IndexVersion::new(4));
        let q = origin.offset_m(0.0, 5.0);
        let s = scorer
            .score(&ScoringInput {
                location: &q,
                features: None,
            })
            .unwrap();
        assert!(s >= 0.9);
    }
}
