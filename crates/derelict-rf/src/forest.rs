//! Forest training with parallel tree construction.

use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use tracing::{debug, info, instrument};

use crate::config::ForestConfig;
use crate::error::RfError;
use crate::importance::{RankedFeature, aggregate_importances};
use crate::split::SplitContext;
use crate::tree::{DecisionTree, TreeConfig};

/// A fitted binary Random Forest.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Forest {
    pub(crate) trees: Vec<DecisionTree>,
    pub(crate) n_features: usize,
    pub(crate) feature_names: Vec<String>,
    pub(crate) importances: Vec<f64>,
}

/// Metadata about a training run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TrainingSummary {
    pub n_trees: usize,
    pub n_samples: usize,
    pub n_features: usize,
    /// Number of positive (abandoned) training labels.
    pub n_positive: usize,
    pub max_features_resolved: usize,
    /// Per-sample weight applied to `[negative, positive]` labels.
    pub class_weight: [f64; 2],
}

/// Result of forest training.
#[derive(Debug)]
pub struct ForestFit {
    forest: Forest,
    importances: Vec<RankedFeature>,
    summary: TrainingSummary,
}

impl ForestFit {
    #[must_use]
    pub fn forest(&self) -> &Forest {
        &self.forest
    }

    #[must_use]
    pub fn into_forest(self) -> Forest {
        self.forest
    }

    /// Ranked impurity importances, normalised to sum to 1.
    #[must_use]
    pub fn importances(&self) -> &[RankedFeature] {
        &self.importances
    }

    #[must_use]
    pub fn summary(&self) -> &TrainingSummary {
        &self.summary
    }
}

/// Validate a row-major dataset and return it column-major.
pub(crate) fn validate_and_transpose(
    features: &[Vec<f64>],
    labels: &[bool],
) -> Result<Vec<Vec<f64>>, RfError> {
    if features.is_empty() {
        return Err(RfError::EmptyDataset);
    }
    if labels.len() != features.len() {
        return Err(RfError::LabelCountMismatch {
            n_samples: features.len(),
            n_labels: labels.len(),
        });
    }
    let n_features = features[0].len();
    if n_features == 0 {
        return Err(RfError::ZeroFeatures);
    }
    for (sample_index, row) in features.iter().enumerate() {
        if row.len() != n_features {
            return Err(RfError::FeatureCountMismatch {
                expected: n_features,
                got: row.len(),
                sample_index,
            });
        }
        if let Some(feature_index) = row.iter().position(|v| !v.is_finite()) {
            return Err(RfError::NonFiniteValue {
                sample_index,
                feature_index,
            });
        }
    }
    Ok((0..n_features)
        .map(|feat_idx| features.iter().map(|row| row[feat_idx]).collect())
        .collect())
}

fn bootstrap_sample(n_samples: usize, draw_count: usize, rng: &mut impl Rng) -> Vec<usize> {
    (0..draw_count).map(|_| rng.gen_range(0..n_samples)).collect()
}

/// Train the forest.
#[instrument(skip_all, fields(n_trees = config.n_trees, n_samples = features.len()))]
pub(crate) fn train(
    config: &ForestConfig,
    features: &[Vec<f64>],
    labels: &[bool],
    feature_names: &[String],
) -> Result<ForestFit, RfError> {
    if config.n_trees == 0 {
        return Err(RfError::InvalidTreeCount { n_trees: 0 });
    }
    let columns = validate_and_transpose(features, labels)?;
    let n_samples = features.len();
    let n_features = columns.len();
    if feature_names.len() != n_features {
        return Err(RfError::FeatureNameMismatch {
            n_features,
            n_names: feature_names.len(),
        });
    }

    let max_features_resolved = config.max_features.resolve(n_features)?;
    if config.bootstrap_fraction <= 0.0 || config.bootstrap_fraction > 1.0 {
        return Err(RfError::InvalidBootstrapFraction {
            fraction: config.bootstrap_fraction,
        });
    }

    let tree_config = TreeConfig::new()
        .with_criterion(config.criterion)
        .with_max_depth(config.max_depth)
        .with_min_samples_split(config.min_samples_split)
        .with_min_samples_leaf(config.min_samples_leaf)
        .with_max_features(Some(max_features_resolved));
    tree_config.validate(n_features)?;

    let class_weight = config.class_weighting.resolve(labels);
    let n_positive = labels.iter().filter(|&&l| l).count();
    let draw_count = ((n_samples as f64) * config.bootstrap_fraction).ceil() as usize;

    info!(
        n_trees = config.n_trees,
        n_samples,
        n_features,
        n_positive,
        max_features = max_features_resolved,
        draw_count,
        "training random forest"
    );

    let mut master_rng = ChaCha8Rng::seed_from_u64(config.seed);
    let tree_seeds: Vec<u64> = (0..config.n_trees).map(|_| master_rng.r#gen()).collect();

    let ctx = SplitContext {
        columns: &columns,
        labels,
        class_weight,
        criterion: config.criterion,
        max_features: max_features_resolved,
        min_samples_leaf: config.min_samples_leaf,
    };

    let trees: Vec<DecisionTree> = tree_seeds
        .into_par_iter()
        .map(|seed| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let indices = bootstrap_sample(n_samples, draw_count, &mut rng);
            tree_config.clone().with_seed(rng.r#gen()).grow(&ctx, &indices)
        })
        .collect();

    debug!(n_trees_trained = trees.len(), "tree training complete");

    let per_tree: Vec<Vec<f64>> = trees.iter().map(DecisionTree::feature_importances).collect();
    let importances = aggregate_importances(&per_tree, feature_names);
    let mut normalised = vec![0.0; n_features];
    for ranked in &importances {
        normalised[ranked.index] = ranked.importance;
    }

    let forest = Forest {
        trees,
        n_features,
        feature_names: feature_names.to_vec(),
        importances: normalised,
    };

    info!(
        top_feature = importances.first().map(|f| f.name.as_str()),
        "random forest training complete"
    );

    Ok(ForestFit {
        forest,
        importances,
        summary: TrainingSummary {
            n_trees: config.n_trees,
            n_samples,
            n_features,
            n_positive,
            max_features_resolved,
            class_weight,
        },
    })
}

#[cfg(test)]
mod tests {
    use crate::config::{ClassWeighting, ForestConfig, MaxFeatures};

    /// Two separable groups along `x`; `y` is noise-free filler.
    fn separable() -> (Vec<Vec<f64>>, Vec<bool>, Vec<String>) {
        let mut features = Vec::new();
        let mut labels = Vec::new();
        for i in 0..30 {
            features.push(vec![i as f64 * 0.1, 0.5]);
            labels.push(false);
        }
        for i in 0..10 {
            features.push(vec![10.0 + i as f64 * 0.1, 0.5]);
            labels.push(true);
        }
        (features, labels, vec!["x".into(), "y".into()])
    }

    #[test]
    fn separable_probabilities_split_cleanly() {
        let (features, labels, names) = separable();
        let fit = ForestConfig::new(30)
            .unwrap()
            .with_max_features(MaxFeatures::All)
            .fit(&features, &labels, &names)
            .unwrap();
        let probs = fit.forest().predict_proba_batch(&features).unwrap();
        for (p, &label) in probs.iter().zip(&labels) {
            assert_eq!(*p > 0.5, label, "p = {p}");
        }
    }

    #[test]
    fn importances_sum_to_one() {
        let (features, labels, names) = separable();
        let fit = ForestConfig::new(10).unwrap().fit(&features, &labels, &names).unwrap();
        let total: f64 = fit.importances().iter().map(|f| f.importance).sum();
        assert!((total - 1.0).abs() < 1e-10, "total = {total}");
        assert_eq!(fit.importances()[0].name, "x");
    }

    #[test]
    fn deterministic_with_same_seed() {
        let (features, labels, names) = separable();
        let fit = |seed| {
            ForestConfig::new(8)
                .unwrap()
                .with_seed(seed)
                .fit(&features, &labels, &names)
                .unwrap()
                .into_forest()
                .predict_proba_batch(&features)
                .unwrap()
        };
        assert_eq!(fit(7), fit(7));
    }

    #[test]
    fn summary_records_balanced_weights() {
        let (features, labels, names) = separable();
        let fit = ForestConfig::new(2).unwrap().fit(&features, &labels, &names).unwrap();
        let summary = fit.summary();
        assert_eq!(summary.n_positive, 10);
        assert!((summary.class_weight[1] - 2.0).abs() < 1e-12);

        let uniform = ForestConfig::new(2)
            .unwrap()
            .with_class_weighting(ClassWeighting::Uniform)
            .fit(&features, &labels, &names)
            .unwrap();
        assert_eq!(uniform.summary().class_weight, [1.0, 1.0]);
    }

    #[test]
    fn label_mismatch_rejected() {
        let (features, _, names) = separable();
        let err = ForestConfig::new(2)
            .unwrap()
            .fit(&features, &[true], &names)
            .unwrap_err();
        assert!(matches!(err, crate::RfError::LabelCountMismatch { .. }));
    }

    #[test]
    fn name_mismatch_rejected() {
        let (features, labels, _) = separable();
        let err = ForestConfig::new(2)
            .unwrap()
            .fit(&features, &labels, &["x".to_string()])
            .unwrap_err();
        assert!(matches!(err, crate::RfError::FeatureNameMismatch { .. }));
    }

    #[test]
    fn nan_rejected() {
        let err = ForestConfig::new(2)
            .unwrap()
            .fit(&[vec![f64::NAN]], &[true], &["x".to_string()])
            .unwrap_err();
        assert!(matches!(
            err,
            crate::RfError::NonFiniteValue {
                sample_index: 0,
                feature_index: 0
            }
        ));
    }
}
