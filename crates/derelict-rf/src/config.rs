//! Configuration builder for forest training.

use crate::error::RfError;
use crate::forest::ForestFit;
use crate::split::SplitCriterion;

/// Strategy for determining the number of features to consider at each split.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum MaxFeatures {
    /// Square root of total features.
    Sqrt,
    /// Log base 2 of total features.
    Log2,
    /// A fraction of total features (must be in (0.0, 1.0]).
    Fraction(f64),
    /// A fixed count.
    Fixed(usize),
    /// All features (no subsampling).
    All,
}

impl MaxFeatures {
    /// Resolve to a concrete count for `n_features` columns.
    ///
    /// # Errors
    ///
    /// Returns [`RfError::InvalidMaxFeatures`] if the count falls outside `[1, n_features]`.
    pub fn resolve(self, n_features: usize) -> Result<usize, RfError> {
        let resolved = match self {
            MaxFeatures::Sqrt => (n_features as f64).sqrt().ceil() as usize,
            MaxFeatures::Log2 => (n_features as f64).log2().ceil().max(1.0) as usize,
            MaxFeatures::Fraction(f) => (n_features as f64 * f).ceil() as usize,
            MaxFeatures::Fixed(n) => n,
            MaxFeatures::All => n_features,
        };
        if resolved == 0 || resolved > n_features {
            return Err(RfError::InvalidMaxFeatures {
                max_features: resolved,
                n_features,
            });
        }
        Ok(resolved)
    }
}

/// How samples of each class are weighted during split search.
///
/// Confirmed-abandoned properties are rare, so the default reweights the
/// classes inversely to their frequency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ClassWeighting {
    /// Every sample has weight 1.
    Uniform,
    /// `w_c = n / (2 · n_c)` so both classes carry equal total mass.
    #[default]
    Balanced,
}

impl ClassWeighting {
    /// Resolve to `[negative, positive]` per-sample weights for the given labels.
    pub(crate) fn resolve(self, labels: &[bool]) -> [f64; 2] {
        match self {
            ClassWeighting::Uniform => [1.0, 1.0],
            ClassWeighting::Balanced => {
                let n = labels.len() as f64;
                let n_pos = labels.iter().filter(|&&l| l).count() as f64;
                let n_neg = n - n_pos;
                let weight = |n_c: f64| if n_c > 0.0 { n / (2.0 * n_c) } else { 1.0 };
                [weight(n_neg), weight(n_pos)]
            }
        }
    }
}

/// Configuration for forest training.
///
/// Construct via [`ForestConfig::new`], then chain `with_*` methods.
///
/// # Defaults
///
/// | Parameter            | Default     |
/// |----------------------|-------------|
/// | `max_features`       | `Sqrt`      |
/// | `max_depth`          | `None`      |
/// | `min_samples_split`  | 2           |
/// | `min_samples_leaf`   | 1           |
/// | `criterion`          | `Gini`      |
/// | `class_weighting`    | `Balanced`  |
/// | `seed`               | 42          |
/// | `bootstrap_fraction` | 1.0         |
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ForestConfig {
    pub(crate) n_trees: usize,
    pub(crate) max_features: MaxFeatures,
    pub(crate) max_depth: Option<usize>,
    pub(crate) min_samples_split: usize,
    pub(crate) min_samples_leaf: usize,
    pub(crate) criterion: SplitCriterion,
    pub(crate) class_weighting: ClassWeighting,
    pub(crate) seed: u64,
    pub(crate) bootstrap_fraction: f64,
}

impl ForestConfig {
    /// Create a new config with the given number of trees.
    ///
    /// # Errors
    ///
    /// Returns [`RfError::InvalidTreeCount`] if `n_trees` is zero.
    pub fn new(n_trees: usize) -> Result<Self, RfError> {
        if n_trees == 0 {
            return Err(RfError::InvalidTreeCount { n_trees });
        }
        Ok(Self {
            n_trees,
            ..Self::default()
        })
    }

    /// Set the max features strategy.
    #[must_use]
    pub fn with_max_features(mut self, max_features: MaxFeatures) -> Self {
        self.max_features = max_features;
        self
    }

    /// Set the maximum tree depth. `None` means unlimited.
    #[must_use]
    pub fn with_max_depth(mut self, max_depth: Option<usize>) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Set the minimum number of samples required to attempt a split.
    #[must_use]
    pub fn with_min_samples_split(mut self, min_samples_split: usize) -> Self {
        self.min_samples_split = min_samples_split;
        self
    }

    /// Set the minimum number of samples required in each leaf after a split.
    #[must_use]
    pub fn with_min_samples_leaf(mut self, min_samples_leaf: usize) -> Self {
        self.min_samples_leaf = min_samples_leaf;
        self
    }

    #[must_use]
    pub fn with_criterion(mut self, criterion: SplitCriterion) -> Self {
        self.criterion = criterion;
        self
    }

    #[must_use]
    pub fn with_class_weighting(mut self, class_weighting: ClassWeighting) -> Self {
        self.class_weighting = class_weighting;
        self
    }

    /// Override the tree count; a zero count is rejected at fit time.
    #[must_use]
    pub fn with_n_trees(mut self, n_trees: usize) -> Self {
        self.n_trees = n_trees;
        self
    }

    /// Set the random seed for reproducibility.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the bootstrap fraction (proportion of samples drawn per tree).
    #[must_use]
    pub fn with_bootstrap_fraction(mut self, bootstrap_fraction: f64) -> Self {
        self.bootstrap_fraction = bootstrap_fraction;
        self
    }

    // --- Getters ---

    #[must_use]
    pub fn n_trees(&self) -> usize {
        self.n_trees
    }

    #[must_use]
    pub fn max_features(&self) -> MaxFeatures {
        self.max_features
    }

    #[must_use]
    pub fn max_depth(&self) -> Option<usize> {
        self.max_depth
    }

    #[must_use]
    pub fn min_samples_split(&self) -> usize {
        self.min_samples_split
    }

    #[must_use]
    pub fn min_samples_leaf(&self) -> usize {
        self.min_samples_leaf
    }

    #[must_use]
    pub fn criterion(&self) -> SplitCriterion {
        self.criterion
    }

    #[must_use]
    pub fn class_weighting(&self) -> ClassWeighting {
        self.class_weighting
    }

    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    #[must_use]
    pub fn bootstrap_fraction(&self) -> f64 {
        self.bootstrap_fraction
    }

    /// Train a forest on the provided dataset.
    ///
    /// `features[sample_idx][feature_idx]` is row-major.
    /// `labels[sample_idx]` is `true` for confirmed-abandoned samples.
    /// `feature_names` names each feature column.
    ///
    /// # Errors
    ///
    /// | Variant                               | When                                              |
    /// |---------------------------------------|---------------------------------------------------|
    /// | [`RfError::EmptyDataset`]             | `features` is empty                               |
    /// | [`RfError::LabelCountMismatch`]       | `labels.len() != features.len()`                  |
    /// | [`RfError::ZeroFeatures`]             | rows have zero feature columns                    |
    /// | [`RfError::FeatureCountMismatch`]     | rows have inconsistent lengths                    |
    /// | [`RfError::FeatureNameMismatch`]      | `feature_names.len()` differs from column count   |
    /// | [`RfError::NonFiniteValue`]           | any value is NaN or infinite                      |
    /// | [`RfError::InvalidMaxFeatures`]       | resolved max_features is outside [1, n_features]  |
    /// | [`RfError::InvalidBootstrapFraction`] | bootstrap_fraction is not in (0.0, 1.0]           |
    /// | [`RfError::InvalidMaxDepth`]          | `max_depth` is `Some(0)`                          |
    /// | [`RfError::InvalidMinSamplesSplit`]   | `min_samples_split` < 2                           |
    /// | [`RfError::InvalidMinSamplesLeaf`]    | `min_samples_leaf` < 1                            |
    pub fn fit(
        &self,
        features: &[Vec<f64>],
        labels: &[bool],
        feature_names: &[String],
    ) -> Result<ForestFit, RfError> {
        crate::forest::train(self, features, labels, feature_names)
    }
}

impl Default for ForestConfig {
    /// 100 trees with the defaults documented on [`ForestConfig`].
    fn default() -> Self {
        Self {
            n_trees: 100,
            max_features: MaxFeatures::Sqrt,
            max_depth: None,
            min_samples_split: 2,
            min_samples_leaf: 1,
            criterion: SplitCriterion::Gini,
            class_weighting: ClassWeighting::Balanced,
            seed: 42,
            bootstrap_fraction: 1.0,
        }
    }
}
