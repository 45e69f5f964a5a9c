use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, instrument};

use crate::{
    RfError,
    node::{FeatureIndex, Node, NodeIndex},
    split::{SplitContext, SplitCriterion},
};

/// Configuration for a single CART decision tree.
///
/// Construct via [`TreeConfig::new`], then chain `with_*` methods.
///
/// # Defaults
///
/// | Parameter           | Default               |
/// |---------------------|-----------------------|
/// | `criterion`         | `Gini`                |
/// | `max_depth`         | `None` (unlimited)    |
/// | `min_samples_split` | 2                     |
/// | `min_samples_leaf`  | 1                     |
/// | `max_features`      | `None` (all features) |
/// | `seed`              | 42                    |
#[derive(Debug, Clone)]
pub struct TreeConfig {
    pub(crate) criterion: SplitCriterion,
    pub(crate) max_depth: Option<usize>,
    pub(crate) min_samples_split: usize,
    pub(crate) min_samples_leaf: usize,
    pub(crate) max_features: Option<usize>,
    pub(crate) seed: u64,
}

impl TreeConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            criterion: SplitCriterion::Gini,
            max_depth: None,
            min_samples_split: 2,
            min_samples_leaf: 1,
            max_features: None,
            seed: 42,
        }
    }

    #[must_use]
    pub fn with_criterion(mut self, criterion: SplitCriterion) -> Self {
        self.criterion = criterion;
        self
    }

    /// Set the maximum tree depth.
    ///
    /// `Some(d)` limits depth to `d` levels below the root.
    #[must_use]
    pub fn with_max_depth(mut self, max_depth: Option<usize>) -> Self {
        self.max_depth = max_depth;
        self
    }

    #[must_use]
    pub fn with_min_samples_split(mut self, min_samples_split: usize) -> Self {
        self.min_samples_split = min_samples_split;
        self
    }

    #[must_use]
    pub fn with_min_samples_leaf(mut self, min_samples_leaf: usize) -> Self {
        self.min_samples_leaf = min_samples_leaf;
        self
    }

    /// Set the number of features to draw at each split. `None` means all.
    #[must_use]
    pub fn with_max_features(mut self, max_features: Option<usize>) -> Self {
        self.max_features = max_features;
        self
    }

    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub(crate) fn validate(&self, n_features: usize) -> Result<usize, RfError> {
        if let Some(d) = self.max_depth
            && d == 0
        {
            return Err(RfError::InvalidMaxDepth { max_depth: 0 });
        }
        if self.min_samples_split < 2 {
            return Err(RfError::InvalidMinSamplesSplit {
                min_samples_split: self.min_samples_split,
            });
        }
        if self.min_samples_leaf < 1 {
            return Err(RfError::InvalidMinSamplesLeaf {
                min_samples_leaf: self.min_samples_leaf,
            });
        }
        let max_features = self.max_features.unwrap_or(n_features);
        if max_features == 0 || max_features > n_features {
            return Err(RfError::InvalidMaxFeatures {
                max_features,
                n_features,
            });
        }
        Ok(max_features)
    }

    /// Train a single unweighted tree on a row-major dataset.
    ///
    /// # Errors
    ///
    /// Returns the same validation errors as [`crate::ForestConfig::fit`].
    #[instrument(skip(self, features, labels), fields(n_samples = features.len()))]
    pub fn fit(&self, features: &[Vec<f64>], labels: &[bool]) -> Result<DecisionTree, RfError> {
        let columns = crate::forest::validate_and_transpose(features, labels)?;
        let max_features = self.validate(columns.len())?;
        let ctx = SplitContext {
            columns: &columns,
            labels,
            class_weight: [1.0, 1.0],
            criterion: self.criterion,
            max_features,
            min_samples_leaf: self.min_samples_leaf,
        };
        let indices: Vec<usize> = (0..labels.len()).collect();
        Ok(self.grow(&ctx, &indices))
    }

    /// Grow a tree over `sample_indices` (duplicates allowed) of pre-validated data.
    pub(crate) fn grow(&self, ctx: &SplitContext<'_>, sample_indices: &[usize]) -> DecisionTree {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let mut arena: Vec<Node> = Vec::new();
        let root = build_node(ctx, self, sample_indices, 0, &mut rng, &mut arena);
        debug!(
            root_index = root.index(),
            n_nodes = arena.len(),
            "decision tree built"
        );
        DecisionTree {
            nodes: arena,
            n_features: ctx.columns.len(),
        }
    }
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Recursively build the arena, returning the index of the node just created.
fn build_node(
    ctx: &SplitContext<'_>,
    config: &TreeConfig,
    sample_indices: &[usize],
    depth: usize,
    rng: &mut ChaCha8Rng,
    arena: &mut Vec<Node>,
) -> NodeIndex {
    let n_samples = sample_indices.len();
    let mass = ctx.mass_of(sample_indices);
    let value = mass.positive_fraction();
    let impurity = ctx.criterion.impurity(mass);

    let push_leaf = |arena: &mut Vec<Node>| {
        let idx = arena.len();
        arena.push(Node::Leaf {
            value,
            impurity,
            n_samples,
        });
        NodeIndex::new(idx)
    };

    let depth_reached = config.max_depth.is_some_and(|d| depth >= d);
    if depth_reached || n_samples < config.min_samples_split || impurity.value() <= 0.0 {
        return push_leaf(arena);
    }

    let Some(split) = ctx.find_best_split(sample_indices, rng) else {
        return push_leaf(arena);
    };

    // Reserve the parent slot so children land after it.
    let idx = arena.len();
    arena.push(Node::Leaf {
        value,
        impurity,
        n_samples,
    });

    let left = build_node(ctx, config, &split.left_indices, depth + 1, rng, arena);
    let right = build_node(ctx, config, &split.right_indices, depth + 1, rng, arena);

    arena[idx] = Node::Split {
        feature: split.feature,
        threshold: split.threshold,
        left,
        right,
        value,
        impurity,
        n_samples,
        impurity_decrease: split.impurity_decrease,
    };
    NodeIndex::new(idx)
}

/// A fitted binary CART tree stored as a node arena; the root is index 0.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DecisionTree {
    pub(crate) nodes: Vec<Node>,
    pub(crate) n_features: usize,
}

impl DecisionTree {
    /// Probability that `sample` is positive: the value of the leaf it reaches.
    ///
    /// # Errors
    ///
    /// Returns [`RfError::PredictionFeatureMismatch`] when `sample.len() != n_features`.
    pub fn predict_proba(&self, sample: &[f64]) -> Result<f64, RfError> {
        self.check_width(sample)?;
        let leaf = self.walk(sample, |_, _, _| {});
        Ok(self.nodes[leaf.index()].value())
    }

    /// Walk from the root to a leaf, calling `on_split(feature, parent_value, child_value)`
    /// at every interior node traversed. Returns the leaf index.
    pub(crate) fn walk(
        &self,
        sample: &[f64],
        mut on_split: impl FnMut(FeatureIndex, f64, f64),
    ) -> NodeIndex {
        let mut current = NodeIndex::new(0);
        loop {
            match &self.nodes[current.index()] {
                Node::Leaf { .. } => return current,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                    value,
                    ..
                } => {
                    let next = if sample[feature.index()] <= *threshold {
                        *left
                    } else {
                        *right
                    };
                    on_split(*feature, *value, self.nodes[next.index()].value());
                    current = next;
                }
            }
        }
    }

    pub(crate) fn check_width(&self, sample: &[f64]) -> Result<(), RfError> {
        if sample.len() != self.n_features {
            return Err(RfError::PredictionFeatureMismatch {
                expected: self.n_features,
                got: sample.len(),
            });
        }
        Ok(())
    }

    /// Unnormalised mean-decrease-in-impurity per feature column.
    #[must_use]
    pub fn feature_importances(&self) -> Vec<f64> {
        let mut totals = vec![0.0; self.n_features];
        for node in &self.nodes {
            if let Node::Split {
                feature,
                impurity_decrease,
                ..
            } = node
            {
                totals[feature.index()] += impurity_decrease;
            }
        }
        totals
    }

    /// Root node value: the weighted positive fraction of the training draw.
    #[must_use]
    pub fn root_value(&self) -> f64 {
        self.nodes.first().map_or(0.0, Node::value)
    }

    #[must_use]
    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Depth of the deepest leaf (a lone root has depth 0).
    #[must_use]
    pub fn depth(&self) -> usize {
        fn depth_of(nodes: &[Node], idx: NodeIndex) -> usize {
            match &nodes[idx.index()] {
                Node::Leaf { .. } => 0,
                Node::Split { left, right, .. } => {
                    1 + depth_of(nodes, *left).max(depth_of(nodes, *right))
                }
            }
        }
        if self.nodes.is_empty() {
            0
        } else {
            depth_of(&self.nodes, NodeIndex::new(0))
        }
    }

    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }
}

#[cfg(test)]
mod tests {
    use super::TreeConfig;

    fn xor() -> (Vec<Vec<f64>>, Vec<bool>) {
        (
            vec![
                vec![0.0, 0.0],
                vec![0.0, 1.0],
                vec![1.0, 0.0],
                vec![1.0, 1.0],
            ],
            vec![false, true, true, false],
        )
    }

    #[test]
    fn pure_node_is_single_leaf() {
        let tree = TreeConfig::new()
            .fit(&[vec![1.0], vec![2.0]], &[true, true])
            .unwrap();
        assert_eq!(tree.n_nodes(), 1);
        assert_eq!(tree.predict_proba(&[5.0]).unwrap(), 1.0);
    }

    #[test]
    fn xor_needs_depth_two() {
        let (features, labels) = xor();
        let tree = TreeConfig::new().fit(&features, &labels).unwrap();
        assert_eq!(tree.depth(), 2);
        for (row, &label) in features.iter().zip(&labels) {
            let p = tree.predict_proba(row).unwrap();
            assert_eq!(p > 0.5, label);
        }
    }

    #[test]
    fn max_depth_caps_growth() {
        let (features, labels) = xor();
        let tree = TreeConfig::new()
            .with_max_depth(Some(1))
            .fit(&features, &labels)
            .unwrap();
        assert!(tree.depth() <= 1);
    }

    #[test]
    fn zero_depth_rejected() {
        let (features, labels) = xor();
        let err = TreeConfig::new()
            .with_max_depth(Some(0))
            .fit(&features, &labels)
            .unwrap_err();
        assert!(matches!(err, crate::RfError::InvalidMaxDepth { .. }));
    }

    #[test]
    fn wrong_width_prediction_rejected() {
        let (features, labels) = xor();
        let tree = TreeConfig::new().fit(&features, &labels).unwrap();
        assert!(tree.predict_proba(&[1.0]).is_err());
    }

    #[test]
    fn importances_credit_only_used_feature() {
        let features = vec![vec![1.0, 7.0], vec![2.0, 7.0], vec![8.0, 7.0], vec![9.0, 7.0]];
        let labels = vec![false, false, true, true];
        let tree = TreeConfig::new().fit(&features, &labels).unwrap();
        let imp = tree.feature_importances();
        assert!(imp[0] > 0.0);
        assert_eq!(imp[1], 0.0);
    }
}
