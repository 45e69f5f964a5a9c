use rand::Rng;

use crate::node::{FeatureIndex, Impurity};

/// Criterion for measuring the quality of a split.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SplitCriterion {
    /// Gini impurity: 1 - p₀² - p₁²
    #[default]
    Gini,
    /// Information entropy: -Σ pᵢ·ln(pᵢ)
    Entropy,
}

/// Class-weighted sample mass of a node, split by label.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct ClassMass {
    pub(crate) negative: f64,
    pub(crate) positive: f64,
}

impl ClassMass {
    pub(crate) fn add(&mut self, positive: bool, weight: f64) {
        if positive {
            self.positive += weight;
        } else {
            self.negative += weight;
        }
    }

    pub(crate) fn remove(&mut self, positive: bool, weight: f64) {
        if positive {
            self.positive -= weight;
        } else {
            self.negative -= weight;
        }
    }

    pub(crate) fn total(&self) -> f64 {
        self.negative + self.positive
    }

    /// Weighted fraction of positive mass; 0.0 for an empty node.
    pub(crate) fn positive_fraction(&self) -> f64 {
        let total = self.total();
        if total > 0.0 { self.positive / total } else { 0.0 }
    }
}

impl SplitCriterion {
    /// Impurity of a node with the given class mass.
    ///
    /// Empty nodes are pure.
    pub(crate) fn impurity(&self, mass: ClassMass) -> Impurity {
        let total = mass.total();
        if total <= 0.0 {
            return Impurity::new(0.0);
        }
        let p1 = mass.positive / total;
        let p0 = 1.0 - p1;
        let value = match self {
            SplitCriterion::Gini => 1.0 - p0 * p0 - p1 * p1,
            SplitCriterion::Entropy => [p0, p1]
                .iter()
                .filter(|&&p| p > 0.0)
                .map(|&p| -p * p.ln())
                .sum(),
        };
        Impurity::new(value.max(0.0))
    }
}

/// Best split found for a node.
#[derive(Debug, Clone)]
pub(crate) struct SplitResult {
    pub(crate) feature: FeatureIndex,
    pub(crate) threshold: f64,
    /// `W·I(parent) - W_l·I(left) - W_r·I(right)` in class-weighted mass.
    pub(crate) impurity_decrease: f64,
    pub(crate) left_indices: Vec<usize>,
    pub(crate) right_indices: Vec<usize>,
}

/// Inputs shared by every split search within one tree.
pub(crate) struct SplitContext<'a> {
    /// Column-major features: `columns[feature][sample]`.
    pub(crate) columns: &'a [Vec<f64>],
    pub(crate) labels: &'a [bool],
    /// Per-class sample weight, `[negative, positive]`.
    pub(crate) class_weight: [f64; 2],
    pub(crate) criterion: SplitCriterion,
    pub(crate) max_features: usize,
    pub(crate) min_samples_leaf: usize,
}

impl SplitContext<'_> {
    pub(crate) fn weight_of(&self, sample: usize) -> f64 {
        self.class_weight[usize::from(self.labels[sample])]
    }

    pub(crate) fn mass_of(&self, sample_indices: &[usize]) -> ClassMass {
        let mut mass = ClassMass::default();
        for &si in sample_indices {
            mass.add(self.labels[si], self.weight_of(si));
        }
        mass
    }

    /// Find the best threshold split among `max_features` randomly drawn features.
    ///
    /// `sample_indices` may contain duplicates (bootstrap draws); each
    /// occurrence contributes its class weight. Returns `None` when every
    /// candidate feature is constant over the node or every boundary would
    /// leave fewer than `min_samples_leaf` samples on one side.
    pub(crate) fn find_best_split(
        &self,
        sample_indices: &[usize],
        rng: &mut impl Rng,
    ) -> Option<SplitResult> {
        let n_features = self.columns.len();
        let n_samples = sample_indices.len();
        if n_samples < 2 || n_features == 0 {
            return None;
        }

        let parent = self.mass_of(sample_indices);
        let parent_term = parent.total() * self.criterion.impurity(parent).value();

        // Partial Fisher-Yates over feature ids.
        let mut feature_order: Vec<usize> = (0..n_features).collect();
        let take = self.max_features.min(n_features);
        for i in 0..take {
            let j = rng.gen_range(i..n_features);
            feature_order.swap(i, j);
        }

        let mut best_decrease = f64::NEG_INFINITY;
        let mut best: Option<(FeatureIndex, f64)> = None;

        for &feat_idx in &feature_order[..take] {
            let column = &self.columns[feat_idx];
            let mut sorted: Vec<(f64, usize)> =
                sample_indices.iter().map(|&si| (column[si], si)).collect();
            sorted.sort_unstable_by(|a, b| a.0.total_cmp(&b.0));

            let mut left = ClassMass::default();
            let mut right = parent;

            for i in 0..(n_samples - 1) {
                let (value, si) = sorted[i];
                let w = self.weight_of(si);
                left.add(self.labels[si], w);
                right.remove(self.labels[si], w);

                let next = sorted[i + 1].0;
                if value == next {
                    continue;
                }
                let n_left = i + 1;
                if n_left < self.min_samples_leaf || n_samples - n_left < self.min_samples_leaf {
                    continue;
                }

                let decrease = parent_term
                    - left.total() * self.criterion.impurity(left).value()
                    - right.total() * self.criterion.impurity(right).value();
                if decrease > best_decrease {
                    best_decrease = decrease;
                    best = Some((FeatureIndex::new(feat_idx), (value + next) / 2.0));
                }
            }
        }

        let (feature, threshold) = best?;
        let column = &self.columns[feature.index()];
        let (left_indices, right_indices): (Vec<usize>, Vec<usize>) = sample_indices
            .iter()
            .partition(|&&si| column[si] <= threshold);

        Some(SplitResult {
            feature,
            threshold,
            impurity_decrease: best_decrease.max(0.0),
            left_indices,
            right_indices,
        })
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::{ClassMass, SplitContext, SplitCriterion};

    fn mass(negative: f64, positive: f64) -> ClassMass {
        ClassMass { negative, positive }
    }

    #[test]
    fn gini_pure_and_balanced() {
        assert!(SplitCriterion::Gini.impurity(mass(10.0, 0.0)).value().abs() < 1e-12);
        assert!((SplitCriterion::Gini.impurity(mass(5.0, 5.0)).value() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn entropy_balanced_is_ln2() {
        let imp = SplitCriterion::Entropy.impurity(mass(3.0, 3.0));
        assert!((imp.value() - 2.0_f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn empty_node_is_pure() {
        assert_eq!(SplitCriterion::Gini.impurity(ClassMass::default()).value(), 0.0);
    }

    fn context<'a>(
        columns: &'a [Vec<f64>],
        labels: &'a [bool],
        min_samples_leaf: usize,
    ) -> SplitContext<'a> {
        SplitContext {
            columns,
            labels,
            class_weight: [1.0, 1.0],
            criterion: SplitCriterion::Gini,
            max_features: columns.len(),
            min_samples_leaf,
        }
    }

    #[test]
    fn separable_column_splits_between_groups() {
        let columns = vec![vec![1.0, 2.0, 3.0, 10.0, 11.0, 12.0]];
        let labels = [false, false, false, true, true, true];
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let split = context(&columns, &labels, 1)
            .find_best_split(&[0, 1, 2, 3, 4, 5], &mut rng)
            .expect("separable data has a split");
        assert_eq!(split.feature.index(), 0);
        assert!(split.threshold > 3.0 && split.threshold < 10.0);
        assert_eq!(split.left_indices, vec![0, 1, 2]);
        assert_eq!(split.right_indices, vec![3, 4, 5]);
    }

    #[test]
    fn constant_column_has_no_split() {
        let columns = vec![vec![5.0; 4]];
        let labels = [false, false, true, true];
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert!(context(&columns, &labels, 1)
            .find_best_split(&[0, 1, 2, 3], &mut rng)
            .is_none());
    }

    #[test]
    fn min_samples_leaf_blocks_tiny_children() {
        let columns = vec![vec![1.0, 10.0]];
        let labels = [false, true];
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert!(context(&columns, &labels, 2)
            .find_best_split(&[0, 1], &mut rng)
            .is_none());
    }

    #[test]
    fn duplicate_indices_count_twice() {
        let columns = vec![vec![0.0, 1.0]];
        let labels = [false, true];
        let ctx = context(&columns, &labels, 1);
        let m = ctx.mass_of(&[1, 1, 0]);
        assert!((m.positive - 2.0).abs() < 1e-12);
        assert!((m.positive_fraction() - 2.0 / 3.0).abs() < 1e-12);
    }
}
