//! Prediction and per-prediction attribution for the forest.

use rayon::iter::{IntoParallelIterator, ParallelIterator};

use crate::error::RfError;
use crate::forest::Forest;
use crate::importance::{RankedFeature, aggregate_importances};

/// Decomposition of a forest probability along each tree's decision path.
///
/// `probability == bias + contributions.iter().sum()` up to rounding: `bias`
/// is the mean root value and each split on the way to a leaf credits its
/// feature with the change in node value.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct PathAttribution {
    pub probability: f64,
    pub bias: f64,
    /// Per-column contribution, indexed like the training features.
    pub contributions: Vec<f64>,
}

impl PathAttribution {
    /// Pair contributions with names, largest magnitude first.
    #[must_use]
    pub fn ranked(&self, names: &[String]) -> Vec<(String, f64)> {
        let mut ranked: Vec<(String, f64)> = names
            .iter()
            .cloned()
            .zip(self.contributions.iter().copied())
            .collect();
        ranked.sort_by(|a, b| b.1.abs().total_cmp(&a.1.abs()));
        ranked
    }
}

impl Forest {
    /// Mean leaf value over all trees: the probability the sample is positive.
    ///
    /// # Errors
    ///
    /// Returns [`RfError::PredictionFeatureMismatch`] when `sample.len() != n_features`,
    /// or [`RfError::NonFiniteValue`] for NaN or infinite inputs.
    pub fn predict_proba(&self, sample: &[f64]) -> Result<f64, RfError> {
        self.check_sample(sample)?;
        let total: f64 = self
            .trees
            .iter()
            .map(|tree| tree.predict_proba(sample))
            .sum::<Result<f64, RfError>>()?;
        Ok((total / self.trees.len() as f64).clamp(0.0, 1.0))
    }

    /// Probabilities for a batch of samples in parallel.
    ///
    /// # Errors
    ///
    /// Returns the first per-sample error encountered.
    pub fn predict_proba_batch(&self, features: &[Vec<f64>]) -> Result<Vec<f64>, RfError> {
        features
            .into_par_iter()
            .map(|sample| self.predict_proba(sample))
            .collect()
    }

    /// Decompose the prediction for `sample` into per-feature contributions.
    ///
    /// # Errors
    ///
    /// Same as [`Forest::predict_proba`].
    pub fn attribution(&self, sample: &[f64]) -> Result<PathAttribution, RfError> {
        self.check_sample(sample)?;
        let mut contributions = vec![0.0; self.n_features];
        let mut bias = 0.0;
        let mut probability = 0.0;
        for tree in &self.trees {
            bias += tree.root_value();
            let leaf = tree.walk(sample, |feature, parent, child| {
                contributions[feature.index()] += child - parent;
            });
            probability += tree.nodes()[leaf.index()].value();
        }
        let n = self.trees.len() as f64;
        contributions.iter_mut().for_each(|c| *c /= n);
        Ok(PathAttribution {
            probability: probability / n,
            bias: bias / n,
            contributions,
        })
    }

    fn check_sample(&self, sample: &[f64]) -> Result<(), RfError> {
        if sample.len() != self.n_features {
            return Err(RfError::PredictionFeatureMismatch {
                expected: self.n_features,
                got: sample.len(),
            });
        }
        if let Some(feature_index) = sample.iter().position(|v| !v.is_finite()) {
            return Err(RfError::NonFiniteValue {
                sample_index: 0,
                feature_index,
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn n_features(&self) -> usize {
        self.n_features
    }

    #[must_use]
    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    #[must_use]
    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    /// Normalised impurity importances, indexed like the training features.
    #[must_use]
    pub fn importances(&self) -> &[f64] {
        &self.importances
    }

    /// Importances paired with feature names, most important first.
    #[must_use]
    pub fn ranked_importances(&self) -> Vec<RankedFeature> {
        aggregate_importances(std::slice::from_ref(&self.importances), &self.feature_names)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{ForestConfig, MaxFeatures};
    use crate::forest::Forest;

    fn fitted() -> (Forest, Vec<Vec<f64>>) {
        let mut features = Vec::new();
        let mut labels = Vec::new();
        for i in 0..20 {
            let x = i as f64;
            features.push(vec![x, (i % 3) as f64]);
            labels.push(x >= 12.0);
        }
        let names = vec!["vacancy_months".to_string(), "noise".to_string()];
        let forest = ForestConfig::new(16)
            .unwrap()
            .with_max_features(MaxFeatures::All)
            .fit(&features, &labels, &names)
            .unwrap()
            .into_forest();
        (forest, features)
    }

    #[test]
    fn attribution_sums_to_probability() {
        let (forest, features) = fitted();
        for sample in &features {
            let attr = forest.attribution(sample).unwrap();
            let total = attr.bias + attr.contributions.iter().sum::<f64>();
            assert!((total - attr.probability).abs() < 1e-9);
            let direct = forest.predict_proba(sample).unwrap();
            assert!((direct - attr.probability).abs() < 1e-9);
        }
    }

    #[test]
    fn ranked_puts_driving_feature_first() {
        let (forest, _) = fitted();
        let attr = forest.attribution(&[19.0, 1.0]).unwrap();
        let ranked = attr.ranked(forest.feature_names());
        assert_eq!(ranked[0].0, "vacancy_months");
        assert!(ranked[0].1 > 0.0);
    }

    #[test]
    fn ranked_importances_are_named_and_normalised() {
        let (forest, _) = fitted();
        let ranked = forest.ranked_importances();
        assert_eq!(ranked[0].name, "vacancy_months");
        assert_eq!(ranked[0].rank, 1);
        let total: f64 = ranked.iter().map(|f| f.importance).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn probabilities_in_unit_interval() {
        let (forest, features) = fitted();
        for p in forest.predict_proba_batch(&features).unwrap() {
            assert!((0.0..=1.0).contains(&p));
        }
    }

    #[test]
    fn nan_input_rejected() {
        let (forest, _) = fitted();
        assert!(forest.predict_proba(&[f64::NAN, 0.0]).is_err());
        assert!(forest.predict_proba(&[1.0]).is_err());
    }
}
