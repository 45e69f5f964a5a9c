//! Binary classification metrics for validation folds.

use std::fmt;

/// The objective a validation fold is scored with.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Metric {
    /// F1 of the positive class at a decision threshold.
    F1 { threshold: f64 },
    /// Area under the ROC curve.
    Auc,
}

impl Default for Metric {
    fn default() -> Self {
        Metric::F1 { threshold: 0.5 }
    }
}

impl Metric {
    /// Score `scores` against `labels`.
    ///
    /// Returns `None` when the metric is undefined: empty input or a single class.
    #[must_use]
    pub fn evaluate(&self, scores: &[f64], labels: &[bool]) -> Option<f64> {
        let n_positive = labels.iter().filter(|&&l| l).count();
        if labels.is_empty() || n_positive == 0 || n_positive == labels.len() {
            return None;
        }
        match *self {
            Metric::F1 { threshold } => Some(ConfusionCounts::at_threshold(scores, labels, threshold).f1()),
            Metric::Auc => roc_auc(scores, labels),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Metric::F1 { threshold } => write!(f, "f1@{threshold}"),
            Metric::Auc => f.write_str("auc"),
        }
    }
}

/// Binary confusion counts with the positive class as "abandoned".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ConfusionCounts {
    pub true_positive: usize,
    pub false_positive: usize,
    pub true_negative: usize,
    pub false_negative: usize,
}

impl ConfusionCounts {
    /// Count predictions `score >= threshold` against `labels`.
    #[must_use]
    pub fn at_threshold(scores: &[f64], labels: &[bool], threshold: f64) -> Self {
        let mut counts = Self::default();
        for (&s, &l) in scores.iter().zip(labels) {
            match (s >= threshold, l) {
                (true, true) => counts.true_positive += 1,
                (true, false) => counts.false_positive += 1,
                (false, false) => counts.true_negative += 1,
                (false, true) => counts.false_negative += 1,
            }
        }
        counts
    }

    /// `tp / (tp + fp)`, or 0 with no positive predictions.
    #[must_use]
    pub fn precision(&self) -> f64 {
        ratio(self.true_positive, self.true_positive + self.false_positive)
    }

    /// `tp / (tp + fn)`, or 0 with no positive labels.
    #[must_use]
    pub fn recall(&self) -> f64 {
        ratio(self.true_positive, self.true_positive + self.false_negative)
    }

    #[must_use]
    pub fn f1(&self) -> f64 {
        let (p, r) = (self.precision(), self.recall());
        if p + r == 0.0 { 0.0 } else { 2.0 * p * r / (p + r) }
    }

    #[must_use]
    pub fn accuracy(&self) -> f64 {
        let total = self.true_positive + self.false_positive + self.true_negative + self.false_negative;
        ratio(self.true_positive + self.true_negative, total)
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 { 0.0 } else { num as f64 / den as f64 }
}

/// ROC AUC as the Mann-Whitney rank statistic, averaging ranks over ties.
///
/// Returns `None` when either class is absent.
#[must_use]
pub fn roc_auc(scores: &[f64], labels: &[bool]) -> Option<f64> {
    let n = scores.len().min(labels.len());
    let n_pos = labels[..n].iter().filter(|&&l| l).count();
    let n_neg = n - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return None;
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));
    let mut rank_sum = 0.0;
    let mut start = 0;
    while start < n {
        let mut end = start + 1;
        while end < n && scores[order[end]] == scores[order[start]] {
            end += 1;
        }
        // Ranks are 1-based; a tie group shares the mean of its ranks.
        let mean_rank = (start + end + 1) as f64 / 2.0;
        rank_sum += mean_rank * order[start..end].iter().filter(|&&i| labels[i]).count() as f64;
        start = end;
    }
    let n_pos_f = n_pos as f64;
    Some((rank_sum - n_pos_f * (n_pos_f + 1.0) / 2.0) / (n_pos_f * n_neg as f64))
}

#[cfg(test)]
mod tests {
    use super::{ConfusionCounts, Metric, roc_auc};

    #[test]
    fn perfect_separation() {
        let scores = [0.1, 0.2, 0.8, 0.9];
        let labels = [false, false, true, true];
        assert_eq!(roc_auc(&scores, &labels), Some(1.0));
        assert_eq!(Metric::default().evaluate(&scores, &labels), Some(1.0));
    }

    #[test]
    fn ties_count_half() {
        let scores = [0.5, 0.5];
        let labels = [false, true];
        assert_eq!(roc_auc(&scores, &labels), Some(0.5));
    }

    #[test]
    fn inverted_ranking_is_zero() {
        assert_eq!(roc_auc(&[0.9, 0.1], &[false, true]), Some(0.0));
    }

    #[test]
    fn single_class_is_undefined() {
        assert_eq!(Metric::Auc.evaluate(&[0.1, 0.9], &[true, true]), None);
        assert_eq!(Metric::default().evaluate(&[0.1, 0.9], &[false, false]), None);
        assert_eq!(Metric::Auc.evaluate(&[], &[]), None);
    }

    #[test]
    fn confusion_counts_and_f1() {
        let scores = [0.9, 0.7, 0.4, 0.2, 0.6];
        let labels = [true, false, true, false, true];
        let c = ConfusionCounts::at_threshold(&scores, &labels, 0.5);
        assert_eq!(
            (c.true_positive, c.false_positive, c.true_negative, c.false_negative),
            (2, 1, 1, 1)
        );
        assert!((c.precision() - 2.0 / 3.0).abs() < 1e-12);
        assert!((c.recall() - 2.0 / 3.0).abs() < 1e-12);
        assert!((c.f1() - 2.0 / 3.0).abs() < 1e-12);
        assert!((c.accuracy() - 0.6).abs() < 1e-12);
    }

    #[test]
    fn no_positive_predictions_scores_zero_f1() {
        let c = ConfusionCounts::at_threshold(&[0.1, 0.2], &[true, false], 0.5);
        assert_eq!(c.f1(), 0.0);
    }
}
