//! Accuracy regression tests for derelict-rf.
//!
//! Guards against algorithmic changes that degrade ranking quality on a
//! deterministic, imbalanced synthetic dataset.

use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use derelict_rf::{ClassWeighting, Forest, ForestConfig};

// ---------------------------------------------------------------------------
// Helper: deterministic imbalanced dataset
// ---------------------------------------------------------------------------

/// 400 samples, 8 features, one positive in five.
///
/// Features 0-1 are informative (positives shifted by +2.0 over [0, 1] noise).
/// Features 2-7 are pure noise in [0, 1].
fn make_imbalanced(seed: u64) -> (Vec<Vec<f64>>, Vec<bool>, Vec<String>) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut features = Vec::with_capacity(400);
    let mut labels = Vec::with_capacity(400);
    for i in 0..400 {
        let positive = i % 5 == 0;
        labels.push(positive);
        let row: Vec<f64> = (0..8)
            .map(|f| {
                let shift = if f < 2 && positive { 2.0 } else { 0.0 };
                shift + rng.r#gen::<f64>()
            })
            .collect();
        features.push(row);
    }
    let names = (0..8).map(|f| format!("f{f}")).collect();
    (features, labels, names)
}

fn recall_at_half(forest: &Forest, features: &[Vec<f64>], labels: &[bool]) -> f64 {
    let probs = forest.predict_proba_batch(features).unwrap();
    let positives = labels.iter().filter(|&&l| l).count() as f64;
    let hits = probs
        .iter()
        .zip(labels)
        .filter(|&(&p, &l)| l && p >= 0.5)
        .count() as f64;
    hits / positives
}

// ---------------------------------------------------------------------------
// a) held-out recall
// ---------------------------------------------------------------------------

/// Recall on a fresh draw must exceed 0.9 with balanced weighting.
#[test]
fn held_out_recall_above_threshold() {
    let (features, labels, names) = make_imbalanced(42);
    let (test_x, test_y, _) = make_imbalanced(7);
    let forest = ForestConfig::new(60)
        .unwrap()
        .with_min_samples_leaf(5)
        .fit(&features, &labels, &names)
        .unwrap()
        .into_forest();

    let recall = recall_at_half(&forest, &test_x, &test_y);
    assert!(recall > 0.9, "held-out recall {recall} <= 0.9");
}

// ---------------------------------------------------------------------------
// b) informative features rank first
// ---------------------------------------------------------------------------

#[test]
fn informative_features_rank_top_two() {
    let (features, labels, names) = make_imbalanced(42);
    let fit = ForestConfig::new(60).unwrap().fit(&features, &labels, &names).unwrap();
    let top: Vec<&str> = fit.importances()[..2].iter().map(|f| f.name.as_str()).collect();
    assert!(top.contains(&"f0") && top.contains(&"f1"), "top = {top:?}");
}

// ---------------------------------------------------------------------------
// c) balanced weighting does not lose recall against uniform
// ---------------------------------------------------------------------------

#[test]
fn balanced_recall_at_least_uniform() {
    let (features, labels, names) = make_imbalanced(42);
    let (test_x, test_y, _) = make_imbalanced(11);
    let fit = |weighting| {
        ForestConfig::new(40)
            .unwrap()
            .with_min_samples_leaf(10)
            .with_class_weighting(weighting)
            .fit(&features, &labels, &names)
            .unwrap()
            .into_forest()
    };
    let balanced = recall_at_half(&fit(ClassWeighting::Balanced), &test_x, &test_y);
    let uniform = recall_at_half(&fit(ClassWeighting::Uniform), &test_x, &test_y);
    assert!(balanced + 1e-9 >= uniform, "balanced {balanced} < uniform {uniform}");
}
