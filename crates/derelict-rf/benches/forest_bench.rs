//! Criterion benchmarks for derelict-rf: forest training, prediction and attribution.

use criterion::{Criterion, criterion_group, criterion_main};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use derelict_rf::ForestConfig;

fn make_dataset(n_samples: usize, n_features: usize, seed: u64) -> (Vec<Vec<f64>>, Vec<bool>, Vec<String>) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut features = Vec::with_capacity(n_samples);
    let mut labels = Vec::with_capacity(n_samples);
    for i in 0..n_samples {
        let positive = i % 4 == 0;
        labels.push(positive);
        let row: Vec<f64> = (0..n_features)
            .map(|f| {
                let shift = if f < 3 && positive { 1.5 } else { 0.0 };
                shift + rng.r#gen::<f64>()
            })
            .collect();
        features.push(row);
    }
    let names = (0..n_features).map(|f| format!("f{f}")).collect();
    (features, labels, names)
}

fn bench_forest_train(c: &mut Criterion) {
    let (features, labels, names) = make_dataset(1000, 12, 42);
    let cfg = ForestConfig::new(100).unwrap().with_min_samples_leaf(10);

    c.bench_function("forest_train_1000x12_100trees", |b| {
        b.iter(|| cfg.fit(&features, &labels, &names).unwrap());
    });
}

fn bench_forest_predict_batch(c: &mut Criterion) {
    let (features, labels, names) = make_dataset(1000, 12, 42);
    let forest = ForestConfig::new(100)
        .unwrap()
        .fit(&features, &labels, &names)
        .unwrap()
        .into_forest();

    c.bench_function("forest_predict_batch_1000x12", |b| {
        b.iter(|| forest.predict_proba_batch(&features).unwrap());
    });
}

fn bench_forest_attribution(c: &mut Criterion) {
    let (features, labels, names) = make_dataset(1000, 12, 42);
    let forest = ForestConfig::new(100)
        .unwrap()
        .fit(&features, &labels, &names)
        .unwrap()
        .into_forest();

    c.bench_function("forest_attribution_single", |b| {
        b.iter(|| forest.attribution(&features[0]).unwrap());
    });
}

criterion_group!(
    benches,
    bench_forest_train,
    bench_forest_predict_batch,
    bench_forest_attribution
);
criterion_main!(benches);
