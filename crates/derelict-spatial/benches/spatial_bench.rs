//! Criterion benchmarks for derelict-spatial: DBSCAN build and per-location scoring.

use std::sync::Arc;

use criterion::{Criterion, criterion_group, criterion_main};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use derelict_spatial::{
    BoundingBox, ClusterModel, ClusterParams, ConfirmedPoint, DensityModel, DensityParams,
    GeoPoint, IndexSnapshot, IndexVersion, ZoneLayout,
};

fn make_snapshot(n: usize, seed: u64) -> (IndexSnapshot, BoundingBox) {
    let origin = GeoPoint::new(42.33, -83.05).unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let points = (0..n)
        .map(|i| ConfirmedPoint {
            location: origin.offset_m(rng.gen_range(0.0..8000.0), rng.gen_range(0.0..8000.0)),
            confirmed_at: i as i64,
        })
        .collect();
    let ne = origin.offset_m(8000.0, 8000.0);
    let bbox = BoundingBox::new(origin.lat, origin.lon, ne.lat, ne.lon).unwrap();
    (IndexSnapshot::build(IndexVersion::new(1), points, 250.0), bbox)
}

fn bench_dbscan_build(c: &mut Criterion) {
    let (snap, _) = make_snapshot(2000, 42);
    c.bench_function("dbscan_build_2000_points", |b| {
        b.iter(|| ClusterModel::build(&snap, ClusterParams::default()));
    });
}

fn bench_cluster_score(c: &mut Criterion) {
    let (snap, bbox) = make_snapshot(2000, 42);
    let model = ClusterModel::build(&snap, ClusterParams::default());
    let query = bbox.center();
    c.bench_function("cluster_score_single", |b| {
        b.iter(|| model.score(&snap, &query).unwrap());
    });
}

fn bench_density_build_zoned(c: &mut Criterion) {
    let (snap, bbox) = make_snapshot(2000, 42);
    let layout = Arc::new(ZoneLayout::grid(&bbox, 2000.0).unwrap());
    c.bench_function("density_build_2000_points_16_zones", |b| {
        b.iter(|| DensityModel::build(&snap, DensityParams::default(), Some(Arc::clone(&layout))));
    });
}

criterion_group!(benches, bench_dbscan_build, bench_cluster_score, bench_density_build_zoned);
criterion_main!(benches);
