//! Confirmed-abandoned point index published as immutable versioned snapshots.
//!
//! Readers call [`SpatialIndex::snapshot`] once and use that `Arc` for the
//! whole call; writers build a fresh [`IndexSnapshot`] and swap it in under a
//! new version. A snapshot is never mutated after publication.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::{debug, info, instrument};

use crate::error::SpatialError;
use crate::geo::{GeoPoint, METERS_PER_DEGREE};

/// Default bucket edge for radius queries, in meters.
const DEFAULT_BUCKET_M: f64 = 250.0;

/// Monotonic version of the confirmed-point set. Version 0 is the empty index.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
    serde::Serialize, serde::Deserialize,
)]
pub struct IndexVersion(u64);

impl IndexVersion {
    #[must_use]
    pub fn new(version: u64) -> Self {
        Self(version)
    }

    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }

    fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for IndexVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A confirmed-abandoned property location.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ConfirmedPoint {
    pub location: GeoPoint,
    /// Unix seconds at which the status was confirmed.
    pub confirmed_at: i64,
}

/// One immutable version of the confirmed-point set with a bucket grid for radius queries.
#[derive(Debug)]
pub struct IndexSnapshot {
    version: IndexVersion,
    points: Vec<ConfirmedPoint>,
    bucket_deg: f64,
    buckets: HashMap<(i64, i64), Vec<usize>>,
}

impl IndexSnapshot {
    /// Build a snapshot; points are kept in `confirmed_at` order.
    #[must_use]
    pub fn build(version: IndexVersion, mut points: Vec<ConfirmedPoint>, bucket_m: f64) -> Self {
        points.sort_by_key(|p| p.confirmed_at);
        let bucket_deg = bucket_m / METERS_PER_DEGREE;
        let mut buckets: HashMap<(i64, i64), Vec<usize>> = HashMap::new();
        for (i, p) in points.iter().enumerate() {
            buckets
                .entry(bucket_key(&p.location, bucket_deg))
                .or_default()
                .push(i);
        }
        Self {
            version,
            points,
            bucket_deg,
            buckets,
        }
    }

    #[must_use]
    pub fn version(&self) -> IndexVersion {
        self.version
    }

    #[must_use]
    pub fn points(&self) -> &[ConfirmedPoint] {
        &self.points
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Indices and distances of all points within `radius_m` of `center`.
    #[must_use]
    pub fn within(&self, center: &GeoPoint, radius_m: f64) -> Vec<(usize, f64)> {
        if self.points.is_empty() {
            return vec![];
        }
        let d_lat = radius_m / METERS_PER_DEGREE;
        let widest = (center.lat.abs() + d_lat).min(89.9).to_radians().cos();
        let d_lon = radius_m / (METERS_PER_DEGREE * widest);

        let (lat_lo, lon_lo) = bucket_key(
            &GeoPoint {
                lat: center.lat - d_lat,
                lon: center.lon - d_lon,
            },
            self.bucket_deg,
        );
        let (lat_hi, lon_hi) = bucket_key(
            &GeoPoint {
                lat: center.lat + d_lat,
                lon: center.lon + d_lon,
            },
            self.bucket_deg,
        );

        // Wide queries touch more cells than there are points; scan instead.
        let n_cells = (lat_hi - lat_lo + 1).saturating_mul(lon_hi - lon_lo + 1);
        if n_cells as usize > self.points.len() {
            return self
                .points
                .iter()
                .enumerate()
                .map(|(i, p)| (i, center.haversine_m(&p.location)))
                .filter(|&(_, d)| d <= radius_m)
                .collect();
        }

        let mut hits = Vec::new();
        for lat_key in lat_lo..=lat_hi {
            for lon_key in lon_lo..=lon_hi {
                let Some(bucket) = self.buckets.get(&(lat_key, lon_key)) else {
                    continue;
                };
                for &i in bucket {
                    let d = center.haversine_m(&self.points[i].location);
                    if d <= radius_m {
                        hits.push((i, d));
                    }
                }
            }
        }
        hits.sort_unstable_by_key(|&(i, _)| i);
        hits
    }

    /// Nearest point among `candidates` (all points when `None`), with its distance.
    #[must_use]
    pub fn nearest(&self, center: &GeoPoint, candidates: Option<&[usize]>) -> Option<(usize, f64)> {
        let distance = |i: usize| (i, center.haversine_m(&self.points[i].location));
        let closest = |a: &(usize, f64), b: &(usize, f64)| a.1.total_cmp(&b.1);
        match candidates {
            Some(indices) => indices.iter().map(|&i| distance(i)).min_by(closest),
            None => (0..self.points.len()).map(distance).min_by(closest),
        }
    }
}

fn bucket_key(p: &GeoPoint, bucket_deg: f64) -> (i64, i64) {
    (
        (p.lat / bucket_deg).floor() as i64,
        (p.lon / bucket_deg).floor() as i64,
    )
}

/// Single-writer, multi-reader holder of the current [`IndexSnapshot`].
#[derive(Debug)]
pub struct SpatialIndex {
    current: RwLock<Arc<IndexSnapshot>>,
    writer: Mutex<()>,
    bucket_m: f64,
}

impl SpatialIndex {
    /// An empty index at version 0.
    #[must_use]
    pub fn new() -> Self {
        Self::with_bucket_m(DEFAULT_BUCKET_M)
    }

    /// An empty index whose snapshots bucket points into `bucket_m` cells.
    #[must_use]
    pub fn with_bucket_m(bucket_m: f64) -> Self {
        let bucket_m = if bucket_m.is_finite() && bucket_m > 0.0 {
            bucket_m
        } else {
            DEFAULT_BUCKET_M
        };
        Self {
            current: RwLock::new(Arc::new(IndexSnapshot::build(
                IndexVersion::default(),
                Vec::new(),
                bucket_m,
            ))),
            writer: Mutex::new(()),
            bucket_m,
        }
    }

    /// Bind to the current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    #[must_use]
    pub fn version(&self) -> IndexVersion {
        self.snapshot().version()
    }

    fn rebuild(&self, edit: impl FnOnce(&mut Vec<ConfirmedPoint>) -> usize) -> (IndexVersion, usize) {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let base = self.snapshot();
        let mut points = base.points().to_vec();
        let changed = edit(&mut points);
        let next = Arc::new(IndexSnapshot::build(base.version().next(), points, self.bucket_m));
        let version = next.version();
        let n_points = next.len();
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = next;
        debug!(%version, n_points, changed, "spatial index snapshot published");
        (version, changed)
    }

    /// Replace the whole confirmed set, e.g. after a change notification.
    ///
    /// # Errors
    ///
    /// Returns [`SpatialError::InvalidCoordinate`] if any point is out of range;
    /// nothing is published in that case.
    #[instrument(skip_all, fields(n_points = points.len()))]
    pub fn publish(&self, points: Vec<ConfirmedPoint>) -> Result<IndexVersion, SpatialError> {
        for p in &points {
            GeoPoint::new(p.location.lat, p.location.lon)?;
        }
        let n = points.len();
        let (version, _) = self.rebuild(move |current| {
            *current = points;
            n
        });
        info!(%version, n_points = n, "confirmed set replaced");
        Ok(version)
    }

    /// Add one confirmed point under a new version.
    ///
    /// # Errors
    ///
    /// Returns [`SpatialError::InvalidCoordinate`] if the point is out of range.
    pub fn insert(&self, point: ConfirmedPoint) -> Result<IndexVersion, SpatialError> {
        GeoPoint::new(point.location.lat, point.location.lon)?;
        Ok(self
            .rebuild(|current| {
                current.push(point);
                1
            })
            .0)
    }

    /// Remove every point at exactly `location`; returns the new version and the count removed.
    ///
    /// A new version is published even when nothing matched.
    pub fn remove(&self, location: &GeoPoint) -> (IndexVersion, usize) {
        self.rebuild(|current| {
            let before = current.len();
            current.retain(|p| p.location != *location);
            before - current.len()
        })
    }
}

impl Default for SpatialIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{ConfirmedPoint, IndexSnapshot, IndexVersion, SpatialIndex};
    use crate::geo::GeoPoint;

    fn at(north_m: f64, east_m: f64, confirmed_at: i64) -> ConfirmedPoint {
        ConfirmedPoint {
            location: GeoPoint::new(40.0, -75.0).unwrap().offset_m(north_m, east_m),
            confirmed_at,
        }
    }

    #[test]
    fn radius_query_matches_brute_force() {
        let points: Vec<ConfirmedPoint> = (0..40)
            .map(|i| at((i % 8) as f64 * 90.0, (i / 8) as f64 * 130.0, i))
            .collect();
        let snap = IndexSnapshot::build(IndexVersion::new(1), points, 100.0);
        let center = GeoPoint::new(40.0, -75.0).unwrap().offset_m(300.0, 200.0);
        let hits: Vec<usize> = snap.within(&center, 250.0).into_iter().map(|(i, _)| i).collect();
        let brute: Vec<usize> = snap
            .points()
            .iter()
            .enumerate()
            .filter(|(_, p)| center.haversine_m(&p.location) <= 250.0)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(hits, brute);
        assert!(!hits.is_empty());
    }

    #[test]
    fn points_sorted_by_confirmation_time() {
        let snap = IndexSnapshot::build(IndexVersion::new(1), vec![at(0.0, 0.0, 9), at(5.0, 0.0, 3)], 100.0);
        assert_eq!(snap.points()[0].confirmed_at, 3);
    }

    #[test]
    fn every_write_bumps_version() {
        let index = SpatialIndex::new();
        assert_eq!(index.version(), IndexVersion::new(0));
        let v1 = index.insert(at(0.0, 0.0, 1)).unwrap();
        let v2 = index.publish(vec![at(0.0, 0.0, 1), at(10.0, 0.0, 2)]).unwrap();
        let (v3, removed) = index.remove(&at(10.0, 0.0, 2).location);
        assert!(v1 < v2 && v2 < v3);
        assert_eq!(removed, 1);
        assert_eq!(index.snapshot().len(), 1);
    }

    #[test]
    fn bound_snapshot_survives_later_writes() {
        let index = SpatialIndex::new();
        index.insert(at(0.0, 0.0, 1)).unwrap();
        let bound = index.snapshot();
        index.insert(at(50.0, 0.0, 2)).unwrap();
        assert_eq!(bound.len(), 1);
        assert_eq!(index.snapshot().len(), 2);
        assert!(!Arc::ptr_eq(&bound, &index.snapshot()));
    }

    #[test]
    fn invalid_point_not_published() {
        let index = SpatialIndex::new();
        let bad = ConfirmedPoint {
            location: GeoPoint { lat: 123.0, lon: 0.0 },
            confirmed_at: 0,
        };
        assert!(index.insert(bad).is_err());
        assert_eq!(index.version(), IndexVersion::new(0));
    }

    #[test]
    fn nearest_respects_candidates() {
        let snap = IndexSnapshot::build(
            IndexVersion::new(1),
            vec![at(0.0, 0.0, 1), at(100.0, 0.0, 2), at(500.0, 0.0, 3)],
            100.0,
        );
        let q = GeoPoint::new(40.0, -75.0).unwrap().offset_m(90.0, 0.0);
        assert_eq!(snap.nearest(&q, None).map(|(i, _)| i), Some(1));
        assert_eq!(snap.nearest(&q, Some(&[0, 2])).map(|(i, _)| i), Some(0));
    }
}
