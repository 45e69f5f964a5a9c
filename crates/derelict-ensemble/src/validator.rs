//! Spatially blocked cross-validation with buffer exclusion.
//!
//! Each fold holds out whole zones. Training samples closer than the buffer
//! radius to any held-out zone's boundary are dropped from that fold, so no
//! retained training sample sits within `buffer_radius_m` of the test area.

use std::collections::BTreeSet;
use std::sync::Arc;

use derelict_spatial::{BoundingBox, GeoPoint, SpatialZone, ZoneId, ZoneLayout};
use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::error::EnsembleError;
use crate::metrics::Metric;

/// Padding around the samples' bounding box for generated zones, in meters.
const ZONE_MARGIN_M: f64 = 1.0;

/// How the study area is partitioned into zones.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ZoneConfig {
    /// Square cells of `cell_m` meters over the samples' bounding box.
    Grid { cell_m: f64 },
    /// `k` blocks from k-means on the sample coordinates.
    KMeans { k: usize },
    /// Explicit polygons.
    Polygons { zones: Vec<SpatialZone> },
}

impl ZoneConfig {
    /// Build the layout covering `locations`.
    ///
    /// # Errors
    ///
    /// | Variant | Condition |
    /// |---|---|
    /// | [`EnsembleError::EmptyTrainingSet`] | `locations` is empty for a generated layout |
    /// | [`EnsembleError::Spatial`] | invalid cell size, `k`, or polygons |
    pub fn layout(&self, locations: &[GeoPoint], seed: u64) -> Result<ZoneLayout, EnsembleError> {
        let layout = match self {
            ZoneConfig::Grid { cell_m } => {
                let bbox = BoundingBox::enclosing(locations, ZONE_MARGIN_M).ok_or(EnsembleError::EmptyTrainingSet)?;
                ZoneLayout::grid(&bbox, *cell_m)?
            }
            ZoneConfig::KMeans { k } => {
                if locations.is_empty() {
                    return Err(EnsembleError::EmptyTrainingSet);
                }
                ZoneLayout::kmeans(locations, *k, seed, ZONE_MARGIN_M)?
            }
            ZoneConfig::Polygons { zones } => ZoneLayout::from_zones(zones.clone())?,
        };
        Ok(layout)
    }
}

/// Validation settings.
///
/// # Defaults
///
/// | Parameter         | Default       |
/// |-------------------|---------------|
/// | `buffer_radius_m` | 500.0         |
/// | `n_folds`         | 5             |
/// | `seed`            | 42            |
/// | `metric`          | F1 at 0.5     |
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    buffer_radius_m: f64,
    n_folds: usize,
    seed: u64,
    metric: Metric,
}

impl ValidatorConfig {
    /// # Errors
    ///
    /// Returns [`EnsembleError::Spatial`] if `buffer_radius_m` is negative or non-finite.
    pub fn new(buffer_radius_m: f64) -> Result<Self, EnsembleError> {
        Self::default().with_buffer_radius_m(buffer_radius_m)
    }

    /// # Errors
    ///
    /// Returns [`EnsembleError::Spatial`] if `buffer_radius_m` is negative or non-finite.
    pub fn with_buffer_radius_m(mut self, buffer_radius_m: f64) -> Result<Self, EnsembleError> {
        if !(buffer_radius_m.is_finite() && buffer_radius_m >= 0.0) {
            return Err(derelict_spatial::SpatialError::InvalidLength {
                name: "buffer_radius_m",
                value: buffer_radius_m,
            }
            .into());
        }
        self.buffer_radius_m = buffer_radius_m;
        Ok(self)
    }

    #[must_use]
    pub fn with_n_folds(mut self, n_folds: usize) -> Self {
        self.n_folds = n_folds;
        self
    }

    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    #[must_use]
    pub fn with_metric(mut self, metric: Metric) -> Self {
        self.metric = metric;
        self
    }

    #[must_use]
    pub fn buffer_radius_m(&self) -> f64 {
        self.buffer_radius_m
    }

    #[must_use]
    pub fn n_folds(&self) -> usize {
        self.n_folds
    }

    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    #[must_use]
    pub fn metric(&self) -> Metric {
        self.metric
    }
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            buffer_radius_m: 500.0,
            n_folds: 5,
            seed: 42,
            metric: Metric::default(),
        }
    }
}

/// One train/test split. Indices refer to the sample slice given to [`SpatialValidator::folds`].
#[derive(Debug, Clone, PartialEq)]
pub struct Fold {
    pub index: usize,
    pub test_zones: Vec<ZoneId>,
    pub train: Vec<usize>,
    pub test: Vec<usize>,
    /// Samples outside the test zones but inside the buffer.
    pub excluded: Vec<usize>,
    /// Smallest distance from a retained training sample to a test-zone boundary.
    pub min_train_boundary_distance_m: Option<f64>,
}

/// Per-fold record in a [`ValidationReport`].
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FoldReport {
    pub index: usize,
    pub test_zones: Vec<ZoneId>,
    pub n_train: usize,
    pub n_test: usize,
    pub n_excluded: usize,
    pub min_train_boundary_distance_m: Option<f64>,
    /// Metric of the chosen weights on this fold; `None` when undefined.
    pub metric: Option<f64>,
}

/// What a training run validated and how the chosen weights scored.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ValidationReport {
    pub run_id: Uuid,
    pub metric: Metric,
    pub buffer_radius_m: f64,
    pub folds: Vec<FoldReport>,
    /// Mean over folds with a defined metric.
    pub mean_metric: Option<f64>,
    pub uniform_metric: Option<f64>,
    /// Why the run fell back to uniform weights, if it did.
    pub fallback_reason: Option<String>,
    /// Zones used for blocking, so the layout can be rebuilt.
    pub zones: Vec<SpatialZone>,
}

/// Splits samples into zone-blocked folds.
#[derive(Debug, Clone)]
pub struct SpatialValidator {
    layout: Arc<ZoneLayout>,
    config: ValidatorConfig,
}

impl SpatialValidator {
    /// # Errors
    ///
    /// Returns [`EnsembleError::InvalidFoldCount`] if `n_folds < 2`.
    pub fn new(layout: Arc<ZoneLayout>, config: ValidatorConfig) -> Result<Self, EnsembleError> {
        if config.n_folds < 2 {
            return Err(EnsembleError::InvalidFoldCount {
                n_folds: config.n_folds,
            });
        }
        Ok(Self { layout, config })
    }

    #[must_use]
    pub fn layout(&self) -> &Arc<ZoneLayout> {
        &self.layout
    }

    #[must_use]
    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Assign zones to folds and split `locations` for each fold.
    ///
    /// Zones that contain samples are shuffled with the configured seed and
    /// dealt round-robin into `min(n_folds, n_zones)` folds. Samples outside
    /// every zone are never tested but may train.
    ///
    /// # Errors
    ///
    /// | Variant | Condition |
    /// |---|---|
    /// | [`EnsembleError::EmptyTrainingSet`] | `locations` is empty |
    /// | [`EnsembleError::TooFewZones`] | fewer than 2 zones contain samples |
    #[instrument(skip_all, fields(n_samples = locations.len(), buffer_m = self.config.buffer_radius_m))]
    pub fn folds(&self, locations: &[GeoPoint]) -> Result<Vec<Fold>, EnsembleError> {
        if locations.is_empty() {
            return Err(EnsembleError::EmptyTrainingSet);
        }
        let zone_of: Vec<Option<ZoneId>> = locations.iter().map(|p| self.layout.zone_of(p)).collect();
        let occupied: BTreeSet<ZoneId> = zone_of.iter().flatten().copied().collect();
        if occupied.len() < 2 {
            return Err(EnsembleError::TooFewZones {
                n_zones: occupied.len(),
                required: 2,
            });
        }

        let mut zones: Vec<ZoneId> = occupied.into_iter().collect();
        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed);
        zones.shuffle(&mut rng);
        let n_folds = self.config.n_folds.min(zones.len());
        let mut assignment: Vec<Vec<ZoneId>> = vec![Vec::new(); n_folds];
        for (i, zone) in zones.into_iter().enumerate() {
            assignment[i % n_folds].push(zone);
        }

        let folds = assignment
            .into_iter()
            .enumerate()
            .map(|(index, mut test_zones)| {
                test_zones.sort_unstable();
                self.split(index, test_zones, locations, &zone_of)
            })
            .collect::<Result<Vec<_>, _>>()?;
        info!(n_folds = folds.len(), "spatial folds built");
        Ok(folds)
    }

    fn split(
        &self,
        index: usize,
        test_zones: Vec<ZoneId>,
        locations: &[GeoPoint],
        zone_of: &[Option<ZoneId>],
    ) -> Result<Fold, EnsembleError> {
        let buffer = self.config.buffer_radius_m;
        let mut train = Vec::new();
        let mut test = Vec::new();
        let mut excluded = Vec::new();
        let mut min_distance: Option<f64> = None;

        for (i, location) in locations.iter().enumerate() {
            if zone_of[i].is_some_and(|z| test_zones.contains(&z)) {
                test.push(i);
                continue;
            }
            let mut distance = f64::INFINITY;
            for &zone in &test_zones {
                distance = distance.min(self.layout.distance_to_boundary_m(location, zone)?);
            }
            if distance >= buffer {
                train.push(i);
                min_distance = Some(min_distance.map_or(distance, |m| m.min(distance)));
            } else {
                excluded.push(i);
            }
        }

        debug!(
            fold = index,
            zones = ?test_zones,
            n_train = train.len(),
            n_test = test.len(),
            n_excluded = excluded.len(),
            "fold split"
        );
        Ok(Fold {
            index,
            test_zones,
            train,
            test,
            excluded,
            min_train_boundary_distance_m: min_distance,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use derelict_spatial::{BoundingBox, GeoPoint, ZoneLayout};

    use super::{SpatialValidator, ValidatorConfig, ZoneConfig};
    use crate::error::EnsembleError;

    fn grid_locations() -> Vec<GeoPoint> {
        let origin = GeoPoint::new(41.0, -87.0).unwrap();
        let mut out = Vec::new();
        for row in 0..8 {
            for col in 0..8 {
                out.push(origin.offset_m(row as f64 * 250.0 + 60.0, col as f64 * 250.0 + 60.0));
            }
        }
        out
    }

    fn validator(buffer: f64, n_folds: usize) -> (SpatialValidator, Vec<GeoPoint>) {
        let locations = grid_locations();
        let layout = ZoneConfig::Grid { cell_m: 1000.0 }.layout(&locations, 7).unwrap();
        let config = ValidatorConfig::new(buffer).unwrap().with_n_folds(n_folds);
        (SpatialValidator::new(Arc::new(layout), config).unwrap(), locations)
    }

    #[test]
    fn every_sample_lands_in_exactly_one_bucket() {
        let (v, locations) = validator(200.0, 4);
        for fold in v.folds(&locations).unwrap() {
            let total = fold.train.len() + fold.test.len() + fold.excluded.len();
            assert_eq!(total, locations.len());
            assert!(!fold.test.is_empty());
        }
    }

    #[test]
    fn retained_training_respects_buffer() {
        let (v, locations) = validator(300.0, 3);
        for fold in v.folds(&locations).unwrap() {
            for &i in &fold.train {
                for &zone in &fold.test_zones {
                    let d = v.layout().distance_to_boundary_m(&locations[i], zone).unwrap();
                    assert!(d >= 300.0, "fold {} sample {i} at {d} m", fold.index);
                }
            }
            if let Some(min) = fold.min_train_boundary_distance_m {
                assert!(min >= 300.0);
            }
        }
    }

    #[test]
    fn larger_buffer_excludes_more() {
        let (narrow, locations) = validator(50.0, 2);
        let (wide, _) = validator(600.0, 2);
        let excluded = |v: &SpatialValidator| -> usize {
            v.folds(&locations).unwrap().iter().map(|f| f.excluded.len()).sum()
        };
        assert!(excluded(&wide) > excluded(&narrow));
    }

    #[test]
    fn each_zone_is_tested_once() {
        let (v, locations) = validator(0.0, 5);
        let folds = v.folds(&locations).unwrap();
        let mut tested: Vec<_> = folds.iter().flat_map(|f| f.test_zones.clone()).collect();
        let n = tested.len();
        tested.sort_unstable();
        tested.dedup();
        assert_eq!(tested.len(), n);
        let n_tested: usize = folds.iter().map(|f| f.test.len()).sum();
        assert_eq!(n_tested, locations.len());
    }

    #[test]
    fn single_zone_rejected() {
        let origin = GeoPoint::new(41.0, -87.0).unwrap();
        let bbox = BoundingBox::enclosing(&[origin], 5000.0).unwrap();
        let layout = ZoneLayout::grid(&bbox, 20_000.0).unwrap();
        let v = SpatialValidator::new(Arc::new(layout), ValidatorConfig::default()).unwrap();
        let err = v.folds(&[origin, origin.offset_m(10.0, 10.0)]).unwrap_err();
        assert!(matches!(err, EnsembleError::TooFewZones { n_zones: 1, .. }));
    }

    #[test]
    fn config_validation() {
        assert!(ValidatorConfig::new(-1.0).is_err());
        let layout = ZoneConfig::KMeans { k: 3 }.layout(&grid_locations(), 1).unwrap();
        let config = ValidatorConfig::default().with_n_folds(1);
        assert!(SpatialValidator::new(Arc::new(layout), config).is_err());
    }
}
