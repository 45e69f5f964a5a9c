//! Table-backed implementations of the engine's external collaborators.
//!
//! Rows are matched to queries by exact coordinate, so a location read from
//! one CSV finds its row in another only if both spell the coordinate the same.

use std::collections::HashMap;

use derelict_ensemble::{
    EvidenceUnavailable, FeatureProvider, FeatureUnavailable, FeatureVector, SatelliteEvidence,
    SatelliteEvidenceSource, StreetEvidence, StreetEvidenceSource,
};
use derelict_spatial::GeoPoint;

/// Cloud cover above which a satellite scene is treated as unusable, in percent.
pub const DEFAULT_MAX_CLOUD_PERCENT: f64 = 60.0;

fn key(location: &GeoPoint) -> (u64, u64) {
    (location.lat.to_bits(), location.lon.to_bits())
}

/// Feature vectors keyed by coordinate.
#[derive(Debug, Clone, Default)]
pub struct TableFeatures {
    rows: HashMap<(u64, u64), FeatureVector>,
}

impl TableFeatures {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the features at `location`.
    pub fn insert(&mut self, location: GeoPoint, features: FeatureVector) {
        self.rows.insert(key(&location), features);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl FeatureProvider for TableFeatures {
    fn features(&self, location: &GeoPoint) -> Result<FeatureVector, FeatureUnavailable> {
        self.rows.get(&key(location)).cloned().ok_or_else(|| FeatureUnavailable {
            reason: format!("no feature row at ({}, {})", location.lat, location.lon),
        })
    }
}

/// Offline imagery results for one location. Missing parts are `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EvidenceRow {
    pub satellite: Option<SatelliteEvidence>,
    pub street: Option<StreetEvidence>,
    pub cloud_cover_percent: Option<f64>,
}

/// Pre-computed satellite and street evidence keyed by coordinate.
#[derive(Debug, Clone)]
pub struct EvidenceTable {
    rows: HashMap<(u64, u64), EvidenceRow>,
    max_cloud_percent: f64,
}

impl EvidenceTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            rows: HashMap::new(),
            max_cloud_percent: DEFAULT_MAX_CLOUD_PERCENT,
        }
    }

    /// Scenes cloudier than `percent` are reported as [`EvidenceUnavailable::CloudCover`].
    #[must_use]
    pub fn with_max_cloud_percent(mut self, percent: f64) -> Self {
        self.max_cloud_percent = percent;
        self
    }

    pub fn insert(&mut self, location: GeoPoint, row: EvidenceRow) {
        self.rows.insert(key(&location), row);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl Default for EvidenceTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SatelliteEvidenceSource for EvidenceTable {
    fn satellite_evidence(&self, location: &GeoPoint) -> Result<SatelliteEvidence, EvidenceUnavailable> {
        let row = self.rows.get(&key(location)).ok_or(EvidenceUnavailable::NoCoverage)?;
        if let Some(percent) = row.cloud_cover_percent
            && percent > self.max_cloud_percent
        {
            return Err(EvidenceUnavailable::CloudCover { percent });
        }
        row.satellite.ok_or(EvidenceUnavailable::NoCoverage)
    }
}

impl StreetEvidenceSource for EvidenceTable {
    fn street_evidence(&self, location: &GeoPoint) -> Result<StreetEvidence, EvidenceUnavailable> {
        self.rows
            .get(&key(location))
            .and_then(|row| row.street)
            .ok_or(EvidenceUnavailable::NoCoverage)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use derelict_ensemble::{
        EvidenceUnavailable, FeatureProvider, FeatureVector, SatelliteEvidence, SatelliteEvidenceSource,
        StreetEvidence, StreetEvidenceSource,
    };
    use derelict_spatial::GeoPoint;

    use super::{EvidenceRow, EvidenceTable, TableFeatures};

    fn here() -> GeoPoint {
        GeoPoint::new(42.331, -83.045).unwrap()
    }

    #[test]
    fn features_found_only_at_exact_coordinate() {
        let names: Arc<[String]> = vec!["vacancy_months".to_string()].into();
        let mut table = TableFeatures::new();
        table.insert(here(), FeatureVector::new(names, vec![14.0]).unwrap());
        assert_eq!(table.features(&here()).unwrap().values(), &[14.0]);
        assert!(table.features(&here().offset_m(5.0, 0.0)).is_err());
    }

    #[test]
    fn cloudy_scene_is_unavailable() {
        let mut table = EvidenceTable::new().with_max_cloud_percent(50.0);
        table.insert(
            here(),
            EvidenceRow {
                satellite: Some(SatelliteEvidence {
                    vegetation_index: 0.7,
                    structural_change: 0.4,
                }),
                street: Some(StreetEvidence { boarding_score: 0.8 }),
                cloud_cover_percent: Some(85.0),
            },
        );
        assert_eq!(
            table.satellite_evidence(&here()),
            Err(EvidenceUnavailable::CloudCover { percent: 85.0 })
        );
        assert_eq!(table.street_evidence(&here()).unwrap().boarding_score, 0.8);
    }

    #[test]
    fn unknown_location_has_no_coverage() {
        let table = EvidenceTable::default();
        assert_eq!(table.satellite_evidence(&here()), Err(EvidenceUnavailable::NoCoverage));
        assert_eq!(table.street_evidence(&here()), Err(EvidenceUnavailable::NoCoverage));
    }
}
