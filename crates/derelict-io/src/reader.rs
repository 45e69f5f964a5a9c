//! CSV readers with full input validation.
//!
//! Columns are located by header name, case-insensitively, so their order is
//! free. Every reader rejects jagged rows, non-finite numbers and out-of-range
//! coordinates, and reports the offending row.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use derelict_ensemble::{FeatureVector, LabeledSample, LocationRequest, SatelliteEvidence, StreetEvidence};
use derelict_spatial::{ConfirmedPoint, GeoPoint};
use tracing::{debug, info, instrument};

use crate::IoError;
use crate::domain::LocationTable;
use crate::provider::{EvidenceRow, EvidenceTable, TableFeatures};

const ID: &str = "id";
const LAT: &str = "lat";
const LON: &str = "lon";
const LABEL_COLUMNS: [&str; 2] = ["abandoned", "label"];

/// A fully read CSV file: header plus rows of equal length.
struct CsvTable {
    path: PathBuf,
    header: Vec<String>,
    rows: Vec<csv::StringRecord>,
}

impl CsvTable {
    fn read(path: &Path) -> Result<Self, IoError> {
        let file = std::fs::File::open(path).map_err(|e| IoError::FileNotFound {
            path: path.to_path_buf(),
            source: e,
        })?;

        // flexible(true) lets the length check below report the row instead of a bare CsvParse.
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(file);

        let header: Vec<String> = rdr
            .headers()
            .map_err(|e| csv_error(path, e))?
            .iter()
            .map(str::to_string)
            .collect();
        debug!(n_columns = header.len(), "read CSV header");

        let mut rows = Vec::new();
        for (row_index, record) in rdr.records().enumerate() {
            let record = record.map_err(|e| csv_error(path, e))?;
            if record.len() != header.len() {
                return Err(IoError::InconsistentRowLength {
                    path: path.to_path_buf(),
                    row_index,
                    expected: header.len(),
                    got: record.len(),
                });
            }
            rows.push(record);
        }
        if rows.is_empty() {
            return Err(IoError::EmptyDataset {
                path: path.to_path_buf(),
            });
        }
        Ok(Self {
            path: path.to_path_buf(),
            header,
            rows,
        })
    }

    fn find(&self, name: &str) -> Option<usize> {
        self.header.iter().position(|h| h.eq_ignore_ascii_case(name))
    }

    fn require(&self, name: &'static str) -> Result<usize, IoError> {
        self.find(name).ok_or_else(|| IoError::MissingColumn {
            path: self.path.clone(),
            column: name,
        })
    }

    fn cell<'r>(&self, row: &'r csv::StringRecord, col: usize) -> &'r str {
        row.get(col).unwrap_or("")
    }

    fn float(&self, row_index: usize, col: usize) -> Result<f64, IoError> {
        let raw = self.cell(&self.rows[row_index], col);
        match raw.parse::<f64>() {
            Ok(value) if value.is_finite() => Ok(value),
            _ => Err(IoError::NonFiniteValue {
                path: self.path.clone(),
                row_index,
                column: self.header[col].clone(),
                raw: raw.to_string(),
            }),
        }
    }

    /// `None` for an empty cell.
    fn optional_float(&self, row_index: usize, col: Option<usize>) -> Result<Option<f64>, IoError> {
        match col {
            Some(col) if !self.cell(&self.rows[row_index], col).is_empty() => self.float(row_index, col).map(Some),
            _ => Ok(None),
        }
    }

    fn location(&self, row_index: usize, lat: usize, lon: usize) -> Result<GeoPoint, IoError> {
        GeoPoint::new(self.float(row_index, lat)?, self.float(row_index, lon)?).map_err(|e| {
            IoError::InvalidCoordinate {
                path: self.path.clone(),
                row_index,
                source: e,
            }
        })
    }

    /// Ids in `col`, rejecting repeats.
    fn unique_ids(&self, col: usize) -> Result<Vec<String>, IoError> {
        let mut seen: HashMap<&str, usize> = HashMap::new();
        let mut ids = Vec::with_capacity(self.rows.len());
        for (row_index, row) in self.rows.iter().enumerate() {
            let id = self.cell(row, col);
            if let Some(&first_row) = seen.get(id) {
                return Err(IoError::DuplicateId {
                    path: self.path.clone(),
                    id: id.to_string(),
                    first_row,
                    second_row: row_index,
                });
            }
            seen.insert(id, row_index);
            ids.push(id.to_string());
        }
        Ok(ids)
    }

    fn features(&self, row_index: usize, names: &Arc<[String]>, cols: &[usize]) -> Result<FeatureVector, IoError> {
        let values = cols
            .iter()
            .map(|&col| self.float(row_index, col))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(FeatureVector::new(Arc::clone(names), values)?)
    }
}

fn csv_error(path: &Path, e: csv::Error) -> IoError {
    IoError::CsvParse {
        path: path.to_path_buf(),
        offset: e.position().map_or(0, csv::Position::byte),
        source: e,
    }
}

/// Every column not in `reserved`, in header order.
fn feature_columns(header: &[String], reserved: &[usize]) -> (Arc<[String]>, Vec<usize>) {
    let cols: Vec<usize> = (0..header.len()).filter(|c| !reserved.contains(c)).collect();
    let names: Arc<[String]> = cols.iter().map(|&c| header[c].clone()).collect::<Vec<_>>().into();
    (names, cols)
}

/// Reads labeled training samples.
///
/// Expected CSV format: `id,lat,lon,abandoned,<feature>...` in any column
/// order. The label column may be named `abandoned` or `label` and holds
/// `0`/`1` or `true`/`false`. Every other column is a feature.
///
/// # Errors
///
/// | Variant | Condition |
/// |---|---|
/// | [`IoError::FileNotFound`] | File doesn't exist or is unreadable |
/// | [`IoError::CsvParse`] | Malformed CSV record |
/// | [`IoError::EmptyDataset`] | Zero data rows after header |
/// | [`IoError::MissingColumn`] | No id, lat, lon or label column |
/// | [`IoError::NoFeatureColumns`] | Nothing left after the reserved columns |
/// | [`IoError::InconsistentRowLength`] | Row has different column count than header |
/// | [`IoError::NonFiniteValue`] | Cell is NaN, Inf, or unparseable float |
/// | [`IoError::InvalidLabel`] | Label is not a recognised boolean |
/// | [`IoError::InvalidCoordinate`] | Latitude or longitude out of range |
/// | [`IoError::DuplicateId`] | Same id appears twice |
pub struct SampleReader {
    path: PathBuf,
}

impl SampleReader {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub fn read(&self) -> Result<Vec<LabeledSample>, IoError> {
        let table = CsvTable::read(&self.path)?;
        let id = table.require(ID)?;
        let lat = table.require(LAT)?;
        let lon = table.require(LON)?;
        let label = LABEL_COLUMNS
            .iter()
            .find_map(|name| table.find(name))
            .ok_or_else(|| IoError::MissingColumn {
                path: self.path.clone(),
                column: LABEL_COLUMNS[0],
            })?;
        let (names, cols) = feature_columns(&table.header, &[id, lat, lon, label]);
        if cols.is_empty() {
            return Err(IoError::NoFeatureColumns {
                path: self.path.clone(),
            });
        }

        let ids = table.unique_ids(id)?;
        let mut samples = Vec::with_capacity(ids.len());
        for (row_index, id) in ids.into_iter().enumerate() {
            let raw = table.cell(&table.rows[row_index], label);
            let abandoned = parse_label(raw).ok_or_else(|| IoError::InvalidLabel {
                path: self.path.clone(),
                row_index,
                raw: raw.to_string(),
            })?;
            samples.push(LabeledSample {
                id,
                location: table.location(row_index, lat, lon)?,
                features: table.features(row_index, &names, &cols)?,
                abandoned,
            });
        }

        info!(
            n_samples = samples.len(),
            n_features = names.len(),
            n_abandoned = samples.iter().filter(|s| s.abandoned).count(),
            "samples loaded"
        );
        Ok(samples)
    }
}

fn parse_label(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" => Some(true),
        "0" | "false" => Some(false),
        _ => None,
    }
}

/// Reads locations to score: `id,lat,lon[,<feature>...]`.
///
/// Feature columns, when present, back a [`TableFeatures`] provider.
///
/// # Errors
///
/// As [`SampleReader`], without the label and feature-column checks.
pub struct LocationReader {
    path: PathBuf,
}

impl LocationReader {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub fn read(&self) -> Result<LocationTable, IoError> {
        let table = CsvTable::read(&self.path)?;
        let id = table.require(ID)?;
        let lat = table.require(LAT)?;
        let lon = table.require(LON)?;
        let (names, cols) = feature_columns(&table.header, &[id, lat, lon]);

        let ids = table.unique_ids(id)?;
        let mut requests = Vec::with_capacity(ids.len());
        let mut features = TableFeatures::new();
        for (row_index, id) in ids.into_iter().enumerate() {
            let location = table.location(row_index, lat, lon)?;
            if !cols.is_empty() {
                features.insert(location, table.features(row_index, &names, &cols)?);
            }
            requests.push(LocationRequest { id, location });
        }

        info!(n_locations = requests.len(), n_features = names.len(), "locations loaded");
        Ok(LocationTable { requests, features })
    }
}

/// Reads confirmed-abandoned points: `lat,lon[,confirmed_at]`.
///
/// `confirmed_at` is a Unix timestamp; when the column is absent rows are
/// stamped with their position so file order is kept.
///
/// # Errors
///
/// | Variant | Condition |
/// |---|---|
/// | [`IoError::FileNotFound`] | File doesn't exist or is unreadable |
/// | [`IoError::EmptyDataset`] | Zero data rows after header |
/// | [`IoError::MissingColumn`] | No lat or lon column |
/// | [`IoError::NonFiniteValue`] | Bad coordinate or timestamp |
/// | [`IoError::InvalidCoordinate`] | Latitude or longitude out of range |
pub struct ConfirmedReader {
    path: PathBuf,
}

impl ConfirmedReader {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub fn read(&self) -> Result<Vec<ConfirmedPoint>, IoError> {
        let table = CsvTable::read(&self.path)?;
        let lat = table.require(LAT)?;
        let lon = table.require(LON)?;
        let stamp = table.find("confirmed_at");

        let mut points = Vec::with_capacity(table.rows.len());
        for row_index in 0..table.rows.len() {
            let confirmed_at = match stamp {
                Some(col) => {
                    let raw = table.cell(&table.rows[row_index], col);
                    raw.parse::<i64>().map_err(|_| IoError::NonFiniteValue {
                        path: self.path.clone(),
                        row_index,
                        column: table.header[col].clone(),
                        raw: raw.to_string(),
                    })?
                }
                None => i64::try_from(row_index).unwrap_or(i64::MAX),
            };
            points.push(ConfirmedPoint {
                location: table.location(row_index, lat, lon)?,
                confirmed_at,
            });
        }

        info!(n_points = points.len(), "confirmed points loaded");
        Ok(points)
    }
}

/// Reads offline imagery results:
/// `lat,lon[,vegetation_index,structural_change][,boarding_score][,cloud_cover]`.
///
/// Empty cells mean the evidence is missing for that location. Satellite
/// evidence needs both its columns filled.
///
/// # Errors
///
/// Same as [`ConfirmedReader`].
pub struct EvidenceReader {
    path: PathBuf,
}

impl EvidenceReader {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub fn read(&self) -> Result<EvidenceTable, IoError> {
        let table = CsvTable::read(&self.path)?;
        let lat = table.require(LAT)?;
        let lon = table.require(LON)?;
        let ndvi = table.find("vegetation_index");
        let structural = table.find("structural_change");
        let boarding = table.find("boarding_score");
        let cloud = table.find("cloud_cover");

        let mut evidence = EvidenceTable::new();
        for row_index in 0..table.rows.len() {
            let satellite = match (
                table.optional_float(row_index, ndvi)?,
                table.optional_float(row_index, structural)?,
            ) {
                (Some(vegetation_index), Some(structural_change)) => Some(SatelliteEvidence {
                    vegetation_index,
                    structural_change,
                }),
                _ => None,
            };
            let street = table
                .optional_float(row_index, boarding)?
                .map(|boarding_score| StreetEvidence { boarding_score });
            evidence.insert(
                table.location(row_index, lat, lon)?,
                EvidenceRow {
                    satellite,
                    street,
                    cloud_cover_percent: table.optional_float(row_index, cloud)?,
                },
            );
        }

        info!(n_rows = evidence.len(), "evidence table loaded");
        Ok(evidence)
    }
}
