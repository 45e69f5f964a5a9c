//! I/O error types for derelict-io.

use std::path::PathBuf;

use derelict_ensemble::EnsembleError;
use derelict_spatial::SpatialError;

/// Errors from file I/O, CSV parsing and result serialization.
#[derive(Debug, thiserror::Error)]
pub enum IoError {
    /// Returned when the input file does not exist or is unreadable.
    #[error("file not found: {path}")]
    FileNotFound {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Returned when the CSV parser encounters a malformed record.
    #[error("CSV parse error in {path} at byte offset {offset}")]
    CsvParse {
        /// Path to the CSV file.
        path: PathBuf,
        /// Byte offset where the error occurred.
        offset: u64,
        /// Underlying CSV error.
        source: csv::Error,
    },

    /// Returned when the CSV file contains a header but zero data rows.
    #[error("empty dataset (no data rows) in {path}")]
    EmptyDataset {
        /// Path to the CSV file.
        path: PathBuf,
    },

    /// Returned when a required column is absent from the header.
    #[error("{path} has no '{column}' column")]
    MissingColumn {
        /// Path to the CSV file.
        path: PathBuf,
        /// The required column name.
        column: &'static str,
    },

    /// Returned when a sample file has no columns besides id, coordinates and label.
    #[error("no feature columns in {path}")]
    NoFeatureColumns {
        /// Path to the CSV file.
        path: PathBuf,
    },

    /// Returned when a data row has a different number of columns than the header.
    #[error("inconsistent row length in {path}: row {row_index} has {got} columns, expected {expected}")]
    InconsistentRowLength {
        /// Path to the CSV file.
        path: PathBuf,
        /// Zero-based row index (excluding header).
        row_index: usize,
        /// Expected number of columns (from header).
        expected: usize,
        /// Actual number of columns in this row.
        got: usize,
    },

    /// Returned when a cell value is NaN, Inf, or otherwise not a finite float.
    #[error("non-finite value in {path}: row {row_index}, column '{column}', raw value \"{raw}\"")]
    NonFiniteValue {
        /// Path to the CSV file.
        path: PathBuf,
        /// Zero-based row index (excluding header).
        row_index: usize,
        /// Header name of the column.
        column: String,
        /// The raw string value that failed to parse.
        raw: String,
    },

    /// Returned when a label cell is not one of `0`, `1`, `true`, `false`.
    #[error("invalid label in {path}: row {row_index}, raw value \"{raw}\"")]
    InvalidLabel {
        /// Path to the CSV file.
        path: PathBuf,
        /// Zero-based row index (excluding header).
        row_index: usize,
        /// The raw label.
        raw: String,
    },

    /// Returned when a latitude/longitude pair is out of range.
    #[error("invalid coordinate in {path}: row {row_index}")]
    InvalidCoordinate {
        /// Path to the CSV file.
        path: PathBuf,
        /// Zero-based row index (excluding header).
        row_index: usize,
        /// Underlying range error.
        source: SpatialError,
    },

    /// Returned when the same id appears more than once.
    #[error("duplicate id \"{id}\" in {path}: first at row {first_row}, again at row {second_row}")]
    DuplicateId {
        /// Path to the CSV file.
        path: PathBuf,
        /// The duplicated id.
        id: String,
        /// Zero-based row index of the first occurrence.
        first_row: usize,
        /// Zero-based row index of the second occurrence.
        second_row: usize,
    },

    /// Returned when the experiment name contains characters outside `[a-zA-Z0-9_-]`.
    #[error("invalid experiment name \"{name}\": must match [a-zA-Z0-9_-]+")]
    InvalidExperimentName {
        /// The invalid name.
        name: String,
    },

    /// Returned when the output directory cannot be created.
    #[error("cannot create output directory {path}")]
    OutputDirCreate {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Returned when a result file cannot be written.
    #[error("cannot write file {path}")]
    WriteFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Returned when a JSON artifact cannot be encoded or decoded.
    #[error("invalid JSON in {path}")]
    Json {
        /// Path of the artifact.
        path: PathBuf,
        /// Underlying serde error.
        source: serde_json::Error,
    },

    /// Wraps feature-vector construction errors.
    #[error(transparent)]
    Ensemble(#[from] EnsembleError),
}
