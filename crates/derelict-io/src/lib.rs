//! File boundary for derelict: CSV inputs, table-backed feature and evidence
//! providers, and JSON artifacts for training runs and score batches.

mod domain;
mod error;
mod provider;
mod reader;
mod writer;

pub use domain::{ExperimentName, LocationTable};
pub use error::IoError;
pub use provider::{DEFAULT_MAX_CLOUD_PERCENT, EvidenceRow, EvidenceTable, TableFeatures};
pub use reader::{ConfirmedReader, EvidenceReader, LocationReader, SampleReader};
pub use writer::{ResultWriter, TrainingArtifact, forest_path, read_training};
