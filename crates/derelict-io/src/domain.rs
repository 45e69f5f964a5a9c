//! Domain types for derelict-io.

use derelict_ensemble::LocationRequest;

use crate::IoError;
use crate::provider::TableFeatures;

/// A validated experiment name for output file naming.
///
/// Must match `[a-zA-Z0-9_-]+`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentName(String);

impl ExperimentName {
    /// Parse and validate an experiment name.
    ///
    /// # Errors
    ///
    /// Returns [`IoError::InvalidExperimentName`] if the name is empty or
    /// contains characters outside `[a-zA-Z0-9_-]`.
    pub fn new(name: String) -> Result<Self, IoError> {
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return Err(IoError::InvalidExperimentName { name });
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ExperimentName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Locations to score, with whatever feature columns the file carried.
///
/// `features` is empty when the file has only id and coordinates.
#[derive(Debug)]
pub struct LocationTable {
    pub requests: Vec<LocationRequest>,
    pub features: TableFeatures,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn experiment_name_valid() {
        let name = ExperimentName::new("detroit-2024_q3".to_string());
        assert_eq!(name.unwrap().as_str(), "detroit-2024_q3");
    }

    #[test]
    fn experiment_name_rejects_empty() {
        let name = ExperimentName::new(String::new());
        assert!(matches!(name, Err(IoError::InvalidExperimentName { .. })));
    }

    #[test]
    fn experiment_name_rejects_path_separators() {
        let name = ExperimentName::new("../escape".to_string());
        assert!(matches!(name, Err(IoError::InvalidExperimentName { .. })));
    }
}
