//! Feature vectors and labeled training samples.

use std::sync::Arc;

use derelict_spatial::GeoPoint;

use crate::error::EnsembleError;

/// Named numeric features for one location.
///
/// The column names are shared between every vector of a run, so cloning a
/// vector never copies its schema.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    names: Arc<[String]>,
    values: Vec<f64>,
}

impl FeatureVector {
    /// # Errors
    ///
    /// Returns [`EnsembleError::InputShape`] if `values` and `names` differ in length.
    pub fn new(names: Arc<[String]>, values: Vec<f64>) -> Result<Self, EnsembleError> {
        if names.len() != values.len() {
            return Err(EnsembleError::InputShape {
                expected: names.len(),
                got: values.len(),
            });
        }
        Ok(Self { names, values })
    }

    #[must_use]
    pub fn names(&self) -> &Arc<[String]> {
        &self.names
    }

    #[must_use]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value of the feature called `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<f64> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| self.values[i])
    }

    /// Check that this vector carries exactly `schema`, in order.
    ///
    /// # Errors
    ///
    /// | Variant | Condition |
    /// |---|---|
    /// | [`EnsembleError::InputShape`] | lengths differ |
    /// | [`EnsembleError::SchemaMismatch`] | a column name differs |
    pub fn check_schema(&self, schema: &[String]) -> Result<(), EnsembleError> {
        if self.values.len() != schema.len() {
            return Err(EnsembleError::InputShape {
                expected: schema.len(),
                got: self.values.len(),
            });
        }
        if let Some(position) = schema.iter().zip(self.names.iter()).position(|(a, b)| a != b) {
            return Err(EnsembleError::SchemaMismatch {
                position,
                expected: schema[position].clone(),
                got: self.names[position].clone(),
            });
        }
        Ok(())
    }
}

/// A feature vector with its coordinate and ground-truth label.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledSample {
    pub id: String,
    pub location: GeoPoint,
    pub features: FeatureVector,
    pub abandoned: bool,
}
