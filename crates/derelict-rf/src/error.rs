use std::path::PathBuf;

/// Errors from forest training, prediction and model files.
#[derive(Debug, thiserror::Error)]
pub enum RfError {
    /// A forest needs at least one tree.
    #[error("forest needs at least one tree, got n_trees = {n_trees}")]
    InvalidTreeCount {
        /// Requested tree count.
        n_trees: usize,
    },

    /// `max_depth` was `Some(0)`.
    #[error("max_depth = {max_depth} leaves no room for a split")]
    InvalidMaxDepth {
        /// Requested depth.
        max_depth: usize,
    },

    /// A split needs at least two samples.
    #[error("min_samples_split = {min_samples_split} is below 2")]
    InvalidMinSamplesSplit {
        /// Requested minimum.
        min_samples_split: usize,
    },

    /// Leaves must hold at least one sample.
    #[error("min_samples_leaf = {min_samples_leaf} is below 1")]
    InvalidMinSamplesLeaf {
        /// Requested minimum.
        min_samples_leaf: usize,
    },

    /// `max_features` resolved outside `[1, n_features]`.
    #[error("max_features resolved to {max_features} for {n_features} features")]
    InvalidMaxFeatures {
        /// Resolved candidate count per split.
        max_features: usize,
        /// Feature columns in the training matrix.
        n_features: usize,
    },

    /// Bootstrap fraction outside `(0, 1]`.
    #[error("bootstrap_fraction {fraction} is outside (0, 1]")]
    InvalidBootstrapFraction {
        /// Requested fraction.
        fraction: f64,
    },

    #[error("no training samples")]
    EmptyDataset,

    #[error("training matrix has no feature columns")]
    ZeroFeatures,

    /// Labels and rows disagree in length.
    #[error("{n_labels} labels for {n_samples} training rows")]
    LabelCountMismatch {
        n_samples: usize,
        n_labels: usize,
    },

    /// A training row is wider or narrower than the first.
    #[error("training row {sample_index} has {got} features, expected {expected}")]
    FeatureCountMismatch {
        expected: usize,
        got: usize,
        sample_index: usize,
    },

    /// The schema does not name every column exactly once.
    #[error("{n_names} feature names for {n_features} columns")]
    FeatureNameMismatch {
        n_features: usize,
        n_names: usize,
    },

    /// A scoring input does not match the trained schema width.
    #[error("scoring input has {got} features, forest was trained on {expected}")]
    PredictionFeatureMismatch {
        expected: usize,
        got: usize,
    },

    /// NaN or infinity in training or scoring input.
    #[error("non-finite value in row {sample_index}, column {feature_index}")]
    NonFiniteValue {
        sample_index: usize,
        feature_index: usize,
    },

    #[error("could not encode forest")]
    SerializeModel {
        source: Box<bincode::ErrorKind>,
    },

    #[error("could not decode forest from {path}")]
    DeserializeModel {
        path: PathBuf,
        source: Box<bincode::ErrorKind>,
    },

    #[error("could not write forest to {path}")]
    WriteModel {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("could not read forest from {path}")]
    ReadModel {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The file was written by an incompatible build.
    #[error("forest file {path} has format version {found}, this build reads {expected}")]
    IncompatibleModelVersion {
        expected: u32,
        found: u32,
        path: PathBuf,
    },
}
