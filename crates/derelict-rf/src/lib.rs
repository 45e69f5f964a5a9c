//! Binary Random Forest for tabular abandonment-risk features.
//!
//! A hand-rolled CART ensemble specialised for the two-class problem
//! (abandoned / not abandoned): weighted bootstrap training in parallel via
//! rayon, balanced class weighting, ranked impurity importances, per-prediction
//! decision-path attribution, and versioned model files.

mod config;
mod error;
mod forest;
mod importance;
mod node;
mod predict;
mod serialize;
mod split;
mod tree;

pub use config::{ClassWeighting, ForestConfig, MaxFeatures};
pub use error::RfError;
pub use forest::{Forest, ForestFit, TrainingSummary};
pub use importance::RankedFeature;
pub use node::{FeatureIndex, Impurity, Node, NodeIndex};
pub use predict::PathAttribution;
pub use split::SplitCriterion;
pub use tree::{DecisionTree, TreeConfig};
