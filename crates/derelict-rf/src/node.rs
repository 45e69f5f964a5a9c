use std::fmt;

/// Zero-based feature column index.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
    serde::Serialize, serde::Deserialize,
)]
pub struct FeatureIndex(usize);

impl FeatureIndex {
    pub(crate) fn new(index: usize) -> Self {
        Self(index)
    }

    /// Return the zero-based feature column index.
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for FeatureIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of a node inside a tree's node arena.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
    serde::Serialize, serde::Deserialize,
)]
pub struct NodeIndex(usize);

impl NodeIndex {
    pub(crate) fn new(index: usize) -> Self {
        Self(index)
    }

    /// Return the zero-based arena index.
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Weighted node impurity (Gini or Entropy).
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, serde::Serialize, serde::Deserialize)]
pub struct Impurity(f64);

impl Impurity {
    pub(crate) fn new(value: f64) -> Self {
        Self(value)
    }

    /// Return the raw impurity value.
    #[must_use]
    pub fn value(self) -> f64 {
        self.0
    }
}

impl fmt::Display for Impurity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}", self.0)
    }
}

/// A node in a decision tree arena.
///
/// Every node, interior or leaf, records the class-weighted fraction of
/// positive (abandoned) samples that reached it. Interior values are what
/// make decision-path attribution possible: walking root to leaf, each split
/// credits its feature with the change in value between parent and child.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Node {
    /// An interior split node. Samples with `feature <= threshold` go left.
    Split {
        /// Feature used for the split.
        feature: FeatureIndex,
        /// Split threshold.
        threshold: f64,
        /// Left child.
        left: NodeIndex,
        /// Right child.
        right: NodeIndex,
        /// Weighted positive fraction at this node.
        value: f64,
        /// Impurity before splitting.
        impurity: Impurity,
        /// Number of (bootstrap) samples that reached this node.
        n_samples: usize,
        /// Weighted impurity decrease produced by this split.
        impurity_decrease: f64,
    },
    /// A terminal leaf.
    Leaf {
        /// Weighted positive fraction; the leaf's probability estimate.
        value: f64,
        /// Impurity at this leaf.
        impurity: Impurity,
        /// Number of (bootstrap) samples in this leaf.
        n_samples: usize,
    },
}

impl Node {
    /// Weighted positive fraction at this node.
    #[must_use]
    pub fn value(&self) -> f64 {
        match self {
            Node::Split { value, .. } | Node::Leaf { value, .. } => *value,
        }
    }

    /// Impurity at this node (before splitting for interior nodes).
    #[must_use]
    pub fn impurity(&self) -> Impurity {
        match self {
            Node::Split { impurity, .. } | Node::Leaf { impurity, .. } => *impurity,
        }
    }

    /// Number of training samples that reached this node.
    #[must_use]
    pub fn n_samples(&self) -> usize {
        match self {
            Node::Split { n_samples, .. } | Node::Leaf { n_samples, .. } => *n_samples,
        }
    }

    /// Return `true` if this node is a leaf.
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::{FeatureIndex, Impurity, Node, NodeIndex};

    #[test]
    fn index_newtypes_display_inner_value() {
        assert_eq!(format!("{}", FeatureIndex::new(3)), "3");
        assert_eq!(format!("{}", NodeIndex::new(0)), "0");
        assert!(FeatureIndex::new(1) < FeatureIndex::new(5));
    }

    #[test]
    fn impurity_display_six_decimals() {
        assert_eq!(format!("{}", Impurity::new(0.25)), "0.250000");
    }

    #[test]
    fn node_accessors() {
        let leaf = Node::Leaf {
            value: 0.8,
            impurity: Impurity::new(0.32),
            n_samples: 10,
        };
        let split = Node::Split {
            feature: FeatureIndex::new(2),
            threshold: 3.5,
            left: NodeIndex::new(1),
            right: NodeIndex::new(2),
            value: 0.4,
            impurity: Impurity::new(0.48),
            n_samples: 20,
            impurity_decrease: 0.16,
        };
        assert!(leaf.is_leaf());
        assert!(!split.is_leaf());
        assert_eq!(split.n_samples(), 20);
        assert!((leaf.value() - 0.8).abs() < f64::EPSILON);
        assert!((split.impurity().value() - 0.48).abs() < f64::EPSILON);
    }
}
