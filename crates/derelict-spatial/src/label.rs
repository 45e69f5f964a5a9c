use std::fmt;

/// A DBSCAN cluster label. Wraps a zero-based cluster index; noise has no label.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
    serde::Serialize, serde::Deserialize,
)]
pub struct ClusterLabel(usize);

impl ClusterLabel {
    pub(crate) fn new(index: usize) -> Self {
        Self(index)
    }

    /// Return the zero-based cluster index.
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ClusterLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::ClusterLabel;

    #[test]
    fn display_prefixes_index() {
        assert_eq!(format!("{}", ClusterLabel::new(3)), "c3");
    }

    #[test]
    fn ordering_follows_index() {
        assert!(ClusterLabel::new(1) < ClusterLabel::new(5));
        assert_eq!(ClusterLabel::new(2).index(), 2);
    }
}
