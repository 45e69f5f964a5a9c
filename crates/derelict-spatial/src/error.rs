use crate::index::IndexVersion;
use crate::zone::ZoneId;

/// Errors from spatial geometry, zoning, the confirmed-point index and spatial scorers.
#[derive(Debug, thiserror::Error)]
pub enum SpatialError {
    /// Returned when a latitude or longitude is non-finite or out of range.
    #[error("invalid coordinate ({lat}, {lon})")]
    InvalidCoordinate {
        /// Latitude in decimal degrees.
        lat: f64,
        /// Longitude in decimal degrees.
        lon: f64,
    },

    /// Returned when a bounding box has min >= max on either axis.
    #[error("bounding box [{min_lat}, {max_lat}] x [{min_lon}, {max_lon}] is empty")]
    EmptyBoundingBox {
        min_lat: f64,
        max_lat: f64,
        min_lon: f64,
        max_lon: f64,
    },

    /// Returned when a length parameter (eps, bandwidth, cell size, buffer) is not positive and finite.
    #[error("{name} must be positive and finite, got {value}")]
    InvalidLength {
        /// Parameter name.
        name: &'static str,
        /// The rejected value in meters.
        value: f64,
    },

    /// Returned when DBSCAN min_samples is zero.
    #[error("min_samples must be at least 1, got {min_samples}")]
    InvalidMinSamples {
        /// The invalid min_samples value.
        min_samples: usize,
    },

    /// Returned when a heatmap resolution is zero.
    #[error("resolution must be at least 1, got {resolution}")]
    InvalidResolution {
        /// The invalid resolution.
        resolution: usize,
    },

    /// Returned when k is zero for k-means zoning.
    #[error("k must be at least 1, got {k}")]
    InvalidK {
        /// The invalid k value provided.
        k: usize,
    },

    /// Returned when fewer distinct points are supplied than the requested k.
    #[error("need at least {k} distinct points to form {k} zones, got {n_points}")]
    TooFewPoints {
        /// Number of distinct points provided.
        n_points: usize,
        /// Requested number of zones.
        k: usize,
    },

    /// Returned when a zone polygon has fewer than three vertices.
    #[error("zone {zone} has {n_vertices} vertices, need at least 3")]
    DegeneratePolygon {
        /// Offending zone.
        zone: ZoneId,
        /// Number of vertices supplied.
        n_vertices: usize,
    },

    /// Returned when two zones share an id.
    #[error("zone id {zone} appears more than once")]
    DuplicateZone {
        /// The repeated id.
        zone: ZoneId,
    },

    /// Returned when a layout would contain no zones.
    #[error("zone layout is empty")]
    EmptyLayout,

    /// Returned when a zone id is not part of the layout.
    #[error("zone {zone} is not part of the layout")]
    UnknownZone {
        /// The unknown id.
        zone: ZoneId,
    },

    /// Returned when a reader bound to an older snapshot meets a model built for a newer one.
    #[error("spatial index snapshot {bound} is stale, current is {current}")]
    IndexStale {
        /// Version the caller is bound to.
        bound: IndexVersion,
        /// Newer version already published.
        current: IndexVersion,
    },
}
