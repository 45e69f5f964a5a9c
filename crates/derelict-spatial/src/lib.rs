//! Spatial primitives for abandonment-risk scoring.
//!
//! Geodesy and polygon geometry in a local metric frame, study-area zone
//! layouts (grid, explicit polygons, k-means blocks), a confirmed-point index
//! published as immutable versioned snapshots, a version-keyed cache for
//! models derived from a snapshot, and the two spatial scorers built on it:
//! DBSCAN neighbourhood clustering and a zone-normalised Gaussian KDE.

mod cache;
mod dbscan;
mod error;
mod geo;
mod index;
mod kde;
mod kmeans;
mod label;
mod polygon;
mod zone;

pub use cache::VersionedCache;
pub use dbscan::{ClusterModel, ClusterParams, ClusterSummary};
pub use error::SpatialError;
pub use geo::{BoundingBox, EARTH_RADIUS_M, GeoPoint, LocalFrame, PlanarPoint};
pub use index::{ConfirmedPoint, IndexSnapshot, IndexVersion, SpatialIndex};
pub use kde::{DensityModel, DensityParams, Heatmap};
pub use label::ClusterLabel;
pub use polygon::Polygon;
pub use zone::{SpatialZone, ZoneId, ZoneLayout};
