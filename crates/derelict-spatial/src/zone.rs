//! Study-area partitions used for spatial blocking and zone-relative scoring.

use std::collections::HashSet;
use std::fmt;

use tracing::{debug, instrument};

use crate::error::SpatialError;
use crate::geo::{BoundingBox, GeoPoint, LocalFrame, PlanarPoint};
use crate::polygon::Polygon;

/// Identifier of a zone within a layout.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
    serde::Serialize, serde::Deserialize,
)]
pub struct ZoneId(u32);

impl ZoneId {
    #[must_use]
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "z{}", self.0)
    }
}

/// One partition of the study area.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SpatialZone {
    pub id: ZoneId,
    /// Boundary ring in WGS84; the closing edge is implicit.
    pub boundary: Vec<GeoPoint>,
}

/// A set of zones sharing one local metric frame.
///
/// Zones are expected not to overlap; a point on a shared edge is assigned to
/// the first zone in layout order that contains it.
#[derive(Debug, Clone)]
pub struct ZoneLayout {
    frame: LocalFrame,
    zones: Vec<SpatialZone>,
    polygons: Vec<Polygon>,
}

impl ZoneLayout {
    /// Build a layout from explicit polygons.
    ///
    /// # Errors
    ///
    /// | Variant | Condition |
    /// |---|---|
    /// | [`SpatialError::EmptyLayout`] | `zones` is empty |
    /// | [`SpatialError::DegeneratePolygon`] | a ring has fewer than 3 vertices |
    /// | [`SpatialError::DuplicateZone`] | two zones share an id |
    /// | [`SpatialError::InvalidCoordinate`] | a vertex is out of range |
    pub fn from_zones(zones: Vec<SpatialZone>) -> Result<Self, SpatialError> {
        if zones.is_empty() {
            return Err(SpatialError::EmptyLayout);
        }
        let mut seen = HashSet::new();
        for zone in &zones {
            if !seen.insert(zone.id) {
                return Err(SpatialError::DuplicateZone { zone: zone.id });
            }
            if zone.boundary.len() < 3 {
                return Err(SpatialError::DegeneratePolygon {
                    zone: zone.id,
                    n_vertices: zone.boundary.len(),
                });
            }
            for vertex in &zone.boundary {
                GeoPoint::new(vertex.lat, vertex.lon)?;
            }
        }
        let all: Vec<GeoPoint> = zones.iter().flat_map(|z| z.boundary.iter().copied()).collect();
        let origin = BoundingBox::enclosing(&all, 0.0).map_or(all[0], |b| b.center());
        let frame = LocalFrame::new(origin);
        let polygons = zones
            .iter()
            .map(|z| Polygon::new(z.boundary.iter().map(|p| frame.project(p)).collect()))
            .collect();
        Ok(Self {
            frame,
            zones,
            polygons,
        })
    }

    /// Tile `bbox` with square cells of `cell_m` meters, row-major from the south-west.
    ///
    /// Edge cells are truncated to the box.
    ///
    /// # Errors
    ///
    /// Returns [`SpatialError::InvalidLength`] if `cell_m` is not positive and finite.
    #[instrument(skip(bbox))]
    pub fn grid(bbox: &BoundingBox, cell_m: f64) -> Result<Self, SpatialError> {
        if !(cell_m.is_finite() && cell_m > 0.0) {
            return Err(SpatialError::InvalidLength {
                name: "cell_m",
                value: cell_m,
            });
        }
        let frame = LocalFrame::new(bbox.center());
        let [sw, _, ne, _] = bbox.corners().map(|c| frame.project(&c));
        // Tolerate rounding so an exact multiple does not spawn a sliver row.
        let n_cols = (((ne.x - sw.x) / cell_m - 1e-6).ceil() as usize).max(1);
        let n_rows = (((ne.y - sw.y) / cell_m - 1e-6).ceil() as usize).max(1);

        let mut zones = Vec::with_capacity(n_rows * n_cols);
        let mut polygons = Vec::with_capacity(n_rows * n_cols);
        for row in 0..n_rows {
            for col in 0..n_cols {
                let x0 = sw.x + col as f64 * cell_m;
                let y0 = sw.y + row as f64 * cell_m;
                let x1 = (x0 + cell_m).min(ne.x);
                let y1 = (y0 + cell_m).min(ne.y);
                let ring = vec![
                    PlanarPoint::new(x0, y0),
                    PlanarPoint::new(x1, y0),
                    PlanarPoint::new(x1, y1),
                    PlanarPoint::new(x0, y1),
                ];
                zones.push(SpatialZone {
                    id: ZoneId::new((row * n_cols + col) as u32),
                    boundary: ring.iter().map(|p| frame.unproject(p)).collect(),
                });
                polygons.push(Polygon::new(ring));
            }
        }
        debug!(n_rows, n_cols, "grid layout built");
        Ok(Self {
            frame,
            zones,
            polygons,
        })
    }

    /// Derive `k` blocks by k-means over `points`.
    ///
    /// Each block is the Voronoi cell of its centroid clipped to the points'
    /// bounding box padded by `margin_m`, so every input point falls in a block.
    ///
    /// # Errors
    ///
    /// | Variant | Condition |
    /// |---|---|
    /// | [`SpatialError::InvalidK`] | `k == 0` |
    /// | [`SpatialError::TooFewPoints`] | fewer than `k` distinct points |
    #[instrument(skip(points), fields(n = points.len()))]
    pub fn kmeans(points: &[GeoPoint], k: usize, seed: u64, margin_m: f64) -> Result<Self, SpatialError> {
        let bbox = BoundingBox::enclosing(points, margin_m.max(1.0))
            .ok_or(SpatialError::TooFewPoints { n_points: 0, k })?;
        let frame = LocalFrame::new(bbox.center());
        let planar: Vec<PlanarPoint> = points.iter().map(|p| frame.project(p)).collect();
        let centroids = crate::kmeans::kmeans(&planar, k, seed)?;
        let outer = Polygon::new(bbox.corners().iter().map(|c| frame.project(c)).collect());

        let mut zones = Vec::with_capacity(k);
        let mut polygons = Vec::with_capacity(k);
        for (i, ci) in centroids.iter().enumerate() {
            let mut cell = outer.clone();
            for (j, cj) in centroids.iter().enumerate() {
                if i == j {
                    continue;
                }
                // |x - ci|² <= |x - cj|²  <=>  (cj - ci)·x <= (|cj|² - |ci|²) / 2
                let normal = PlanarPoint::new(cj.x - ci.x, cj.y - ci.y);
                if normal.squared_norm() == 0.0 {
                    continue;
                }
                cell = cell.clip_half_plane(normal, (cj.squared_norm() - ci.squared_norm()) / 2.0);
            }
            if cell.vertices().len() < 3 {
                continue;
            }
            zones.push(SpatialZone {
                id: ZoneId::new(i as u32),
                boundary: cell.vertices().iter().map(|p| frame.unproject(p)).collect(),
            });
            polygons.push(cell);
        }
        debug!(n_zones = zones.len(), "k-means layout built");
        Ok(Self {
            frame,
            zones,
            polygons,
        })
    }

    #[must_use]
    pub fn zones(&self) -> &[SpatialZone] {
        &self.zones
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.zones.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    #[must_use]
    pub fn frame(&self) -> &LocalFrame {
        &self.frame
    }

    fn position(&self, zone: ZoneId) -> Result<usize, SpatialError> {
        self.zones
            .iter()
            .position(|z| z.id == zone)
            .ok_or(SpatialError::UnknownZone { zone })
    }

    /// The planar polygon of `zone` in this layout's frame.
    ///
    /// # Errors
    ///
    /// Returns [`SpatialError::UnknownZone`] for an id outside the layout.
    pub fn polygon(&self, zone: ZoneId) -> Result<&Polygon, SpatialError> {
        Ok(&self.polygons[self.position(zone)?])
    }

    /// The zone containing `point`, if any.
    #[must_use]
    pub fn zone_of(&self, point: &GeoPoint) -> Option<ZoneId> {
        let p = self.frame.project(point);
        self.polygons
            .iter()
            .position(|poly| poly.contains(&p))
            .map(|i| self.zones[i].id)
    }

    /// Distance in meters from `point` to the boundary of `zone`.
    ///
    /// # Errors
    ///
    /// Returns [`SpatialError::UnknownZone`] for an id outside the layout.
    pub fn distance_to_boundary_m(&self, point: &GeoPoint, zone: ZoneId) -> Result<f64, SpatialError> {
        let poly = self.polygon(zone)?;
        Ok(poly.distance_to_boundary(&self.frame.project(point)))
    }

    /// Whether `point` lies inside `zone`.
    ///
    /// # Errors
    ///
    /// Returns [`SpatialError::UnknownZone`] for an id outside the layout.
    pub fn contains(&self, zone: ZoneId, point: &GeoPoint) -> Result<bool, SpatialError> {
        Ok(self.polygon(zone)?.contains(&self.frame.project(point)))
    }
}

#[cfg(test)]
mod tests {
    use super::{SpatialZone, ZoneId, ZoneLayout};
    use crate::geo::{BoundingBox, GeoPoint};

    fn origin() -> GeoPoint {
        GeoPoint::new(42.0, -83.0).unwrap()
    }

    fn box_km(km: f64) -> BoundingBox {
        let ne = origin().offset_m(km * 1000.0, km * 1000.0);
        BoundingBox::new(origin().lat, origin().lon, ne.lat, ne.lon).unwrap()
    }

    #[test]
    fn grid_tiles_box() {
        let layout = ZoneLayout::grid(&box_km(2.0), 500.0).unwrap();
        assert_eq!(layout.len(), 16);
        let p = origin().offset_m(750.0, 250.0);
        assert_eq!(layout.zone_of(&p), Some(ZoneId::new(4)));
    }

    #[test]
    fn boundary_distance_inside_cell() {
        let layout = ZoneLayout::grid(&box_km(1.0), 1000.0).unwrap();
        let p = origin().offset_m(100.0, 500.0);
        let d = layout.distance_to_boundary_m(&p, ZoneId::new(0)).unwrap();
        assert!((d - 100.0).abs() < 1.0, "d = {d}");
    }

    #[test]
    fn outside_point_has_no_zone() {
        let layout = ZoneLayout::grid(&box_km(1.0), 500.0).unwrap();
        assert_eq!(layout.zone_of(&origin().offset_m(-50.0, -50.0)), None);
    }

    #[test]
    fn kmeans_blocks_cover_every_point() {
        let mut pts = Vec::new();
        for &(n, e) in &[(0.0, 0.0), (3000.0, 0.0), (0.0, 3000.0), (3000.0, 3000.0)] {
            for i in 0..6 {
                pts.push(origin().offset_m(n + 40.0 * i as f64, e + 25.0 * i as f64));
            }
        }
        let layout = ZoneLayout::kmeans(&pts, 4, 42, 100.0).unwrap();
        assert_eq!(layout.len(), 4);
        assert!(pts.iter().all(|p| layout.zone_of(p).is_some()));
        let first = layout.zone_of(&pts[0]);
        assert!(pts[..6].iter().all(|p| layout.zone_of(p) == first));
    }

    #[test]
    fn explicit_zones_validated() {
        let tri = SpatialZone {
            id: ZoneId::new(1),
            boundary: vec![origin(), origin().offset_m(0.0, 100.0), origin().offset_m(100.0, 0.0)],
        };
        assert!(ZoneLayout::from_zones(vec![tri.clone(), tri.clone()]).is_err());
        let bad = SpatialZone {
            id: ZoneId::new(2),
            boundary: vec![origin()],
        };
        assert!(ZoneLayout::from_zones(vec![bad]).is_err());
        assert!(ZoneLayout::from_zones(vec![]).is_err());
        let layout = ZoneLayout::from_zones(vec![tri]).unwrap();
        assert_eq!(layout.zone_of(&origin().offset_m(20.0, 20.0)), Some(ZoneId::new(1)));
    }
}
