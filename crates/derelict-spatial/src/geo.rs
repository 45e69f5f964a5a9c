//! WGS84 coordinates, haversine distance and a local equirectangular frame.

use crate::error::SpatialError;

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Meters per degree of latitude on the mean sphere.
pub(crate) const METERS_PER_DEGREE: f64 = EARTH_RADIUS_M * std::f64::consts::PI / 180.0;

/// A WGS84 geographic coordinate in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    /// Create a point, rejecting non-finite or out-of-range coordinates.
    ///
    /// # Errors
    ///
    /// Returns [`SpatialError::InvalidCoordinate`] if `lat ∉ [-90, 90]` or `lon ∉ [-180, 180]`.
    pub fn new(lat: f64, lon: f64) -> Result<Self, SpatialError> {
        if !lat.is_finite() || !lon.is_finite() || lat.abs() > 90.0 || lon.abs() > 180.0 {
            return Err(SpatialError::InvalidCoordinate { lat, lon });
        }
        Ok(Self { lat, lon })
    }

    /// Great-circle distance to `other` in meters.
    #[must_use]
    pub fn haversine_m(&self, other: &GeoPoint) -> f64 {
        let d_lat = (other.lat - self.lat).to_radians();
        let d_lon = (other.lon - self.lon).to_radians();
        let a = (d_lat / 2.0).sin().powi(2)
            + self.lat.to_radians().cos() * other.lat.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_M * a.sqrt().min(1.0).asin()
    }

    /// The point `north_m` meters north and `east_m` meters east of this one.
    ///
    /// Uses the local tangent approximation, accurate to well under a meter
    /// for offsets of a few kilometers.
    #[must_use]
    pub fn offset_m(&self, north_m: f64, east_m: f64) -> GeoPoint {
        let cos_lat = self.lat.to_radians().cos().max(1e-12);
        GeoPoint {
            lat: self.lat + north_m / METERS_PER_DEGREE,
            lon: self.lon + east_m / (METERS_PER_DEGREE * cos_lat),
        }
    }
}

/// A point in a local metric frame: `x` east, `y` north, both in meters.
#[derive(Debug, Clone, Copy, PartialEq, Default, serde::Serialize, serde::Deserialize)]
pub struct PlanarPoint {
    pub x: f64,
    pub y: f64,
}

impl PlanarPoint {
    #[must_use]
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    #[must_use]
    pub fn distance(&self, other: &PlanarPoint) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }

    #[must_use]
    pub fn squared_norm(&self) -> f64 {
        self.x * self.x + self.y * self.y
    }
}

/// Equirectangular projection centred on an origin.
///
/// Distances are accurate at city scale, which is all zone geometry needs.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LocalFrame {
    origin: GeoPoint,
    cos_lat: f64,
}

impl LocalFrame {
    #[must_use]
    pub fn new(origin: GeoPoint) -> Self {
        Self {
            origin,
            cos_lat: origin.lat.to_radians().cos().max(1e-12),
        }
    }

    #[must_use]
    pub fn origin(&self) -> GeoPoint {
        self.origin
    }

    #[must_use]
    pub fn project(&self, point: &GeoPoint) -> PlanarPoint {
        PlanarPoint {
            x: (point.lon - self.origin.lon) * METERS_PER_DEGREE * self.cos_lat,
            y: (point.lat - self.origin.lat) * METERS_PER_DEGREE,
        }
    }

    #[must_use]
    pub fn unproject(&self, point: &PlanarPoint) -> GeoPoint {
        GeoPoint {
            lat: self.origin.lat + point.y / METERS_PER_DEGREE,
            lon: self.origin.lon + point.x / (METERS_PER_DEGREE * self.cos_lat),
        }
    }
}

/// An axis-aligned latitude/longitude rectangle.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub min_lon: f64,
    pub max_lat: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    /// # Errors
    ///
    /// Returns [`SpatialError::EmptyBoundingBox`] unless `min < max` on both axes,
    /// or [`SpatialError::InvalidCoordinate`] for an out-of-range corner.
    pub fn new(min_lat: f64, min_lon: f64, max_lat: f64, max_lon: f64) -> Result<Self, SpatialError> {
        GeoPoint::new(min_lat, min_lon)?;
        GeoPoint::new(max_lat, max_lon)?;
        if min_lat >= max_lat || min_lon >= max_lon {
            return Err(SpatialError::EmptyBoundingBox {
                min_lat,
                max_lat,
                min_lon,
                max_lon,
            });
        }
        Ok(Self {
            min_lat,
            min_lon,
            max_lat,
            max_lon,
        })
    }

    /// Smallest box containing every point, padded by `margin_m` on each side.
    ///
    /// Returns `None` for an empty slice.
    #[must_use]
    pub fn enclosing(points: &[GeoPoint], margin_m: f64) -> Option<Self> {
        let first = points.first()?;
        let mut bbox = Self {
            min_lat: first.lat,
            min_lon: first.lon,
            max_lat: first.lat,
            max_lon: first.lon,
        };
        for p in &points[1..] {
            bbox.min_lat = bbox.min_lat.min(p.lat);
            bbox.min_lon = bbox.min_lon.min(p.lon);
            bbox.max_lat = bbox.max_lat.max(p.lat);
            bbox.max_lon = bbox.max_lon.max(p.lon);
        }
        let south_west = GeoPoint {
            lat: bbox.min_lat,
            lon: bbox.min_lon,
        }
        .offset_m(-margin_m, -margin_m);
        let north_east = GeoPoint {
            lat: bbox.max_lat,
            lon: bbox.max_lon,
        }
        .offset_m(margin_m, margin_m);
        Some(Self {
            min_lat: south_west.lat,
            min_lon: south_west.lon,
            max_lat: north_east.lat,
            max_lon: north_east.lon,
        })
    }

    #[must_use]
    pub fn contains(&self, point: &GeoPoint) -> bool {
        (self.min_lat..=self.max_lat).contains(&point.lat)
            && (self.min_lon..=self.max_lon).contains(&point.lon)
    }

    #[must_use]
    pub fn center(&self) -> GeoPoint {
        GeoPoint {
            lat: (self.min_lat + self.max_lat) / 2.0,
            lon: (self.min_lon + self.max_lon) / 2.0,
        }
    }

    /// Corners in counter-clockwise order starting at the south-west.
    #[must_use]
    pub fn corners(&self) -> [GeoPoint; 4] {
        [
            GeoPoint { lat: self.min_lat, lon: self.min_lon },
            GeoPoint { lat: self.min_lat, lon: self.max_lon },
            GeoPoint { lat: self.max_lat, lon: self.max_lon },
            GeoPoint { lat: self.max_lat, lon: self.min_lon },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::{BoundingBox, GeoPoint, LocalFrame};

    #[test]
    fn rejects_out_of_range() {
        assert!(GeoPoint::new(91.0, 0.0).is_err());
        assert!(GeoPoint::new(0.0, f64::NAN).is_err());
        assert!(GeoPoint::new(-33.9, 151.2).is_ok());
    }

    #[test]
    fn one_degree_latitude_is_about_111_km() {
        let a = GeoPoint::new(0.0, 0.0).unwrap();
        let b = GeoPoint::new(1.0, 0.0).unwrap();
        assert!((a.haversine_m(&b) - 111_195.0).abs() < 10.0);
    }

    #[test]
    fn offset_matches_haversine() {
        let origin = GeoPoint::new(41.88, -87.63).unwrap();
        let moved = origin.offset_m(300.0, 400.0);
        assert!((origin.haversine_m(&moved) - 500.0).abs() < 0.5);
    }

    #[test]
    fn projection_round_trips() {
        let frame = LocalFrame::new(GeoPoint::new(42.33, -83.05).unwrap());
        let p = GeoPoint::new(42.34, -83.04).unwrap();
        let back = frame.unproject(&frame.project(&p));
        assert!((back.lat - p.lat).abs() < 1e-12);
        assert!((back.lon - p.lon).abs() < 1e-12);
    }

    #[test]
    fn enclosing_box_pads_every_side() {
        let pts = [GeoPoint::new(0.0, 0.0).unwrap(), GeoPoint::new(0.01, 0.02).unwrap()];
        let bbox = BoundingBox::enclosing(&pts, 100.0).unwrap();
        assert!(pts.iter().all(|p| bbox.contains(p)));
        assert!(bbox.min_lat < 0.0 && bbox.max_lon > 0.02);
        assert!(BoundingBox::enclosing(&[], 1.0).is_none());
    }

    #[test]
    fn empty_box_rejected() {
        assert!(BoundingBox::new(1.0, 0.0, 1.0, 2.0).is_err());
    }
}
