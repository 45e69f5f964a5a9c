use crate::geo::PlanarPoint;

/// A simple polygon ring in a local metric frame. The closing edge is implicit.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Polygon {
    vertices: Vec<PlanarPoint>,
}

impl Polygon {
    #[must_use]
    pub fn new(vertices: Vec<PlanarPoint>) -> Self {
        Self { vertices }
    }

    #[must_use]
    pub fn vertices(&self) -> &[PlanarPoint] {
        &self.vertices
    }

    fn edges(&self) -> impl Iterator<Item = (PlanarPoint, PlanarPoint)> + '_ {
        let n = self.vertices.len();
        (0..n).map(move |i| (self.vertices[i], self.vertices[(i + 1) % n]))
    }

    /// Even-odd ray casting. Points exactly on an edge may land either side.
    #[must_use]
    pub fn contains(&self, p: &PlanarPoint) -> bool {
        let mut inside = false;
        for (a, b) in self.edges() {
            if (a.y > p.y) != (b.y > p.y) {
                let x_cross = a.x + (p.y - a.y) / (b.y - a.y) * (b.x - a.x);
                if p.x < x_cross {
                    inside = !inside;
                }
            }
        }
        inside
    }

    /// Shortest distance from `p` to any edge, whether `p` is inside or not.
    #[must_use]
    pub fn distance_to_boundary(&self, p: &PlanarPoint) -> f64 {
        self.edges()
            .map(|(a, b)| segment_distance(p, &a, &b))
            .fold(f64::INFINITY, f64::min)
    }

    /// Absolute area via the shoelace formula.
    #[must_use]
    pub fn area(&self) -> f64 {
        self.edges()
            .map(|(a, b)| a.x * b.y - b.x * a.y)
            .sum::<f64>()
            .abs()
            / 2.0
    }

    /// Keep the part of the polygon where `normal · x <= offset`.
    ///
    /// Sutherland–Hodgman against one half-plane; exact for convex input.
    #[must_use]
    pub fn clip_half_plane(&self, normal: PlanarPoint, offset: f64) -> Polygon {
        let side = |p: &PlanarPoint| normal.x * p.x + normal.y * p.y - offset;
        let mut out = Vec::with_capacity(self.vertices.len() + 1);
        for (a, b) in self.edges() {
            let (sa, sb) = (side(&a), side(&b));
            if sa <= 0.0 {
                out.push(a);
            }
            if (sa <= 0.0) != (sb <= 0.0) {
                let t = sa / (sa - sb);
                out.push(PlanarPoint::new(a.x + t * (b.x - a.x), a.y + t * (b.y - a.y)));
            }
        }
        Polygon::new(out)
    }
}

fn segment_distance(p: &PlanarPoint, a: &PlanarPoint, b: &PlanarPoint) -> f64 {
    let (dx, dy) = (b.x - a.x, b.y - a.y);
    let len_sq = dx * dx + dy * dy;
    if len_sq == 0.0 {
        return p.distance(a);
    }
    let t = (((p.x - a.x) * dx + (p.y - a.y) * dy) / len_sq).clamp(0.0, 1.0);
    p.distance(&PlanarPoint::new(a.x + t * dx, a.y + t * dy))
}

#[cfg(test)]
mod tests {
    use super::Polygon;
    use crate::geo::PlanarPoint;

    fn square(side: f64) -> Polygon {
        Polygon::new(vec![
            PlanarPoint::new(0.0, 0.0),
            PlanarPoint::new(side, 0.0),
            PlanarPoint::new(side, side),
            PlanarPoint::new(0.0, side),
        ])
    }

    #[test]
    fn contains_interior_not_exterior() {
        let sq = square(10.0);
        assert!(sq.contains(&PlanarPoint::new(5.0, 5.0)));
        assert!(!sq.contains(&PlanarPoint::new(15.0, 5.0)));
    }

    #[test]
    fn boundary_distance_inside_and_outside() {
        let sq = square(10.0);
        assert!((sq.distance_to_boundary(&PlanarPoint::new(5.0, 2.0)) - 2.0).abs() < 1e-12);
        assert!((sq.distance_to_boundary(&PlanarPoint::new(13.0, 14.0)) - 5.0).abs() < 1e-12);
    }

    #[test]
    fn clip_halves_square() {
        let half = square(10.0).clip_half_plane(PlanarPoint::new(1.0, 0.0), 5.0);
        assert!((half.area() - 50.0).abs() < 1e-9);
        assert!(half.contains(&PlanarPoint::new(2.0, 5.0)));
        assert!(!half.contains(&PlanarPoint::new(7.0, 5.0)));
    }

    #[test]
    fn clip_outside_everything_is_empty() {
        let none = square(10.0).clip_half_plane(PlanarPoint::new(1.0, 0.0), -1.0);
        assert!(none.vertices().is_empty());
    }
}
