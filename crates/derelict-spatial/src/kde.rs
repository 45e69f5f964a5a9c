//! Gaussian kernel density over confirmed points, normalised per zone.

use std::collections::HashMap;
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, instrument};

use crate::error::SpatialError;
use crate::geo::{BoundingBox, GeoPoint, PlanarPoint};
use crate::index::{IndexSnapshot, IndexVersion};
use crate::zone::{ZoneId, ZoneLayout};

/// Upper bound on lattice probes per zone when searching for its peak.
const MAX_PROBES_PER_ZONE: usize = 4096;

/// Kernel parameters for the density surface.
///
/// # Defaults
///
/// | Parameter          | Default |
/// |--------------------|---------|
/// | `bandwidth_m`      | 1000.0  |
/// | `cutoff_bandwidths`| 4.0     |
/// | `lattice_step_m`   | 250.0   |
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct DensityParams {
    bandwidth_m: f64,
    cutoff_bandwidths: f64,
    lattice_step_m: f64,
}

impl DensityParams {
    /// # Errors
    ///
    /// Returns [`SpatialError::InvalidLength`] if `bandwidth_m` is not positive and finite.
    pub fn new(bandwidth_m: f64) -> Result<Self, SpatialError> {
        positive("bandwidth_m", bandwidth_m)?;
        Ok(Self {
            bandwidth_m,
            ..Self::default()
        })
    }

    /// Kernel contributions beyond `n` bandwidths are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`SpatialError::InvalidLength`] if `n` is not positive and finite.
    pub fn with_cutoff_bandwidths(mut self, n: f64) -> Result<Self, SpatialError> {
        positive("cutoff_bandwidths", n)?;
        self.cutoff_bandwidths = n;
        Ok(self)
    }

    /// Spacing of the probe lattice used to find each zone's peak.
    ///
    /// # Errors
    ///
    /// Returns [`SpatialError::InvalidLength`] if `step_m` is not positive and finite.
    pub fn with_lattice_step_m(mut self, step_m: f64) -> Result<Self, SpatialError> {
        positive("lattice_step_m", step_m)?;
        self.lattice_step_m = step_m;
        Ok(self)
    }

    #[must_use]
    pub fn bandwidth_m(&self) -> f64 {
        self.bandwidth_m
    }

    #[must_use]
    pub fn cutoff_bandwidths(&self) -> f64 {
        self.cutoff_bandwidths
    }

    #[must_use]
    pub fn lattice_step_m(&self) -> f64 {
        self.lattice_step_m
    }
}

impl Default for DensityParams {
    fn default() -> Self {
        Self {
            bandwidth_m: 1000.0,
            cutoff_bandwidths: 4.0,
            lattice_step_m: 250.0,
        }
    }
}

fn positive(name: &'static str, value: f64) -> Result<(), SpatialError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(SpatialError::InvalidLength { name, value })
    }
}

/// A gridded density surface, normalised so its maximum cell is 1.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Heatmap {
    pub bbox: BoundingBox,
    pub resolution: usize,
    /// Row-major from the south-west cell; `resolution²` values.
    pub values: Vec<f64>,
}

impl Heatmap {
    #[must_use]
    pub fn value(&self, row: usize, col: usize) -> Option<f64> {
        if row >= self.resolution || col >= self.resolution {
            return None;
        }
        self.values.get(row * self.resolution + col).copied()
    }

    /// Centre coordinate of a cell.
    #[must_use]
    pub fn cell_center(&self, row: usize, col: usize) -> GeoPoint {
        let n = self.resolution as f64;
        GeoPoint {
            lat: self.bbox.min_lat + (row as f64 + 0.5) / n * (self.bbox.max_lat - self.bbox.min_lat),
            lon: self.bbox.min_lon + (col as f64 + 0.5) / n * (self.bbox.max_lon - self.bbox.min_lon),
        }
    }
}

/// Kernel density surface for one index snapshot with cached per-zone peaks.
#[derive(Debug, Clone)]
pub struct DensityModel {
    version: IndexVersion,
    params: DensityParams,
    layout: Option<Arc<ZoneLayout>>,
    zone_max: HashMap<ZoneId, f64>,
    global_max: f64,
}

impl DensityModel {
    /// Build the surface and locate its peak inside every zone of `layout`.
    ///
    /// Peaks are probed at the confirmed points inside the zone plus a regular
    /// lattice over the zone. Without a layout every query is normalised by
    /// the global peak.
    #[instrument(skip_all, fields(version = %snapshot.version(), n_points = snapshot.len()))]
    pub fn build(snapshot: &IndexSnapshot, params: DensityParams, layout: Option<Arc<ZoneLayout>>) -> Self {
        let at_points = snapshot
            .points()
            .par_iter()
            .map(|p| raw_density(snapshot, &params, &p.location))
            .reduce(|| 0.0, f64::max);

        let zone_max: HashMap<ZoneId, f64> = match &layout {
            Some(layout) => layout
                .zones()
                .par_iter()
                .filter_map(|zone| {
                    let polygon = layout.polygon(zone.id).ok()?;
                    let mut probes: Vec<GeoPoint> = snapshot
                        .points()
                        .iter()
                        .map(|p| p.location)
                        .filter(|p| polygon.contains(&layout.frame().project(p)))
                        .collect();
                    probes.extend(lattice(polygon.vertices(), params.lattice_step_m).into_iter().filter_map(|p| {
                        polygon.contains(&p).then(|| layout.frame().unproject(&p))
                    }));
                    probes.extend(zone.boundary.iter().copied());
                    let peak = probes
                        .iter()
                        .map(|q| raw_density(snapshot, &params, q))
                        .fold(0.0, f64::max);
                    Some((zone.id, peak))
                })
                .collect(),
            None => HashMap::new(),
        };

        let global_max = zone_max.values().copied().fold(at_points, f64::max);
        debug!(n_zones = zone_max.len(), global_max, "density surface built");
        Self {
            version: snapshot.version(),
            params,
            layout,
            zone_max,
            global_max,
        }
    }

    #[must_use]
    pub fn version(&self) -> IndexVersion {
        self.version
    }

    #[must_use]
    pub fn params(&self) -> DensityParams {
        self.params
    }

    /// Peak density recorded for `zone`.
    #[must_use]
    pub fn zone_peak(&self, zone: ZoneId) -> Option<f64> {
        self.zone_max.get(&zone).copied()
    }

    /// Unnormalised density `Σ exp(−d²/2h²)` at `query`.
    ///
    /// # Errors
    ///
    /// Returns [`SpatialError::IndexStale`] if `snapshot` is not the one this model was built from.
    pub fn density_at(&self, snapshot: &IndexSnapshot, query: &GeoPoint) -> Result<f64, SpatialError> {
        self.check_version(snapshot)?;
        Ok(raw_density(snapshot, &self.params, query))
    }

    /// Relative hotspot value in `[0, 1]`: density at `query` over the peak
    /// density of the zone containing it (global peak outside every zone).
    ///
    /// # Errors
    ///
    /// Returns [`SpatialError::IndexStale`] if `snapshot` is not the one this model was built from.
    pub fn score(&self, snapshot: &IndexSnapshot, query: &GeoPoint) -> Result<f64, SpatialError> {
        let density = self.density_at(snapshot, query)?;
        if density <= 0.0 {
            return Ok(0.0);
        }
        let peak = self
            .layout
            .as_ref()
            .and_then(|layout| layout.zone_of(query))
            .and_then(|zone| self.zone_peak(zone))
            .unwrap_or(self.global_max);
        // Probing can miss the true peak; never exceed 1.
        Ok((density / peak.max(density)).clamp(0.0, 1.0))
    }

    /// Evaluate the surface over `bbox` on a `resolution × resolution` grid.
    ///
    /// # Errors
    ///
    /// | Variant | Condition |
    /// |---|---|
    /// | [`SpatialError::InvalidResolution`] | `resolution == 0` |
    /// | [`SpatialError::IndexStale`] | `snapshot` is not the one this model was built from |
    #[instrument(skip(self, snapshot, bbox))]
    pub fn heatmap(&self, snapshot: &IndexSnapshot, bbox: &BoundingBox, resolution: usize) -> Result<Heatmap, SpatialError> {
        self.check_version(snapshot)?;
        if resolution == 0 {
            return Err(SpatialError::InvalidResolution { resolution });
        }
        let mut heatmap = Heatmap {
            bbox: *bbox,
            resolution,
            values: Vec::new(),
        };
        let raw: Vec<f64> = (0..resolution * resolution)
            .into_par_iter()
            .map(|cell| {
                let center = heatmap.cell_center(cell / resolution, cell % resolution);
                raw_density(snapshot, &self.params, &center)
            })
            .collect();
        let max = raw.iter().copied().fold(0.0, f64::max);
        heatmap.values = if max > 0.0 {
            raw.into_iter().map(|v| v / max).collect()
        } else {
            raw
        };
        Ok(heatmap)
    }

    fn check_version(&self, snapshot: &IndexSnapshot) -> Result<(), SpatialError> {
        if snapshot.version() != self.version {
            return Err(SpatialError::IndexStale {
                bound: snapshot.version(),
                current: self.version,
            });
        }
        Ok(())
    }
}

fn raw_density(snapshot: &IndexSnapshot, params: &DensityParams, query: &GeoPoint) -> f64 {
    let h = params.bandwidth_m;
    snapshot
        .within(query, params.cutoff_bandwidths * h)
        .into_iter()
        .map(|(_, d)| (-(d * d) / (2.0 * h * h)).exp())
        .sum()
}

/// Regular lattice over the bounding rectangle of `vertices`.
fn lattice(vertices: &[PlanarPoint], step_m: f64) -> Vec<PlanarPoint> {
    let Some(first) = vertices.first() else {
        return vec![];
    };
    let (mut x0, mut y0, mut x1, mut y1) = (first.x, first.y, first.x, first.y);
    for v in vertices {
        x0 = x0.min(v.x);
        y0 = y0.min(v.y);
        x1 = x1.max(v.x);
        y1 = y1.max(v.y);
    }
    let mut step = step_m;
    while ((x1 - x0) / step + 1.0) * ((y1 - y0) / step + 1.0) > MAX_PROBES_PER_ZONE as f64 {
        step *= 2.0;
    }
    let nx = ((x1 - x0) / step).floor() as usize;
    let ny = ((y1 - y0) / step).floor() as usize;
    let mut out = Vec::with_capacity((nx + 1) * (ny + 1));
    for i in 0..=nx {
        for j in 0..=ny {
            out.push(PlanarPoint::new(x0 + i as f64 * step, y0 + j as f64 * step));
        }
    }
    out
}
