//! Derivative-free search for ensemble weights on the simplex.
//!
//! The validation metric is piecewise constant in the weights, so the search
//! evaluates it directly: an exhaustive simplex grid, then a pattern search
//! that moves weight mass between pairs of components and halves its step
//! whenever no move improves.

use rayon::prelude::*;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{ConvergenceError, EnsembleError};
use crate::metrics::Metric;
use crate::precompute::{FoldScores, mean_metric};
use crate::weights::ModelWeights;

/// Weight-search budget and tolerances.
///
/// # Defaults
///
/// | Parameter         | Default |
/// |-------------------|---------|
/// | `grid_resolution` | 10      |
/// | `initial_step`    | 0.05    |
/// | `min_step`        | 1e-3    |
/// | `max_evaluations` | 2000    |
/// | `min_improvement` | 1e-9    |
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    grid_resolution: usize,
    initial_step: f64,
    min_step: f64,
    max_evaluations: usize,
    min_improvement: f64,
}

impl OptimizerConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_grid_resolution(mut self, grid_resolution: usize) -> Self {
        self.grid_resolution = grid_resolution;
        self
    }

    #[must_use]
    pub fn with_initial_step(mut self, initial_step: f64) -> Self {
        self.initial_step = initial_step;
        self
    }

    #[must_use]
    pub fn with_min_step(mut self, min_step: f64) -> Self {
        self.min_step = min_step;
        self
    }

    #[must_use]
    pub fn with_max_evaluations(mut self, max_evaluations: usize) -> Self {
        self.max_evaluations = max_evaluations;
        self
    }

    #[must_use]
    pub fn with_min_improvement(mut self, min_improvement: f64) -> Self {
        self.min_improvement = min_improvement;
        self
    }

    #[must_use]
    pub fn grid_resolution(&self) -> usize {
        self.grid_resolution
    }

    #[must_use]
    pub fn max_evaluations(&self) -> usize {
        self.max_evaluations
    }

    #[must_use]
    pub fn min_improvement(&self) -> f64 {
        self.min_improvement
    }

    /// # Errors
    ///
    /// | Variant | Condition |
    /// |---|---|
    /// | [`EnsembleError::ZeroBudget`] | `grid_resolution` or `max_evaluations` is zero |
    /// | [`EnsembleError::InvalidThreshold`] | a step is outside `(0, 1]` or `min_step > initial_step` |
    pub fn validate(&self) -> Result<(), EnsembleError> {
        if self.grid_resolution == 0 {
            return Err(EnsembleError::ZeroBudget {
                name: "grid_resolution",
            });
        }
        if self.max_evaluations == 0 {
            return Err(EnsembleError::ZeroBudget {
                name: "max_evaluations",
            });
        }
        if !(self.initial_step > 0.0 && self.initial_step <= 1.0) {
            return Err(EnsembleError::InvalidThreshold {
                name: "initial_step",
                value: self.initial_step,
            });
        }
        if !(self.min_step > 0.0 && self.min_step <= self.initial_step) {
            return Err(EnsembleError::InvalidThreshold {
                name: "min_step",
                value: self.min_step,
            });
        }
        Ok(())
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            grid_resolution: 10,
            initial_step: 0.05,
            min_step: 1e-3,
            max_evaluations: 2000,
            min_improvement: 1e-9,
        }
    }
}

/// Best weights found and how they compare with uniform weights.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizationOutcome {
    /// `[rf, spatial, kde]`.
    pub weights: [f64; 3],
    pub metric: f64,
    pub uniform_metric: f64,
    pub evaluations: usize,
}

/// Maximises the mean fold metric of fused scores over the weight simplex.
#[derive(Debug, Clone)]
pub struct WeightOptimizer {
    config: OptimizerConfig,
    metric: Metric,
}

impl WeightOptimizer {
    /// # Errors
    ///
    /// Same as [`OptimizerConfig::validate`].
    pub fn new(config: OptimizerConfig, metric: Metric) -> Result<Self, EnsembleError> {
        config.validate()?;
        Ok(Self { config, metric })
    }

    /// Search for the best weights.
    ///
    /// # Errors
    ///
    /// | Variant | Condition |
    /// |---|---|
    /// | [`ConvergenceError::DegenerateLabels`] | all held-out labels share one class |
    /// | [`ConvergenceError::NoScorableFold`] | no fold has a defined metric |
    /// | [`ConvergenceError::NoImprovement`] | the best metric beats uniform by no more than `min_improvement` |
    #[instrument(skip_all, fields(n_folds = folds.len(), metric = %self.metric))]
    pub fn optimize(&self, folds: &[FoldScores]) -> Result<OptimizationOutcome, ConvergenceError> {
        let n_samples: usize = folds.iter().map(|f| f.labels.len()).sum();
        let n_positive = folds.iter().flat_map(|f| &f.labels).filter(|&&l| l).count();
        if n_positive == 0 || n_positive == n_samples {
            return Err(ConvergenceError::DegenerateLabels { n_samples, n_positive });
        }

        let uniform = ModelWeights::uniform(Uuid::nil()).as_array();
        let objective = |w: &[f64; 3]| mean_metric(folds, self.metric, w);
        let uniform_metric = objective(&uniform).ok_or(ConvergenceError::NoScorableFold { n_folds: folds.len() })?;

        let grid = simplex_grid(self.config.grid_resolution);
        let mut evaluations = 1 + grid.len();
        // Keeping the first of equal maxima makes the grid phase deterministic.
        let (mut best, mut best_metric) = grid
            .par_iter()
            .map(|w| (*w, objective(w).unwrap_or(f64::NEG_INFINITY)))
            .reduce(
                || (uniform, uniform_metric),
                |a, b| if b.1 > a.1 { b } else { a },
            );
        debug!(grid_points = grid.len(), best_metric, "grid phase done");

        let mut step = self.config.initial_step;
        while step >= self.config.min_step && evaluations < self.config.max_evaluations {
            let mut moved = false;
            for (from, to) in PAIRS {
                if evaluations >= self.config.max_evaluations {
                    break;
                }
                let delta = step.min(best[from]);
                if delta <= 0.0 {
                    continue;
                }
                let mut candidate = best;
                candidate[from] -= delta;
                candidate[to] += delta;
                let candidate = project(candidate);
                evaluations += 1;
                if let Some(m) = objective(&candidate)
                    && m > best_metric
                {
                    best = candidate;
                    best_metric = m;
                    moved = true;
                }
            }
            if !moved {
                step /= 2.0;
            }
        }

        info!(
            best_metric,
            uniform_metric,
            evaluations,
            rf = best[0],
            spatial = best[1],
            kde = best[2],
            "weight search finished"
        );
        if best_metric <= uniform_metric + self.config.min_improvement {
            return Err(ConvergenceError::NoImprovement {
                uniform: uniform_metric,
                best: best_metric,
                evaluations,
            });
        }
        Ok(OptimizationOutcome {
            weights: best,
            metric: best_metric,
            uniform_metric,
            evaluations,
        })
    }

    /// Search for weights, falling back to uniform weights on [`ConvergenceError`].
    ///
    /// The error is logged as a warning and returned alongside the fallback
    /// for the run's report; it is never raised.
    pub fn optimize_or_uniform(
        &self,
        folds: &[FoldScores],
        run_id: Uuid,
    ) -> (ModelWeights, Option<ConvergenceError>) {
        let outcome = self.optimize(folds).and_then(|o| {
            ModelWeights::from_array(o.weights, run_id, Some(o.metric)).map_err(|_| ConvergenceError::NoImprovement {
                uniform: o.uniform_metric,
                best: o.metric,
                evaluations: o.evaluations,
            })
        });
        match outcome {
            Ok(weights) => (weights, None),
            Err(err) => {
                warn!(%run_id, error = %err, "weight search did not converge; using uniform weights");
                (ModelWeights::uniform(run_id), Some(err))
            }
        }
    }
}

/// Ordered pairs `(from, to)` of components to move weight between.
const PAIRS: [(usize, usize); 6] = [(0, 1), (0, 2), (1, 0), (1, 2), (2, 0), (2, 1)];

/// Every `(i, j, r - i - j) / r` point of the simplex.
fn simplex_grid(resolution: usize) -> Vec<[f64; 3]> {
    let r = resolution as f64;
    let mut points = Vec::with_capacity((resolution + 1) * (resolution + 2) / 2);
    for i in 0..=resolution {
        for j in 0..=resolution - i {
            points.push(project([i as f64 / r, j as f64 / r, 0.0]));
        }
    }
    points
}

/// Clamp to non-negative and put the remainder on the last component so the sum is exactly 1.
fn project(w: [f64; 3]) -> [f64; 3] {
    let a = w[0].clamp(0.0, 1.0);
    let b = w[1].clamp(0.0, 1.0 - a);
    [a, b, (1.0 - a - b).max(0.0)]
}
