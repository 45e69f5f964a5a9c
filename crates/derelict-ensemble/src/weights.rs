//! Ensemble weights and the registry of training runs that produced them.

use std::sync::{Arc, PoisonError, RwLock};

use tracing::info;
use uuid::Uuid;

use crate::error::EnsembleError;
use crate::scorer::ScorerKind;

/// Tolerance on `rf + spatial + kde = 1`.
pub const WEIGHT_TOLERANCE: f64 = 1e-6;

/// Fusion weights for the three base scorers, tagged with the run that produced them.
///
/// Weights are a point on the 2-simplex: each is non-negative and they sum
/// to 1 within [`WEIGHT_TOLERANCE`]. Values are never edited after a run;
/// a later run supersedes them.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ModelWeights {
    rf: f64,
    spatial: f64,
    kde: f64,
    run_id: Uuid,
    validation_metric: Option<f64>,
}

impl ModelWeights {
    /// # Errors
    ///
    /// Returns [`EnsembleError::InvalidWeights`] unless every weight is finite
    /// and non-negative and they sum to 1 within [`WEIGHT_TOLERANCE`].
    pub fn new(
        rf: f64,
        spatial: f64,
        kde: f64,
        run_id: Uuid,
        validation_metric: Option<f64>,
    ) -> Result<Self, EnsembleError> {
        let weights = Self {
            rf,
            spatial,
            kde,
            run_id,
            validation_metric,
        };
        weights.validate()?;
        Ok(weights)
    }

    /// `(0.33, 0.33, 0.34)`: the fallback when the weight search does not converge.
    #[must_use]
    pub fn uniform(run_id: Uuid) -> Self {
        Self {
            rf: 0.33,
            spatial: 0.33,
            kde: 0.34,
            run_id,
            validation_metric: None,
        }
    }

    /// Build from an array ordered like [`ScorerKind::ALL`].
    ///
    /// # Errors
    ///
    /// Same as [`ModelWeights::new`].
    pub fn from_array(weights: [f64; 3], run_id: Uuid, validation_metric: Option<f64>) -> Result<Self, EnsembleError> {
        Self::new(weights[0], weights[1], weights[2], run_id, validation_metric)
    }

    /// Re-check the simplex constraint, e.g. after deserialising.
    ///
    /// # Errors
    ///
    /// Returns [`EnsembleError::InvalidWeights`] if the weights are off the simplex.
    pub fn validate(&self) -> Result<(), EnsembleError> {
        let all = self.as_array();
        let valid = all.iter().all(|w| w.is_finite() && *w >= 0.0)
            && (all.iter().sum::<f64>() - 1.0).abs() <= WEIGHT_TOLERANCE;
        if !valid {
            return Err(EnsembleError::InvalidWeights {
                rf: self.rf,
                spatial: self.spatial,
                kde: self.kde,
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn rf(&self) -> f64 {
        self.rf
    }

    #[must_use]
    pub fn spatial(&self) -> f64 {
        self.spatial
    }

    #[must_use]
    pub fn kde(&self) -> f64 {
        self.kde
    }

    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Mean validation metric the weights achieved; `None` for the uniform fallback.
    #[must_use]
    pub fn validation_metric(&self) -> Option<f64> {
        self.validation_metric
    }

    #[must_use]
    pub fn weight(&self, kind: ScorerKind) -> f64 {
        self.as_array()[kind.index()]
    }

    #[must_use]
    pub fn as_array(&self) -> [f64; 3] {
        [self.rf, self.spatial, self.kde]
    }
}

/// Every run's weights, plus a pointer to the active run.
///
/// Registering a run activates it. Rolling back re-points `active` to an
/// earlier run; no entry is ever modified or removed.
#[derive(Debug, Default)]
pub struct WeightRegistry {
    state: RwLock<RegistryState>,
}

#[derive(Debug, Default)]
struct RegistryState {
    history: Vec<Arc<ModelWeights>>,
    active: Option<usize>,
}

impl WeightRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a run's weights and make them active.
    ///
    /// # Errors
    ///
    /// Returns [`EnsembleError::InvalidWeights`] if the weights are off the simplex.
    pub fn register(&self, weights: ModelWeights) -> Result<Arc<ModelWeights>, EnsembleError> {
        weights.validate()?;
        let weights = Arc::new(weights);
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.history.push(Arc::clone(&weights));
        state.active = Some(state.history.len() - 1);
        info!(run_id = %weights.run_id(), rf = weights.rf(), spatial = weights.spatial(), kde = weights.kde(), "weights activated");
        Ok(weights)
    }

    /// The active weights, if any run has been registered.
    #[must_use]
    pub fn active(&self) -> Option<Arc<ModelWeights>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.active.map(|i| Arc::clone(&state.history[i]))
    }

    /// Re-point `active` at an earlier run.
    ///
    /// # Errors
    ///
    /// Returns [`EnsembleError::UnknownRun`] if `run_id` was never registered.
    pub fn activate(&self, run_id: Uuid) -> Result<Arc<ModelWeights>, EnsembleError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let index = state
            .history
            .iter()
            .rposition(|w| w.run_id() == run_id)
            .ok_or(EnsembleError::UnknownRun { run_id })?;
        state.active = Some(index);
        info!(%run_id, "weights rolled back");
        Ok(Arc::clone(&state.history[index]))
    }

    /// All registered runs, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<Arc<ModelWeights>> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .clone()
    }
}
