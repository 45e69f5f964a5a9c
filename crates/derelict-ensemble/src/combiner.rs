//! Weighted fusion of base scores.

use crate::error::EnsembleError;
use crate::scorer::ScorerKind;
use crate::weights::ModelWeights;

/// Base scores for one location, one slot per [`ScorerKind`].
///
/// A slot is `None` when its scorer was not applicable, e.g. the forest for a
/// location without features.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ComponentScores([Option<f64>; 3]);

impl ComponentScores {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All three scores present, ordered like [`ScorerKind::ALL`].
    #[must_use]
    pub fn complete(scores: [f64; 3]) -> Self {
        Self(scores.map(Some))
    }

    pub fn set(&mut self, kind: ScorerKind, score: f64) {
        self.0[kind.index()] = Some(score);
    }

    #[must_use]
    pub fn get(&self, kind: ScorerKind) -> Option<f64> {
        self.0[kind.index()]
    }
}

/// One component's share of a fused score.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ComponentContribution {
    pub kind: ScorerKind,
    /// The component's own score; `None` if it was dropped.
    pub prediction: Option<f64>,
    /// Weight actually applied, after renormalising over present components.
    pub weight: f64,
    pub contribution: f64,
}

/// A fused score with its per-component breakdown.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Fusion {
    pub base_confidence: f64,
    pub components: Vec<ComponentContribution>,
    /// True when a missing component forced the weights to be renormalised.
    pub renormalised: bool,
}

/// `base = Σ w_k · s_k` over the three base scorers.
#[derive(Debug, Clone)]
pub struct EnsembleCombiner {
    weights: ModelWeights,
}

impl EnsembleCombiner {
    #[must_use]
    pub fn new(weights: ModelWeights) -> Self {
        Self { weights }
    }

    #[must_use]
    pub fn weights(&self) -> &ModelWeights {
        &self.weights
    }

    /// The fused score in `[0, 1]`.
    ///
    /// # Errors
    ///
    /// Same as [`EnsembleCombiner::fuse`].
    pub fn combine(&self, scores: &ComponentScores) -> Result<f64, EnsembleError> {
        Ok(self.fuse(scores)?.base_confidence)
    }

    /// Fuse `scores` and report each component's contribution.
    ///
    /// Missing components get weight 0 and the remaining weights are scaled
    /// to sum to 1. If every present component has weight 0 they share the
    /// weight equally.
    ///
    /// # Errors
    ///
    /// | Variant | Condition |
    /// |---|---|
    /// | [`EnsembleError::ScoreRange`] | a present score is NaN or outside `[0, 1]` |
    /// | [`EnsembleError::InputShape`] | no component score is present |
    pub fn fuse(&self, scores: &ComponentScores) -> Result<Fusion, EnsembleError> {
        for kind in ScorerKind::ALL {
            if let Some(value) = scores.get(kind)
                && !(0.0..=1.0).contains(&value)
            {
                return Err(EnsembleError::ScoreRange {
                    component: kind,
                    value,
                });
            }
        }

        let present: Vec<ScorerKind> = ScorerKind::ALL
            .into_iter()
            .filter(|&k| scores.get(k).is_some())
            .collect();
        if present.is_empty() {
            return Err(EnsembleError::InputShape {
                expected: ScorerKind::ALL.len(),
                got: 0,
            });
        }
        let present_mass: f64 = present.iter().map(|&k| self.weights.weight(k)).sum();
        let renormalised = present.len() < ScorerKind::ALL.len();

        let components: Vec<ComponentContribution> = ScorerKind::ALL
            .into_iter()
            .map(|kind| {
                let prediction = scores.get(kind);
                let weight = match prediction {
                    None => 0.0,
                    Some(_) if present_mass > 0.0 => self.weights.weight(kind) / present_mass,
                    Some(_) => 1.0 / present.len() as f64,
                };
                ComponentContribution {
                    kind,
                    prediction,
                    weight,
                    contribution: weight * prediction.unwrap_or(0.0),
                }
            })
            .collect();
        let base_confidence = components
            .iter()
            .map(|c| c.contribution)
            .sum::<f64>()
            .clamp(0.0, 1.0);
        Ok(Fusion {
            base_confidence,
            components,
            renormalised,
        })
    }
}
