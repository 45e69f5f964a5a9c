//! Staged, cost-increasing refinement of high-risk candidates.
//!
//! ```text
//! Broad ──below broad──────────────────────────────▶ Finalized
//!   │
//!   └──▶ SatelliteReview ──below satellite─────────▶ Finalized
//!          │
//!          └──▶ StreetReview ──────────────────────▶ Finalized
//! ```
//!
//! Every transition is recorded with its reason, the score before and after,
//! and a short evidence note. Unavailable evidence is a zero adjustment.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use derelict_spatial::GeoPoint;
use tracing::{debug, warn};

use crate::error::{EnsembleError, EvidenceUnavailable};
use crate::gateway::EvidenceGateway;

/// Vegetation index and structural change for one location, both in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SatelliteEvidence {
    pub vegetation_index: f64,
    pub structural_change: f64,
}

/// Street-level boarding detection confidence in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StreetEvidence {
    pub boarding_score: f64,
}

/// Supplies satellite evidence. Calls may block.
pub trait SatelliteEvidenceSource: Send + Sync {
    /// # Errors
    ///
    /// Returns [`EvidenceUnavailable`] when no usable imagery exists.
    fn satellite_evidence(&self, location: &GeoPoint) -> Result<SatelliteEvidence, EvidenceUnavailable>;
}

/// Supplies street-level evidence. Calls may block.
pub trait StreetEvidenceSource: Send + Sync {
    /// # Errors
    ///
    /// Returns [`EvidenceUnavailable`] when no usable imagery exists.
    fn street_evidence(&self, location: &GeoPoint) -> Result<StreetEvidence, EvidenceUnavailable>;
}

/// A source with no imagery anywhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEvidence;

impl SatelliteEvidenceSource for NoEvidence {
    fn satellite_evidence(&self, _location: &GeoPoint) -> Result<SatelliteEvidence, EvidenceUnavailable> {
        Err(EvidenceUnavailable::NoCoverage)
    }
}

impl StreetEvidenceSource for NoEvidence {
    fn street_evidence(&self, _location: &GeoPoint) -> Result<StreetEvidence, EvidenceUnavailable> {
        Err(EvidenceUnavailable::NoCoverage)
    }
}

/// Funnel thresholds, adjustment caps and call limits.
///
/// # Defaults
///
/// | Parameter             | Default |
/// |-----------------------|---------|
/// | `broad_threshold`     | 0.3     |
/// | `satellite_threshold` | 0.6     |
/// | `satellite_cap`       | 0.25    |
/// | `street_cap`          | 0.25    |
/// | `ndvi_baseline`       | 0.3     |
/// | `max_in_flight`       | 8       |
/// | `call_timeout_ms`     | 5000    |
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct FunnelConfig {
    broad_threshold: f64,
    satellite_threshold: f64,
    satellite_cap: f64,
    street_cap: f64,
    ndvi_baseline: f64,
    max_in_flight: usize,
    call_timeout_ms: u64,
}

impl FunnelConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_broad_threshold(mut self, threshold: f64) -> Self {
        self.broad_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_satellite_threshold(mut self, threshold: f64) -> Self {
        self.satellite_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_satellite_cap(mut self, cap: f64) -> Self {
        self.satellite_cap = cap;
        self
    }

    #[must_use]
    pub fn with_street_cap(mut self, cap: f64) -> Self {
        self.street_cap = cap;
        self
    }

    /// Vegetation index treated as normal upkeep; overgrowth is measured above it.
    #[must_use]
    pub fn with_ndvi_baseline(mut self, baseline: f64) -> Self {
        self.ndvi_baseline = baseline;
        self
    }

    #[must_use]
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub fn broad_threshold(&self) -> f64 {
        self.broad_threshold
    }

    #[must_use]
    pub fn satellite_threshold(&self) -> f64 {
        self.satellite_threshold
    }

    #[must_use]
    pub fn satellite_cap(&self) -> f64 {
        self.satellite_cap
    }

    #[must_use]
    pub fn street_cap(&self) -> f64 {
        self.street_cap
    }

    #[must_use]
    pub fn ndvi_baseline(&self) -> f64 {
        self.ndvi_baseline
    }

    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// # Errors
    ///
    /// | Variant | Condition |
    /// |---|---|
    /// | [`EnsembleError::InvalidThreshold`] | a threshold or cap is outside `[0, 1]`, or the baseline is 1 |
    /// | [`EnsembleError::ZeroBudget`] | `max_in_flight` is zero |
    pub fn validate(&self) -> Result<(), EnsembleError> {
        for (name, value) in [
            ("broad_threshold", self.broad_threshold),
            ("satellite_threshold", self.satellite_threshold),
            ("satellite_cap", self.satellite_cap),
            ("street_cap", self.street_cap),
            ("ndvi_baseline", self.ndvi_baseline),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(EnsembleError::InvalidThreshold { name, value });
            }
        }
        if self.ndvi_baseline >= 1.0 {
            return Err(EnsembleError::InvalidThreshold {
                name: "ndvi_baseline",
                value: self.ndvi_baseline,
            });
        }
        if self.max_in_flight == 0 {
            return Err(EnsembleError::ZeroBudget { name: "max_in_flight" });
        }
        Ok(())
    }
}

impl Default for FunnelConfig {
    fn default() -> Self {
        Self {
            broad_threshold: 0.3,
            satellite_threshold: 0.6,
            satellite_cap: 0.25,
            street_cap: 0.25,
            ndvi_baseline: 0.3,
            max_in_flight: 8,
            call_timeout_ms: 5000,
        }
    }
}

/// Funnel states. `Broad` is initial and `Finalized` terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunnelStage {
    Broad,
    SatelliteReview,
    StreetReview,
    Finalized,
}

impl fmt::Display for FunnelStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FunnelStage::Broad => "broad",
            FunnelStage::SatelliteReview => "satellite_review",
            FunnelStage::StreetReview => "street_review",
            FunnelStage::Finalized => "finalized",
        })
    }
}

/// Why the funnel left a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    BelowBroadThreshold,
    AboveBroadThreshold,
    BelowSatelliteThreshold,
    AboveSatelliteThreshold,
    StreetReviewed,
}

/// One recorded stage change.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Transition {
    pub from: FunnelStage,
    pub to: FunnelStage,
    pub reason: TransitionReason,
    pub score_before: f64,
    /// Adjustment actually applied after clamping to `[0, 1]`.
    pub adjustment: f64,
    pub score_after: f64,
    pub note: String,
}

/// The ordered transitions of one funnel run.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FunnelHistory {
    pub transitions: Vec<Transition>,
}

impl FunnelHistory {
    /// Recompute the final score from the recorded adjustments.
    ///
    /// Returns `None` unless the transitions form a chain from `Broad` to
    /// `Finalized` whose scores connect.
    #[must_use]
    pub fn replay(&self) -> Option<f64> {
        let first = self.transitions.first()?;
        if first.from != FunnelStage::Broad {
            return None;
        }
        let mut stage = FunnelStage::Broad;
        let mut score = first.score_before;
        for t in &self.transitions {
            if t.from != stage || (t.score_before - score).abs() > 1e-12 {
                return None;
            }
            score = (score + t.adjustment).clamp(0.0, 1.0);
            if (score - t.score_after).abs() > 1e-12 {
                return None;
            }
            stage = t.to;
        }
        (stage == FunnelStage::Finalized).then_some(score)
    }

    /// Number of evidence requests the run made.
    #[must_use]
    pub fn evidence_requests(&self) -> usize {
        self.transitions
            .iter()
            .filter(|t| matches!(t.from, FunnelStage::SatelliteReview | FunnelStage::StreetReview))
            .count()
    }
}

/// Score after a stage.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StageScore {
    pub stage: FunnelStage,
    pub score: f64,
}

/// Result of running one location through the funnel.
#[derive(Debug, Clone, PartialEq)]
pub struct FunnelOutcome {
    pub stage_scores: Vec<StageScore>,
    pub final_confidence: f64,
    pub history: FunnelHistory,
}

/// Runs the funnel state machine against the evidence collaborators.
#[derive(Clone)]
pub struct EvidenceFunnel {
    config: FunnelConfig,
    gateway: EvidenceGateway,
    satellite: Arc<dyn SatelliteEvidenceSource>,
    street: Arc<dyn StreetEvidenceSource>,
}

impl fmt::Debug for EvidenceFunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvidenceFunnel")
            .field("config", &self.config)
            .field("gateway", &self.gateway)
            .finish_non_exhaustive()
    }
}

impl EvidenceFunnel {
    /// # Errors
    ///
    /// Same as [`FunnelConfig::validate`].
    pub fn new(
        config: FunnelConfig,
        satellite: Arc<dyn SatelliteEvidenceSource>,
        street: Arc<dyn StreetEvidenceSource>,
    ) -> Result<Self, EnsembleError> {
        config.validate()?;
        let gateway = EvidenceGateway::new(config.max_in_flight, config.call_timeout())?;
        Ok(Self {
            config,
            gateway,
            satellite,
            street,
        })
    }

    #[must_use]
    pub fn config(&self) -> &FunnelConfig {
        &self.config
    }

    /// Drive one location from `Broad` to `Finalized`.
    ///
    /// `location_id` only labels log lines.
    pub fn run(&self, location_id: &str, location: &GeoPoint, base_confidence: f64) -> FunnelOutcome {
        let mut stage = FunnelStage::Broad;
        let mut score = base_confidence.clamp(0.0, 1.0);
        let mut history = FunnelHistory::default();
        let mut stage_scores = vec![StageScore {
            stage: FunnelStage::Broad,
            score,
        }];

        while stage != FunnelStage::Finalized {
            let (to, reason, adjustment, note) = match stage {
                FunnelStage::Broad if score < self.config.broad_threshold => (
                    FunnelStage::Finalized,
                    TransitionReason::BelowBroadThreshold,
                    0.0,
                    "below broad threshold".to_string(),
                ),
                FunnelStage::Broad => (
                    FunnelStage::SatelliteReview,
                    TransitionReason::AboveBroadThreshold,
                    0.0,
                    "escalated to satellite review".to_string(),
                ),
                FunnelStage::SatelliteReview => {
                    let (adjustment, note) = self.satellite_adjustment(location_id, location);
                    let after = (score + adjustment).clamp(0.0, 1.0);
                    if after < self.config.satellite_threshold {
                        (FunnelStage::Finalized, TransitionReason::BelowSatelliteThreshold, adjustment, note)
                    } else {
                        (FunnelStage::StreetReview, TransitionReason::AboveSatelliteThreshold, adjustment, note)
                    }
                }
                FunnelStage::StreetReview => {
                    let (adjustment, note) = self.street_adjustment(location_id, location);
                    (FunnelStage::Finalized, TransitionReason::StreetReviewed, adjustment, note)
                }
                FunnelStage::Finalized => break,
            };
            let after = (score + adjustment).clamp(0.0, 1.0);
            if matches!(stage, FunnelStage::SatelliteReview | FunnelStage::StreetReview) {
                stage_scores.push(StageScore { stage, score: after });
            }
            history.transitions.push(Transition {
                from: stage,
                to,
                reason,
                score_before: score,
                adjustment: after - score,
                score_after: after,
                note,
            });
            debug!(location_id, from = %stage, to = %to, score = after, "funnel transition");
            stage = to;
            score = after;
        }

        FunnelOutcome {
            stage_scores,
            final_confidence: score,
            history,
        }
    }

    /// `cap · (2s − 1)` with `s` the mean of overgrowth and structural change.
    fn satellite_adjustment(&self, location_id: &str, location: &GeoPoint) -> (f64, String) {
        let source = Arc::clone(&self.satellite);
        let at = *location;
        match self.gateway.call(move || source.satellite_evidence(&at)) {
            Ok(evidence) if !(evidence.vegetation_index.is_finite() && evidence.structural_change.is_finite()) => {
                warn!(
                    location_id,
                    stage = %FunnelStage::SatelliteReview,
                    vegetation_index = evidence.vegetation_index,
                    structural_change = evidence.structural_change,
                    "non-finite satellite evidence; neutral adjustment"
                );
                (0.0, "satellite unavailable: non-finite reading".to_string())
            }
            Ok(evidence) => {
                let baseline = self.config.ndvi_baseline;
                let overgrowth = ((evidence.vegetation_index - baseline) / (1.0 - baseline)).clamp(0.0, 1.0);
                let structural = evidence.structural_change.clamp(0.0, 1.0);
                let signal = 0.5 * (overgrowth + structural);
                let cap = self.config.satellite_cap;
                let adjustment = (cap * (2.0 * signal - 1.0)).clamp(-cap, cap);
                (adjustment, satellite_note(overgrowth, structural))
            }
            Err(reason) => {
                warn!(location_id, stage = %FunnelStage::SatelliteReview, %reason, "satellite evidence unavailable; neutral adjustment");
                (0.0, format!("satellite unavailable: {reason}"))
            }
        }
    }

    /// `cap · (2b − 1)` with `b` the boarding score.
    fn street_adjustment(&self, location_id: &str, location: &GeoPoint) -> (f64, String) {
        let source = Arc::clone(&self.street);
        let at = *location;
        match self.gateway.call(move || source.street_evidence(&at)) {
            Ok(evidence) if !evidence.boarding_score.is_finite() => {
                warn!(
                    location_id,
                    stage = %FunnelStage::StreetReview,
                    boarding_score = evidence.boarding_score,
                    "non-finite street evidence; neutral adjustment"
                );
                (0.0, "street view unavailable: non-finite reading".to_string())
            }
            Ok(evidence) => {
                let boarding = evidence.boarding_score.clamp(0.0, 1.0);
                let cap = self.config.street_cap;
                let note = if boarding >= 0.5 {
                    "boarding detected"
                } else {
                    "no boarding detected"
                };
                ((cap * (2.0 * boarding - 1.0)).clamp(-cap, cap), note.to_string())
            }
            Err(reason) => {
                warn!(location_id, stage = %FunnelStage::StreetReview, %reason, "street evidence unavailable; neutral adjustment");
                (0.0, format!("street view unavailable: {reason}"))
            }
        }
    }
}

fn satellite_note(overgrowth: f64, structural: f64) -> String {
    let mut parts = Vec::new();
    if overgrowth >= 0.5 {
        parts.push("high vegetation index");
    }
    if structural >= 0.5 {
        parts.push("structural change");
    }
    if parts.is_empty() {
        "no satellite signs of neglect".to_string()
    } else {
        parts.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use derelict_spatial::GeoPoint;

    use super::{
        EvidenceFunnel, FunnelConfig, FunnelStage, NoEvidence, SatelliteEvidence, SatelliteEvidenceSource,
        StreetEvidence, StreetEvidenceSource, TransitionReason,
    };
    use crate::error::EvidenceUnavailable;

    #[derive(Default)]
    struct Fixed {
        satellite: Option<SatelliteEvidence>,
        street: Option<StreetEvidence>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl SatelliteEvidenceSource for Fixed {
        fn satellite_evidence(&self, _: &GeoPoint) -> Result<SatelliteEvidence, EvidenceUnavailable> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
            self.satellite.ok_or(EvidenceUnavailable::CloudCover { percent: 80.0 })
        }
    }

    impl StreetEvidenceSource for Fixed {
        fn street_evidence(&self, _: &GeoPoint) -> Result<StreetEvidence, EvidenceUnavailable> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
            self.street.ok_or(EvidenceUnavailable::NoCoverage)
        }
    }

    fn funnel(source: Arc<Fixed>, config: FunnelConfig) -> EvidenceFunnel {
        EvidenceFunnel::new(config, source.clone(), source).unwrap()
    }

    fn here() -> GeoPoint {
        GeoPoint::new(42.33, -83.05).unwrap()
    }

    #[test]
    fn low_base_finalizes_at_broad_without_calls() {
        let source = Arc::new(Fixed::default());
        let out = funnel(Arc::clone(&source), FunnelConfig::default()).run("loc-1", &here(), 0.2);
        assert_eq!(out.final_confidence, 0.2);
        assert_eq!(out.history.transitions.len(), 1);
        assert_eq!(out.history.transitions[0].reason, TransitionReason::BelowBroadThreshold);
        assert_eq!(out.history.evidence_requests(), 0);
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn satellite_boost_advances_to_street_review() {
        // Overgrowth 0.8 and structural change 0.8 give cap · 0.6 = +0.15.
        let source = Arc::new(Fixed {
            satellite: Some(SatelliteEvidence {
                vegetation_index: 0.8,
                structural_change: 0.8,
            }),
            street: Some(StreetEvidence { boarding_score: 0.5 }),
            ..Fixed::default()
        });
        let config = FunnelConfig::default().with_ndvi_baseline(0.0);
        let out = funnel(source, config).run("loc-2", &here(), 0.5);
        let satellite = &out.history.transitions[1];
        assert_eq!(satellite.from, FunnelStage::SatelliteReview);
        assert_eq!(satellite.to, FunnelStage::StreetReview);
        assert!((satellite.score_after - 0.65).abs() < 1e-12);
        assert_eq!(out.stage_scores.len(), 3);
        assert!((out.final_confidence - 0.65).abs() < 1e-12);
        assert_eq!(out.history.replay(), Some(out.final_confidence));
    }

    #[test]
    fn weak_satellite_evidence_finalizes_early() {
        let source = Arc::new(Fixed {
            satellite: Some(SatelliteEvidence {
                vegetation_index: 0.1,
                structural_change: 0.0,
            }),
            ..Fixed::default()
        });
        let out = funnel(Arc::clone(&source), FunnelConfig::default()).run("loc-3", &here(), 0.5);
        assert_eq!(out.history.transitions.last().unwrap().reason, TransitionReason::BelowSatelliteThreshold);
        assert!((out.final_confidence - 0.25).abs() < 1e-12);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unavailable_evidence_is_neutral() {
        let source = Arc::new(Fixed::default());
        let out = funnel(source, FunnelConfig::default()).run("loc-4", &here(), 0.7);
        assert_eq!(out.final_confidence, 0.7);
        assert!(out.history.transitions[1].note.contains("cloud cover"));
        assert_eq!(out.history.evidence_requests(), 2);
    }

    #[test]
    fn timeout_is_neutral() {
        let source = Arc::new(Fixed {
            satellite: Some(SatelliteEvidence {
                vegetation_index: 1.0,
                structural_change: 1.0,
            }),
            delay: Duration::from_millis(300),
            ..Fixed::default()
        });
        let config = FunnelConfig::default().with_call_timeout(Duration::from_millis(20));
        let out = funnel(source, config).run("loc-5", &here(), 0.5);
        assert_eq!(out.final_confidence, 0.5);
        assert!(out.history.transitions[1].note.contains("timed out"));
    }

    #[test]
    fn adjustments_stay_in_unit_interval() {
        let source = Arc::new(Fixed {
            satellite: Some(SatelliteEvidence {
                vegetation_index: 1.0,
                structural_change: 1.0,
            }),
            street: Some(StreetEvidence { boarding_score: 1.0 }),
            ..Fixed::default()
        });
        let out = funnel(source, FunnelConfig::default()).run("loc-6", &here(), 0.95);
        assert_eq!(out.final_confidence, 1.0);
        assert!(out.history.transitions.iter().all(|t| t.adjustment.abs() <= 0.25));
    }

    #[test]
    fn non_finite_evidence_is_neutral() {
        let source = Arc::new(Fixed {
            satellite: Some(SatelliteEvidence {
                vegetation_index: f64::NAN,
                structural_change: 0.9,
            }),
            street: Some(StreetEvidence {
                boarding_score: f64::INFINITY,
            }),
            ..Fixed::default()
        });
        let out = funnel(source, FunnelConfig::default()).run("loc-8", &here(), 0.5);
        assert_eq!(out.final_confidence, 0.5);
        assert_eq!(out.history.transitions[1].reason, TransitionReason::BelowSatelliteThreshold);
        assert_eq!(out.history.transitions[1].adjustment, 0.0);
        assert!(out.history.transitions[1].note.contains("non-finite"));
        assert_eq!(out.history.replay(), Some(0.5));

        // Street stage: a high base passes satellite review and meets the bad boarding score.
        let source = Arc::new(Fixed {
            satellite: Some(SatelliteEvidence {
                vegetation_index: 0.3,
                structural_change: 0.5,
            }),
            street: Some(StreetEvidence {
                boarding_score: f64::NAN,
            }),
            ..Fixed::default()
        });
        let out = funnel(source, FunnelConfig::default()).run("loc-9", &here(), 0.9);
        let street = out.history.transitions.last().unwrap();
        assert_eq!(street.from, FunnelStage::StreetReview);
        assert_eq!(street.adjustment, 0.0);
        assert!(street.note.contains("non-finite"));
        assert!((0.0..=1.0).contains(&out.final_confidence));
    }

    #[test]
    fn replay_rejects_tampered_history() {
        let funnel = EvidenceFunnel::new(FunnelConfig::default(), Arc::new(NoEvidence), Arc::new(NoEvidence)).unwrap();
        let mut out = funnel.run("loc-7", &here(), 0.8);
        assert_eq!(out.history.replay(), Some(0.8));
        out.history.transitions[1].adjustment = 0.1;
        assert_eq!(out.history.replay(), None);
    }

    #[test]
    fn invalid_thresholds_rejected() {
        let bad = FunnelConfig::default().with_broad_threshold(1.5);
        assert!(EvidenceFunnel::new(bad, Arc::new(NoEvidence), Arc::new(NoEvidence)).is_err());
        let bad = FunnelConfig::default().with_ndvi_baseline(1.0);
        assert!(bad.validate().is_err());
    }
}
