use std::sync::Arc;

use media_types::{Representation, TrackType};
use parking_lot::Mutex;
use tracing::debug;

use super::estimator::{Estimator, RequestSample};
use crate::config::{AbrConfig, RepresentationConstraints};

/// Estimator shared by every buffer of one track type, so that bandwidth knowledge
/// survives Period transitions.
pub type SharedEstimator = Arc<Mutex<Box<dyn Estimator>>>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AbrReason {
    /// No bandwidth estimate yet, the configured initial bitrate was used.
    Initial,
    /// A manual bitrate is set.
    Manual,
    /// Chosen from the bandwidth estimate (bits per second, before any factor).
    Estimate { bandwidth: f64 },
}

#[derive(Debug, Clone)]
pub enum AbrDecision {
    Selected {
        representation: Arc<Representation>,
        reason: AbrReason,
    },
    /// Every Representation is excluded by the constraints.
    NoValidRepresentation,
}

impl AbrDecision {
    pub fn representation(&self) -> Option<&Arc<Representation>> {
        match self {
            Self::Selected { representation, .. } => Some(representation),
            Self::NoValidRepresentation => None,
        }
    }
}

/// Chooses a Representation for one track type.
pub struct AbrManager {
    track_type: TrackType,
    estimator: SharedEstimator,
    starving: bool,
}

impl AbrManager {
    pub fn new(track_type: TrackType, estimator: SharedEstimator) -> Self {
        Self {
            track_type,
            estimator,
            starving: false,
        }
    }

    pub fn add_sample(&self, sample: RequestSample) {
        self.estimator.lock().add_sample(sample);
    }

    pub fn is_starving(&self) -> bool {
        self.starving
    }

    /// Picks the Representation to buffer given the current buffer gap.
    ///
    /// `representations` must be sorted by ascending bitrate.
    pub fn select(
        &mut self,
        representations: &[Arc<Representation>],
        buffer_gap: f64,
        config: &AbrConfig,
        constraints: &RepresentationConstraints,
    ) -> AbrDecision {
        let candidates: Vec<&Arc<Representation>> = representations
            .iter()
            .filter(|r| !constraints.excluded.iter().any(|id| *id == r.id))
            .collect();

        if let Some(manual) = constraints.manual_bitrate {
            return match highest_under(&candidates, manual as f64) {
                Some(representation) => AbrDecision::Selected {
                    representation,
                    reason: AbrReason::Manual,
                },
                None => AbrDecision::NoValidRepresentation,
            };
        }

        self.update_starvation(buffer_gap, config);
        let estimate = self.estimator.lock().estimate();
        let (mut target, reason) = match estimate {
            Some(bandwidth) => {
                let factor = if self.starving {
                    config.starvation_bitrate_factor
                } else {
                    config.regular_bitrate_factor
                };
                (bandwidth * factor, AbrReason::Estimate { bandwidth })
            }
            None => (
                *config.initial_bitrate.get(self.track_type) as f64,
                AbrReason::Initial,
            ),
        };
        if let Some(min) = constraints.min_auto_bitrate {
            target = target.max(min as f64);
        }
        if let Some(max) = constraints.max_auto_bitrate {
            target = target.min(max as f64);
        }

        let Some(representation) = highest_under(&candidates, target) else {
            return AbrDecision::NoValidRepresentation;
        };
        debug!(
            track = %self.track_type,
            target_bps = target,
            starving = self.starving,
            representation = %representation.id,
            bitrate = representation.bitrate,
            "ABR selection"
        );
        AbrDecision::Selected {
            representation,
            reason,
        }
    }

    fn update_starvation(&mut self, buffer_gap: f64, config: &AbrConfig) {
        if !self.starving && buffer_gap <= config.starvation_gap {
            debug!(track = %self.track_type, buffer_gap, "Entering starvation mode");
            self.starving = true;
        } else if self.starving && buffer_gap >= config.out_of_starvation_gap {
            debug!(track = %self.track_type, buffer_gap, "Leaving starvation mode");
            self.starving = false;
        }
    }
}

/// Highest bitrate not above `target`, or the lowest one when none fits.
fn highest_under(candidates: &[&Arc<Representation>], target: f64) -> Option<Arc<Representation>> {
    let fitting = candidates
        .iter()
        .filter(|r| r.bitrate as f64 <= target)
        .max_by_key(|r| r.bitrate);
    fitting
        .or_else(|| candidates.iter().min_by_key(|r| r.bitrate))
        .map(|r| Arc::clone(r))
}
