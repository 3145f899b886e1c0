//! Global minimum radius estimate.
//!
//! Every completed lookup reports how far the found node was from the queried
//! target. Sixteen times that distance, averaged over a bounded window, is the
//! smallest radius the observed lookup density can support; every topic's
//! radius is floored at this value.

use tracing::trace;

use crate::identity::Identity;

/// Largest representable prefix distance.
pub const MAX_RADIUS: u64 = u64::MAX;

/// Number of samples the running average approximates.
pub(crate) const MIN_RADIUS_WINDOW: u64 = 1024;

/// Multiplier applied to each lookup distance sample.
const SAMPLE_SCALE: f64 = 16.0;

#[derive(Debug, Clone)]
pub struct MinRadiusEstimator {
    window: u64,
    sum: f64,
    count: u64,
    min_radius: u64,
}

impl MinRadiusEstimator {
    pub fn new(window: u64) -> Self {
        Self {
            window: window.max(1),
            sum: 0.0,
            count: 0,
            min_radius: 0,
        }
    }

    /// Record the distance between a lookup target and the node it found.
    pub fn observe(&mut self, target: &Identity, found: &Identity) {
        self.observe_distance(target.prefix_distance(found));
    }

    pub fn observe_distance(&mut self, distance: u64) {
        let cap = (MAX_RADIUS / 2) as f64;
        let sample = (distance as f64 * SAMPLE_SCALE).min(cap);

        if self.count < self.window {
            self.count += 1;
        } else {
            self.sum -= self.sum / self.window as f64;
        }
        self.sum += sample;
        self.min_radius = (self.sum / self.count as f64) as u64;

        trace!(
            distance = distance,
            samples = self.count,
            min_radius = self.min_radius,
            "min radius sample"
        );
    }

    pub fn min_radius(&self) -> u64 {
        self.min_radius
    }

    pub fn samples(&self) -> u64 {
        self.count
    }
}

impl Default for MinRadiusEstimator {
    fn default() -> Self {
        Self::new(MIN_RADIUS_WINDOW)
    }
}
