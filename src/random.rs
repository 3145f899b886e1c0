//! Random variates consumed by the ticket store.
//!
//! Both the probabilistic ticket retention and the lookup target selection
//! draw from a [`TicketRandom`] owned by the store, so tests can substitute a
//! scripted sequence.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub trait TicketRandom: Send {
    /// Uniform integer in `[0, bound)`. `bound` is never zero.
    fn below(&mut self, bound: u64) -> u64;

    /// Exponentially distributed variate with rate 1.
    fn exp(&mut self) -> f64;
}

#[derive(Debug)]
pub struct StdRandom {
    rng: StdRng,
}

impl StdRandom {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for StdRandom {
    fn default() -> Self {
        Self::new()
    }
}

impl TicketRandom for StdRandom {
    fn below(&mut self, bound: u64) -> u64 {
        debug_assert!(bound > 0, "below() needs a non-empty range");
        self.rng.gen_range(0..bound)
    }

    fn exp(&mut self) -> f64 {
        // Inverse CDF; 1 - u lies in (0, 1] so the log is finite.
        let u: f64 = self.rng.gen();
        -(1.0 - u).ln()
    }
}
