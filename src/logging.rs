//! Deterministic sampling for high-frequency per-pod log lines.
//!
//! At hundreds of thousands of pods per minute, logging every dispatch
//! drowns the interesting lines. Call sites that fire once per pod gate
//! their verbose output through a [`Sampler`] keyed on the pod key, so the
//! same 1-in-N pods are traced end to end on every peer.

use crate::membership::fnv1a_32;

#[derive(Debug, Clone, Copy)]
pub struct Sampler {
    rate: u32,
}

impl Sampler {
    pub fn new(rate: u32) -> Self {
        Self { rate: rate.max(1) }
    }

    /// True for roughly one key in `rate`. Stable across peers and restarts.
    pub fn should_log(&self, key: &str) -> bool {
        self.rate <= 1 || fnv1a_32(key.as_bytes()) % self.rate == 0
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new(100)
    }
}
