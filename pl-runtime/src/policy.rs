//! Policy interface seen by the episode driver.

use std::sync::Arc;

use pl_core::{Observation, A};

/// Inference entry point of a policy snapshot.
///
/// `scores[a]` ranks action `a`; the greedy action is the first maximum.
pub trait Policy: Send + Sync {
    /// Version of the snapshot these weights came from.
    fn version(&self) -> u64;
    fn scores(&self, obs: &Observation) -> Vec<f32>;
}

/// Where the driver gets its policy. Consulted once per decision, so a newer
/// snapshot takes effect at the next decision point and never mid-decision.
pub trait PolicySource {
    fn current(&mut self) -> Arc<dyn Policy>;
}

impl PolicySource for Arc<dyn Policy> {
    fn current(&mut self) -> Arc<dyn Policy> {
        Arc::clone(self)
    }
}

/// Fixed scores regardless of the observation.
#[derive(Debug, Clone)]
pub struct ConstantPolicy {
    version: u64,
    scores: Vec<f32>,
}

impl ConstantPolicy {
    pub fn new(version: u64, scores: Vec<f32>) -> Self {
        Self { version, scores }
    }

    /// Prefers `action`, all others tied below it.
    pub fn preferring(version: u64, action: u8) -> Self {
        let mut scores = vec![0.0f32; A];
        if let Some(s) = scores.get_mut(action as usize) {
            *s = 1.0;
        }
        Self::new(version, scores)
    }
}

impl Policy for ConstantPolicy {
    fn version(&self) -> u64 {
        self.version
    }

    fn scores(&self, _obs: &Observation) -> Vec<f32> {
        self.scores.clone()
    }
}
