//! Training sample derived from a rollout window.

use std::sync::Arc;

use crate::rollout::Observation;

/// One n-step training sample.
///
/// `n_step_return` is already discounted with `gamma`; the bootstrap term for
/// `next_state` is `bootstrap_discount * V(next_state)` and is left to the
/// training step.
#[derive(Debug, Clone)]
pub struct Transition {
    pub state: Arc<Observation>,
    pub action: u8,
    pub n_step_return: f32,
    /// `None` when the window ends on a terminal step.
    pub next_state: Option<Arc<Observation>>,
    pub n: u8,
    /// Discount factor in force when this sample was built.
    pub gamma: f32,
    /// `gamma^n`.
    pub bootstrap_discount: f32,
    /// Every intermediate action of the window was greedy.
    pub greedy_path: bool,
}

impl Transition {
    pub fn is_terminal(&self) -> bool {
        self.next_state.is_none()
    }
}
