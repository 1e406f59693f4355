//! Rollout -> n-step transitions.
//!
//! A window starts at every step `i` and spans up to `n_max` steps, shrinking
//! at the end of the rollout instead of wrapping. The discounted return sums
//! the window's rewards; the bootstrap target is the observation right after
//! the window, or none when the window reaches a terminal step.

use std::sync::Arc;

use pl_core::config::NStepConfig;
use pl_core::{NonGreedyWindows, Observation, Rollout, Transition};
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;

use crate::buffer::{Split, SplitBuffers};

/// Counters for one rollout's worth of windows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FillReport {
    pub windows: usize,
    pub train: usize,
    pub test: usize,
    /// Dropped because an intermediate action was not greedy.
    pub dropped_non_greedy: usize,
    /// Shortened at the first non-greedy intermediate action.
    pub truncated: usize,
    /// Reached the end of a cut-short rollout with nothing to bootstrap from.
    pub dropped_no_bootstrap: usize,
}

impl FillReport {
    pub fn produced(&self) -> usize {
        self.train + self.test
    }

    pub fn merge(&mut self, o: &FillReport) {
        self.windows += o.windows;
        self.train += o.train;
        self.test += o.test;
        self.dropped_non_greedy += o.dropped_non_greedy;
        self.truncated += o.truncated;
        self.dropped_no_bootstrap += o.dropped_no_bootstrap;
    }
}

enum Window {
    Full(usize),
    Truncated(usize),
    Dropped,
}

fn window(r: &Rollout, i: usize, n_max: usize, policy: NonGreedyWindows) -> Window {
    let full = n_max.min(r.steps.len() - i);
    // Intermediate actions: every action in the window after the first.
    let first_off_policy = (i + 1..i + full).find(|&j| !r.steps[j].was_greedy);
    match (policy, first_off_policy) {
        (_, None) | (NonGreedyWindows::Keep, _) => Window::Full(full),
        (NonGreedyWindows::Drop, Some(_)) => Window::Dropped,
        (NonGreedyWindows::Truncate, Some(j)) => Window::Truncated(j - i),
    }
}

/// All transitions a rollout yields under `cfg`, in step order.
pub fn build_transitions(r: &Rollout, cfg: &NStepConfig) -> (Vec<Transition>, FillReport) {
    let mut report = FillReport {
        windows: r.steps.len(),
        ..FillReport::default()
    };
    let mut out = Vec::with_capacity(r.steps.len());
    let n_max = cfg.n_max.max(1) as usize;
    let terminal_end = r.is_terminal();

    for i in 0..r.steps.len() {
        let (n, truncated) = match window(r, i, n_max, cfg.non_greedy) {
            Window::Full(n) => (n, false),
            Window::Truncated(n) => (n, true),
            Window::Dropped => {
                report.dropped_non_greedy += 1;
                continue;
            }
        };

        let end = i + n;
        let next_state: Option<Arc<Observation>> = if end < r.steps.len() {
            Some(Arc::clone(&r.steps[end].observation))
        } else if terminal_end {
            None
        } else if let Some(f) = &r.final_observation {
            Some(Arc::clone(f))
        } else {
            report.dropped_no_bootstrap += 1;
            continue;
        };

        let mut ret = 0.0f32;
        let mut disc = 1.0f32;
        for s in &r.steps[i..end] {
            ret += disc * s.rewards.total();
            disc *= cfg.gamma;
        }

        if truncated {
            report.truncated += 1;
        }
        let greedy_path = r.steps[i + 1..end].iter().all(|s| s.was_greedy);
        out.push(Transition {
            state: Arc::clone(&r.steps[i].observation),
            action: r.steps[i].action,
            n_step_return: ret,
            next_state,
            n: n as u8,
            gamma: cfg.gamma,
            bootstrap_discount: cfg.gamma.powi(n as i32),
            greedy_path,
        });
    }
    (out, report)
}

/// Builds transitions and routes each one to the train or test store.
pub struct TransitionBuilder {
    cfg: NStepConfig,
    rng: ChaCha8Rng,
}

impl TransitionBuilder {
    pub fn new(cfg: NStepConfig, seed: u64) -> Self {
        Self {
            cfg,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn config(&self) -> &NStepConfig {
        &self.cfg
    }

    /// Later rollouts use the new settings; transitions already built keep theirs.
    pub fn set_config(&mut self, cfg: NStepConfig) {
        self.cfg = cfg;
    }

    /// Consume one rollout into the buffers.
    pub fn fill(&mut self, r: &Rollout, buffers: &mut SplitBuffers) -> FillReport {
        let (transitions, mut report) = build_transitions(r, &self.cfg);
        for t in transitions {
            match buffers.route(t, self.cfg.test_ratio, &mut self.rng) {
                Split::Train => report.train += 1,
                Split::Test => report.test += 1,
            }
        }
        report
    }
}
