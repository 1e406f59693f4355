//! Episode records produced by collectors and consumed by the learner.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// What the policy sees at one decision point.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    /// Grayscale plane, `height * width` bytes, row-major.
    pub pixels: Vec<u8>,
    /// Float features (speed, orientation, upcoming zone centers in car frame).
    pub features: Vec<f32>,
}

impl Observation {
    pub fn new(pixels: Vec<u8>, features: Vec<f32>) -> Self {
        Self { pixels, features }
    }
}

/// Per-step reward, kept by component so reward shaping stays inspectable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RewardParts {
    pub time: f32,
    pub velocity: f32,
    pub press_forward: f32,
    pub terminal: f32,
}

impl RewardParts {
    pub fn total(&self) -> f32 {
        self.time + self.velocity + self.press_forward + self.terminal
    }

    /// A reward made of a single lump (tests, synthetic rollouts).
    pub fn lump(r: f32) -> Self {
        Self {
            time: r,
            ..Self::default()
        }
    }
}

/// One decision of an episode.
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub observation: Arc<Observation>,
    pub action: u8,
    pub rewards: RewardParts,
    /// Per-action scores of the policy that chose `action`.
    pub scores: Vec<f32>,
    /// `action` equals the argmax of `scores`.
    pub was_greedy: bool,
    pub policy_version: u64,
    /// Engine time of the decision.
    pub race_time_ms: i32,
    /// Zone the car was in when deciding.
    pub zone: u32,
    /// Episode ended right after this step with nothing to bootstrap from.
    pub terminal: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeOutcome {
    Finished,
    TimedOut,
}

impl EpisodeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EpisodeOutcome::Finished => "finished",
            EpisodeOutcome::TimedOut => "timed_out",
        }
    }
}

/// Simulator noise observed during one episode. Never an error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnomalyCounters {
    /// Frame identical to the previous one.
    pub duplicate_frames: u32,
    /// Run-step whose engine time is not previous + one engine step.
    pub desync_steps: u32,
    /// Zero-length simulation state at a decision point.
    pub empty_snapshots: u32,
    /// On-connect sync received mid-episode.
    pub reconnect_events: u32,
}

impl AnomalyCounters {
    pub fn total(&self) -> u32 {
        self.duplicate_frames + self.desync_steps + self.empty_snapshots + self.reconnect_events
    }
}

/// Complete record of one episode, in temporal order.
#[derive(Debug, Clone)]
pub struct Rollout {
    pub collector_id: u32,
    pub steps: Vec<StepRecord>,
    /// Observation after the last step when the episode was cut short.
    pub final_observation: Option<Arc<Observation>>,
    pub outcome: EpisodeOutcome,
    pub race_time_ms: i32,
    /// Engine time at which each zone was entered; index 0 is the start zone.
    pub zone_entrance_times_ms: Vec<i32>,
    pub anomalies: AnomalyCounters,
}

impl Rollout {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn is_finished(&self) -> bool {
        self.outcome == EpisodeOutcome::Finished
    }

    /// Last step is terminal.
    pub fn is_terminal(&self) -> bool {
        self.steps.last().map(|s| s.terminal).unwrap_or(false)
    }

    pub fn zones_reached(&self) -> usize {
        self.zone_entrance_times_ms.len().saturating_sub(1)
    }

    pub fn total_reward(&self) -> f32 {
        self.steps.iter().map(|s| s.rewards.total()).sum()
    }

    pub fn policy_versions(&self) -> (u64, u64) {
        let lo = self.steps.iter().map(|s| s.policy_version).min().unwrap_or(0);
        let hi = self.steps.iter().map(|s| s.policy_version).max().unwrap_or(0);
        (lo, hi)
    }
}
