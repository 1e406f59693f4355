//! pl-core: shared data model (actions, observations, rollouts, transitions) and configuration.

pub mod action;
pub mod config;
pub mod rollout;
pub mod transition;

pub use action::{
    action_to_inputs, argmax, inputs_to_action, InputState, A, ACTIONS, ACTION_BACKWARD, ACTION_FORWARD,
};
pub use config::{Config, ConfigError, NonGreedyWindows, Schedule, StrategyKind};
pub use rollout::{AnomalyCounters, EpisodeOutcome, Observation, RewardParts, Rollout, StepRecord};
pub use transition::Transition;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
