//! Unified configuration schema.
//!
//! One YAML document configures the simulator link, reward shaping,
//! exploration, n-step construction, replay sizing and orchestration.
//! Every section has defaults so a partial file is enough.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Largest BGRA frame the wire accepts (same 64 MiB guard as other payloads).
pub const MAX_FRAME_BYTES: u64 = 64 * 1024 * 1024;

/// Configuration loading errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub simulator: SimulatorConfig,
    #[serde(default)]
    pub rewards: RewardConfig,
    #[serde(default)]
    pub exploration: ExplorationConfig,
    #[serde(default)]
    pub nstep: NStepConfig,
    #[serde(default)]
    pub replay: ReplayConfig,
    #[serde(default)]
    pub orchestration: OrchestrationConfig,
    #[serde(default)]
    pub features: FeatureConfig,
}

/// Simulator link and episode timing.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SimulatorConfig {
    pub host: String,
    /// Collector `i` talks to `base_port + i`.
    pub base_port: u16,
    /// Socket read/write timeout on the client side.
    pub socket_timeout_ms: u64,
    /// Value sent with `set-timeout`: how long the simulator waits for our answers.
    pub simulator_timeout_ms: u32,
    /// Game speed multiplier sent with `set-speed` on reset.
    pub running_speed: f32,
    pub engine_step_ms: u32,
    pub engine_steps_per_action: u32,
    pub frame_width: u32,
    pub frame_height: u32,
    pub max_overall_duration_ms: i32,
    /// Ceiling measured from the last checkpoint or zone entrance.
    pub max_minirace_duration_ms: i32,
    /// Hard cap on sync events handled in one episode.
    pub max_events_per_episode: u64,
}

impl SimulatorConfig {
    pub fn ms_per_action(&self) -> u32 {
        self.engine_step_ms * self.engine_steps_per_action
    }

    /// `None` when `base_port + collector_id` is not a valid port.
    pub fn port_for(&self, collector_id: u32) -> Option<u16> {
        u16::try_from(collector_id)
            .ok()
            .and_then(|id| self.base_port.checked_add(id))
    }
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            base_port: 8477,
            socket_timeout_ms: 10_000,
            simulator_timeout_ms: 2_000,
            running_speed: 20.0,
            engine_step_ms: 10,
            engine_steps_per_action: 5,
            frame_width: 160,
            frame_height: 120,
            max_overall_duration_ms: 50_000,
            max_minirace_duration_ms: 24_000,
            max_events_per_episode: 200_000,
        }
    }
}

/// Reward shaping, expressed per millisecond of engine time.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RewardConfig {
    pub per_ms_in_race: f32,
    /// Multiplied by speed (m/s).
    pub per_ms_velocity: f32,
    /// Paid when the chosen action accelerates.
    pub per_ms_press_forward: f32,
    pub on_finish: f32,
    pub on_failed_to_finish: f32,
}

impl Default for RewardConfig {
    fn default() -> Self {
        let ms_per_action = 50.0;
        Self {
            per_ms_in_race: -0.03 / ms_per_action,
            per_ms_velocity: 0.03 / ms_per_action / 800.0,
            per_ms_press_forward: 0.03 / ms_per_action / 8.0,
            on_finish: 1.0,
            on_failed_to_finish: 0.0,
        }
    }
}

/// Value annealed against the shared progress counter.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    Constant { value: f32 },
    /// Linear interpolation between `(progress, value)` points sorted by progress;
    /// clamped to the first/last value outside the range.
    PiecewiseLinear { points: Vec<(u64, f32)> },
}

impl Schedule {
    pub fn value_at(&self, progress: u64) -> f32 {
        match self {
            Schedule::Constant { value } => *value,
            Schedule::PiecewiseLinear { points } => {
                let (first, last) = match (points.first(), points.last()) {
                    (Some(f), Some(l)) => (f, l),
                    _ => return 0.0,
                };
                if progress <= first.0 {
                    return first.1;
                }
                if progress >= last.0 {
                    return last.1;
                }
                for w in points.windows(2) {
                    let (x0, y0) = w[0];
                    let (x1, y1) = w[1];
                    if progress >= x0 && progress <= x1 {
                        if x1 == x0 {
                            return y1;
                        }
                        let t = (progress - x0) as f64 / (x1 - x0) as f64;
                        return (y0 as f64 + t * (y1 as f64 - y0 as f64)) as f32;
                    }
                }
                last.1
            }
        }
    }

    fn is_sorted(&self) -> bool {
        match self {
            Schedule::Constant { .. } => true,
            Schedule::PiecewiseLinear { points } => points.windows(2).all(|w| w[0].0 <= w[1].0),
        }
    }
}

/// Which exploration strategy collectors use for training episodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Greedy,
    EpsilonGreedy,
    Boltzmann,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExplorationConfig {
    pub strategy: StrategyKind,
    /// Random-action probability for `epsilon_greedy`.
    pub epsilon: Schedule,
    /// Softmax temperature for `boltzmann`.
    pub tau: Schedule,
    /// Every k-th episode of a collector is run greedily for evaluation (0 disables).
    pub eval_every_episodes: u32,
}

impl Default for ExplorationConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::EpsilonGreedy,
            epsilon: Schedule::PiecewiseLinear {
                points: vec![(0, 1.0), (50_000, 0.1), (300_000, 0.03)],
            },
            tau: Schedule::Constant { value: 0.01 },
            eval_every_episodes: 5,
        }
    }
}

/// What to do with an n-step window whose intermediate actions were not all greedy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NonGreedyWindows {
    /// Keep every window (off-policy n-step).
    Keep,
    /// Drop the whole window.
    Drop,
    /// Cut the window just before the first non-greedy intermediate action.
    Truncate,
}

impl NonGreedyWindows {
    /// `discard_non_greedy = true` maps to `Drop`.
    pub fn from_discard_flag(discard: bool) -> Self {
        if discard {
            NonGreedyWindows::Drop
        } else {
            NonGreedyWindows::Keep
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NStepConfig {
    pub n_max: u8,
    pub gamma: f32,
    pub non_greedy: NonGreedyWindows,
    /// Probability that a transition is routed to the held-out test buffer.
    pub test_ratio: f32,
}

impl Default for NStepConfig {
    fn default() -> Self {
        Self {
            n_max: 3,
            gamma: 0.99,
            non_greedy: NonGreedyWindows::Drop,
            test_ratio: 0.05,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReplayConfig {
    pub capacity: usize,
    pub test_capacity: usize,
    pub batch_size: usize,
    /// Training starts once the train buffer holds this many transitions.
    pub min_size_to_learn: usize,
    /// If set, buffers are loaded from / saved to this directory at learner start / stop.
    pub persist_dir: Option<PathBuf>,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            capacity: 30_000 * 15,
            test_capacity: 30_000 * 15 / 20,
            batch_size: 512,
            min_size_to_learn: 10_000,
            persist_dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OrchestrationConfig {
    pub collectors: u32,
    /// Per-collector rollout queue capacity.
    pub rollout_queue_capacity: usize,
    /// How long a collector blocks on a full queue before dropping the rollout.
    pub enqueue_wait_ms: u64,
    /// Upper bound on rollouts taken from one queue per drain pass.
    pub max_rollouts_per_queue: usize,
    pub train_steps_per_drain: u32,
    pub publish_every_train_steps: u32,
    /// Learner idle wait when no queue is ready.
    pub idle_wait_ms: u64,
    pub connect_retries: u32,
    pub connect_backoff_ms: u64,
    /// Consecutive failed episodes before the session is recreated.
    pub episode_retries: u32,
    pub seed: u64,
    /// NDJSON logs and `run.json` go here when set.
    pub logs_dir: Option<PathBuf>,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            collectors: 2,
            rollout_queue_capacity: 2,
            enqueue_wait_ms: 30_000,
            max_rollouts_per_queue: 1,
            train_steps_per_drain: 4,
            publish_every_train_steps: 10,
            idle_wait_ms: 50,
            connect_retries: 5,
            connect_backoff_ms: 1_000,
            episode_retries: 3,
            seed: 444,
            logs_dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Upcoming zone centers included in the float features.
    pub zone_centers_in_inputs: usize,
    /// Virtual checkpoints along the track, in driving order (world coordinates).
    pub zone_centers: Vec<[f32; 3]>,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            zone_centers_in_inputs: 16,
            zone_centers: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let bad = |m: &str| Err(ConfigError::Invalid(m.to_string()));
        let s = &self.simulator;
        if s.engine_step_ms == 0 || s.engine_steps_per_action == 0 {
            return bad("simulator step timing must be > 0");
        }
        if s.frame_width == 0 || s.frame_height == 0 {
            return bad("frame size must be > 0");
        }
        let frame_bytes = u64::from(s.frame_width)
            .saturating_mul(u64::from(s.frame_height))
            .saturating_mul(4);
        if frame_bytes > MAX_FRAME_BYTES {
            return bad("frame exceeds the 64 MiB payload limit");
        }
        if s.max_overall_duration_ms <= 0 || s.max_minirace_duration_ms <= 0 {
            return bad("episode ceilings must be > 0");
        }
        let n = &self.nstep;
        if n.n_max == 0 {
            return bad("nstep.n_max must be > 0");
        }
        if !(n.gamma > 0.0 && n.gamma <= 1.0) {
            return bad("nstep.gamma must be in (0, 1]");
        }
        if !(0.0..1.0).contains(&n.test_ratio) {
            return bad("nstep.test_ratio must be in [0, 1)");
        }
        let r = &self.replay;
        if r.capacity == 0 || r.test_capacity == 0 || r.batch_size == 0 {
            return bad("replay capacities and batch size must be > 0");
        }
        let o = &self.orchestration;
        if o.rollout_queue_capacity == 0 || o.max_rollouts_per_queue == 0 {
            return bad("rollout queue capacity must be > 0");
        }
        if o.collectors > 0 && s.port_for(o.collectors - 1).is_none() {
            return bad("simulator.base_port + orchestration.collectors exceeds 65535");
        }
        if o.publish_every_train_steps == 0 {
            return bad("orchestration.publish_every_train_steps must be > 0");
        }
        if !self.exploration.epsilon.is_sorted() || !self.exploration.tau.is_sorted() {
            return bad("schedule points must be sorted by progress");
        }
        Ok(())
    }
}
