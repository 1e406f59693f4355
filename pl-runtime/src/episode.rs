//! Episode driver: runs one episode against a [`Simulator`] and records a [`Rollout`].
//!
//! Each engine step arrives as a run-step sync event. Every `ms_per_action`
//! of engine time is a decision point: the driver reads the simulation state,
//! requests a frame and releases the simulator; when the frame arrives it
//! builds the observation, asks the policy, applies the inputs and releases
//! the simulator again. Rewards of a step are settled at the following
//! decision (or at termination), once the car's resulting speed is known.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use pl_core::config::{Config, RewardConfig};
use pl_core::{
    action_to_inputs, AnomalyCounters, EpisodeOutcome, Observation, RewardParts, Rollout,
    StepRecord,
};
use pl_features::{build_observation, ZoneTracker};
use pl_proto::{ClientError, ErrorClass, Event, Frame, SimulationSnapshot};
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use thiserror::Error;

use crate::exploration::Exploration;
use crate::policy::PolicySource;
use crate::sim::Simulator;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("simulator: {0}")]
    Client(#[from] ClientError),
    #[error("episode exceeded {0} sync events")]
    EventBudget(u64),
    #[error("policy returned {got} scores, expected exactly one per action")]
    BadScores { got: usize },
    #[error("shutdown requested")]
    Shutdown,
}

impl DriverError {
    /// The session can no longer be used; the collector must reconnect.
    pub fn is_session_fatal(&self) -> bool {
        match self {
            DriverError::Client(e) => e.class() != ErrorClass::Timeout,
            DriverError::EventBudget(_) | DriverError::BadScores { .. } | DriverError::Shutdown => {
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpisodeState {
    Idle,
    Running,
    Finished,
    TimedOut,
    Aborted,
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub engine_step_ms: i32,
    pub ms_per_action: i32,
    pub frame_width: u32,
    pub frame_height: u32,
    pub running_speed: f32,
    pub simulator_timeout_ms: u32,
    pub max_overall_duration_ms: i32,
    pub max_minirace_duration_ms: i32,
    pub max_events_per_episode: u64,
    pub zone_centers_in_inputs: usize,
    pub rewards: RewardConfig,
}

impl DriverConfig {
    pub fn from_config(cfg: &Config) -> Self {
        let s = &cfg.simulator;
        Self {
            engine_step_ms: s.engine_step_ms as i32,
            ms_per_action: s.ms_per_action() as i32,
            frame_width: s.frame_width,
            frame_height: s.frame_height,
            running_speed: s.running_speed,
            simulator_timeout_ms: s.simulator_timeout_ms,
            max_overall_duration_ms: s.max_overall_duration_ms,
            max_minirace_duration_ms: s.max_minirace_duration_ms,
            max_events_per_episode: s.max_events_per_episode,
            zone_centers_in_inputs: cfg.features.zone_centers_in_inputs,
            rewards: cfg.rewards.clone(),
        }
    }

    /// Step reward for holding `action` for one decision period and ending at `speed`.
    pub fn step_reward(&self, action: u8, speed: f32) -> RewardParts {
        let ms = self.ms_per_action as f32;
        let r = &self.rewards;
        let accelerates = action_to_inputs(action).map(|i| i.accelerate).unwrap_or(false);
        RewardParts {
            time: r.per_ms_in_race * ms,
            velocity: r.per_ms_velocity * ms * speed,
            press_forward: if accelerates {
                r.per_ms_press_forward * ms
            } else {
                0.0
            },
            terminal: 0.0,
        }
    }
}

/// Decision in progress: state captured, frame requested, not yet answered.
struct Decision {
    snapshot: SimulationSnapshot,
    time_ms: i32,
    minirace_elapsed_ms: i32,
    timed_out: bool,
}

/// Bookkeeping for the episode in flight.
struct Episode {
    steps: Vec<StepRecord>,
    /// Last step's reward has not been settled yet.
    open_step: bool,
    anomalies: AnomalyCounters,
    last_run_step: Option<i32>,
    last_frame: Option<Vec<u8>>,
    last_speed: f32,
    minirace_start_ms: i32,
    events: u64,
    decision: Option<Decision>,
}

impl Episode {
    fn new() -> Self {
        Self {
            steps: Vec::new(),
            open_step: false,
            anomalies: AnomalyCounters::default(),
            last_run_step: None,
            last_frame: None,
            last_speed: 0.0,
            minirace_start_ms: 0,
            events: 0,
            decision: None,
        }
    }
}

pub struct EpisodeDriver {
    cfg: DriverConfig,
    zones: ZoneTracker,
    rng: ChaCha8Rng,
    state: EpisodeState,
    episodes: u64,
}

impl EpisodeDriver {
    pub fn new(cfg: DriverConfig, zone_centers: Vec<[f32; 3]>, seed: u64) -> Self {
        Self {
            cfg,
            zones: ZoneTracker::new(zone_centers),
            rng: ChaCha8Rng::seed_from_u64(seed),
            state: EpisodeState::Idle,
            episodes: 0,
        }
    }

    pub fn state(&self) -> EpisodeState {
        self.state
    }

    pub fn config(&self) -> &DriverConfig {
        &self.cfg
    }

    pub fn episodes_started(&self) -> u64 {
        self.episodes
    }

    /// Answer an on-connect sync event: configure the session, then release it.
    pub fn answer_on_connect<S: Simulator + ?Sized>(&self, sim: &mut S) -> Result<(), ClientError> {
        sim.set_timeout(self.cfg.simulator_timeout_ms)?;
        sim.set_on_step_period(self.cfg.engine_step_ms as u32)?;
        sim.ack()
    }

    /// Run one episode to completion.
    ///
    /// On error the state is `Aborted` and whatever was recorded is discarded.
    pub fn run_episode<S: Simulator + ?Sized>(
        &mut self,
        sim: &mut S,
        policy: &mut dyn PolicySource,
        exploration: &Exploration,
        collector_id: u32,
        stop: &AtomicBool,
    ) -> Result<Rollout, DriverError> {
        self.state = EpisodeState::Running;
        self.episodes += 1;
        match self.drive(sim, policy, exploration, collector_id, stop) {
            Ok(r) => {
                self.state = if r.is_finished() {
                    EpisodeState::Finished
                } else {
                    EpisodeState::TimedOut
                };
                Ok(r)
            }
            Err(e) => {
                self.state = EpisodeState::Aborted;
                Err(e)
            }
        }
    }

    fn drive<S: Simulator + ?Sized>(
        &mut self,
        sim: &mut S,
        policy: &mut dyn PolicySource,
        exploration: &Exploration,
        collector_id: u32,
        stop: &AtomicBool,
    ) -> Result<Rollout, DriverError> {
        sim.give_up()?;
        sim.set_speed(self.cfg.running_speed)?;
        self.zones.reset(0);
        let mut ep = Episode::new();

        loop {
            if stop.load(Ordering::Relaxed) {
                return Err(DriverError::Shutdown);
            }
            ep.events += 1;
            if ep.events > self.cfg.max_events_per_episode {
                return Err(DriverError::EventBudget(self.cfg.max_events_per_episode));
            }

            match sim.await_event()? {
                Event::OnConnect => {
                    if ep.last_run_step.is_some() {
                        ep.anomalies.reconnect_events += 1;
                    }
                    self.answer_on_connect(sim)?;
                }
                Event::RunStep { time_ms } => {
                    self.on_run_step(sim, &mut ep, time_ms)?;
                    sim.ack()?;
                }
                Event::CheckpointCountChanged { current, target } => {
                    if let Some(t) = ep.last_run_step {
                        ep.minirace_start_ms = t;
                    }
                    if current == target && sim.race_finished()? {
                        sim.prevent_simulation_finish()?;
                        if ep.decision.take().is_some() {
                            sim.unrequest_frame()?;
                        }
                        sim.ack()?;
                        return Ok(self.finish(ep, collector_id));
                    }
                    sim.ack()?;
                }
                Event::LapCountChanged { .. } => sim.ack()?,
                Event::FrameReady(frame) => {
                    let Some(decision) = ep.decision.take() else {
                        // Stray frame from a request already withdrawn.
                        sim.unrequest_frame()?;
                        sim.ack()?;
                        continue;
                    };
                    let obs = Arc::new(self.observe(&mut ep, &frame, &decision));
                    if decision.timed_out {
                        sim.unrequest_frame()?;
                        sim.ack()?;
                        return Ok(self.time_out(ep, obs, decision.time_ms, collector_id));
                    }
                    if let Err(e) = self.decide(sim, &mut ep, obs, &decision, policy, exploration) {
                        if !e.is_session_fatal() {
                            // Leave the session released: no frame request, nothing unacknowledged.
                            sim.unrequest_frame()?;
                            sim.ack()?;
                        }
                        return Err(e);
                    }
                    sim.ack()?;
                }
            }
        }
    }

    fn on_run_step<S: Simulator + ?Sized>(
        &mut self,
        sim: &mut S,
        ep: &mut Episode,
        time_ms: i32,
    ) -> Result<(), DriverError> {
        if let Some(prev) = ep.last_run_step {
            if time_ms >= 0 && time_ms != prev + self.cfg.engine_step_ms {
                ep.anomalies.desync_steps += 1;
            }
        }
        ep.last_run_step = Some(time_ms);

        let is_decision = time_ms >= 0 && time_ms % self.cfg.ms_per_action == 0;
        if !is_decision || ep.decision.is_some() {
            return Ok(());
        }

        let snapshot = sim.get_simulation_state()?;
        match snapshot.dynamics() {
            Some(d) => {
                if self.zones.update(&d.position, time_ms) > 0 {
                    ep.minirace_start_ms = time_ms;
                }
                ep.last_speed = d.speed();
            }
            None => ep.anomalies.empty_snapshots += 1,
        }
        self.settle_open_step(ep, 0.0);

        let minirace_elapsed_ms = time_ms - ep.minirace_start_ms;
        let timed_out = time_ms >= self.cfg.max_overall_duration_ms
            || minirace_elapsed_ms >= self.cfg.max_minirace_duration_ms;

        sim.request_frame(self.cfg.frame_width, self.cfg.frame_height)?;
        ep.decision = Some(Decision {
            snapshot,
            time_ms,
            minirace_elapsed_ms,
            timed_out,
        });
        Ok(())
    }

    fn observe(&self, ep: &mut Episode, frame: &Frame, decision: &Decision) -> Observation {
        if ep.last_frame.as_deref() == Some(frame.data.as_slice()) {
            ep.anomalies.duplicate_frames += 1;
        }
        let obs = build_observation(
            frame,
            &decision.snapshot,
            &self.zones,
            decision.minirace_elapsed_ms,
            self.cfg.max_minirace_duration_ms,
            self.cfg.zone_centers_in_inputs,
        );
        ep.last_frame = Some(frame.data.clone());
        obs
    }

    fn decide<S: Simulator + ?Sized>(
        &mut self,
        sim: &mut S,
        ep: &mut Episode,
        obs: Arc<Observation>,
        decision: &Decision,
        source: &mut dyn PolicySource,
        exploration: &Exploration,
    ) -> Result<(), DriverError> {
        let policy = source.current();
        let scores = policy.scores(&obs);
        if scores.len() != pl_core::A {
            return Err(DriverError::BadScores { got: scores.len() });
        }
        let choice = exploration.choose_action(&scores, &mut self.rng);
        let inputs = action_to_inputs(choice.action).unwrap_or_default();
        sim.set_input_state(inputs)?;
        sim.unrequest_frame()?;
        ep.steps.push(StepRecord {
            observation: obs,
            action: choice.action,
            rewards: RewardParts::default(),
            scores,
            was_greedy: choice.was_greedy,
            policy_version: policy.version(),
            race_time_ms: decision.time_ms,
            zone: self.zones.current_zone() as u32,
            terminal: false,
        });
        ep.open_step = true;
        Ok(())
    }

    fn settle_open_step(&self, ep: &mut Episode, terminal_reward: f32) {
        if !ep.open_step {
            return;
        }
        ep.open_step = false;
        let speed = ep.last_speed;
        if let Some(last) = ep.steps.last_mut() {
            last.rewards = self.cfg.step_reward(last.action, speed);
            last.rewards.terminal = terminal_reward;
        }
    }

    fn finish(&mut self, mut ep: Episode, collector_id: u32) -> Rollout {
        let race_time_ms = ep.last_run_step.unwrap_or(0);
        if ep.open_step {
            self.settle_open_step(&mut ep, self.cfg.rewards.on_finish);
        } else if let Some(last) = ep.steps.last_mut() {
            last.rewards.terminal += self.cfg.rewards.on_finish;
        }
        if let Some(last) = ep.steps.last_mut() {
            last.terminal = true;
        }
        Rollout {
            collector_id,
            steps: ep.steps,
            final_observation: None,
            outcome: EpisodeOutcome::Finished,
            race_time_ms,
            zone_entrance_times_ms: self.zones.entrance_times_ms().to_vec(),
            anomalies: ep.anomalies,
        }
    }

    fn time_out(
        &mut self,
        mut ep: Episode,
        final_obs: Arc<Observation>,
        time_ms: i32,
        collector_id: u32,
    ) -> Rollout {
        // The last step was already settled at this decision point.
        if let Some(last) = ep.steps.last_mut() {
            last.rewards.terminal += self.cfg.rewards.on_failed_to_finish;
        }
        ep.open_step = false;
        Rollout {
            collector_id,
            steps: ep.steps,
            final_observation: Some(final_obs),
            outcome: EpisodeOutcome::TimedOut,
            race_time_ms: time_ms,
            zone_entrance_times_ms: self.zones.entrance_times_ms().to_vec(),
            anomalies: ep.anomalies,
        }
    }
}
