//! Collector loop: drive one simulator session episode after episode and feed
//! the learner.
//!
//! Session failures are handled here and never reach the learner: timeouts
//! abort the episode and keep the session, connection and protocol errors
//! recreate it. Every retry path is capped.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use pl_core::config::{Config, ExplorationConfig};
use pl_core::{EpisodeOutcome, Rollout};
use pl_logging::{AnomalyStatsV1, EpisodeEventV1, NdjsonError, NdjsonWriter, SessionEventV1};
use pl_proto::{ClientError, SimClient};
use pl_runtime::{
    DriverConfig, DriverError, EpisodeDriver, Exploration, Policy, PolicySource, Simulator,
};
use thiserror::Error;

use crate::model_slot::ModelSlot;
use crate::policy::{PolicyFactory, TrainingError};
use crate::progress::ProgressCounter;
use crate::queue::{QueueError, RolloutSender};
use crate::shutdown::ShutdownSignal;

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("collector {id}: gave up after {attempts} connect attempts: {last}")]
    ConnectRetriesExhausted {
        id: u32,
        attempts: u32,
        last: ClientError,
    },
    #[error("collector {0}: no initial policy snapshot was published")]
    NoPolicy(u32),
    #[error("policy: {0}")]
    Policy(#[from] TrainingError),
    #[error("log: {0}")]
    Log(#[from] NdjsonError),
}

/// Opens (and registers) a simulator session for a collector.
pub trait SimConnector: Send {
    type Session: Simulator;
    fn connect(&mut self, collector_id: u32) -> Result<Self::Session, ClientError>;
}

/// Real simulator over TCP; collector `i` uses `base_port + i`.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub host: String,
    pub base_port: u16,
    pub socket_timeout: Duration,
    pub simulator_timeout_ms: u32,
    pub step_period_ms: u32,
}

impl TcpConnector {
    pub fn from_config(cfg: &Config) -> Self {
        let s = &cfg.simulator;
        Self {
            host: s.host.clone(),
            base_port: s.base_port,
            socket_timeout: Duration::from_millis(s.socket_timeout_ms),
            simulator_timeout_ms: s.simulator_timeout_ms,
            step_period_ms: s.engine_step_ms,
        }
    }
}

impl SimConnector for TcpConnector {
    type Session = SimClient;

    fn connect(&mut self, collector_id: u32) -> Result<SimClient, ClientError> {
        let port = u16::try_from(collector_id)
            .ok()
            .and_then(|id| self.base_port.checked_add(id))
            .ok_or_else(|| {
                ClientError::Connect(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("port {} + {collector_id} is out of range", self.base_port),
                ))
            })?;
        let mut client =
            SimClient::connect((self.host.as_str(), port), Some(self.socket_timeout))?;
        client.register(self.simulator_timeout_ms, self.step_period_ms)?;
        Ok(client)
    }
}

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub id: u32,
    pub run_id: String,
    pub driver: DriverConfig,
    pub zone_centers: Vec<[f32; 3]>,
    pub exploration: ExplorationConfig,
    pub connect_retries: u32,
    pub connect_backoff: Duration,
    pub episode_retries: u32,
    pub seed: u64,
    /// Stop after this many completed episodes.
    pub max_episodes: Option<u64>,
}

impl CollectorConfig {
    pub fn from_config(cfg: &Config, id: u32, run_id: &str) -> Self {
        let o = &cfg.orchestration;
        Self {
            id,
            run_id: run_id.to_string(),
            driver: DriverConfig::from_config(cfg),
            zone_centers: cfg.features.zone_centers.clone(),
            exploration: cfg.exploration.clone(),
            connect_retries: o.connect_retries,
            connect_backoff: Duration::from_millis(o.connect_backoff_ms),
            episode_retries: o.episode_retries,
            seed: o.seed ^ (u64::from(id) + 1),
            max_episodes: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectorStats {
    pub episodes_finished: u64,
    pub episodes_timed_out: u64,
    pub episodes_failed: u64,
    pub rollouts_sent: u64,
    pub rollouts_lost: u64,
    pub sessions_opened: u64,
    pub steps: u64,
}

impl CollectorStats {
    pub fn episodes_completed(&self) -> u64 {
        self.episodes_finished + self.episodes_timed_out
    }
}

/// Policy source backed by a model slot: a newly published snapshot replaces
/// the active policy at the next decision point.
pub struct SlotPolicySource {
    slot: Arc<ModelSlot>,
    factory: Arc<dyn PolicyFactory>,
    active: Arc<dyn Policy>,
    swaps: u64,
}

impl SlotPolicySource {
    /// Takes the initial snapshot out of `slot`.
    pub fn new(
        slot: Arc<ModelSlot>,
        factory: Arc<dyn PolicyFactory>,
    ) -> Result<Option<Self>, TrainingError> {
        let Some(snap) = slot.take() else {
            return Ok(None);
        };
        let active = factory.build(&snap)?;
        Ok(Some(Self {
            slot,
            factory,
            active,
            swaps: 0,
        }))
    }

    pub fn version(&self) -> u64 {
        self.active.version()
    }

    pub fn swaps(&self) -> u64 {
        self.swaps
    }
}

impl PolicySource for SlotPolicySource {
    fn current(&mut self) -> Arc<dyn Policy> {
        if let Some(snap) = self.slot.take() {
            match self.factory.build(&snap) {
                Ok(p) => {
                    self.active = p;
                    self.swaps += 1;
                }
                // Keep acting with the previous weights.
                Err(e) => eprintln!("policy snapshot v{} rejected: {e}", snap.version),
            }
        }
        Arc::clone(&self.active)
    }
}

pub struct Collector<C: SimConnector> {
    cfg: CollectorConfig,
    connector: C,
    queue: RolloutSender,
    source: SlotPolicySource,
    progress: ProgressCounter,
    shutdown: ShutdownSignal,
    log: Option<NdjsonWriter>,
    driver: EpisodeDriver,
    stats: CollectorStats,
}

impl<C: SimConnector> Collector<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: CollectorConfig,
        connector: C,
        queue: RolloutSender,
        slot: Arc<ModelSlot>,
        factory: Arc<dyn PolicyFactory>,
        progress: ProgressCounter,
        shutdown: ShutdownSignal,
        log: Option<NdjsonWriter>,
    ) -> Result<Self, CollectorError> {
        let source =
            SlotPolicySource::new(slot, factory)?.ok_or(CollectorError::NoPolicy(cfg.id))?;
        let driver = EpisodeDriver::new(cfg.driver.clone(), cfg.zone_centers.clone(), cfg.seed);
        Ok(Self {
            cfg,
            connector,
            queue,
            source,
            progress,
            shutdown,
            log,
            driver,
            stats: CollectorStats::default(),
        })
    }

    fn session_event(
        &mut self,
        kind: &'static str,
        attempt: u32,
        detail: Option<String>,
    ) -> Result<(), NdjsonError> {
        if let Some(w) = self.log.as_mut() {
            w.write_event(&SessionEventV1 {
                event: "session",
                ts_ms: pl_logging::now_ms(),
                run_id: self.cfg.run_id.clone(),
                collector_id: self.cfg.id,
                kind,
                attempt,
                detail,
            })?;
        }
        Ok(())
    }

    fn connect(&mut self) -> Result<Option<C::Session>, CollectorError> {
        let attempts = self.cfg.connect_retries.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.connector.connect(self.cfg.id) {
                Ok(s) => {
                    self.stats.sessions_opened += 1;
                    self.session_event("connected", attempt, None)?;
                    return Ok(Some(s));
                }
                Err(e) => {
                    self.session_event("connect_failed", attempt, Some(e.to_string()))?;
                    if attempt >= attempts {
                        return Err(CollectorError::ConnectRetriesExhausted {
                            id: self.cfg.id,
                            attempts,
                            last: e,
                        });
                    }
                }
            }
            std::thread::sleep(self.cfg.connect_backoff);
            if self.shutdown.is_triggered() {
                return Ok(None);
            }
        }
    }

    fn close(&mut self, mut session: C::Session, reason: &'static str) -> Result<(), NdjsonError> {
        let detail = session.close().err().map(|e| e.to_string());
        self.session_event(reason, 0, detail)
    }

    fn exploration_for(&self, episode: u64) -> (Exploration, bool) {
        let k = u64::from(self.cfg.exploration.eval_every_episodes);
        if k > 0 && (episode + 1) % k == 0 {
            (Exploration::Greedy, true)
        } else {
            let e = Exploration::from_config(&self.cfg.exploration, self.progress.get());
            let greedy = e.is_greedy();
            (e, greedy)
        }
    }

    /// Run until shutdown, `max_episodes`, or the learner goes away.
    ///
    /// The session is always closed (sending `shutdown`) before returning.
    pub fn run(mut self) -> Result<CollectorStats, CollectorError> {
        let mut session: Option<C::Session> = None;
        let mut failures = 0u32;
        let mut episode = 0u64;

        let res = loop {
            if self.shutdown.is_triggered() {
                break Ok(());
            }
            if self
                .cfg
                .max_episodes
                .is_some_and(|m| self.stats.episodes_completed() >= m)
            {
                break Ok(());
            }
            let mut sim = match session.take() {
                Some(s) => s,
                None => match self.connect() {
                    Ok(Some(s)) => s,
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                },
            };

            let (exploration, greedy_eval) = self.exploration_for(episode);
            let result = self.driver.run_episode(
                &mut sim,
                &mut self.source,
                &exploration,
                self.cfg.id,
                self.shutdown.flag(),
            );
            match result {
                Ok(rollout) => {
                    failures = 0;
                    episode += 1;
                    session = Some(sim);
                    match self.complete(rollout, episode, greedy_eval) {
                        Ok(true) => {}
                        Ok(false) => break Ok(()),
                        Err(e) => break Err(e),
                    }
                }
                Err(DriverError::Shutdown) => {
                    session = Some(sim);
                    break Ok(());
                }
                Err(e) => {
                    failures += 1;
                    self.stats.episodes_failed += 1;
                    if let Err(le) = self.session_event("episode_failed", failures, Some(e.to_string())) {
                        session = Some(sim);
                        break Err(le.into());
                    }
                    if e.is_session_fatal() || failures > self.cfg.episode_retries {
                        failures = 0;
                        if let Err(le) = self.close(sim, "recreated") {
                            break Err(le.into());
                        }
                    } else {
                        session = Some(sim);
                    }
                }
            }
        };

        if let Some(sim) = session.take() {
            self.close(sim, "closed")?;
        }
        if let Some(w) = self.log.as_mut() {
            w.flush()?;
        }
        res.map(|()| self.stats)
    }

    /// Count, forward and log one rollout. `Ok(false)` when the learner is gone.
    fn complete(&mut self, r: Rollout, episode: u64, greedy_eval: bool) -> Result<bool, CollectorError> {
        let steps = r.len() as u64;
        match r.outcome {
            EpisodeOutcome::Finished => self.stats.episodes_finished += 1,
            EpisodeOutcome::TimedOut => self.stats.episodes_timed_out += 1,
        }
        self.stats.steps += steps;
        let progress = self.progress.add(steps);

        let (first_v, last_v) = r.policy_versions();
        let event = EpisodeEventV1 {
            event: "episode",
            ts_ms: pl_logging::now_ms(),
            run_id: self.cfg.run_id.clone(),
            collector_id: self.cfg.id,
            episode,
            outcome: r.outcome.as_str(),
            greedy_eval,
            steps,
            race_time_ms: r.race_time_ms,
            zones_reached: r.zones_reached() as u32,
            total_reward: r.total_reward(),
            policy_version_first: first_v,
            policy_version_last: last_v,
            progress,
            enqueued: false,
            anomalies: AnomalyStatsV1 {
                duplicate_frames: r.anomalies.duplicate_frames,
                desync_steps: r.anomalies.desync_steps,
                empty_snapshots: r.anomalies.empty_snapshots,
                reconnect_events: r.anomalies.reconnect_events,
            },
        };

        let (enqueued, keep_going) = match self.queue.send(r) {
            Ok(()) => {
                self.stats.rollouts_sent += 1;
                (true, true)
            }
            Err(QueueError::Overflow(_)) => {
                self.stats.rollouts_lost += 1;
                (false, true)
            }
            Err(QueueError::Disconnected) => (false, false),
        };
        if let Some(w) = self.log.as_mut() {
            w.write_event(&EpisodeEventV1 { enqueued, ..event })?;
        }
        Ok(keep_going)
    }
}
