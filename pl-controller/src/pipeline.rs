//! Wires collectors, queues, model slots and the learner into one run.
//!
//! Collectors run on named threads; the learner runs on the calling thread.
//! When the learner returns, the shutdown signal is raised and every
//! collector is joined after closing its simulator session.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use pl_core::config::{Config, ConfigError};
use pl_logging::{NdjsonError, NdjsonWriter, RunManifestV1};
use pl_replay::{ReplayError, SplitBuffers};
use thiserror::Error;

use crate::collector::{Collector, CollectorConfig, CollectorError, CollectorStats, SimConnector};
use crate::learner::{Learner, LearnerConfig, LearnerError, LearnerStats};
use crate::model_slot::{ModelSlot, PolicySnapshot};
use crate::policy::{PolicyFactory, PolicyModel, TrainingError};
use crate::progress::ProgressCounter;
use crate::queue::rollout_queue;
use crate::shutdown::ShutdownSignal;

pub const POLICY_SNAPSHOT_FILE: &str = "policy.snapshot";

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("learner: {0}")]
    Learner(#[from] LearnerError),
    #[error("collector: {0}")]
    Collector(#[from] CollectorError),
    #[error("replay: {0}")]
    Replay(#[from] ReplayError),
    #[error("model: {0}")]
    Model(#[from] TrainingError),
    #[error("io/json error: {0}")]
    Log(#[from] NdjsonError),
    #[error("io error: {0}")]
    Fs(#[from] std::io::Error),
    #[error("no collectors configured")]
    NoCollectors,
    #[error("{0} thread panicked")]
    Panicked(String),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunLimits {
    pub max_train_steps: Option<u64>,
    pub max_episodes_per_collector: Option<u64>,
}

pub struct RunReport<M> {
    pub model: M,
    pub buffers: SplitBuffers,
    pub learner: LearnerStats,
    /// One entry per collector, in id order.
    pub collectors: Vec<Result<CollectorStats, CollectorError>>,
    pub progress: u64,
}

impl<M> RunReport<M> {
    pub fn rollouts_lost(&self) -> u64 {
        self.collectors
            .iter()
            .filter_map(|c| c.as_ref().ok())
            .map(|c| c.rollouts_lost)
            .sum()
    }

    pub fn episodes_completed(&self) -> u64 {
        self.collectors
            .iter()
            .filter_map(|c| c.as_ref().ok())
            .map(|c| c.episodes_completed())
            .sum()
    }
}

fn run_id_for(cfg: &Config) -> String {
    cfg.orchestration
        .logs_dir
        .as_deref()
        .and_then(|p| p.file_name())
        .and_then(|s| s.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| format!("run-{}", pl_logging::now_ms()))
}

fn ensure_manifest(logs_dir: &Path, cfg: &Config, run_id: &str) -> Result<RunManifestV1, ControllerError> {
    std::fs::create_dir_all(logs_dir)?;
    let run_json = logs_dir.join(pl_logging::MANIFEST_FILE);
    let config_hash = Some(pl_logging::hash_config_bytes(cfg.to_yaml()?.as_bytes()));
    let mut m = if run_json.exists() {
        pl_logging::read_manifest(&run_json)?
    } else {
        RunManifestV1 {
            run_manifest_version: pl_logging::RUN_MANIFEST_VERSION,
            run_id: run_id.to_string(),
            created_ts_ms: pl_logging::now_ms(),
            feature_schema_id: pl_features::FEATURE_SCHEMA_ID,
            action_count: pl_core::A,
            git_hash: pl_logging::try_git_hash(),
            config_hash: None,
            logs_dir: logs_dir.display().to_string(),
            replay_dir: None,
            episodes_completed: 0,
            rollouts_lost: 0,
            train_step: 0,
            policy_version: 0,
            progress: 0,
        }
    };
    m.config_hash = config_hash;
    m.replay_dir = cfg
        .replay
        .persist_dir
        .as_ref()
        .map(|p| p.display().to_string());
    pl_logging::write_manifest_atomic(&run_json, &m)?;
    Ok(m)
}

fn load_state<M: PolicyModel>(
    cfg: &Config,
    model: &mut M,
) -> Result<SplitBuffers, ControllerError> {
    let r = &cfg.replay;
    let Some(dir) = r.persist_dir.as_deref() else {
        return Ok(SplitBuffers::new(r.capacity, r.test_capacity)?);
    };
    pl_replay::cleanup_tmp_files(dir)?;
    let snap_path = dir.join(POLICY_SNAPSHOT_FILE);
    if snap_path.exists() {
        model.load_snapshot(&PolicySnapshot::read(&snap_path)?)?;
    }
    Ok(pl_replay::load_split(dir, r.capacity, r.test_capacity)?)
}

fn save_state<M: PolicyModel>(dir: &Path, model: &M, buffers: &SplitBuffers) -> Result<(), ControllerError> {
    std::fs::create_dir_all(dir)?;
    pl_replay::save_split(buffers, dir)?;
    model.snapshot().write_atomic(dir.join(POLICY_SNAPSHOT_FILE))?;
    Ok(())
}

fn open_log(dir: Option<&Path>, name: &str) -> Result<Option<NdjsonWriter>, ControllerError> {
    dir.map(|d| NdjsonWriter::open_append_with_flush(d.join(name), 16))
        .transpose()
        .map_err(Into::into)
}

/// Run collectors and the learner until the learner stops.
///
/// The learner stops on `shutdown`, on `limits.max_train_steps`, or once every
/// collector has hung up (e.g. after `limits.max_episodes_per_collector`).
pub fn run_pipeline<C, M>(
    cfg: &Config,
    connectors: Vec<C>,
    mut model: M,
    factory: Arc<dyn PolicyFactory>,
    limits: RunLimits,
    shutdown: ShutdownSignal,
) -> Result<RunReport<M>, ControllerError>
where
    C: SimConnector + 'static,
    M: PolicyModel,
{
    cfg.validate()?;
    if connectors.is_empty() {
        return Err(ControllerError::NoCollectors);
    }
    let run_id = run_id_for(cfg);
    let logs_dir: Option<PathBuf> = cfg.orchestration.logs_dir.clone();
    let mut manifest = match logs_dir.as_deref() {
        Some(d) => Some(ensure_manifest(d, cfg, &run_id)?),
        None => None,
    };
    let progress = ProgressCounter::starting_at(manifest.as_ref().map_or(0, |m| m.progress));
    let buffers = load_state(cfg, &mut model)?;
    eprintln!(
        "[{run_id}] starting: {} collectors, replay {}/{} restored",
        connectors.len(),
        buffers.train.len(),
        buffers.test.len()
    );

    let initial = model.snapshot();
    let wait = Duration::from_millis(cfg.orchestration.enqueue_wait_ms);
    let mut receivers = Vec::with_capacity(connectors.len());
    let mut slots = Vec::with_capacity(connectors.len());
    let mut handles: Vec<JoinHandle<Result<CollectorStats, CollectorError>>> = Vec::new();

    let setup = (|| -> Result<(), ControllerError> {
        for (i, connector) in connectors.into_iter().enumerate() {
            let id = i as u32;
            let (tx, rx) = rollout_queue(cfg.orchestration.rollout_queue_capacity, wait);
            let slot = Arc::new(ModelSlot::new());
            slot.publish(initial.clone());

            let mut ccfg = CollectorConfig::from_config(cfg, id, &run_id);
            ccfg.max_episodes = limits.max_episodes_per_collector;
            let log = open_log(logs_dir.as_deref(), &pl_logging::collector_log_name(id))?;
            let collector = Collector::new(
                ccfg,
                connector,
                tx,
                Arc::clone(&slot),
                Arc::clone(&factory),
                progress.clone(),
                shutdown.clone(),
                log,
            )?;
            let h = std::thread::Builder::new()
                .name(format!("collector-{id}"))
                .spawn(move || collector.run())?;
            handles.push(h);
            receivers.push(rx);
            slots.push(slot);
        }
        Ok(())
    })();
    if let Err(e) = setup {
        shutdown.trigger();
        drop(receivers);
        for h in handles {
            let _ = h.join();
        }
        return Err(e);
    }

    let mut lcfg = LearnerConfig::from_config(cfg, &run_id);
    lcfg.max_train_steps = limits.max_train_steps;
    let learner_log = open_log(logs_dir.as_deref(), pl_logging::LEARNER_FILE)?;
    let learner = Learner::new(lcfg, model, buffers, receivers, slots, progress.clone(), learner_log);
    let learned = learner.run(&shutdown);

    // Learner is done (queues dropped): release and join every collector.
    shutdown.trigger();
    let mut collectors = Vec::with_capacity(handles.len());
    for (id, h) in handles.into_iter().enumerate() {
        match h.join() {
            Ok(r) => {
                if let Err(e) = &r {
                    eprintln!("[{run_id}] collector {id} stopped: {e}");
                }
                collectors.push(r);
            }
            Err(_) => return Err(ControllerError::Panicked(format!("collector-{id}"))),
        }
    }

    let (model, buffers, learner) = learned?;
    if let Some(dir) = cfg.replay.persist_dir.as_deref() {
        save_state(dir, &model, &buffers)?;
    }

    let report = RunReport {
        model,
        buffers,
        learner,
        collectors,
        progress: progress.get(),
    };
    if let (Some(m), Some(d)) = (manifest.as_mut(), logs_dir.as_deref()) {
        m.episodes_completed += report.episodes_completed();
        m.rollouts_lost += report.rollouts_lost();
        m.train_step += report.learner.train_steps;
        m.policy_version = report.learner.published_version.unwrap_or(m.policy_version);
        m.progress = report.progress;
        pl_logging::write_manifest_atomic(d.join(pl_logging::MANIFEST_FILE), m)?;
    }
    eprintln!(
        "[{run_id}] done: {} train steps, {} episodes, {} rollouts lost",
        report.learner.train_steps,
        report.episodes_completed(),
        report.rollouts_lost()
    );
    Ok(report)
}

/// A pipeline running on its own thread.
pub struct PipelineHandle<M> {
    shutdown: ShutdownSignal,
    join: JoinHandle<Result<RunReport<M>, ControllerError>>,
}

impl<M> PipelineHandle<M> {
    /// Ask every collector and the learner to stop.
    pub fn request_shutdown(&self) {
        self.shutdown.trigger();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub fn join(self) -> Result<RunReport<M>, ControllerError> {
        match self.join.join() {
            Ok(r) => r,
            Err(_) => Err(ControllerError::Panicked("pipeline".to_string())),
        }
    }
}

pub fn spawn_pipeline<C, M>(
    cfg: Config,
    connectors: Vec<C>,
    model: M,
    factory: Arc<dyn PolicyFactory>,
    limits: RunLimits,
) -> Result<PipelineHandle<M>, ControllerError>
where
    C: SimConnector + 'static,
    M: PolicyModel + 'static,
{
    let shutdown = ShutdownSignal::new();
    let sd = shutdown.clone();
    let join = std::thread::Builder::new()
        .name("learner".to_string())
        .spawn(move || run_pipeline(&cfg, connectors, model, factory, limits, sd))?;
    Ok(PipelineHandle { shutdown, join })
}
