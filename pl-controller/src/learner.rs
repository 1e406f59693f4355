//! Learner loop: drain rollouts, grow the replay buffers, train, publish.
//!
//! The drain is round-robin with a rotating start index and a per-queue cap,
//! so a busy collector cannot starve a slow one. When nothing is queued and
//! training cannot start yet, the learner parks on a `Select` over all live
//! queues with a timeout.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Select, TryRecvError};
use pl_core::config::{Config, NStepConfig, ReplayConfig};
use pl_logging::{LearnerStatsEventV1, NdjsonError, NdjsonWriter};
use pl_replay::{FillReport, ReplayError, SplitBuffers, TransitionBuilder};
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use thiserror::Error;

use crate::model_slot::ModelSlot;
use crate::policy::{PolicyModel, TrainingError};
use crate::progress::ProgressCounter;
use crate::queue::RolloutReceiver;
use crate::shutdown::ShutdownSignal;

#[derive(Debug, Error)]
pub enum LearnerError {
    #[error("training: {0}")]
    Training(#[from] TrainingError),
    #[error("replay: {0}")]
    Replay(#[from] ReplayError),
    #[error("log: {0}")]
    Log(#[from] NdjsonError),
}

#[derive(Debug, Clone)]
pub struct LearnerConfig {
    pub run_id: String,
    pub nstep: NStepConfig,
    pub replay: ReplayConfig,
    pub train_steps_per_drain: u32,
    pub publish_every_train_steps: u32,
    pub max_rollouts_per_queue: usize,
    pub idle_wait: Duration,
    pub seed: u64,
    /// Stop after this many training steps.
    pub max_train_steps: Option<u64>,
}

impl LearnerConfig {
    pub fn from_config(cfg: &Config, run_id: &str) -> Self {
        let o = &cfg.orchestration;
        Self {
            run_id: run_id.to_string(),
            nstep: cfg.nstep.clone(),
            replay: cfg.replay.clone(),
            train_steps_per_drain: o.train_steps_per_drain,
            publish_every_train_steps: o.publish_every_train_steps,
            max_rollouts_per_queue: o.max_rollouts_per_queue,
            idle_wait: Duration::from_millis(o.idle_wait_ms),
            seed: o.seed,
            max_train_steps: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LearnerStats {
    pub train_steps: u64,
    /// Indexed by collector queue.
    pub rollouts_received: Vec<u64>,
    pub fill: FillReport,
    pub last_loss: Option<f32>,
    pub last_test_loss: Option<f32>,
    pub published: u64,
    pub published_version: Option<u64>,
}

pub struct Learner<M: PolicyModel> {
    cfg: LearnerConfig,
    model: M,
    buffers: SplitBuffers,
    builder: TransitionBuilder,
    queues: Vec<RolloutReceiver>,
    live: Vec<bool>,
    slots: Vec<Arc<ModelSlot>>,
    progress: ProgressCounter,
    rng: ChaCha8Rng,
    next_queue: usize,
    stats: LearnerStats,
    loss_sum: f32,
    loss_count: u32,
    log: Option<NdjsonWriter>,
}

impl<M: PolicyModel> Learner<M> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: LearnerConfig,
        model: M,
        buffers: SplitBuffers,
        queues: Vec<RolloutReceiver>,
        slots: Vec<Arc<ModelSlot>>,
        progress: ProgressCounter,
        log: Option<NdjsonWriter>,
    ) -> Self {
        let n = queues.len();
        Self {
            builder: TransitionBuilder::new(cfg.nstep.clone(), cfg.seed ^ 0x5eed),
            rng: ChaCha8Rng::seed_from_u64(cfg.seed),
            cfg,
            model,
            buffers,
            queues,
            live: vec![true; n],
            slots,
            progress,
            next_queue: 0,
            stats: LearnerStats {
                rollouts_received: vec![0; n],
                ..LearnerStats::default()
            },
            loss_sum: 0.0,
            loss_count: 0,
            log,
        }
    }

    pub fn buffers(&self) -> &SplitBuffers {
        &self.buffers
    }

    pub fn stats(&self) -> &LearnerStats {
        &self.stats
    }

    /// Send the model's current snapshot to every collector slot.
    pub fn publish(&mut self) {
        let snap = self.model.snapshot();
        self.stats.published_version = Some(snap.version);
        self.stats.published += 1;
        for slot in &self.slots {
            slot.publish(snap.clone());
        }
    }

    /// One fair pass over all queues. Returns the number of rollouts consumed.
    pub fn drain(&mut self) -> usize {
        let n = self.queues.len();
        if n == 0 {
            return 0;
        }
        let per_queue = self.cfg.max_rollouts_per_queue.max(1);
        let mut got = 0;
        for k in 0..n {
            let q = (self.next_queue + k) % n;
            if !self.live[q] {
                continue;
            }
            for _ in 0..per_queue {
                match self.queues[q].try_recv() {
                    Ok(r) => {
                        let report = self.builder.fill(&r, &mut self.buffers);
                        self.stats.fill.merge(&report);
                        self.stats.rollouts_received[q] += 1;
                        got += 1;
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        self.live[q] = false;
                        break;
                    }
                }
            }
        }
        self.next_queue = (self.next_queue + 1) % n;
        got
    }

    fn all_disconnected(&self) -> bool {
        self.live.iter().all(|l| !l)
    }

    fn ready_to_train(&self) -> bool {
        self.buffers.train.len() >= self.cfg.replay.min_size_to_learn.max(1)
    }

    fn limit_reached(&self) -> bool {
        self.cfg
            .max_train_steps
            .is_some_and(|m| self.stats.train_steps >= m)
    }

    /// Block until some live queue has a rollout, or `timeout` elapses.
    fn wait_for_rollouts(&self, timeout: Duration) {
        let mut sel = Select::new();
        let mut any = false;
        for (q, rx) in self.queues.iter().enumerate() {
            if self.live[q] {
                sel.recv(rx.inner());
                any = true;
            }
        }
        if any {
            let _ = sel.ready_timeout(timeout);
        } else {
            std::thread::sleep(timeout);
        }
    }

    /// Up to `train_steps_per_drain` steps; stops early (between steps) on shutdown.
    fn train_round(&mut self, shutdown: &ShutdownSignal) -> Result<(), LearnerError> {
        for _ in 0..self.cfg.train_steps_per_drain.max(1) {
            if shutdown.is_triggered() || self.limit_reached() {
                break;
            }
            let batch = self.buffers.train.sample(self.cfg.replay.batch_size, &mut self.rng);
            let out = self.model.train_step(&batch)?;
            self.stats.train_steps += 1;
            self.stats.last_loss = Some(out.loss);
            self.loss_sum += out.loss;
            self.loss_count += 1;

            let every = u64::from(self.cfg.publish_every_train_steps.max(1));
            if self.stats.train_steps % every == 0 {
                self.publish();
                self.evaluate_and_log()?;
            }
        }
        Ok(())
    }

    fn evaluate_and_log(&mut self) -> Result<(), LearnerError> {
        let test_loss = if self.buffers.test.is_empty() {
            None
        } else {
            let batch = self.buffers.test.sample(self.cfg.replay.batch_size, &mut self.rng);
            Some(self.model.test_loss(&batch)?)
        };
        self.stats.last_test_loss = test_loss.or(self.stats.last_test_loss);
        let mean_loss = (self.loss_count > 0).then(|| self.loss_sum / self.loss_count as f32);
        self.loss_sum = 0.0;
        self.loss_count = 0;

        if let Some(w) = self.log.as_mut() {
            let fill = &self.stats.fill;
            w.write_event(&LearnerStatsEventV1 {
                event: "learner_stats",
                ts_ms: pl_logging::now_ms(),
                run_id: self.cfg.run_id.clone(),
                train_step: self.stats.train_steps,
                mean_loss,
                test_loss,
                train_size: self.buffers.train.len(),
                test_size: self.buffers.test.len(),
                transitions_total: fill.produced() as u64,
                windows_dropped: (fill.dropped_non_greedy + fill.dropped_no_bootstrap) as u64,
                rollouts_received: self.stats.rollouts_received.clone(),
                rollouts_lost: self.queues.iter().map(|q| q.stats().lost()).sum(),
                policy_version: self.stats.published_version.unwrap_or(0),
                progress: self.progress.get(),
            })?;
            w.flush()?;
        }
        Ok(())
    }

    /// Run until shutdown, the step limit, or every collector has hung up.
    ///
    /// Returns the model, the buffers and the final counters. Queues are
    /// dropped on return, which releases collectors blocked on a full queue.
    pub fn run(mut self, shutdown: &ShutdownSignal) -> Result<(M, SplitBuffers, LearnerStats), LearnerError> {
        loop {
            if shutdown.is_triggered() || self.limit_reached() {
                break;
            }
            let got = self.drain();
            let trained = if self.ready_to_train() {
                self.train_round(shutdown)?;
                true
            } else {
                false
            };
            if got == 0 {
                if self.all_disconnected() {
                    break;
                }
                if !trained {
                    self.wait_for_rollouts(self.cfg.idle_wait);
                }
            }
        }
        if let Some(w) = self.log.as_mut() {
            w.flush()?;
        }
        Ok((self.model, self.buffers, self.stats))
    }
}
