use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pl_core::config::StrategyKind;
use pl_core::{
    AnomalyCounters, Config, EpisodeOutcome, Observation, RewardParts, Rollout, StepRecord, A,
};
use pl_proto::{ClientError, Command, Event, SimulationSnapshot};
use pl_replay::SplitBuffers;
use pl_runtime::{Faults, InjectedFailure, MockTrack, PolicySource, ScriptedSim, Simulator};

use crate::{
    rollout_queue, run_pipeline, spawn_pipeline, Collector, CollectorConfig, CollectorError,
    Learner, LearnerConfig, LinearQ, LinearQFactory, ModelSlot, PolicyFactory, PolicyModel,
    PolicySnapshot, ProgressCounter, RunLimits, ShutdownSignal, SimConnector, SlotPolicySource,
    TcpConnector, POLICY_SNAPSHOT_FILE,
};

const ZONES_IN_INPUTS: usize = 2;

fn feature_dim() -> usize {
    pl_features::feature_len(ZONES_IN_INPUTS)
}

fn test_config() -> Config {
    let mut cfg = Config::default();
    cfg.simulator.frame_width = 8;
    cfg.simulator.frame_height = 4;
    cfg.simulator.max_minirace_duration_ms = 2_000;
    cfg.simulator.max_overall_duration_ms = 5_000;
    cfg.features.zone_centers =
        ScriptedSim::new(MockTrack::default(), Faults::default()).zone_centers();
    cfg.features.zone_centers_in_inputs = ZONES_IN_INPUTS;
    cfg.exploration.strategy = StrategyKind::Greedy;
    cfg.exploration.eval_every_episodes = 0;
    cfg.replay.capacity = 4_096;
    cfg.replay.test_capacity = 256;
    cfg.replay.batch_size = 8;
    cfg.replay.min_size_to_learn = 16;
    cfg.orchestration.enqueue_wait_ms = 20;
    cfg.orchestration.idle_wait_ms = 5;
    cfg.orchestration.connect_retries = 3;
    cfg.orchestration.connect_backoff_ms = 1;
    cfg.orchestration.train_steps_per_drain = 2;
    cfg.orchestration.publish_every_train_steps = 5;
    cfg
}

fn model() -> LinearQ {
    LinearQ::new(feature_dim(), 0.01)
}

/// Counts `close()` so tests can check that every session is shut down.
struct CountedSim {
    inner: ScriptedSim,
    closes: Arc<AtomicUsize>,
}

impl Simulator for CountedSim {
    fn await_event(&mut self) -> Result<Event, ClientError> {
        self.inner.await_event()
    }

    fn ack(&mut self) -> Result<(), ClientError> {
        self.inner.ack()
    }

    fn send(&mut self, cmd: &Command) -> Result<(), ClientError> {
        self.inner.send(cmd)
    }

    fn get_simulation_state(&mut self) -> Result<SimulationSnapshot, ClientError> {
        self.inner.get_simulation_state()
    }

    fn race_finished(&mut self) -> Result<bool, ClientError> {
        self.inner.race_finished()
    }

    fn close(&mut self) -> Result<(), ClientError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.inner.close()
    }
}

#[derive(Clone, Default)]
struct Counters {
    attempts: Arc<AtomicUsize>,
    opened: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

struct ScriptedConnector {
    /// Faults for successive sessions; clean sessions once exhausted.
    faults: VecDeque<Faults>,
    /// Refuse this many connect attempts first.
    refuse: usize,
    counters: Counters,
}

impl ScriptedConnector {
    fn clean(counters: &Counters) -> Self {
        Self {
            faults: VecDeque::new(),
            refuse: 0,
            counters: counters.clone(),
        }
    }
}

impl SimConnector for ScriptedConnector {
    type Session = CountedSim;

    fn connect(&mut self, _collector_id: u32) -> Result<CountedSim, ClientError> {
        let n = self.counters.attempts.fetch_add(1, Ordering::SeqCst);
        if n < self.refuse {
            return Err(ClientError::Connect(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "simulator not up yet",
            )));
        }
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        let faults = self.faults.pop_front().unwrap_or_default();
        Ok(CountedSim {
            inner: ScriptedSim::new(MockTrack::default(), faults),
            closes: Arc::clone(&self.counters.closes),
        })
    }
}

fn factory() -> Arc<dyn PolicyFactory> {
    Arc::new(LinearQFactory)
}

fn seeded_slot() -> Arc<ModelSlot> {
    let slot = Arc::new(ModelSlot::new());
    slot.publish(model().snapshot());
    slot
}

fn obs(x: f32) -> Arc<Observation> {
    let mut features = vec![0.0; feature_dim()];
    features[0] = x;
    Arc::new(Observation::new(vec![0; 4], features))
}

/// A finished rollout of `len` greedy steps.
fn rollout(collector_id: u32, len: usize) -> Rollout {
    let steps = (0..len)
        .map(|i| StepRecord {
            observation: obs(i as f32 / len as f32),
            action: (i % A) as u8,
            rewards: RewardParts::lump(0.1),
            scores: vec![0.0; A],
            was_greedy: true,
            policy_version: 0,
            race_time_ms: 50 * i as i32,
            zone: 0,
            terminal: i + 1 == len,
        })
        .collect();
    Rollout {
        collector_id,
        steps,
        final_observation: None,
        outcome: EpisodeOutcome::Finished,
        race_time_ms: 50 * len as i32,
        zone_entrance_times_ms: vec![0],
        anomalies: AnomalyCounters::default(),
    }
}

fn learner_config(cfg: &Config) -> LearnerConfig {
    let mut l = LearnerConfig::from_config(cfg, "test");
    l.nstep.test_ratio = 0.0;
    l
}

#[test]
fn pipeline_trains_publishes_and_closes_every_session() {
    let cfg = test_config();
    let counters = Counters::default();
    let connectors = vec![
        ScriptedConnector::clean(&counters),
        ScriptedConnector::clean(&counters),
    ];
    let limits = RunLimits {
        max_train_steps: Some(20),
        max_episodes_per_collector: None,
    };
    let report = run_pipeline(
        &cfg,
        connectors,
        model(),
        factory(),
        limits,
        ShutdownSignal::new(),
    )
    .unwrap();

    assert_eq!(report.learner.train_steps, 20);
    assert_eq!(report.learner.published, 4);
    assert_eq!(report.learner.published_version, Some(20));
    assert_eq!(report.model.snapshot().version, 20);
    assert!(report.buffers.train.len() >= cfg.replay.min_size_to_learn);
    assert!(report.progress > 0);
    assert_eq!(report.learner.rollouts_received.len(), 2);

    assert_eq!(report.collectors.len(), 2);
    for c in &report.collectors {
        let stats = c.as_ref().unwrap();
        assert_eq!(stats.sessions_opened, 1);
        assert_eq!(stats.episodes_failed, 0);
    }
    let steps: u64 = report
        .collectors
        .iter()
        .map(|c| c.as_ref().unwrap().steps)
        .sum();
    assert_eq!(steps, report.progress);
    assert_eq!(counters.opened.load(Ordering::SeqCst), 2);
    assert_eq!(counters.closes.load(Ordering::SeqCst), 2);
}

#[test]
fn run_without_collectors_is_rejected() {
    let cfg = test_config();
    let res = run_pipeline::<ScriptedConnector, _>(
        &cfg,
        Vec::new(),
        model(),
        factory(),
        RunLimits::default(),
        ShutdownSignal::new(),
    );
    assert!(matches!(res, Err(crate::ControllerError::NoCollectors)));
}

#[test]
fn connect_gives_up_after_configured_attempts() {
    let cfg = test_config();
    let counters = Counters::default();
    let connector = ScriptedConnector {
        faults: VecDeque::new(),
        refuse: usize::MAX,
        counters: counters.clone(),
    };
    let (tx, _rx) = rollout_queue(2, Duration::from_millis(5));
    let collector = Collector::new(
        CollectorConfig::from_config(&cfg, 4, "test"),
        connector,
        tx,
        seeded_slot(),
        factory(),
        ProgressCounter::new(),
        ShutdownSignal::new(),
        None,
    )
    .unwrap();

    match collector.run() {
        Err(CollectorError::ConnectRetriesExhausted { id, attempts, .. }) => {
            assert_eq!(id, 4);
            assert_eq!(attempts, 3);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(counters.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(counters.opened.load(Ordering::SeqCst), 0);
}

#[test]
fn refused_connects_are_retried() {
    let cfg = test_config();
    let counters = Counters::default();
    let connector = ScriptedConnector {
        faults: VecDeque::new(),
        refuse: 2,
        counters: counters.clone(),
    };
    let (tx, rx) = rollout_queue(4, Duration::from_millis(5));
    let mut ccfg = CollectorConfig::from_config(&cfg, 0, "test");
    ccfg.max_episodes = Some(1);
    let collector = Collector::new(
        ccfg,
        connector,
        tx,
        seeded_slot(),
        factory(),
        ProgressCounter::new(),
        ShutdownSignal::new(),
        None,
    )
    .unwrap();

    let stats = collector.run().unwrap();
    assert_eq!(stats.episodes_completed(), 1);
    assert_eq!(stats.sessions_opened, 1);
    assert_eq!(counters.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(rx.len(), 1);
}

#[test]
fn disconnect_mid_episode_recreates_the_session() {
    let cfg = test_config();
    let counters = Counters::default();
    let broken = Faults {
        fail_after_events: Some((30, InjectedFailure::Disconnect)),
        ..Faults::default()
    };
    let connector = ScriptedConnector {
        faults: VecDeque::from([broken]),
        refuse: 0,
        counters: counters.clone(),
    };
    let (tx, rx) = rollout_queue(4, Duration::from_millis(5));
    let mut ccfg = CollectorConfig::from_config(&cfg, 0, "test");
    ccfg.max_episodes = Some(2);
    let collector = Collector::new(
        ccfg,
        connector,
        tx,
        seeded_slot(),
        factory(),
        ProgressCounter::new(),
        ShutdownSignal::new(),
        None,
    )
    .unwrap();

    let stats = collector.run().unwrap();
    assert_eq!(stats.episodes_failed, 1);
    assert_eq!(stats.episodes_completed(), 2);
    assert_eq!(stats.sessions_opened, 2);
    assert_eq!(counters.closes.load(Ordering::SeqCst), 2);

    // The aborted episode never reaches the learner.
    assert_eq!(rx.len(), 2);
    while let Ok(r) = rx.try_recv() {
        assert!(!r.is_empty());
    }
}

#[test]
fn full_queue_drops_rollouts_and_logs_them() {
    let cfg = test_config();
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join(pl_logging::collector_log_name(1));
    let log = pl_logging::NdjsonWriter::open_append(&log_path).unwrap();

    let (tx, rx) = rollout_queue(1, Duration::from_millis(1));
    let mut ccfg = CollectorConfig::from_config(&cfg, 1, "test");
    ccfg.max_episodes = Some(3);
    let progress = ProgressCounter::new();
    let collector = Collector::new(
        ccfg,
        ScriptedConnector::clean(&Counters::default()),
        tx,
        seeded_slot(),
        factory(),
        progress.clone(),
        ShutdownSignal::new(),
        Some(log),
    )
    .unwrap();

    let stats = collector.run().unwrap();
    assert_eq!(stats.rollouts_sent, 1);
    assert_eq!(stats.rollouts_lost, 2);
    assert_eq!(rx.stats().lost(), 2);
    assert_eq!(rx.len(), 1);
    // Dropped rollouts still count toward progress.
    assert_eq!(progress.get(), stats.steps);

    let lines = pl_logging::read_ndjson_lenient(&log_path).unwrap();
    let episodes: Vec<_> = lines.iter().filter(|v| v["event"] == "episode").collect();
    assert_eq!(episodes.len(), 3);
    assert_eq!(episodes[0]["enqueued"], true);
    assert_eq!(episodes[1]["enqueued"], false);
    assert_eq!(episodes[2]["enqueued"], false);
    assert_eq!(episodes[2]["outcome"], "timed_out");
    let kinds: Vec<_> = lines
        .iter()
        .filter(|v| v["event"] == "session")
        .map(|v| v["kind"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(kinds, vec!["connected", "closed"]);
}

#[test]
fn collector_stops_when_learner_hangs_up() {
    let cfg = test_config();
    let counters = Counters::default();
    let (tx, rx) = rollout_queue(1, Duration::from_secs(5));
    drop(rx);
    let collector = Collector::new(
        CollectorConfig::from_config(&cfg, 0, "test"),
        ScriptedConnector::clean(&counters),
        tx,
        seeded_slot(),
        factory(),
        ProgressCounter::new(),
        ShutdownSignal::new(),
        None,
    )
    .unwrap();

    let stats = collector.run().unwrap();
    assert_eq!(stats.episodes_completed(), 1);
    assert_eq!(stats.rollouts_sent, 0);
    assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
}

#[test]
fn collector_needs_an_initial_snapshot() {
    let cfg = test_config();
    let (tx, _rx) = rollout_queue(1, Duration::from_millis(1));
    let res = Collector::new(
        CollectorConfig::from_config(&cfg, 2, "test"),
        ScriptedConnector::clean(&Counters::default()),
        tx,
        Arc::new(ModelSlot::new()),
        factory(),
        ProgressCounter::new(),
        ShutdownSignal::new(),
        None,
    );
    assert!(matches!(res, Err(CollectorError::NoPolicy(2))));
}

#[test]
fn slot_source_swaps_at_next_decision_and_survives_bad_snapshots() {
    let slot = seeded_slot();
    let mut source = SlotPolicySource::new(Arc::clone(&slot), factory())
        .unwrap()
        .unwrap();
    assert_eq!(source.current().version(), 0);
    assert!(!slot.has_pending());

    let bytes = (*model().snapshot().bytes).clone();
    slot.publish(PolicySnapshot::new(5, bytes));
    // Not applied until the next decision asks for it.
    assert_eq!(source.version(), 0);
    assert_eq!(source.current().version(), 5);
    assert_eq!(source.swaps(), 1);

    slot.publish(PolicySnapshot::new(6, vec![1, 2, 3]));
    assert_eq!(source.current().version(), 5);
    assert_eq!(source.swaps(), 1);
    assert!(!slot.has_pending());
}

#[test]
fn drain_is_round_robin_with_per_queue_cap() {
    let mut cfg = test_config();
    cfg.replay.min_size_to_learn = 1_000;
    let (tx_a, rx_a) = rollout_queue(8, Duration::from_millis(1));
    let (tx_b, rx_b) = rollout_queue(8, Duration::from_millis(1));
    for _ in 0..4 {
        tx_a.send(rollout(0, 3)).unwrap();
    }
    tx_b.send(rollout(1, 3)).unwrap();

    let buffers = SplitBuffers::new(1_000, 10).unwrap();
    let mut learner = Learner::new(
        learner_config(&cfg),
        model(),
        buffers,
        vec![rx_a, rx_b],
        Vec::new(),
        ProgressCounter::new(),
        None,
    );
    assert_eq!(learner.drain(), 2);
    assert_eq!(learner.stats().rollouts_received, vec![1, 1]);
    assert_eq!(learner.drain(), 1);
    assert_eq!(learner.drain(), 1);
    assert_eq!(learner.stats().rollouts_received, vec![3, 1]);
    assert_eq!(learner.buffers().train.len(), 4 * 3);
    assert_eq!(learner.stats().fill.train, 12);
}

#[test]
fn learner_waits_for_min_size_before_training() {
    let mut cfg = test_config();
    cfg.replay.min_size_to_learn = 10;
    let (tx, rx) = rollout_queue(4, Duration::from_millis(1));
    tx.send(rollout(0, 5)).unwrap();
    drop(tx);

    let learner = Learner::new(
        learner_config(&cfg),
        model(),
        SplitBuffers::new(100, 10).unwrap(),
        vec![rx],
        vec![seeded_slot()],
        ProgressCounter::new(),
        None,
    );
    let (m, buffers, stats) = learner.run(&ShutdownSignal::new()).unwrap();
    assert_eq!(buffers.train.len(), 5);
    assert_eq!(stats.train_steps, 0);
    assert_eq!(stats.published, 0);
    assert_eq!(m.snapshot().version, 0);
}

#[test]
fn learner_publishes_on_cadence_until_step_limit() {
    let mut cfg = test_config();
    cfg.replay.min_size_to_learn = 10;
    cfg.replay.batch_size = 4;
    cfg.orchestration.train_steps_per_drain = 1;
    cfg.orchestration.publish_every_train_steps = 3;
    let (tx, rx) = rollout_queue(4, Duration::from_millis(1));
    for _ in 0..3 {
        tx.send(rollout(0, 5)).unwrap();
    }
    let slot = Arc::new(ModelSlot::new());
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join(pl_logging::LEARNER_FILE);
    let log = pl_logging::NdjsonWriter::open_append(&log_path).unwrap();

    let mut lcfg = learner_config(&cfg);
    lcfg.max_train_steps = Some(6);
    let learner = Learner::new(
        lcfg,
        model(),
        SplitBuffers::new(100, 10).unwrap(),
        vec![rx],
        vec![Arc::clone(&slot)],
        ProgressCounter::new(),
        Some(log),
    );
    let (_m, buffers, stats) = learner.run(&ShutdownSignal::new()).unwrap();
    // The sender is still alive: the learner stopped on the step limit.
    drop(tx);

    assert_eq!(stats.train_steps, 6);
    assert_eq!(stats.published, 2);
    assert_eq!(stats.published_version, Some(6));
    assert_eq!(buffers.train.len(), 15);
    assert!(stats.last_loss.is_some());
    assert_eq!(slot.take().map(|s| s.version), Some(6));
    // Both publishes landed in the slot; the first was replaced unread.
    assert_eq!(slot.stats(), (2, 1, 1));

    let lines = pl_logging::read_ndjson_lenient(&log_path).unwrap();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["train_step"], 3);
    assert_eq!(lines[1]["train_step"], 6);
    assert_eq!(lines[1]["policy_version"], 6);
    assert_eq!(lines[1]["rollouts_received"][0], 3);
}

#[test]
fn learner_returns_promptly_on_shutdown() {
    let cfg = test_config();
    let (_tx, rx) = rollout_queue(1, Duration::from_millis(1));
    let shutdown = ShutdownSignal::new();
    shutdown.trigger();
    let learner = Learner::new(
        learner_config(&cfg),
        model(),
        SplitBuffers::new(10, 10).unwrap(),
        vec![rx],
        Vec::new(),
        ProgressCounter::new(),
        None,
    );
    let (_, _, stats) = learner.run(&shutdown).unwrap();
    assert_eq!(stats.rollouts_received, vec![0]);
}

#[test]
fn persisted_run_resumes_model_replay_and_counters() {
    let dir = tempfile::tempdir().unwrap();
    let logs = dir.path().join("run-a");
    let replay = dir.path().join("replay");
    let mut cfg = test_config();
    cfg.orchestration.logs_dir = Some(logs.clone());
    cfg.replay.persist_dir = Some(replay.clone());
    let limits = RunLimits {
        max_train_steps: Some(10),
        max_episodes_per_collector: None,
    };

    let counters = Counters::default();
    let first = run_pipeline(
        &cfg,
        vec![ScriptedConnector::clean(&counters)],
        model(),
        factory(),
        limits,
        ShutdownSignal::new(),
    )
    .unwrap();
    assert_eq!(first.learner.train_steps, 10);
    assert!(replay.join(POLICY_SNAPSHOT_FILE).exists());
    assert!(replay.join("replay_train.meta.json").exists());

    let manifest = pl_logging::read_manifest(logs.join(pl_logging::MANIFEST_FILE)).unwrap();
    assert_eq!(manifest.run_id, "run-a");
    assert_eq!(manifest.train_step, 10);
    assert_eq!(manifest.policy_version, 10);
    assert_eq!(manifest.progress, first.progress);
    assert_eq!(manifest.episodes_completed, first.episodes_completed());
    assert!(manifest.config_hash.is_some());

    let learner_lines = pl_logging::read_ndjson_lenient(logs.join(pl_logging::LEARNER_FILE)).unwrap();
    assert_eq!(learner_lines.len(), 2);
    let episode_lines =
        pl_logging::read_ndjson_lenient(logs.join(pl_logging::collector_log_name(0))).unwrap();
    assert!(episode_lines.iter().any(|v| v["event"] == "episode"));

    let second = run_pipeline(
        &cfg,
        vec![ScriptedConnector::clean(&counters)],
        model(),
        factory(),
        limits,
        ShutdownSignal::new(),
    )
    .unwrap();
    // Weights and the update count come back from the snapshot.
    assert_eq!(second.model.snapshot().version, 20);
    assert!(second.buffers.train.len() >= first.buffers.train.len());
    assert!(second.progress >= first.progress);

    let resumed = pl_logging::read_manifest(logs.join(pl_logging::MANIFEST_FILE)).unwrap();
    assert_eq!(resumed.created_ts_ms, manifest.created_ts_ms);
    assert_eq!(resumed.train_step, 20);
    assert_eq!(resumed.policy_version, 20);
    assert_eq!(resumed.progress, second.progress);
}

#[test]
fn spawned_pipeline_stops_on_request() {
    let cfg = test_config();
    let counters = Counters::default();
    let handle = spawn_pipeline(
        cfg,
        vec![
            ScriptedConnector::clean(&counters),
            ScriptedConnector::clean(&counters),
        ],
        model(),
        factory(),
        RunLimits::default(),
    )
    .unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert!(!handle.is_finished());
    handle.request_shutdown();

    let report = handle.join().unwrap();
    assert!(report.collectors.iter().all(|c| c.is_ok()));
    assert_eq!(
        counters.closes.load(Ordering::SeqCst),
        counters.opened.load(Ordering::SeqCst)
    );
}

#[test]
fn tcp_connector_rejects_ports_past_u16() {
    let mut connector = TcpConnector {
        host: "127.0.0.1".into(),
        base_port: 65_535,
        socket_timeout: Duration::from_millis(50),
        simulator_timeout_ms: 1_000,
        step_period_ms: 10,
    };
    for id in [1, 70_000] {
        match connector.connect(id) {
            Err(ClientError::Connect(e)) => assert_eq!(e.kind(), io::ErrorKind::InvalidInput),
            other => panic!("expected out-of-range port, got {:?}", other.map(|_| ())),
        }
    }
}
