//! pl-controller: collectors, rollout queues, model slots and the learner.
//!
//! Each collector owns one simulator session and pushes complete rollouts
//! into its own bounded queue. The learner drains those queues fairly, turns
//! rollouts into n-step transitions, trains, and publishes snapshots back to
//! one slot per collector.

pub mod collector;
pub mod learner;
pub mod model_slot;
pub mod pipeline;
pub mod policy;
pub mod progress;
pub mod queue;
pub mod shutdown;

pub use collector::{
    Collector, CollectorConfig, CollectorError, CollectorStats, SimConnector, SlotPolicySource,
    TcpConnector,
};
pub use learner::{Learner, LearnerConfig, LearnerError, LearnerStats};
pub use model_slot::{ModelSlot, PolicySnapshot};
pub use pipeline::{
    run_pipeline, spawn_pipeline, ControllerError, PipelineHandle, RunLimits, RunReport,
    POLICY_SNAPSHOT_FILE,
};
pub use policy::{
    LinearQ, LinearQFactory, LinearQPolicy, PolicyFactory, PolicyModel, TrainOutcome,
    TrainingError,
};
pub use progress::ProgressCounter;
pub use queue::{rollout_queue, QueueError, QueueStats, RolloutReceiver, RolloutSender};
pub use shutdown::ShutdownSignal;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");


#[cfg(test)]
mod controller_tests;
