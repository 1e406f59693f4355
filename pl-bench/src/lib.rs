//! Shared fixtures for the pl micro-benchmarks.

use std::sync::Arc;

use pl_core::{
    AnomalyCounters, EpisodeOutcome, Observation, RewardParts, Rollout, StepRecord, A,
};
use pl_proto::{CheckpointData, Dynamics, Frame, SimulationSnapshot};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;

pub const FRAME_W: u32 = 160;
pub const FRAME_H: u32 = 120;
pub const FEATURE_LEN: usize = pl_features::feature_len(16);

/// A frame of deterministic noise at the default capture size.
pub fn frame(seed: u64) -> Frame {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut data = vec![0u8; Frame::byte_len(FRAME_W, FRAME_H)];
    rng.fill(&mut data[..]);
    Frame {
        width: FRAME_W,
        height: FRAME_H,
        step: 0,
        data,
    }
}

/// A full-size simulation state with `checkpoints` entries.
pub fn snapshot(checkpoints: usize) -> SimulationSnapshot {
    SimulationSnapshot::build(
        Dynamics {
            race_time_ms: 12_340,
            position: [512.0, 9.5, 300.25],
            velocity: [42.0, 0.0, -3.5],
            orientation: [0.0, 0.0, 1.0, 0.0, 1.0, 0.0, -1.0, 0.0, 0.0],
        },
        CheckpointData {
            states: (0..checkpoints).map(|i| (i % 2) as u8).collect(),
            times: (0..checkpoints).map(|i| 1_000 * i as i32).collect(),
        },
        &[0u8; 256],
    )
}

/// A rollout of `len` steps with a mix of greedy and exploratory actions.
pub fn rollout(len: usize, seed: u64) -> Rollout {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let steps = (0..len)
        .map(|i| {
            let features = (0..FEATURE_LEN).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
            StepRecord {
                observation: Arc::new(Observation::new(vec![0u8; 64], features)),
                action: rng.gen_range(0..A as u8),
                rewards: RewardParts::lump(rng.gen_range(-0.01f32..0.01)),
                scores: vec![0.0; A],
                was_greedy: rng.gen_bool(0.8),
                policy_version: 1,
                race_time_ms: 50 * i as i32,
                zone: (i / 20) as u32,
                terminal: i + 1 == len,
            }
        })
        .collect();
    Rollout {
        collector_id: 0,
        steps,
        final_observation: None,
        outcome: EpisodeOutcome::Finished,
        race_time_ms: 50 * len as i32,
        zone_entrance_times_ms: vec![0],
        anomalies: AnomalyCounters::default(),
    }
}
