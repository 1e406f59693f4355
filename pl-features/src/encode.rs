//! Observation encoding: BGRA frame -> grayscale plane, snapshot -> float features.

use pl_core::Observation;
use pl_proto::{Dynamics, Frame, SimulationSnapshot};

use crate::schema::{feature_len, DISTANCE_NORM, HEAD_LEN, VELOCITY_NORM};
use crate::zones::ZoneTracker;

/// BGRA8 -> 8-bit luma (BT.601 weights, fixed point).
pub fn frame_to_gray(frame: &Frame) -> Vec<u8> {
    frame
        .data
        .chunks_exact(4)
        .map(|px| {
            let (b, g, r) = (px[0] as u32, px[1] as u32, px[2] as u32);
            ((29 * b + 150 * g + 77 * r + 128) >> 8) as u8
        })
        .collect()
}

/// World vector -> car frame (right, up, forward).
fn to_car_frame(d: &Dynamics, v: [f32; 3]) -> [f32; 3] {
    let m = &d.orientation;
    let mut out = [0f32; 3];
    for (axis, o) in out.iter_mut().enumerate() {
        *o = m[axis] * v[0] + m[3 + axis] * v[1] + m[6 + axis] * v[2];
    }
    out
}

fn push3(out: &mut [f32], off: &mut usize, v: [f32; 3], scale: f32) {
    for x in v {
        out[*off] = x / scale;
        *off += 1;
    }
}

/// Float features for one decision. An empty snapshot encodes as zeros after
/// the mini-race slot.
pub fn encode_features(
    snapshot: &SimulationSnapshot,
    zones: &ZoneTracker,
    minirace_elapsed_ms: i32,
    minirace_ceiling_ms: i32,
    zone_centers_in_inputs: usize,
) -> Vec<f32> {
    let mut out = vec![0.0f32; feature_len(zone_centers_in_inputs)];
    let mut off = 0usize;

    out[off] = if minirace_ceiling_ms > 0 {
        (minirace_elapsed_ms as f32 / minirace_ceiling_ms as f32).clamp(0.0, 1.0)
    } else {
        0.0
    };
    off += 1;

    let Some(d) = snapshot.dynamics() else {
        return out;
    };

    push3(&mut out, &mut off, to_car_frame(d, d.velocity), VELOCITY_NORM);
    push3(&mut out, &mut off, to_car_frame(d, [0.0, 1.0, 0.0]), 1.0);
    debug_assert_eq!(off, HEAD_LEN);

    for c in zones.upcoming(zone_centers_in_inputs) {
        let rel = [
            c[0] - d.position[0],
            c[1] - d.position[1],
            c[2] - d.position[2],
        ];
        push3(&mut out, &mut off, to_car_frame(d, rel), DISTANCE_NORM);
    }
    out
}

pub fn build_observation(
    frame: &Frame,
    snapshot: &SimulationSnapshot,
    zones: &ZoneTracker,
    minirace_elapsed_ms: i32,
    minirace_ceiling_ms: i32,
    zone_centers_in_inputs: usize,
) -> Observation {
    Observation::new(
        frame_to_gray(frame),
        encode_features(
            snapshot,
            zones,
            minirace_elapsed_ms,
            minirace_ceiling_ms,
            zone_centers_in_inputs,
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pl_proto::CheckpointData;

    const IDENTITY: [f32; 9] = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0];

    fn snap(position: [f32; 3], velocity: [f32; 3], orientation: [f32; 9]) -> SimulationSnapshot {
        SimulationSnapshot::build(
            Dynamics {
                race_time_ms: 0,
                position,
                velocity,
                orientation,
            },
            CheckpointData::default(),
            &[],
        )
    }

    #[test]
    fn gray_weights() {
        let f = Frame {
            width: 3,
            height: 1,
            step: 0,
            data: vec![0, 0, 0, 255, 255, 255, 255, 255, 255, 0, 0, 255],
        };
        let g = frame_to_gray(&f);
        assert_eq!(g[0], 0);
        assert_eq!(g[1], 255);
        // Pure red: 77/256 of full scale.
        assert_eq!(g[2], ((77 * 255 + 128) >> 8) as u8);
    }

    #[test]
    fn features_length_and_minirace_slot() {
        let zones = ZoneTracker::new(vec![[0.0; 3], [10.0, 0.0, 0.0]]);
        let f = encode_features(&snap([0.0; 3], [0.0; 3], IDENTITY), &zones, 12_000, 24_000, 4);
        assert_eq!(f.len(), feature_len(4));
        assert_eq!(f[0], 0.5);
    }

    #[test]
    fn empty_snapshot_encodes_zeros() {
        let zones = ZoneTracker::new(vec![[5.0, 5.0, 5.0]]);
        let f = encode_features(&SimulationSnapshot::empty(), &zones, 0, 24_000, 2);
        assert!(f.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn car_frame_rotation() {
        // Car yawed so its forward axis points along world +x: columns are
        // right = -z, up = +y, forward = +x.
        let orient = [0.0, 0.0, 1.0, 0.0, 1.0, 0.0, -1.0, 0.0, 0.0];
        let zones = ZoneTracker::new(vec![[0.0; 3], [100.0, 0.0, 0.0]]);
        let f = encode_features(&snap([0.0; 3], [50.0, 0.0, 0.0], orient), &zones, 0, 1, 1);
        // Velocity is straight ahead.
        assert_eq!(&f[1..4], &[0.0, 0.0, 0.5]);
        // Gravity axis unchanged.
        assert_eq!(&f[4..7], &[0.0, 1.0, 0.0]);
        // Next zone center 100 m ahead.
        assert_eq!(&f[7..10], &[0.0, 0.0, 1.0]);
    }
}
