//! Discrete action space: the fixed table of controller input combinations.

use serde::{Deserialize, Serialize};

/// Number of discrete actions.
pub const A: usize = 9;

/// Accelerate forward, don't turn.
pub const ACTION_FORWARD: u8 = 7;
/// Brake / reverse, don't turn.
pub const ACTION_BACKWARD: u8 = 8;

/// The four digital inputs the simulator accepts per step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct InputState {
    pub left: bool,
    pub right: bool,
    pub accelerate: bool,
    pub brake: bool,
}

impl InputState {
    pub const fn new(left: bool, right: bool, accelerate: bool, brake: bool) -> Self {
        Self {
            left,
            right,
            accelerate,
            brake,
        }
    }
}

/// Action index -> input combination.
///
/// Layout: 0..=2 steer left, 3..=5 steer right, 6..=8 straight; within each
/// group the order is (coast, accelerate, brake).
pub const ACTIONS: [InputState; A] = [
    InputState::new(true, false, false, false),
    InputState::new(true, false, true, false),
    InputState::new(true, false, false, true),
    InputState::new(false, true, false, false),
    InputState::new(false, true, true, false),
    InputState::new(false, true, false, true),
    InputState::new(false, false, false, false),
    InputState::new(false, false, true, false),
    InputState::new(false, false, false, true),
];

/// Input combination for an action index, `None` when out of range.
pub fn action_to_inputs(action: u8) -> Option<InputState> {
    ACTIONS.get(action as usize).copied()
}

/// Inverse of [`action_to_inputs`].
pub fn inputs_to_action(inputs: InputState) -> Option<u8> {
    ACTIONS.iter().position(|a| *a == inputs).map(|i| i as u8)
}

/// Index of the largest score. Ties resolve to the lowest index; NaN never wins.
pub fn argmax(scores: &[f32]) -> Option<u8> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &s) in scores.iter().enumerate() {
        if s.is_nan() {
            continue;
        }
        match best {
            Some((_, b)) if s <= b => {}
            _ => best = Some((i, s)),
        }
    }
    best.map(|(i, _)| i as u8)
}
