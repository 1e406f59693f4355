//! Tensor names and ids for persisted replay buffers.

/// Bumped whenever the tensor layout below changes.
pub const FORMAT_VERSION: u32 = 1;

pub const T_FEATURES: &str = "features";
pub const T_PIXELS: &str = "pixels";
pub const T_ACTIONS: &str = "actions";
pub const T_RETURNS: &str = "returns";
pub const T_N_STEPS: &str = "n_steps";
pub const T_GAMMAS: &str = "gammas";
pub const T_NEXT_FEATURES: &str = "next_features";
pub const T_NEXT_PIXELS: &str = "next_pixels";
/// 1 when the sample bootstraps, 0 when it ends on a terminal step.
pub const T_HAS_NEXT: &str = "has_next";
pub const T_GREEDY_PATH: &str = "greedy_path";

pub const TRAIN_STEM: &str = "replay_train";
pub const TEST_STEM: &str = "replay_test";
