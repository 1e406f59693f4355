//! pl-replay: replay storage for the learner.
//!
//! Rollouts are cut into n-step transitions, split between a training and a
//! held-out store, and can be persisted as safetensors between runs.

pub mod buffer;
pub mod nstep;
pub mod persist;
pub mod schema;

use thiserror::Error;

pub use buffer::{ReplayBuffer, Split, SplitBuffers};
pub use nstep::{build_transitions, FillReport, TransitionBuilder};
pub use persist::{
    cleanup_tmp_files, load_buffer, load_split, save_buffer, save_split, ReplayMeta,
};

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("safetensors: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
    #[error("shape mismatch: {0}")]
    Shape(String),
}

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
