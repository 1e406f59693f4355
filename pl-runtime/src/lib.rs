//! pl-runtime: episode driver, exploration strategies and the simulator seam.

pub mod episode;
pub mod exploration;
pub mod mock;
pub mod policy;
pub mod sim;

pub use episode::{DriverConfig, DriverError, EpisodeDriver, EpisodeState};
pub use exploration::{Choice, Exploration};
pub use mock::{Faults, InjectedFailure, MockTrack, ScriptedSim};
pub use policy::{ConstantPolicy, Policy, PolicySource};
pub use sim::Simulator;

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
