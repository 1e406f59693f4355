//! pl-features: observation encoding and zone bookkeeping.

pub mod encode;
pub mod schema;
pub mod zones;

pub use encode::{build_observation, encode_features, frame_to_gray};
pub use schema::{feature_len, FEATURE_SCHEMA_ID};
pub use zones::ZoneTracker;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_nonempty() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn default_feature_len_matches_config() {
        let cfg = pl_core::Config::default();
        assert_eq!(
            feature_len(cfg.features.zone_centers_in_inputs),
            7 + 3 * 16
        );
    }
}
