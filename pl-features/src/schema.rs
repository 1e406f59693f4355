//! Float feature layout.
//!
//! ### Layout
//! - **minirace_progress**: 1 float, mini-race elapsed / mini-race ceiling, clamped to [0, 1]
//! - **velocity_car**: 3 floats, velocity in the car frame (right, up, forward) / VELOCITY_NORM
//! - **gravity_car**: 3 floats, world up axis expressed in the car frame
//! - **zone_centers_car**: 3 floats per upcoming zone center, offset from the car in the
//!   car frame / DISTANCE_NORM; past the last zone the final center is repeated
//!
//! Total: F = 7 + 3 * K, K = zone centers in inputs.

/// Increment this whenever the feature layout changes.
pub const FEATURE_SCHEMA_ID: u32 = 1;

/// Leading fixed block before the zone centers.
pub const HEAD_LEN: usize = 7;

pub const VELOCITY_NORM: f32 = 100.0;
pub const DISTANCE_NORM: f32 = 100.0;

pub const fn feature_len(zone_centers_in_inputs: usize) -> usize {
    HEAD_LEN + 3 * zone_centers_in_inputs
}
