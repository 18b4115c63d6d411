//! Safe zone entry/exit detection.

pub mod evaluator;
pub mod geometry;

pub use evaluator::{transition, GeofenceEvaluator, GeofenceOutcome};
pub use geometry::{distance_meters, within_radius, Coordinate, EARTH_RADIUS_METERS};
