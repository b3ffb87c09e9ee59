//! Tool execution engine
//!
//! The sole path for assistant-initiated state mutation: schema
//! validation, unit normalization, the progression safety gate, rate
//! limiting, and a fully audited received -> validated -> executed ->
//! logged state machine.

mod engine;
mod schema;
pub mod units;

pub use engine::ToolEngine;
pub use schema::{parse_bodyweight, parse_workout, BodyweightParams, WorkoutParams};
pub use units::{from_lbs, to_lbs, WeightUnit, KG_TO_LBS};
