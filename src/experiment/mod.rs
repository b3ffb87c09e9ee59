//! Personalization experiments
//!
//! Segment classification plus deterministic, governed A/B variant
//! selection with a runtime kill switch.

mod segment;
mod variant;

pub use segment::{compute_segment, INACTIVITY_RETURNING_DAYS};
pub use variant::{default_catalog, DisableMode, VariantSelector, VariantStatus};
