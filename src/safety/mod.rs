//! Stateless safety rule engine
//!
//! Two concerns: weight-progression limits (including anti-gaming
//! heuristics) and adversarial-claim detection in free text. Advisory
//! only; this module never mutates state.

pub mod patterns;
mod validator;

pub use patterns::{scan_claims, ClaimCategory, ClaimMatch, CLAIM_PATTERNS_VERSION};
pub use validator::SafetyValidator;
