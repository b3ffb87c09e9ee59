//! Runtime governance
//!
//! The quality monitor watches aggregate tool-call health and drives
//! the variant kill switch; the security monitor watches per-user
//! request behavior and escalates suspected memory poisoning.

mod quality;
mod security;

pub use quality::QualityMonitor;
pub use security::SecurityMonitor;
