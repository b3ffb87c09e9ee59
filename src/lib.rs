//! Spotter - Coaching Memory & Safety Core
//!
//! Embedding-backed user memory, weight-progression safety limits,
//! governed A/B personalization, and audited tool execution for an
//! AI fitness coach.

pub mod config;
pub mod embedding;
pub mod error;
pub mod experiment;
pub mod memory;
pub mod monitor;
pub mod safety;
pub mod service;
pub mod storage;
pub mod tools;
pub mod types;

pub use config::CoachConfig;
pub use error::{Result, SpotterError};
pub use service::CoachService;
pub use storage::Storage;
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
