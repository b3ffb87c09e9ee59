//! Storage collaborator for the coaching core
//!
//! Wraps SQLite (WAL mode) behind a narrow query surface: memory items
//! with in-process vector similarity, workout history, experiment
//! assignments, user profiles, safety events, and the append-only
//! action log.

pub(crate) mod audit;
mod connection;
mod migrations;
pub mod queries;

pub use audit::{query_action_log, ActionLogFilter};
pub use connection::Storage;
