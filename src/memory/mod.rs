//! Embedding-backed long-term memory
//!
//! `MemoryStore` queues, embeds, persists, and ranks per-user memory
//! text; `MemoryGuardian` sanitizes content entering and leaving it.

mod guardian;
mod store;

pub use guardian::{MemoryGuardian, PoisoningRecommendation, PoisoningReport, SanitizeResult};
pub use store::{MemoryStore, RetrieveOptions};
