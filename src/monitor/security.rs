//! Security monitor
//!
//! Per-user sliding request windows, sticky suspicion flags, and an
//! escalation path that re-uses the memory guardian's poisoning
//! detection. Flags persist until explicitly cleared by an operator.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::config::SecurityConfig;
use crate::error::Result;
use crate::memory::{MemoryGuardian, PoisoningRecommendation, PoisoningReport};

pub struct SecurityMonitor {
    guardian: Arc<MemoryGuardian>,
    config: SecurityConfig,
    /// Timestamps inside each window are pruned on every request, but
    /// the per-user entries themselves live for the process lifetime
    windows: DashMap<String, VecDeque<Instant>>,
    flagged: RwLock<HashSet<String>>,
}

impl SecurityMonitor {
    pub fn new(guardian: Arc<MemoryGuardian>, config: SecurityConfig) -> Self {
        Self {
            guardian,
            config,
            windows: DashMap::new(),
            flagged: RwLock::new(HashSet::new()),
        }
    }

    /// Record one request and report whether the user stays within the
    /// window limit. Crossing the limit flags the user; the flag is
    /// sticky until [`clear_flag`](Self::clear_flag).
    pub fn record_request(&self, user_id: &str) -> bool {
        let now = Instant::now();
        let window = Duration::from_secs(self.config.window_secs);
        let mut entry = self.windows.entry(user_id.to_string()).or_default();
        while let Some(front) = entry.front() {
            if now.duration_since(*front) > window {
                entry.pop_front();
            } else {
                break;
            }
        }
        entry.push_back(now);
        let count = entry.len();
        drop(entry);

        if count > self.config.max_requests_per_window {
            let newly_flagged = self.flagged.write().insert(user_id.to_string());
            if newly_flagged {
                tracing::warn!(
                    user_id,
                    count,
                    limit = self.config.max_requests_per_window,
                    "request rate exceeded, user flagged"
                );
            }
            false
        } else {
            true
        }
    }

    pub fn is_flagged(&self, user_id: &str) -> bool {
        self.flagged.read().contains(user_id)
    }

    /// Operator action; flags never expire on their own
    pub fn clear_flag(&self, user_id: &str) {
        if self.flagged.write().remove(user_id) {
            tracing::info!(user_id, "security flag cleared");
        }
    }

    pub fn flagged_users(&self) -> HashSet<String> {
        self.flagged.read().clone()
    }

    /// Run poisoning detection for a user and apply the recommended
    /// escalation: flag, restrict (also a flag at this layer), or an
    /// emergency clear of the recent memory window.
    pub fn escalate(&self, user_id: &str) -> Result<PoisoningReport> {
        let report = self.guardian.detect_poisoning(user_id)?;
        match report.recommendation {
            PoisoningRecommendation::None => {}
            PoisoningRecommendation::Flag | PoisoningRecommendation::Restrict => {
                self.flagged.write().insert(user_id.to_string());
                tracing::warn!(
                    user_id,
                    recommendation = ?report.recommendation,
                    patterns = report.patterns.len(),
                    "poisoning suspicion, user flagged"
                );
            }
            PoisoningRecommendation::ClearContext => {
                self.flagged.write().insert(user_id.to_string());
                let redacted = self
                    .guardian
                    .emergency_clear(user_id, "poisoning_escalation")?;
                tracing::warn!(
                    user_id,
                    redacted,
                    patterns = report.patterns.len(),
                    "poisoning escalation cleared recent memory context"
                );
            }
        }
        Ok(report)
    }
}
