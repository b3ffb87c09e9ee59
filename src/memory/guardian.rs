//! Memory guardian
//!
//! Sanitizes content entering the memory store, re-validates content
//! leaving it (rules may have changed since storage), and watches for
//! memory-poisoning attempts. Escalation never hard-deletes: emergency
//! clearing redacts, preserving the audit trail.

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::MemoryConfig;
use crate::safety::{ClaimCategory, ClaimMatch, SafetyValidator};
use crate::storage::{queries, Storage};
use crate::types::{MemoryItem, SafetyDecision};

/// Result of a sanitize-for-storage pass
#[derive(Debug, Clone)]
pub enum SanitizeResult {
    /// Cleaned text, safe to persist
    Accepted(String),
    /// Content violates claim rules; the caller must not persist it
    Refused(SafetyDecision),
}

/// Escalating response to suspected memory poisoning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoisoningRecommendation {
    None,
    /// Mark the account for review
    Flag,
    /// Restrict memory writes pending review
    Restrict,
    /// Redact the recent memory window immediately
    ClearContext,
}

/// Outcome of a poisoning scan over recent memories
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoisoningReport {
    pub suspicious: bool,
    pub patterns: Vec<ClaimMatch>,
    pub recommendation: PoisoningRecommendation,
}

/// Uses the safety validator to police the memory store's boundaries
pub struct MemoryGuardian {
    validator: SafetyValidator,
    storage: Storage,
    config: MemoryConfig,
}

impl MemoryGuardian {
    pub fn new(validator: SafetyValidator, storage: Storage, config: MemoryConfig) -> Self {
        Self {
            validator,
            storage,
            config,
        }
    }

    /// Strip control characters and emoji, truncate, then claim-check.
    /// A violation is a refusal; there is no degraded-persist path.
    pub fn sanitize_for_storage(&self, owner_id: &str, text: &str) -> SanitizeResult {
        let cleaned = strip_hostile_chars(text);
        let cleaned: String = cleaned.chars().take(self.config.max_text_len).collect();
        let cleaned = cleaned.trim().to_string();

        let decision = self.validator.validate_text_claims(&cleaned);
        if !decision.safe {
            tracing::info!(owner_id, reason = ?decision.reason, "memory refused at storage boundary");
            return SanitizeResult::Refused(decision);
        }
        SanitizeResult::Accepted(cleaned)
    }

    /// Read-time admission check for one candidate under the current
    /// rule set. Suitable as the retrieval predicate, so a dropped
    /// candidate frees its slot for the next one in the pool.
    pub fn admit_for_retrieval(&self, item: &MemoryItem) -> bool {
        let safe = self.validator.validate_text_claims(&item.text).safe;
        if !safe {
            tracing::debug!(memory_id = item.id, "memory dropped at retrieval boundary");
        }
        safe
    }

    /// Re-validate candidates at read time, dropping any that fail under
    /// the current rule set, until `limit` safe items are collected.
    pub fn filter_for_retrieval(&self, candidates: Vec<MemoryItem>, limit: usize) -> Vec<MemoryItem> {
        let mut safe = Vec::with_capacity(limit);
        for item in candidates {
            if safe.len() >= limit {
                break;
            }
            if self.admit_for_retrieval(&item) {
                safe.push(item);
            }
        }
        safe
    }

    /// Scan the most recent memories for clustered adversarial claims.
    ///
    /// Escalation: ≥3 matches in one category flags; ≥2 distinct
    /// categories restricts; ≥3 categories or ≥3 bypass matches clears
    /// the recent context.
    pub fn detect_poisoning(&self, owner_id: &str) -> crate::error::Result<PoisoningReport> {
        let window = self.config.poisoning_scan_window;
        let owner = owner_id.to_string();
        let recent = self
            .storage
            .with_connection(move |conn| queries::recent_memories(conn, &owner, window))?;

        let mut patterns: Vec<ClaimMatch> = Vec::new();
        for item in &recent {
            patterns.extend(self.validator.claim_matches(&item.text));
        }

        let mut per_category: HashMap<ClaimCategory, usize> = HashMap::new();
        for m in &patterns {
            *per_category.entry(m.category).or_insert(0) += 1;
        }
        let category_count = per_category.len();
        let max_in_one = per_category.values().copied().max().unwrap_or(0);
        let bypass_count = per_category
            .get(&ClaimCategory::SafetyBypass)
            .copied()
            .unwrap_or(0);

        let recommendation = if category_count >= 3 || bypass_count >= 3 {
            PoisoningRecommendation::ClearContext
        } else if category_count >= 2 {
            PoisoningRecommendation::Restrict
        } else if max_in_one >= 3 {
            PoisoningRecommendation::Flag
        } else {
            PoisoningRecommendation::None
        };

        Ok(PoisoningReport {
            suspicious: recommendation != PoisoningRecommendation::None,
            patterns,
            recommendation,
        })
    }

    /// Redact (soft-delete) the owner's recent memory window, recording
    /// the reason. Reversible by construction; never hard-deletes.
    pub fn emergency_clear(&self, owner_id: &str, reason: &str) -> crate::error::Result<usize> {
        let since = Utc::now() - Duration::days(self.config.emergency_clear_days);
        let owner = owner_id.to_string();
        let reason = reason.to_string();
        let redacted = self
            .storage
            .with_connection(move |conn| queries::redact_since(conn, &owner, since, &reason))?;
        tracing::warn!(owner_id, redacted, "emergency memory clear executed");
        Ok(redacted)
    }
}

/// Remove control characters and emoji/symbol codepoints
fn strip_hostile_chars(text: &str) -> String {
    text.chars()
        .filter(|c| {
            if c.is_control() && *c != '\n' && *c != '\t' {
                return false;
            }
            let cp = *c as u32;
            // emoji blocks, dingbats, variation selectors
            !matches!(cp,
                0x1F000..=0x1FAFF
                | 0x2600..=0x27BF
                | 0x2190..=0x21FF
                | 0xFE00..=0xFE0F
                | 0x200D
            )
        })
        .collect()
}
