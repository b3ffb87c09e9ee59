//! Governed prompt-variant selection
//!
//! Deterministic per (user, session): a stable hash over the segment's
//! candidate list, cached per session and persisted as an experiment
//! assignment. The disabled-id set is the kill switch: a disabled
//! variant is never silently substituted, and disabling a variant
//! evicts every cached assignment that references it.

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::error::{Result, SpotterError};
use crate::storage::{queries, Storage};
use crate::types::{
    ExperimentAssignment, MemoryLoad, SafetyLevel, Segment, Tone, VariantDefinition,
};

/// Whether a variant was disabled by an operator or by the quality monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisableMode {
    Manual,
    Auto,
}

/// Runtime status of one variant, as reported by `get_variant_status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantStatus {
    pub enabled: bool,
    pub disable_mode: Option<DisableMode>,
    /// Terminal calls in the trailing quality window
    pub recent_calls: i64,
    /// Failed calls in the trailing quality window
    pub recent_failures: i64,
    /// Safety violations in the trailing quality window
    pub recent_safety_violations: i64,
}

/// The static variant catalog shipped with the coach
pub fn default_catalog() -> Vec<VariantDefinition> {
    vec![
        VariantDefinition {
            id: "control".into(),
            tone: Tone::Supportive,
            memory_load: MemoryLoad::Full,
            logging_offer: false,
            safety_level: SafetyLevel::Standard,
        },
        VariantDefinition {
            id: "v1-encourager".into(),
            tone: Tone::Supportive,
            memory_load: MemoryLoad::Light,
            logging_offer: true,
            safety_level: SafetyLevel::Strict,
        },
        VariantDefinition {
            id: "v2-data-driven".into(),
            tone: Tone::DataDriven,
            memory_load: MemoryLoad::Full,
            logging_offer: true,
            safety_level: SafetyLevel::Standard,
        },
        VariantDefinition {
            id: "v3-direct-minimal".into(),
            tone: Tone::Direct,
            memory_load: MemoryLoad::Light,
            logging_offer: false,
            safety_level: SafetyLevel::Minimal,
        },
    ]
}

/// Deterministic, governed variant assignment per (user, session)
pub struct VariantSelector {
    catalog: Vec<VariantDefinition>,
    disabled: RwLock<HashMap<String, DisableMode>>,
    /// (user_id, session_id) -> variant_id
    cache: DashMap<(String, String), String>,
    storage: Storage,
}

impl VariantSelector {
    pub fn new(catalog: Vec<VariantDefinition>, storage: Storage) -> Self {
        Self {
            catalog,
            disabled: RwLock::new(HashMap::new()),
            cache: DashMap::new(),
            storage,
        }
    }

    pub fn catalog(&self) -> &[VariantDefinition] {
        &self.catalog
    }

    pub fn definition(&self, variant_id: &str) -> Option<&VariantDefinition> {
        self.catalog.iter().find(|v| v.id == variant_id)
    }

    pub fn is_disabled(&self, variant_id: &str) -> bool {
        self.disabled.read().contains_key(variant_id)
    }

    pub fn disabled_ids(&self) -> HashSet<String> {
        self.disabled.read().keys().cloned().collect()
    }

    /// Variants disabled automatically by the quality monitor
    pub fn auto_disabled_ids(&self) -> HashSet<String> {
        self.disabled
            .read()
            .iter()
            .filter(|(_, mode)| **mode == DisableMode::Auto)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn disable_mode(&self, variant_id: &str) -> Option<DisableMode> {
        self.disabled.read().get(variant_id).copied()
    }

    /// Add a variant to the kill switch set and evict every cached
    /// session assignment that references it.
    pub fn disable_variant(&self, variant_id: &str, mode: DisableMode) {
        self.disabled
            .write()
            .insert(variant_id.to_string(), mode);
        let evicted_before = self.cache.len();
        self.cache.retain(|_, cached| cached != variant_id);
        tracing::warn!(
            variant_id,
            ?mode,
            evicted = evicted_before - self.cache.len(),
            "variant disabled"
        );
    }

    pub fn enable_variant(&self, variant_id: &str) {
        if self.disabled.write().remove(variant_id).is_some() {
            tracing::info!(variant_id, "variant re-enabled");
        }
    }

    /// Select the variant for a (user, session) pair.
    ///
    /// Selection is deterministic: a stable hash of `user:session` over
    /// the segment-filtered candidate list. A cached pick is reused
    /// unless it has been disabled, in which case the cache entry is
    /// evicted and one salted re-hash is attempted; if that pick is also
    /// disabled, the call fails with `VariantDisabled`. The kill switch
    /// is never bypassed with a default.
    pub fn select_variant(
        &self,
        user_id: &str,
        session_id: &str,
        segment: Segment,
    ) -> Result<VariantDefinition> {
        let candidates: Vec<&VariantDefinition> = self
            .catalog
            .iter()
            .filter(|v| v.appropriate_for(segment))
            .collect();
        if candidates.is_empty() {
            return Err(SpotterError::Config(format!(
                "no variants appropriate for segment {}",
                segment
            )));
        }

        let cache_key = (user_id.to_string(), session_id.to_string());
        if let Some(cached) = self.cache.get(&cache_key) {
            let cached_id = cached.value().clone();
            drop(cached);
            if !self.is_disabled(&cached_id) {
                if let Some(def) = self.definition(&cached_id) {
                    return Ok(def.clone());
                }
            }
            // Disabled while cached: forced re-selection
            self.cache.remove(&cache_key);
        }

        let primary = candidates[stable_pick(user_id, session_id, 0, candidates.len())];
        let pick = if self.is_disabled(&primary.id) {
            let rehash = candidates[stable_pick(user_id, session_id, 1, candidates.len())];
            if self.is_disabled(&rehash.id) {
                return Err(SpotterError::VariantDisabled(rehash.id.clone()));
            }
            rehash
        } else {
            primary
        };

        self.persist_assignment(user_id, session_id, pick, segment)?;
        self.cache.insert(cache_key, pick.id.clone());
        Ok(pick.clone())
    }

    fn persist_assignment(
        &self,
        user_id: &str,
        session_id: &str,
        variant: &VariantDefinition,
        segment: Segment,
    ) -> Result<()> {
        let assignment = ExperimentAssignment {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            variant_id: variant.id.clone(),
            segment,
            variant_config: serde_json::to_value(variant)?,
            created_at: Utc::now(),
            outcome: None,
            metrics: None,
            completed_at: None,
        };
        self.storage
            .with_connection(move |conn| queries::upsert_assignment(conn, &assignment))
    }

    /// Number of live cached session assignments (monitoring)
    pub fn cached_sessions(&self) -> usize {
        self.cache.len()
    }
}

/// Stable candidate index for (user, session, salt)
fn stable_pick(user_id: &str, session_id: &str, salt: u8, count: usize) -> usize {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hasher.update(b":");
    hasher.update(session_id.as_bytes());
    hasher.update([salt]);
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % count as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selector() -> VariantSelector {
        VariantSelector::new(default_catalog(), Storage::open_in_memory().unwrap())
    }

    #[test]
    fn test_selection_deterministic() {
        let s = selector();
        let a = s
            .select_variant("u1", "s1", Segment::Intermediate)
            .unwrap();
        let b = s
            .select_variant("u1", "s1", Segment::Intermediate)
            .unwrap();
        assert_eq!(a.id, b.id);

        // fresh selector, same inputs, same pick (hash is process-stable)
        let s2 = selector();
        let c = s2
            .select_variant("u1", "s1", Segment::Intermediate)
            .unwrap();
        assert_eq!(a.id, c.id);
    }

    #[test]
    fn test_beginner_never_gets_minimal_safety() {
        let s = selector();
        for i in 0..50 {
            let picked = s
                .select_variant(&format!("user-{}", i), "s1", Segment::Beginner)
                .unwrap();
            assert_ne!(picked.safety_level, SafetyLevel::Minimal);
        }
    }

    #[test]
    fn test_selection_persists_assignment() {
        let s = selector();
        let picked = s.select_variant("u1", "s1", Segment::Advanced).unwrap();
        let stored = s
            .storage
            .with_connection(|conn| queries::get_assignment(conn, "u1", "s1"))
            .unwrap()
            .unwrap();
        assert_eq!(stored.variant_id, picked.id);
        assert_eq!(stored.segment, Segment::Advanced);
    }

    // Disabling evicts cached assignments; later selections
    // never return the disabled variant
    #[test]
    fn test_disable_evicts_and_never_returns() {
        let s = selector();
        let mut holders = Vec::new();
        let mut target = None;
        for i in 0..40 {
            let user = format!("user-{}", i);
            let picked = s
                .select_variant(&user, "session", Segment::Advanced)
                .unwrap();
            if target.is_none() {
                target = Some(picked.id.clone());
            }
            if Some(&picked.id) == target.as_ref() {
                holders.push(user);
            }
        }
        let target = target.unwrap();
        assert!(holders.len() >= 2);
        let cached_before = s.cached_sessions();

        s.disable_variant(&target, DisableMode::Manual);
        assert_eq!(s.cached_sessions(), cached_before - holders.len());

        for user in &holders {
            match s.select_variant(user, "session", Segment::Advanced) {
                Ok(picked) => assert_ne!(picked.id, target),
                Err(SpotterError::VariantDisabled(_)) => {}
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
    }

    #[test]
    fn test_all_disabled_fails_explicitly() {
        let s = selector();
        for v in default_catalog() {
            s.disable_variant(&v.id, DisableMode::Manual);
        }
        let result = s.select_variant("u1", "s1", Segment::Advanced);
        assert!(matches!(result, Err(SpotterError::VariantDisabled(_))));
    }

    #[test]
    fn test_enable_restores_selection() {
        let s = selector();
        let picked = s.select_variant("u1", "s1", Segment::Advanced).unwrap();
        s.disable_variant(&picked.id, DisableMode::Auto);
        assert_eq!(s.auto_disabled_ids().len(), 1);

        s.enable_variant(&picked.id);
        assert!(!s.is_disabled(&picked.id));
        let again = s.select_variant("u1", "s1", Segment::Advanced).unwrap();
        assert_eq!(again.id, picked.id);
    }
}
