//! Runtime configuration for the coaching core
//!
//! Every tunable lives here with a hand-tuned default so tests and
//! embedders can override narrowly.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Top-level configuration for [`crate::service::CoachService`]
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CoachConfig {
    pub memory: MemoryConfig,
    pub progression: ProgressionConfig,
    pub quality: QualityConfig,
    pub security: SecurityConfig,
    pub tools: ToolConfig,
}

/// Embedding memory store tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Per-owner buffer size that triggers an immediate flush
    pub flush_threshold: usize,
    /// Periodic background flush interval in seconds
    pub flush_interval_secs: u64,
    /// Maximum items per embedding provider batch
    pub embed_batch_size: usize,
    /// Similarity candidate pool size before the recency re-sort
    pub candidate_pool: usize,
    /// Default result limit for retrieval
    pub default_limit: usize,
    /// Hard cap on returned items regardless of limit
    pub max_context_items: usize,
    /// Default token budget for retrieval
    pub default_token_budget: usize,
    /// Maximum stored text length after sanitization
    pub max_text_len: usize,
    /// Timeout for embedding provider calls, in milliseconds
    pub provider_timeout_ms: u64,
    /// How many recent memories the poisoning scan examines
    pub poisoning_scan_window: usize,
    /// Emergency clear redacts memories newer than this many days
    pub emergency_clear_days: i64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            flush_threshold: 10,
            flush_interval_secs: 60,
            embed_batch_size: 100,
            candidate_pool: 20,
            default_limit: 10,
            max_context_items: 8,
            default_token_budget: 1500,
            max_text_len: 2000,
            provider_timeout_ms: 10_000,
            poisoning_scan_window: 20,
            emergency_clear_days: 7,
        }
    }
}

/// Weight-progression safety limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressionConfig {
    /// Maximum fractional increase over the most recent value (0.10 = +10%)
    pub max_increase: f64,
    /// Gap in days after which the stricter post-layoff limit applies
    pub gap_days: i64,
    /// Maximum fractional increase allowed after a layoff gap
    pub gap_max_increase: f64,
    /// Maximum fractional increase over the earliest of the last three
    /// values when a dip-then-rise pattern is present
    pub zigzag_max_increase: f64,
    /// History window consulted per exercise
    pub history_window: usize,
    /// Minimum history rows before the round-number heuristic arms
    pub round_number_min_history: usize,
    /// Static no-history caps per exercise key, in lbs
    pub default_caps: HashMap<String, f64>,
    /// Cap for exercises absent from `default_caps`, in lbs
    pub fallback_cap: f64,
}

impl Default for ProgressionConfig {
    fn default() -> Self {
        let mut caps = HashMap::new();
        caps.insert("bench_press".to_string(), 95.0);
        caps.insert("squat".to_string(), 135.0);
        caps.insert("deadlift".to_string(), 135.0);
        caps.insert("overhead_press".to_string(), 65.0);
        caps.insert("barbell_row".to_string(), 95.0);
        Self {
            max_increase: 0.10,
            gap_days: 7,
            gap_max_increase: 0.15,
            zigzag_max_increase: 0.20,
            history_window: 10,
            round_number_min_history: 3,
            default_caps: caps,
            fallback_cap: 45.0,
        }
    }
}

/// Quality monitor thresholds and windows
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Monitor tick interval in seconds
    pub tick_interval_secs: u64,
    /// Trailing window in minutes
    pub window_minutes: i64,
    /// Tool-call error rate warn threshold
    pub error_rate_warn: f64,
    /// Tool-call error rate critical threshold
    pub error_rate_critical: f64,
    /// p95 latency warn threshold in milliseconds
    pub p95_warn_ms: i64,
    /// p95 latency critical threshold in milliseconds
    pub p95_critical_ms: i64,
    /// Minimum recent calls before a disabled variant may auto-recover
    pub recovery_min_samples: i64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 300,
            window_minutes: 60,
            error_rate_warn: 0.03,
            error_rate_critical: 0.05,
            p95_warn_ms: 2500,
            p95_critical_ms: 3000,
            recovery_min_samples: 20,
        }
    }
}

/// Security monitor tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Sliding window length in seconds
    pub window_secs: u64,
    /// Maximum requests per user per window before flagging
    pub max_requests_per_window: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            max_requests_per_window: 30,
        }
    }
}

/// Tool execution engine tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    /// Minimum interval between requests per user, in milliseconds
    pub min_interval_ms: u64,
    /// Maximum reps per set accepted by schema validation
    pub max_reps: u32,
    /// Maximum sets per workout accepted by schema validation
    pub max_sets: u32,
    /// Maximum weight in lbs accepted by schema validation
    pub max_weight_lbs: f64,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 1000,
            max_reps: 100,
            max_sets: 20,
            max_weight_lbs: 1500.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_sane() {
        let cfg = CoachConfig::default();
        assert_eq!(cfg.memory.flush_threshold, 10);
        assert_eq!(cfg.memory.max_context_items, 8);
        assert!((cfg.progression.max_increase - 0.10).abs() < f64::EPSILON);
        assert_eq!(cfg.progression.default_caps["bench_press"], 95.0);
        assert!(cfg.quality.error_rate_warn < cfg.quality.error_rate_critical);
    }

    #[test]
    fn test_partial_deserialization() {
        let cfg: CoachConfig =
            serde_json::from_str(r#"{"memory": {"flush_threshold": 5}}"#).unwrap();
        assert_eq!(cfg.memory.flush_threshold, 5);
        // untouched fields keep defaults
        assert_eq!(cfg.memory.embed_batch_size, 100);
        assert_eq!(cfg.tools.min_interval_ms, 1000);
    }
}
