//! Core types for Spotter

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Unique identifier for a memory item (SQLite rowid)
pub type MemoryItemId = i64;

/// A single piece of retrievable user-specific text, embedded for
/// similarity search. Immutable once embedded; only `redacted` ever
/// changes (soft delete, audit-preserving).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryItem {
    /// Unique identifier
    pub id: MemoryItemId,
    /// Owning user
    pub owner_id: String,
    /// Optional scope (e.g. a training program) for isolation
    pub scope_id: Option<String>,
    /// Memory text
    pub text: String,
    /// Embedding vector
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub embedding: Vec<f32>,
    /// Model that produced the embedding
    pub embedding_model: String,
    /// Arbitrary metadata as JSON
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Importance weight (default 1.0)
    #[serde(default = "default_importance")]
    pub importance: f32,
    /// Soft-delete flag
    #[serde(default)]
    pub redacted: bool,
    /// When the memory was created
    pub created_at: DateTime<Utc>,
}

fn default_importance() -> f32 {
    1.0
}

/// Input for enqueueing a new memory (pre-embedding)
#[derive(Debug, Clone)]
pub struct MemoryInput {
    pub owner_id: String,
    pub scope_id: Option<String>,
    pub text: String,
    pub metadata: HashMap<String, serde_json::Value>,
    pub importance: f32,
}

impl MemoryInput {
    pub fn new(owner_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            scope_id: None,
            text: text.into(),
            metadata: HashMap::new(),
            importance: 1.0,
        }
    }

    pub fn with_scope(mut self, scope_id: impl Into<String>) -> Self {
        self.scope_id = Some(scope_id.into());
        self
    }
}

/// Coarse experience bucket driving tone and safety defaults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Segment {
    Beginner,
    Intermediate,
    Advanced,
    Returning,
}

impl std::fmt::Display for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Segment::Beginner => write!(f, "beginner"),
            Segment::Intermediate => write!(f, "intermediate"),
            Segment::Advanced => write!(f, "advanced"),
            Segment::Returning => write!(f, "returning"),
        }
    }
}

impl std::str::FromStr for Segment {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "beginner" => Ok(Segment::Beginner),
            "intermediate" => Ok(Segment::Intermediate),
            "advanced" => Ok(Segment::Advanced),
            "returning" => Ok(Segment::Returning),
            _ => Err(format!("Unknown segment: {}", s)),
        }
    }
}

/// Segment classification with supporting detail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentInfo {
    pub segment: Segment,
    /// Weeks since the profile was created
    pub tenure_weeks: i64,
    /// Days since last activity
    pub inactive_days: i64,
    /// Personal records per week over the last 30 days (advanced users only)
    pub pr_per_week: Option<f32>,
}

/// Minimal tenure/activity record read by the segment classifier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

/// Prompt tone for a variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tone {
    Supportive,
    Direct,
    DataDriven,
}

/// How much retrieved memory a variant loads into the prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryLoad {
    Light,
    Full,
}

/// How aggressively the variant's prompt framing defers to safety limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SafetyLevel {
    Strict,
    Standard,
    Minimal,
}

/// A named combination of prompt-construction choices under experiment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantDefinition {
    pub id: String,
    pub tone: Tone,
    pub memory_load: MemoryLoad,
    pub logging_offer: bool,
    pub safety_level: SafetyLevel,
}

impl VariantDefinition {
    /// Static segment-appropriateness filter. Beginners and returning
    /// users never see minimal-safety framing.
    pub fn appropriate_for(&self, segment: Segment) -> bool {
        match segment {
            Segment::Beginner | Segment::Returning => self.safety_level != SafetyLevel::Minimal,
            Segment::Intermediate | Segment::Advanced => true,
        }
    }
}

/// A persisted (user, session) -> variant assignment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentAssignment {
    pub id: Uuid,
    pub user_id: String,
    pub session_id: String,
    pub variant_id: String,
    pub segment: Segment,
    /// Snapshot of the variant config at assignment time
    pub variant_config: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub outcome: Option<String>,
    pub metrics: Option<serde_json::Value>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Terminal/non-terminal status of an audited tool invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Pending,
    Success,
    Failed,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Success => "success",
            ActionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ActionStatus::Pending)
    }
}

impl std::str::FromStr for ActionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ActionStatus::Pending),
            "success" => Ok(ActionStatus::Success),
            "failed" => Ok(ActionStatus::Failed),
            _ => Err(format!("Unknown action status: {}", s)),
        }
    }
}

/// Append-only audit record for a tool invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionLogEntry {
    pub id: i64,
    pub user_id: String,
    pub session_id: String,
    pub tool_name: String,
    pub request_payload: serde_json::Value,
    pub result_payload: Option<serde_json::Value>,
    pub status: ActionStatus,
    pub error_code: Option<String>,
    pub execution_time_ms: Option<i64>,
    pub request_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Advisory output of a safety check; never mutates state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyDecision {
    pub safe: bool,
    pub reason: Option<String>,
    pub max_safe_value: Option<f64>,
}

impl SafetyDecision {
    pub fn safe() -> Self {
        Self {
            safe: true,
            reason: None,
            max_safe_value: None,
        }
    }

    pub fn unsafe_with(reason: impl Into<String>, max_safe_value: Option<f64>) -> Self {
        Self {
            safe: false,
            reason: Some(reason.into()),
            max_safe_value,
        }
    }
}

/// Severity attached to a quality alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warn,
    Critical,
}

/// A threshold breach observed by the quality monitor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityAlert {
    pub severity: AlertSeverity,
    pub metric: String,
    pub value: f64,
    pub threshold: f64,
    /// Variant implicated by the breach, if attributable
    pub variant_id: Option<String>,
}

/// Point-in-time aggregate over the trailing quality window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualitySnapshot {
    pub window_start: DateTime<Utc>,
    pub tool_call_error_rate: f64,
    pub safety_violation_count: i64,
    pub p95_latency_ms: i64,
    pub p99_latency_ms: i64,
    pub alerts: Vec<QualityAlert>,
    pub created_at: DateTime<Utc>,
}

/// Request shape for context assembly
#[derive(Debug, Clone)]
pub struct ChatContext {
    pub user_id: String,
    pub session_id: String,
    pub scope_id: Option<String>,
    pub query_text: String,
}

/// Request shape for tool execution
#[derive(Debug, Clone)]
pub struct ToolExecutionContext {
    pub user_id: String,
    pub scope_id: Option<String>,
    pub session_id: String,
}

/// Personalization + memory bundle returned to the chat layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoachContext {
    pub variant: VariantDefinition,
    pub segment: SegmentInfo,
    pub memories: Vec<MemoryItem>,
}

/// Field-level validation failure detail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// Why a tool invocation was rejected before persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectionKind {
    /// Malformed or out-of-range input
    Validation { fields: Vec<FieldError> },
    /// Progression or content-claim safety check failed
    Safety { decision: SafetyDecision },
    /// Per-user minimum inter-request interval not yet elapsed
    RateLimited { retry_after_ms: u64 },
}

/// Domain-expected rejection of a tool invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rejection {
    pub kind: RejectionKind,
    /// Corrective natural-language guidance for the end user
    pub guidance: String,
}

/// Result of an applied tool invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedAction {
    pub request_id: Uuid,
    pub tool_name: String,
    pub result: serde_json::Value,
    pub execution_time_ms: i64,
}

/// Outcome of a tool invocation: applied, or rejected with guidance.
/// Both paths have produced exactly one terminal audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ToolResult {
    Applied(AppliedAction),
    Rejected(Rejection),
}

impl ToolResult {
    pub fn is_applied(&self) -> bool {
        matches!(self, ToolResult::Applied(_))
    }
}

/// The persisted domain mutation for a logged workout, with aggregates
/// derived at write time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkoutRecord {
    pub owner_id: String,
    pub scope_id: Option<String>,
    pub exercise_key: String,
    /// Normalized weight in canonical lbs
    pub weight_lbs: f64,
    /// Value as submitted, for display and audit
    pub original_value: f64,
    /// Unit as submitted
    pub original_unit: String,
    /// Reps per set
    pub reps: Vec<u32>,
    pub sets: u32,
    /// Σ weight × reps, in lbs
    pub total_volume_lbs: f64,
    pub total_reps: i64,
    pub max_weight_lbs: f64,
    pub created_at: DateTime<Utc>,
}

/// One historical data point for a tracked progression metric,
/// ordered most recent first when loaded as a window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressionEntry {
    /// Recorded value in canonical units (lbs)
    pub value: f64,
    pub created_at: DateTime<Utc>,
}

/// Estimate the token footprint of a text: ceil(chars / 4)
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        // chars, not bytes
        assert_eq!(estimate_tokens("ééééé"), 2);
    }

    #[test]
    fn test_segment_roundtrip() {
        for seg in [
            Segment::Beginner,
            Segment::Intermediate,
            Segment::Advanced,
            Segment::Returning,
        ] {
            let parsed: Segment = seg.to_string().parse().unwrap();
            assert_eq!(seg, parsed);
        }
    }

    #[test]
    fn test_minimal_safety_excluded_for_beginners() {
        let v = VariantDefinition {
            id: "v3".into(),
            tone: Tone::Direct,
            memory_load: MemoryLoad::Full,
            logging_offer: false,
            safety_level: SafetyLevel::Minimal,
        };
        assert!(!v.appropriate_for(Segment::Beginner));
        assert!(!v.appropriate_for(Segment::Returning));
        assert!(v.appropriate_for(Segment::Advanced));
    }
}
