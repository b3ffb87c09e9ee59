//! Audited tool execution
//!
//! State machine: received -> validated (schema, safety) -> executed ->
//! logged(success) | rejected -> logged(failed). A validation or safety
//! failure never reaches persistence, and every invocation produces one
//! pending audit entry followed by exactly one terminal entry under a
//! single request id.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::schema::{parse_bodyweight, parse_workout};
use crate::config::ToolConfig;
use crate::error::Result;
use crate::safety::SafetyValidator;
use crate::storage::queries::{self, exercise_history};
use crate::storage::{audit, Storage};
use crate::types::{
    ActionStatus, AppliedAction, FieldError, Rejection, RejectionKind, SafetyDecision,
    ToolExecutionContext, ToolResult, WorkoutRecord,
};

/// Validated, safety-gated, fully audited state mutation
pub struct ToolEngine {
    storage: Storage,
    validator: SafetyValidator,
    config: ToolConfig,
    /// Per-user timestamp of the last accepted request. Grows with the
    /// set of distinct users seen; no eviction in the single-process
    /// model.
    last_request: DashMap<String, Instant>,
    /// Per-(user, exercise) locks serializing check-then-write, retained
    /// for the process lifetime
    exercise_locks: DashMap<(String, String), Arc<Mutex<()>>>,
}

impl ToolEngine {
    pub fn new(storage: Storage, validator: SafetyValidator, config: ToolConfig) -> Self {
        Self {
            storage,
            validator,
            config,
            last_request: DashMap::new(),
            exercise_locks: DashMap::new(),
        }
    }

    /// Execute a structured tool call.
    ///
    /// Domain rejections (validation, safety, rate limit) return
    /// `Ok(ToolResult::Rejected)`; infrastructure failures return `Err`.
    /// Either way a terminal audit entry has been written.
    pub async fn execute(
        &self,
        tool_name: &str,
        params: &Value,
        ctx: &ToolExecutionContext,
    ) -> Result<ToolResult> {
        let request_id = Uuid::new_v4();
        let started = Instant::now();

        self.storage.with_connection(|conn| {
            audit::append_pending(
                conn,
                &ctx.user_id,
                &ctx.session_id,
                tool_name,
                params,
                request_id,
                Utc::now(),
            )
        })?;

        if let Some(rejection) = self.check_rate_limit(&ctx.user_id) {
            return self.reject(request_id, started, "rate_limited", rejection);
        }

        let outcome = match tool_name {
            "log_workout" => self.run_log_workout(params, ctx).await,
            "log_bodyweight" => self.run_log_bodyweight(params, ctx),
            _ => Ok(Err(Rejection {
                kind: RejectionKind::Validation {
                    fields: vec![FieldError {
                        field: "tool_name".into(),
                        message: format!("unknown tool: {}", tool_name),
                    }],
                },
                guidance: "I can log workouts and bodyweight entries.".into(),
            })),
        };

        match outcome {
            Ok(Ok(result)) => {
                let elapsed = started.elapsed().as_millis() as i64;
                self.storage.with_connection(|conn| {
                    audit::append_terminal(
                        conn,
                        request_id,
                        ActionStatus::Success,
                        Some(&result),
                        None,
                        elapsed,
                        Utc::now(),
                    )
                })?;
                Ok(ToolResult::Applied(AppliedAction {
                    request_id,
                    tool_name: tool_name.to_string(),
                    result,
                    execution_time_ms: elapsed,
                }))
            }
            Ok(Err(rejection)) => {
                let code = match rejection.kind {
                    RejectionKind::Validation { .. } => "validation",
                    RejectionKind::Safety { .. } => "safety",
                    RejectionKind::RateLimited { .. } => "rate_limited",
                };
                self.reject(request_id, started, code, rejection)
            }
            Err(e) => {
                // Fail closed: nothing was applied, and the failure is audited
                let elapsed = started.elapsed().as_millis() as i64;
                let log_result = self.storage.with_connection(|conn| {
                    audit::append_terminal(
                        conn,
                        request_id,
                        ActionStatus::Failed,
                        None,
                        Some("provider_error"),
                        elapsed,
                        Utc::now(),
                    )
                });
                if let Err(log_err) = log_result {
                    tracing::error!(%request_id, error = %log_err, "failed to audit errored tool call");
                }
                Err(e)
            }
        }
    }

    fn reject(
        &self,
        request_id: Uuid,
        started: Instant,
        error_code: &str,
        rejection: Rejection,
    ) -> Result<ToolResult> {
        let elapsed = started.elapsed().as_millis() as i64;
        let payload = serde_json::to_value(&rejection)?;
        self.storage.with_connection(|conn| {
            audit::append_terminal(
                conn,
                request_id,
                ActionStatus::Failed,
                Some(&payload),
                Some(error_code),
                elapsed,
                Utc::now(),
            )
        })?;
        Ok(ToolResult::Rejected(rejection))
    }

    /// Minimum inter-request interval per user, enforced in-process
    fn check_rate_limit(&self, user_id: &str) -> Option<Rejection> {
        let min_interval = std::time::Duration::from_millis(self.config.min_interval_ms);
        if min_interval.is_zero() {
            return None;
        }
        let now = Instant::now();
        match self.last_request.entry(user_id.to_string()) {
            Entry::Occupied(mut seen) => {
                let elapsed = now.duration_since(*seen.get());
                if elapsed < min_interval {
                    let retry_after_ms = (min_interval - elapsed).as_millis() as u64;
                    return Some(Rejection {
                        kind: RejectionKind::RateLimited { retry_after_ms },
                        guidance: "You're logging very quickly; give me a second and try again."
                            .into(),
                    });
                }
                seen.insert(now);
            }
            // no prior request on record, always admitted
            Entry::Vacant(slot) => {
                slot.insert(now);
            }
        }
        None
    }

    async fn run_log_workout(
        &self,
        params: &Value,
        ctx: &ToolExecutionContext,
    ) -> Result<std::result::Result<Value, Rejection>> {
        let parsed = match parse_workout(params, &self.config) {
            Ok(p) => p,
            Err(fields) => return Ok(Err(validation_rejection(fields))),
        };

        // Serialize check-then-write per (user, exercise) so two
        // concurrent submissions cannot both pass the progression gate.
        let lock = self
            .exercise_locks
            .entry((ctx.user_id.clone(), parsed.exercise_key.clone()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let history = {
            let user = ctx.user_id.clone();
            let scope = ctx.scope_id.clone();
            let exercise = parsed.exercise_key.clone();
            let window = self.validator.config().history_window;
            self.storage.with_connection(move |conn| {
                exercise_history(conn, &user, scope.as_deref(), &exercise, window)
            })?
        };

        let decision = self.validator.validate_progression(
            &parsed.exercise_key,
            &history,
            parsed.weight_lbs,
            Utc::now(),
        );
        if !decision.safe {
            return Ok(Err(safety_rejection(decision)));
        }

        // Aggregates are derived at write time
        let total_reps: i64 = parsed.reps.iter().map(|r| *r as i64).sum();
        let record = WorkoutRecord {
            owner_id: ctx.user_id.clone(),
            scope_id: ctx.scope_id.clone(),
            exercise_key: parsed.exercise_key.clone(),
            weight_lbs: parsed.weight_lbs,
            original_value: parsed.original_value,
            original_unit: parsed.unit.as_str().to_string(),
            reps: parsed.reps.clone(),
            sets: parsed.sets,
            total_volume_lbs: parsed.weight_lbs * total_reps as f64,
            total_reps,
            max_weight_lbs: parsed.weight_lbs,
            created_at: Utc::now(),
        };
        let record_id = self
            .storage
            .with_transaction(|conn| queries::insert_workout(conn, &record))?;

        tracing::info!(
            user_id = %ctx.user_id,
            exercise = %record.exercise_key,
            weight_lbs = record.weight_lbs,
            "workout logged"
        );
        Ok(Ok(serde_json::json!({
            "record_id": record_id,
            "exercise": record.exercise_key,
            "weight_lbs": record.weight_lbs,
            "original_value": record.original_value,
            "original_unit": record.original_unit,
            "total_volume_lbs": record.total_volume_lbs,
            "total_reps": record.total_reps,
            "max_weight_lbs": record.max_weight_lbs,
        })))
    }

    fn run_log_bodyweight(
        &self,
        params: &Value,
        ctx: &ToolExecutionContext,
    ) -> Result<std::result::Result<Value, Rejection>> {
        let parsed = match parse_bodyweight(params, &self.config) {
            Ok(p) => p,
            Err(fields) => return Ok(Err(validation_rejection(fields))),
        };

        let user = ctx.user_id.clone();
        let entry_id = self.storage.with_connection(move |conn| {
            queries::insert_bodyweight(
                conn,
                &user,
                parsed.weight_lbs,
                parsed.original_value,
                parsed.unit.as_str(),
                Utc::now(),
            )
        })?;

        Ok(Ok(serde_json::json!({
            "entry_id": entry_id,
            "weight_lbs": parsed.weight_lbs,
            "original_value": parsed.original_value,
            "original_unit": parsed.unit.as_str(),
        })))
    }
}

fn validation_rejection(fields: Vec<FieldError>) -> Rejection {
    let detail = fields
        .iter()
        .map(|f| format!("{} {}", f.field, f.message))
        .collect::<Vec<_>>()
        .join("; ");
    Rejection {
        kind: RejectionKind::Validation { fields },
        guidance: format!("I couldn't log that: {}.", detail),
    }
}

fn safety_rejection(decision: SafetyDecision) -> Rejection {
    let guidance = match decision.max_safe_value {
        Some(max) => format!(
            "That's a bigger jump than is safe to program. Try {} lbs or less.",
            max
        ),
        None => "That progression looks unsafe; let's build up more gradually.".to_string(),
    };
    Rejection {
        kind: RejectionKind::Safety { decision },
        guidance,
    }
}
