//! Service facade wiring the coaching core together
//!
//! One `CoachService` owns the memory store, guardian, safety
//! validator, variant selector, tool engine, and both monitors, and
//! exposes the handful of operations a chat layer needs: context
//! assembly, memory writes, audited tool execution, outcome and
//! response recording, and background maintenance loops.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::CoachConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::{Result, SpotterError};
use crate::experiment::{compute_segment, default_catalog, VariantSelector, VariantStatus};
use crate::memory::{MemoryGuardian, MemoryStore, RetrieveOptions, SanitizeResult};
use crate::monitor::{QualityMonitor, SecurityMonitor};
use crate::safety::{ClaimMatch, SafetyValidator};
use crate::storage::{queries, Storage};
use crate::tools::ToolEngine;
use crate::types::{
    ChatContext, CoachContext, ExperimentAssignment, MemoryInput, MemoryLoad, QualitySnapshot,
    ToolExecutionContext, ToolResult, UserProfile,
};

pub struct CoachService {
    config: CoachConfig,
    storage: Storage,
    memory: Arc<MemoryStore>,
    guardian: Arc<MemoryGuardian>,
    selector: Arc<VariantSelector>,
    engine: ToolEngine,
    quality: Arc<QualityMonitor>,
    security: SecurityMonitor,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CoachService {
    pub fn new(
        storage: Storage,
        embedder: Arc<dyn EmbeddingProvider>,
        config: CoachConfig,
    ) -> Self {
        let validator = SafetyValidator::new(config.progression.clone());
        let memory = Arc::new(MemoryStore::new(
            storage.clone(),
            embedder,
            config.memory.clone(),
        ));
        let guardian = Arc::new(MemoryGuardian::new(
            validator.clone(),
            storage.clone(),
            config.memory.clone(),
        ));
        let selector = Arc::new(VariantSelector::new(default_catalog(), storage.clone()));
        let engine = ToolEngine::new(storage.clone(), validator, config.tools.clone());
        let quality = Arc::new(QualityMonitor::new(
            storage.clone(),
            selector.clone(),
            config.quality.clone(),
        ));
        let security = SecurityMonitor::new(guardian.clone(), config.security.clone());
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            storage,
            memory,
            guardian,
            selector,
            engine,
            quality,
            security,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Assemble the personalization context for one chat turn.
    ///
    /// Touches the user's activity profile, classifies their segment,
    /// selects the experiment variant (a tripped kill switch surfaces
    /// as an error, never a silent substitute), retrieves relevant
    /// memories, and filters them through the guardian.
    pub async fn get_context(&self, ctx: &ChatContext) -> Result<CoachContext> {
        if !self.security.record_request(&ctx.user_id) {
            self.security.escalate(&ctx.user_id)?;
        }

        let now = Utc::now();
        let user_id = ctx.user_id.clone();
        let (profile, pr_count) = self.storage.with_connection(move |conn| {
            let profile = queries::touch_profile(conn, &user_id, now)?;
            let pr_count = queries::pr_count_since(conn, &user_id, now - chrono::Duration::days(30))?;
            Ok((profile, pr_count))
        })?;

        let segment = compute_segment(&profile, pr_count, now);
        let variant = self
            .selector
            .select_variant(&ctx.user_id, &ctx.session_id, segment.segment)?;

        // Light memory load halves both the item cap and the budget
        let mut options = RetrieveOptions::defaults(&self.config.memory);
        options.scope_id = ctx.scope_id.clone();
        if variant.memory_load == MemoryLoad::Light {
            options.limit = (options.limit / 2).max(1);
            options.token_budget = (options.token_budget / 2).max(1);
        }
        // The guardian vets candidates inside retrieval, so a dropped
        // memory frees its slot and budget for the next pool item
        let memories = self
            .memory
            .retrieve_filtered(&ctx.user_id, &ctx.query_text, &options, |item| {
                self.guardian.admit_for_retrieval(item)
            })
            .await;

        tracing::debug!(
            user_id = %ctx.user_id,
            segment = %segment.segment,
            variant = %variant.id,
            memories = memories.len(),
            "context assembled"
        );
        Ok(CoachContext {
            variant,
            segment,
            memories,
        })
    }

    /// Store one memory for a user, subject to the guardian's storage
    /// boundary. Returns `false` when the content was refused.
    pub async fn remember(
        &self,
        owner_id: &str,
        scope_id: Option<&str>,
        text: &str,
    ) -> Result<bool> {
        match self.guardian.sanitize_for_storage(owner_id, text) {
            SanitizeResult::Accepted(cleaned) => {
                if cleaned.is_empty() {
                    return Ok(false);
                }
                let mut input = MemoryInput::new(owner_id, cleaned);
                if let Some(scope) = scope_id {
                    input = input.with_scope(scope);
                }
                self.memory.enqueue(input).await?;
                Ok(true)
            }
            SanitizeResult::Refused(_) => Ok(false),
        }
    }

    /// Execute an audited tool call
    pub async fn execute_tool(
        &self,
        tool_name: &str,
        params: &serde_json::Value,
        ctx: &ToolExecutionContext,
    ) -> Result<ToolResult> {
        if !self.security.record_request(&ctx.user_id) {
            self.security.escalate(&ctx.user_id)?;
        }
        self.engine.execute(tool_name, params, ctx).await
    }

    /// Look up the experiment assignment persisted for a (user, session)
    /// pair, if one exists.
    pub fn assignment(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<Option<ExperimentAssignment>> {
        let user = user_id.to_string();
        let session = session_id.to_string();
        self.storage
            .with_connection(move |conn| queries::get_assignment(conn, &user, &session))
    }

    /// Record the outcome for an experiment assignment
    pub fn record_outcome(
        &self,
        assignment_id: Uuid,
        outcome: &str,
        metrics: Option<&serde_json::Value>,
    ) -> Result<()> {
        let outcome = outcome.to_string();
        let metrics = metrics.cloned();
        self.storage.with_connection(move |conn| {
            queries::record_outcome(conn, assignment_id, &outcome, metrics.as_ref(), Utc::now())
        })
    }

    /// Resolve the session's assignment and record its outcome
    pub fn record_session_outcome(
        &self,
        user_id: &str,
        session_id: &str,
        outcome: &str,
        metrics: Option<&serde_json::Value>,
    ) -> Result<()> {
        let assignment = self.assignment(user_id, session_id)?.ok_or_else(|| {
            SpotterError::InvalidInput(format!(
                "no assignment for user {} session {}",
                user_id, session_id
            ))
        })?;
        self.record_outcome(assignment.id, outcome, metrics)
    }

    /// Scan an assistant response for claim-pattern violations and
    /// record each as a safety event attributed to the session's
    /// variant. These events feed the quality monitor's kill switch.
    pub fn record_response(
        &self,
        user_id: &str,
        session_id: &str,
        response_text: &str,
    ) -> Result<Vec<ClaimMatch>> {
        let matches = crate::safety::scan_claims(response_text);
        if matches.is_empty() {
            return Ok(matches);
        }
        let user = user_id.to_string();
        let session = session_id.to_string();
        let found = matches.clone();
        self.storage.with_connection(move |conn| {
            let variant_id = queries::get_assignment(conn, &user, &session)?
                .map(|a| a.variant_id);
            for m in &found {
                queries::record_safety_event(
                    conn,
                    &user,
                    variant_id.as_deref(),
                    m.category.as_str(),
                    Some(m.pattern_id.as_str()),
                    Utc::now(),
                )?;
            }
            Ok(())
        })?;
        tracing::warn!(
            user_id,
            session_id,
            violations = matches.len(),
            "assistant response contained claim-pattern violations"
        );
        Ok(matches)
    }

    /// Runtime status for every catalog variant
    pub fn variant_statuses(&self) -> Result<HashMap<String, VariantStatus>> {
        self.quality.variant_statuses()
    }

    pub fn latest_quality(&self) -> Option<QualitySnapshot> {
        self.quality.latest_snapshot()
    }

    /// Ensure a profile row exists for a user (registration hook)
    pub fn register_user(&self, user_id: &str) -> Result<()> {
        let now = Utc::now();
        let profile = UserProfile {
            user_id: user_id.to_string(),
            created_at: now,
            last_active_at: now,
        };
        self.storage
            .with_connection(move |conn| queries::upsert_profile(conn, &profile))
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    pub fn guardian(&self) -> &MemoryGuardian {
        &self.guardian
    }

    pub fn selector(&self) -> &VariantSelector {
        &self.selector
    }

    pub fn security(&self) -> &SecurityMonitor {
        &self.security
    }

    /// Spawn the background maintenance loops: the periodic memory
    /// flush and the quality tick. Ticks never overlap; the next one
    /// waits for the previous pass to finish.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        let memory = self.memory.clone();
        let mut rx = self.shutdown.subscribe();
        let flush_interval = Duration::from_secs(self.config.memory.flush_interval_secs);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // immediate first tick
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        memory.flush_all().await;
                    }
                    _ = rx.changed() => {
                        if *rx.borrow() {
                            break;
                        }
                    }
                }
            }
        }));

        let quality = self.quality.clone();
        let mut rx = self.shutdown.subscribe();
        let tick_interval = Duration::from_secs(self.config.quality.tick_interval_secs);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = quality.tick() {
                            tracing::error!(error = %e, "quality tick failed");
                        }
                    }
                    _ = rx.changed() => {
                        if *rx.borrow() {
                            break;
                        }
                    }
                }
            }
        }));
    }

    /// Stop the background loops and flush any buffered memories
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "background task join failed");
            }
        }
        self.memory.flush_all().await;
    }
}
