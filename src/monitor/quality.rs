//! Quality monitor
//!
//! Periodically aggregates the trailing window of terminal tool calls
//! and safety events, raises threshold alerts, trips the variant kill
//! switch on critical breaches, and recovers auto-disabled variants
//! once their gates pass again with enough samples.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use parking_lot::RwLock;

use crate::config::QualityConfig;
use crate::error::Result;
use crate::experiment::{DisableMode, VariantSelector, VariantStatus};
use crate::storage::{queries, Storage};
use crate::types::{AlertSeverity, QualityAlert, QualitySnapshot};

pub struct QualityMonitor {
    storage: Storage,
    selector: Arc<VariantSelector>,
    config: QualityConfig,
    latest: RwLock<Option<QualitySnapshot>>,
}

impl QualityMonitor {
    pub fn new(storage: Storage, selector: Arc<VariantSelector>, config: QualityConfig) -> Self {
        Self {
            storage,
            selector,
            config,
            latest: RwLock::new(None),
        }
    }

    /// Most recent snapshot, if a tick has run
    pub fn latest_snapshot(&self) -> Option<QualitySnapshot> {
        self.latest.read().clone()
    }

    /// Run one evaluation pass over the trailing window.
    ///
    /// Critical breaches disable the implicated variants (auto mode);
    /// previously auto-disabled variants are re-enabled when all gates
    /// pass and the window holds at least `recovery_min_samples` calls.
    pub fn tick(&self) -> Result<QualitySnapshot> {
        let now = Utc::now();
        let since = now - Duration::minutes(self.config.window_minutes);

        let (stats, safety_counts, per_variant) = self.storage.with_connection(|conn| {
            Ok((
                queries::action_window_stats(conn, since)?,
                queries::safety_event_counts(conn, since)?,
                queries::variant_call_stats(conn, since)?,
            ))
        })?;

        let error_rate = stats.error_rate();
        let p95 = stats.latency_percentile(95.0);
        let p99 = stats.latency_percentile(99.0);
        let safety_total: i64 = safety_counts.iter().map(|(_, n)| n).sum();

        let mut alerts = Vec::new();

        if error_rate >= self.config.error_rate_critical {
            alerts.push(QualityAlert {
                severity: AlertSeverity::Critical,
                metric: "tool_call_error_rate".into(),
                value: error_rate,
                threshold: self.config.error_rate_critical,
                variant_id: None,
            });
        } else if error_rate >= self.config.error_rate_warn {
            alerts.push(QualityAlert {
                severity: AlertSeverity::Warn,
                metric: "tool_call_error_rate".into(),
                value: error_rate,
                threshold: self.config.error_rate_warn,
                variant_id: None,
            });
        }

        if p95 >= self.config.p95_critical_ms {
            alerts.push(QualityAlert {
                severity: AlertSeverity::Critical,
                metric: "p95_latency_ms".into(),
                value: p95 as f64,
                threshold: self.config.p95_critical_ms as f64,
                variant_id: None,
            });
        } else if p95 >= self.config.p95_warn_ms {
            alerts.push(QualityAlert {
                severity: AlertSeverity::Warn,
                metric: "p95_latency_ms".into(),
                value: p95 as f64,
                threshold: self.config.p95_warn_ms as f64,
                variant_id: None,
            });
        }

        // Any safety violation in the window is critical. Attributable
        // ones trip the kill switch on the implicated variant.
        for (variant_id, count) in &safety_counts {
            if *count == 0 {
                continue;
            }
            alerts.push(QualityAlert {
                severity: AlertSeverity::Critical,
                metric: "safety_violation_count".into(),
                value: *count as f64,
                threshold: 0.0,
                variant_id: variant_id.clone(),
            });
            if let Some(id) = variant_id {
                if !self.selector.is_disabled(id) {
                    tracing::warn!(variant_id = %id, count, "auto-disabling variant after safety violation");
                    self.selector.disable_variant(id, DisableMode::Auto);
                }
            }
        }

        // Per-variant error rate at the critical threshold also trips
        // the kill switch for that variant.
        for (variant_id, (calls, failures)) in &per_variant {
            if *calls == 0 {
                continue;
            }
            let rate = *failures as f64 / *calls as f64;
            if rate >= self.config.error_rate_critical && !self.selector.is_disabled(variant_id) {
                alerts.push(QualityAlert {
                    severity: AlertSeverity::Critical,
                    metric: "variant_error_rate".into(),
                    value: rate,
                    threshold: self.config.error_rate_critical,
                    variant_id: Some(variant_id.clone()),
                });
                tracing::warn!(variant_id = %variant_id, rate, "auto-disabling variant after error-rate breach");
                self.selector.disable_variant(variant_id, DisableMode::Auto);
            }
        }

        self.recover_variants(&per_variant, &safety_counts);

        let snapshot = QualitySnapshot {
            window_start: since,
            tool_call_error_rate: error_rate,
            safety_violation_count: safety_total,
            p95_latency_ms: p95,
            p99_latency_ms: p99,
            alerts,
            created_at: now,
        };
        tracing::debug!(
            error_rate,
            p95_latency_ms = p95,
            safety_violations = safety_total,
            alerts = snapshot.alerts.len(),
            "quality tick"
        );
        *self.latest.write() = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Re-enable auto-disabled variants whose gates pass with enough
    /// recent samples. Manually disabled variants are never recovered.
    fn recover_variants(
        &self,
        per_variant: &HashMap<String, (i64, i64)>,
        safety_counts: &[(Option<String>, i64)],
    ) {
        for id in self.selector.auto_disabled_ids() {
            let (calls, failures) = per_variant.get(&id).copied().unwrap_or((0, 0));
            if calls < self.config.recovery_min_samples {
                continue;
            }
            let violations = safety_counts
                .iter()
                .filter(|(v, _)| v.as_deref() == Some(id.as_str()))
                .map(|(_, n)| n)
                .sum::<i64>();
            let rate = failures as f64 / calls as f64;
            if violations == 0 && rate < self.config.error_rate_warn {
                tracing::info!(variant_id = %id, calls, rate, "recovering auto-disabled variant");
                self.selector.enable_variant(&id);
            }
        }
    }

    /// Runtime status for every catalog variant over the trailing window
    pub fn variant_statuses(&self) -> Result<HashMap<String, VariantStatus>> {
        let since = Utc::now() - Duration::minutes(self.config.window_minutes);
        let (per_variant, safety_counts) = self.storage.with_connection(|conn| {
            Ok((
                queries::variant_call_stats(conn, since)?,
                queries::safety_event_counts(conn, since)?,
            ))
        })?;

        let mut statuses = HashMap::new();
        for def in self.selector.catalog() {
            let (calls, failures) = per_variant.get(&def.id).copied().unwrap_or((0, 0));
            let violations = safety_counts
                .iter()
                .filter(|(v, _)| v.as_deref() == Some(def.id.as_str()))
                .map(|(_, n)| n)
                .sum::<i64>();
            statuses.insert(
                def.id.clone(),
                VariantStatus {
                    enabled: !self.selector.is_disabled(&def.id),
                    disable_mode: self.selector.disable_mode(&def.id),
                    recent_calls: calls,
                    recent_failures: failures,
                    recent_safety_violations: violations,
                },
            );
        }
        Ok(statuses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::default_catalog;
    use crate::storage::audit;
    use crate::types::ActionStatus;
    use uuid::Uuid;

    fn monitor(storage: Storage) -> QualityMonitor {
        let selector = Arc::new(VariantSelector::new(default_catalog(), storage.clone()));
        QualityMonitor::new(storage, selector, QualityConfig::default())
    }

    fn log_call(storage: &Storage, user: &str, session: &str, failed: bool, latency_ms: i64) {
        let request_id = Uuid::new_v4();
        storage
            .with_connection(|conn| {
                audit::append_pending(
                    conn,
                    user,
                    session,
                    "log_workout",
                    &serde_json::json!({}),
                    request_id,
                    Utc::now(),
                )?;
                audit::append_terminal(
                    conn,
                    request_id,
                    if failed {
                        ActionStatus::Failed
                    } else {
                        ActionStatus::Success
                    },
                    None,
                    failed.then_some("validation"),
                    latency_ms,
                    Utc::now(),
                )?;
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_clean_window_produces_no_alerts() {
        let storage = Storage::open_in_memory().unwrap();
        for i in 0..10 {
            log_call(&storage, "u1", &format!("s{}", i), false, 100);
        }
        let m = monitor(storage);
        let snapshot = m.tick().unwrap();
        assert!(snapshot.alerts.is_empty());
        assert_eq!(snapshot.safety_violation_count, 0);
        assert!(m.latest_snapshot().is_some());
    }

    #[test]
    fn test_error_rate_thresholds() {
        let storage = Storage::open_in_memory().unwrap();
        // 4 failures out of 100 calls: warn but not critical
        for i in 0..100 {
            log_call(&storage, "u1", &format!("s{}", i), i < 4, 100);
        }
        let m = monitor(storage);
        let snapshot = m.tick().unwrap();
        let alert = snapshot
            .alerts
            .iter()
            .find(|a| a.metric == "tool_call_error_rate")
            .unwrap();
        assert_eq!(alert.severity, AlertSeverity::Warn);
    }

    #[test]
    fn test_latency_thresholds() {
        let storage = Storage::open_in_memory().unwrap();
        for i in 0..20 {
            log_call(&storage, "u1", &format!("s{}", i), false, 2800);
        }
        let m = monitor(storage);
        let snapshot = m.tick().unwrap();
        let alert = snapshot
            .alerts
            .iter()
            .find(|a| a.metric == "p95_latency_ms")
            .unwrap();
        assert_eq!(alert.severity, AlertSeverity::Warn);
        assert_eq!(snapshot.p95_latency_ms, 2800);
    }

    // A single attributed safety violation is critical and
    // trips the kill switch on that variant.
    #[test]
    fn test_safety_violation_auto_disables_variant() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                queries::record_safety_event(
                    conn,
                    "u1",
                    Some("v3-direct-minimal"),
                    "progression",
                    Some("limit bypassed in output"),
                    Utc::now(),
                )?;
                Ok(())
            })
            .unwrap();

        let m = monitor(storage);
        let snapshot = m.tick().unwrap();
        assert_eq!(snapshot.safety_violation_count, 1);
        assert!(snapshot
            .alerts
            .iter()
            .any(|a| a.severity == AlertSeverity::Critical
                && a.metric == "safety_violation_count"
                && a.variant_id.as_deref() == Some("v3-direct-minimal")));
        assert!(m.selector.is_disabled("v3-direct-minimal"));
        assert_eq!(
            m.selector.disable_mode("v3-direct-minimal"),
            Some(DisableMode::Auto)
        );
    }

    #[test]
    fn test_recovery_requires_min_samples() {
        let storage = Storage::open_in_memory().unwrap();
        let m = monitor(storage.clone());
        m.selector.disable_variant("control", DisableMode::Auto);

        // 5 clean calls attributed to control: gates pass but too few samples
        for i in 0..5 {
            let session = format!("s{}", i);
            storage
                .with_connection(|conn| {
                    let assignment = crate::types::ExperimentAssignment {
                        id: Uuid::new_v4(),
                        user_id: "u1".into(),
                        session_id: session.clone(),
                        variant_id: "control".into(),
                        segment: crate::types::Segment::Intermediate,
                        variant_config: serde_json::json!({}),
                        created_at: Utc::now(),
                        outcome: None,
                        metrics: None,
                        completed_at: None,
                    };
                    queries::upsert_assignment(conn, &assignment)
                })
                .unwrap();
            log_call(&storage, "u1", &session, false, 100);
        }
        m.tick().unwrap();
        assert!(m.selector.is_disabled("control"));

        // 20 more clean calls cross the sample gate
        for i in 5..25 {
            let session = format!("s{}", i);
            storage
                .with_connection(|conn| {
                    let assignment = crate::types::ExperimentAssignment {
                        id: Uuid::new_v4(),
                        user_id: "u1".into(),
                        session_id: session.clone(),
                        variant_id: "control".into(),
                        segment: crate::types::Segment::Intermediate,
                        variant_config: serde_json::json!({}),
                        created_at: Utc::now(),
                        outcome: None,
                        metrics: None,
                        completed_at: None,
                    };
                    queries::upsert_assignment(conn, &assignment)
                })
                .unwrap();
            log_call(&storage, "u1", &session, false, 100);
        }
        m.tick().unwrap();
        assert!(!m.selector.is_disabled("control"));
    }

    #[test]
    fn test_manual_disable_never_auto_recovers() {
        let storage = Storage::open_in_memory().unwrap();
        let m = monitor(storage.clone());
        m.selector.disable_variant("control", DisableMode::Manual);
        for i in 0..30 {
            log_call(&storage, "u1", &format!("s{}", i), false, 100);
        }
        m.tick().unwrap();
        assert!(m.selector.is_disabled("control"));
    }

    #[test]
    fn test_variant_statuses_cover_catalog() {
        let storage = Storage::open_in_memory().unwrap();
        let m = monitor(storage);
        let statuses = m.variant_statuses().unwrap();
        assert_eq!(statuses.len(), 4);
        assert!(statuses.values().all(|s| s.enabled));
    }
}
