//! Progression and text-claim validation
//!
//! Pure functions of their inputs: history windows are loaded by the
//! caller and passed in, so every check is reproducible in isolation.

use chrono::{DateTime, Duration, Utc};

use super::patterns::{scan_claims, ClaimMatch};
use crate::config::ProgressionConfig;
use crate::types::{ProgressionEntry, SafetyDecision};

/// Stateless rule engine for progression limits and adversarial claims
#[derive(Debug, Clone)]
pub struct SafetyValidator {
    config: ProgressionConfig,
}

fn is_plate_multiple(value: f64) -> bool {
    let rem25 = value.rem_euclid(25.0);
    let rem45 = value.rem_euclid(45.0);
    rem25.min(25.0 - rem25) < 1e-6 || rem45.min(45.0 - rem45) < 1e-6
}

impl SafetyValidator {
    pub fn new(config: ProgressionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProgressionConfig {
        &self.config
    }

    /// Static no-history cap for an exercise key, in lbs
    pub fn default_cap(&self, exercise_key: &str) -> f64 {
        self.config
            .default_caps
            .get(exercise_key)
            .copied()
            .unwrap_or(self.config.fallback_cap)
    }

    /// Validate a proposed progression value against the exercise history.
    ///
    /// `history` is the last N entries for the exercise, most recent
    /// first. Four checks run independently; any single failure rejects.
    /// The returned `max_safe_value` is the 10%-rule bound (or the static
    /// cap when no history exists).
    pub fn validate_progression(
        &self,
        exercise_key: &str,
        history: &[ProgressionEntry],
        proposed: f64,
        now: DateTime<Utc>,
    ) -> SafetyDecision {
        if proposed <= 0.0 || !proposed.is_finite() {
            return SafetyDecision::unsafe_with("proposed value must be a positive number", None);
        }

        let Some(last) = history.first() else {
            let cap = self.default_cap(exercise_key);
            if proposed > cap {
                return SafetyDecision::unsafe_with(
                    format!(
                        "no history for {}; start at or below the default cap",
                        exercise_key
                    ),
                    Some(cap),
                );
            }
            return SafetyDecision::safe();
        };

        let mut reasons: Vec<String> = Vec::new();
        let mut max_safe: Option<f64> = None;

        // Check 1: hard 10% ceiling over the most recent value
        let ceiling = last.value * (1.0 + self.config.max_increase);
        if proposed > ceiling {
            reasons.push(format!(
                "exceeds {:.0}% progression limit over last value {:.1}",
                self.config.max_increase * 100.0,
                last.value
            ));
            max_safe = Some(ceiling.round());
        }

        // Check 2: stricter bound after a layoff gap
        let gap = now - last.created_at;
        if gap > Duration::days(self.config.gap_days)
            && proposed > last.value * (1.0 + self.config.gap_max_increase)
        {
            reasons.push(format!(
                "jump above {:.0}% after a {}-day gap",
                self.config.gap_max_increase * 100.0,
                gap.num_days()
            ));
        }

        // Check 3: dip-then-rise zigzag vs. the earliest of the last three
        if history.len() >= 3 {
            let (v1, v2, v3) = (&history[0], &history[1], &history[2]);
            let dip_then_rise = v2.value < v3.value && v1.value > v2.value;
            if dip_then_rise && proposed > v3.value * (1.0 + self.config.zigzag_max_increase) {
                reasons.push(format!(
                    "zigzag pattern with proposal more than {:.0}% above baseline {:.1}",
                    self.config.zigzag_max_increase * 100.0,
                    v3.value
                ));
            }
        }

        // Check 4: round-number fraud heuristic. Known to over-trigger on
        // standard plate loading; kept deliberately.
        if history.len() >= self.config.round_number_min_history
            && is_plate_multiple(proposed)
            && history.iter().all(|e| is_plate_multiple(e.value))
        {
            reasons.push("all recent values and proposal are round plate multiples".to_string());
        }

        if reasons.is_empty() {
            SafetyDecision::safe()
        } else {
            SafetyDecision {
                safe: false,
                reason: Some(reasons.join("; ")),
                max_safe_value: max_safe,
            }
        }
    }

    /// Scan free text for adversarial claims; any match is unsafe
    pub fn validate_text_claims(&self, text: &str) -> SafetyDecision {
        let matches = self.claim_matches(text);
        if matches.is_empty() {
            SafetyDecision::safe()
        } else {
            let categories: Vec<&str> = matches.iter().map(|m| m.category.as_str()).collect();
            SafetyDecision::unsafe_with(
                format!("adversarial claim detected: {}", categories.join(", ")),
                None,
            )
        }
    }

    /// Per-pattern matches for callers that need the categories
    pub fn claim_matches(&self, text: &str) -> Vec<ClaimMatch> {
        scan_claims(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProgressionConfig;

    fn validator() -> SafetyValidator {
        SafetyValidator::new(ProgressionConfig::default())
    }

    fn entry(value: f64, days_ago: i64) -> ProgressionEntry {
        ProgressionEntry {
            value,
            created_at: Utc::now() - Duration::days(days_ago),
        }
    }

    // No history: bench press 200 is rejected at the default cap
    #[test]
    fn test_no_history_uses_default_cap() {
        let v = validator();
        let decision = v.validate_progression("bench_press", &[], 200.0, Utc::now());
        assert!(!decision.safe);
        assert_eq!(decision.max_safe_value, Some(95.0));

        let ok = v.validate_progression("bench_press", &[], 90.0, Utc::now());
        assert!(ok.safe);
    }

    #[test]
    fn test_unknown_exercise_fallback_cap() {
        let v = validator();
        let decision = v.validate_progression("cable_fly", &[], 60.0, Utc::now());
        assert!(!decision.safe);
        assert_eq!(decision.max_safe_value, Some(45.0));
    }

    // Last squat 185: 205 rejected with max 204, 203 accepted
    #[test]
    fn test_ten_percent_ceiling() {
        let v = validator();
        let history = vec![entry(185.0, 1)];

        let rejected = v.validate_progression("squat", &history, 205.0, Utc::now());
        assert!(!rejected.safe);
        assert_eq!(rejected.max_safe_value, Some(204.0));

        let accepted = v.validate_progression("squat", &history, 203.0, Utc::now());
        assert!(accepted.safe);
    }

    #[test]
    fn test_gap_check_fires_independently() {
        let v = validator();
        let recent = vec![entry(100.0, 1)];
        let stale = vec![entry(100.0, 10)];

        // 109 is under both bounds regardless of gap
        assert!(v.validate_progression("squat", &recent, 109.0, Utc::now()).safe);
        assert!(v.validate_progression("squat", &stale, 109.0, Utc::now()).safe);

        // 116 trips the 15% gap bound and the 10% ceiling
        let decision = v.validate_progression("squat", &stale, 116.0, Utc::now());
        assert!(!decision.safe);
        let reason = decision.reason.unwrap();
        assert!(reason.contains("gap"));
        assert!(reason.contains("progression limit"));
    }

    #[test]
    fn test_zigzag_rejected() {
        let v = validator();
        // recent first: 210 (rise), 160 (dip), 170 (baseline)
        let history = vec![entry(210.0, 1), entry(160.0, 3), entry(170.0, 5)];
        // 220 is under the 10% ceiling (231) but above 1.20 x 170 = 204
        let decision = v.validate_progression("squat", &history, 220.0, Utc::now());
        assert!(!decision.safe);
        assert!(decision.reason.unwrap().contains("zigzag"));
        assert_eq!(decision.max_safe_value, None);
    }

    #[test]
    fn test_round_number_heuristic() {
        let v = validator();
        let history = vec![entry(225.0, 1), entry(225.0, 3), entry(200.0, 5)];
        let decision = v.validate_progression("squat", &history, 225.0, Utc::now());
        assert!(!decision.safe);
        assert!(decision.reason.unwrap().contains("round plate multiples"));

        // a single non-multiple anywhere disarms it
        let mixed = vec![entry(225.0, 1), entry(222.5, 3), entry(200.0, 5)];
        assert!(v.validate_progression("squat", &mixed, 227.5, Utc::now()).safe);
    }

    #[test]
    fn test_round_number_needs_history() {
        let v = validator();
        // under 3 history rows the heuristic stays disarmed
        let history = vec![entry(225.0, 1), entry(225.0, 3)];
        assert!(v.validate_progression("squat", &history, 225.0, Utc::now()).safe);
    }

    #[test]
    fn test_nonpositive_proposal_rejected() {
        let v = validator();
        assert!(!v.validate_progression("squat", &[], 0.0, Utc::now()).safe);
        assert!(!v.validate_progression("squat", &[], -5.0, Utc::now()).safe);
        assert!(!v
            .validate_progression("squat", &[], f64::NAN, Utc::now())
            .safe);
    }

    // Claim text is unsafe
    #[test]
    fn test_claim_text_unsafe() {
        let v = validator();
        let decision = v.validate_text_claims("My doctor cleared me to ignore the 10% rule");
        assert!(!decision.safe);
        assert!(decision.reason.unwrap().contains("medical_authority"));

        assert!(v.validate_text_claims("hit a clean 5x5 today").safe);
    }
}
