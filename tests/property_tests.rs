//! Property-based tests for spotter
//!
//! These tests verify invariants that must hold for all inputs:
//! - The progression ceiling is an exact boundary
//! - Sanitization and claim scanning never panic
//! - Selection is deterministic across process restarts
//! - Conversions and estimates stay bounded
//!
//! Run with: cargo test --test property_tests

use proptest::prelude::*;

// ============================================================================
// PROGRESSION LIMIT TESTS
// ============================================================================

mod progression_tests {
    use super::*;
    use chrono::{Duration, Utc};
    use spotter::config::ProgressionConfig;
    use spotter::safety::SafetyValidator;
    use spotter::types::ProgressionEntry;

    fn is_plate_multiple(v: f64) -> bool {
        let r25 = v.rem_euclid(25.0);
        let r45 = v.rem_euclid(45.0);
        r25.min(25.0 - r25) < 1e-6 || r45.min(45.0 - r45) < 1e-6
    }

    proptest! {
        /// Invariant: with one recent history entry, the 10% ceiling is
        /// the exact accept/reject boundary
        #[test]
        fn ten_percent_is_exact_boundary(
            last in 50.0f64..400.0,
            ratio in 0.5f64..1.5,
        ) {
            // stay away from the boundary itself and from plate multiples
            // so no other check interferes
            prop_assume!((ratio - 1.10).abs() > 1e-3);
            let proposed = last * ratio;
            prop_assume!(!is_plate_multiple(proposed) && !is_plate_multiple(last));

            let v = SafetyValidator::new(ProgressionConfig::default());
            let history = vec![ProgressionEntry {
                value: last,
                created_at: Utc::now() - Duration::days(1),
            }];
            let decision = v.validate_progression("squat", &history, proposed, Utc::now());
            prop_assert_eq!(decision.safe, ratio < 1.10);
        }

        /// Invariant: a rejected over-ceiling proposal always carries the
        /// rounded ceiling as max_safe_value
        #[test]
        fn rejection_reports_rounded_ceiling(last in 50.0f64..400.0, excess in 1.15f64..2.0) {
            let proposed = last * excess;
            let v = SafetyValidator::new(ProgressionConfig::default());
            let history = vec![ProgressionEntry {
                value: last,
                created_at: Utc::now() - Duration::days(1),
            }];
            let decision = v.validate_progression("squat", &history, proposed, Utc::now());
            prop_assert!(!decision.safe);
            prop_assert_eq!(decision.max_safe_value, Some((last * 1.10).round()));
        }

        /// Invariant: non-finite and non-positive proposals never pass
        #[test]
        fn degenerate_proposals_rejected(proposed in prop_oneof![
            Just(0.0f64),
            Just(-1.0),
            Just(f64::NAN),
            Just(f64::INFINITY),
        ]) {
            let v = SafetyValidator::new(ProgressionConfig::default());
            let decision = v.validate_progression("squat", &[], proposed, Utc::now());
            prop_assert!(!decision.safe);
        }
    }
}

// ============================================================================
// CLAIM SCAN AND SANITIZATION TESTS
// ============================================================================

mod guardian_tests {
    use super::*;
    use spotter::config::{MemoryConfig, ProgressionConfig};
    use spotter::memory::{MemoryGuardian, SanitizeResult};
    use spotter::safety::{scan_claims, SafetyValidator};
    use spotter::Storage;

    fn guardian() -> MemoryGuardian {
        MemoryGuardian::new(
            SafetyValidator::new(ProgressionConfig::default()),
            Storage::open_in_memory().unwrap(),
            MemoryConfig::default(),
        )
    }

    proptest! {
        /// Invariant: claim scanning never panics on any input
        #[test]
        fn scan_never_panics(s in ".*") {
            let _ = scan_claims(&s);
        }

        /// Invariant: sanitization never panics, and accepted output
        /// carries no control characters
        #[test]
        fn sanitize_output_clean(s in "\\PC{0,500}") {
            if let SanitizeResult::Accepted(cleaned) = guardian().sanitize_for_storage("u1", &s) {
                prop_assert!(cleaned
                    .chars()
                    .all(|c| !c.is_control() || c == '\n' || c == '\t'));
            }
        }

        /// Invariant: accepted text never exceeds the configured cap
        #[test]
        fn sanitize_respects_max_len(s in "\\PC{0,4000}") {
            let max = MemoryConfig::default().max_text_len;
            if let SanitizeResult::Accepted(cleaned) = guardian().sanitize_for_storage("u1", &s) {
                prop_assert!(cleaned.chars().count() <= max);
            }
        }
    }
}

// ============================================================================
// VARIANT SELECTION TESTS
// ============================================================================

mod selection_tests {
    use super::*;
    use spotter::experiment::{default_catalog, VariantSelector};
    use spotter::types::Segment;
    use spotter::Storage;

    proptest! {
        /// Invariant: selection is a pure function of (user, session,
        /// segment); two independent selectors agree
        #[test]
        fn selection_deterministic(
            user in "[a-z0-9]{1,16}",
            session in "[a-z0-9]{1,16}",
        ) {
            let a = VariantSelector::new(default_catalog(), Storage::open_in_memory().unwrap());
            let b = VariantSelector::new(default_catalog(), Storage::open_in_memory().unwrap());
            let pick_a = a.select_variant(&user, &session, Segment::Intermediate).unwrap();
            let pick_b = b.select_variant(&user, &session, Segment::Intermediate).unwrap();
            prop_assert_eq!(pick_a.id, pick_b.id);
        }

        /// Invariant: beginners and returning users never receive a
        /// minimal-safety variant
        #[test]
        fn protected_segments_never_minimal(
            user in "[a-z0-9]{1,16}",
            session in "[a-z0-9]{1,16}",
            returning in any::<bool>(),
        ) {
            let segment = if returning { Segment::Returning } else { Segment::Beginner };
            let selector = VariantSelector::new(default_catalog(), Storage::open_in_memory().unwrap());
            let pick = selector.select_variant(&user, &session, segment).unwrap();
            prop_assert_ne!(pick.safety_level, spotter::types::SafetyLevel::Minimal);
        }
    }
}

// ============================================================================
// UNIT AND ESTIMATE TESTS
// ============================================================================

mod conversion_tests {
    use super::*;
    use spotter::tools::{from_lbs, to_lbs, WeightUnit};
    use spotter::types::estimate_tokens;

    proptest! {
        /// Invariant: lbs conversion is the identity
        #[test]
        fn lbs_identity(v in 0.0f64..2000.0) {
            prop_assert_eq!(to_lbs(v, WeightUnit::Lbs), v);
        }

        /// Invariant: kg round-trips within a hundredth of a pound
        #[test]
        fn kg_roundtrip(v in 0.1f64..1000.0) {
            let lbs = to_lbs(v, WeightUnit::Kg);
            let back = from_lbs(lbs, WeightUnit::Kg);
            prop_assert!((back - v).abs() < 0.01);
            prop_assert!(lbs > v); // a kilogram is heavier than a pound
        }

        /// Invariant: the token estimate is ceil(chars / 4)
        #[test]
        fn token_estimate_bounds(s in "\\PC{0,300}") {
            let chars = s.chars().count();
            let est = estimate_tokens(&s);
            prop_assert!(est * 4 >= chars);
            prop_assert!(est == 0 || (est - 1) * 4 < chars);
        }
    }
}
