//! Segment classification
//!
//! A coarse experience bucket per user, derived from tenure and recent
//! activity. Returning (inactivity) takes precedence over tenure.

use chrono::{DateTime, Utc};

use crate::types::{Segment, SegmentInfo, UserProfile};

/// Days of inactivity after which a user is classified as returning
pub const INACTIVITY_RETURNING_DAYS: i64 = 10;

/// Weeks of tenure below which a user is a beginner
const BEGINNER_MAX_WEEKS: i64 = 4;

/// Weeks of tenure above which a user is advanced
const INTERMEDIATE_MAX_WEEKS: i64 = 26;

/// Classify a user into an experience segment.
///
/// `pr_count_last_30_days` feeds the PR-frequency tracked for advanced
/// users; it is ignored for other segments.
pub fn compute_segment(
    profile: &UserProfile,
    pr_count_last_30_days: i64,
    now: DateTime<Utc>,
) -> SegmentInfo {
    let tenure_weeks = (now - profile.created_at).num_weeks();
    let inactive_days = (now - profile.last_active_at).num_days();

    let (segment, pr_per_week) = if inactive_days >= INACTIVITY_RETURNING_DAYS {
        (Segment::Returning, None)
    } else if tenure_weeks < BEGINNER_MAX_WEEKS {
        (Segment::Beginner, None)
    } else if tenure_weeks <= INTERMEDIATE_MAX_WEEKS {
        (Segment::Intermediate, None)
    } else {
        (
            Segment::Advanced,
            Some(pr_count_last_30_days as f32 / (30.0 / 7.0)),
        )
    };

    SegmentInfo {
        segment,
        tenure_weeks,
        inactive_days,
        pr_per_week,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn profile(now: DateTime<Utc>, tenure_days: i64, inactive_days: i64) -> UserProfile {
        UserProfile {
            user_id: "u1".into(),
            created_at: now - Duration::days(tenure_days),
            last_active_at: now - Duration::days(inactive_days),
        }
    }

    #[test]
    fn test_tenure_buckets() {
        let now = Utc::now();
        assert_eq!(
            compute_segment(&profile(now, 7, 1), 0, now).segment,
            Segment::Beginner
        );
        assert_eq!(
            compute_segment(&profile(now, 28, 1), 0, now).segment,
            Segment::Intermediate
        );
        assert_eq!(
            compute_segment(&profile(now, 26 * 7, 1), 0, now).segment,
            Segment::Intermediate
        );
        assert_eq!(
            compute_segment(&profile(now, 200, 1), 0, now).segment,
            Segment::Advanced
        );
    }

    #[test]
    fn test_returning_takes_precedence() {
        let now = Utc::now();
        // long-tenured but inactive: returning wins
        let info = compute_segment(&profile(now, 300, 15), 4, now);
        assert_eq!(info.segment, Segment::Returning);
        assert!(info.pr_per_week.is_none());
        assert_eq!(info.inactive_days, 15);
    }

    #[test]
    fn test_advanced_tracks_pr_frequency() {
        let now = Utc::now();
        let info = compute_segment(&profile(now, 300, 2), 6, now);
        assert_eq!(info.segment, Segment::Advanced);
        let per_week = info.pr_per_week.unwrap();
        assert!((per_week - 1.4).abs() < 0.01);
    }
}
