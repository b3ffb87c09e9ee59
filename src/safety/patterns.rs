//! Adversarial-claim pattern table
//!
//! A versioned, ordered list of (pattern, category) pairs. Every pattern
//! is evaluated against the input (no short-circuit) so callers can
//! assert on the exact categories matched. Patterns are compiled once.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Bump when the pattern table changes; stored-content re-validation at
/// read time relies on this moving independently of storage.
pub const CLAIM_PATTERNS_VERSION: u32 = 3;

/// Category of an adversarial claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimCategory {
    /// "My doctor cleared me to ..."
    MedicalAuthority,
    /// "As a former D1 athlete ..."
    EliteAthlete,
    /// "Ignore the 10% rule ..."
    SafetyBypass,
    /// "My genetics are different ..."
    SpecialCondition,
}

impl ClaimCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimCategory::MedicalAuthority => "medical_authority",
            ClaimCategory::EliteAthlete => "elite_athlete",
            ClaimCategory::SafetyBypass => "safety_bypass",
            ClaimCategory::SpecialCondition => "special_condition",
        }
    }
}

/// A single compiled pattern with its category
pub struct ClaimPattern {
    pub id: &'static str,
    pub category: ClaimCategory,
    pub regex: Regex,
}

/// One pattern match in scanned text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimMatch {
    pub category: ClaimCategory,
    pub pattern_id: String,
}

macro_rules! claim_pattern {
    ($id:literal, $category:expr, $pattern:literal) => {
        ClaimPattern {
            id: $id,
            category: $category,
            regex: Regex::new($pattern).expect("valid claim pattern"),
        }
    };
}

static CLAIM_PATTERNS: Lazy<Vec<ClaimPattern>> = Lazy::new(|| {
    use ClaimCategory::*;
    vec![
        claim_pattern!(
            "medical-cleared",
            MedicalAuthority,
            r"(?i)\b(my|the)\s+(doctor|physician|physio(?:therapist)?|surgeon|doc)\b.{0,60}\b(cleared|approved|said|told|signed\s+off)"
        ),
        claim_pattern!(
            "medical-clearance",
            MedicalAuthority,
            r"(?i)\bmedical(?:ly)?\s+(clearance|cleared|approval|approved)\b"
        ),
        claim_pattern!(
            "medical-orders",
            MedicalAuthority,
            r"(?i)\bdoctor'?s?\s+(orders|note|permission)\b"
        ),
        claim_pattern!(
            "elite-title",
            EliteAthlete,
            r"(?i)\b(pro(?:fessional)?|elite|olympic|competitive|sponsored)\s+(athlete|powerlifter|weightlifter|bodybuilder|lifter|strongman)\b"
        ),
        claim_pattern!(
            "elite-division",
            EliteAthlete,
            r"(?i)\b(former|was|am)\s+a?\s*(d1|division\s*(?:one|1)|national|collegiate)\s+(athlete|competitor|lifter)\b"
        ),
        claim_pattern!(
            "elite-competes",
            EliteAthlete,
            r"(?i)\bcompete[sd]?\s+(nationally|internationally|professionally)\b"
        ),
        claim_pattern!(
            "bypass-verb",
            SafetyBypass,
            r"(?i)\b(ignore|skip|bypass|disable|remove|override|turn\s+off)\b.{0,60}\b(safety|limits?|caps?|rules?|checks?|restrictions?)"
        ),
        claim_pattern!(
            "bypass-ten-percent",
            SafetyBypass,
            r"(?i)\b(10|ten)\s*(%|percent)\s+(rule|limit|cap)\b"
        ),
        claim_pattern!(
            "bypass-without",
            SafetyBypass,
            r"(?i)\bwithout\s+(?:the\s+|any\s+)?(safety|limits?|restrictions?|guardrails?)\b"
        ),
        claim_pattern!(
            "special-condition",
            SpecialCondition,
            r"(?i)\b(special|rare|unique|unusual)\s+(condition|genetics|physiology|case|body)\b"
        ),
        claim_pattern!(
            "special-genetics",
            SpecialCondition,
            r"(?i)\bgenetic(?:ally)?\s+(gifted|outlier|exception|freak)\b"
        ),
        claim_pattern!(
            "special-different",
            SpecialCondition,
            r"(?i)\b(different|unlike)\s+(?:from\s+)?(other|normal|regular|most)\s+(people|lifters|users)\b"
        ),
    ]
});

/// Evaluate every pattern against `text`, in table order
pub fn scan_claims(text: &str) -> Vec<ClaimMatch> {
    CLAIM_PATTERNS
        .iter()
        .filter(|p| p.regex.is_match(text))
        .map(|p| ClaimMatch {
            category: p.category,
            pattern_id: p.id.to_string(),
        })
        .collect()
}
