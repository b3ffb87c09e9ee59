//! Weight unit normalization
//!
//! All persisted weights are canonical lbs; the original value and unit
//! are retained on the row for display and audit.

use serde::{Deserialize, Serialize};

/// Conversion factor from kilograms to pounds
pub const KG_TO_LBS: f64 = 2.20462;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightUnit {
    Lbs,
    Kg,
}

impl WeightUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            WeightUnit::Lbs => "lbs",
            WeightUnit::Kg => "kg",
        }
    }
}

impl std::fmt::Display for WeightUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for WeightUnit {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "lbs" | "lb" | "pounds" => Ok(WeightUnit::Lbs),
            "kg" | "kgs" | "kilograms" => Ok(WeightUnit::Kg),
            _ => Err(format!("Unknown weight unit: {}", s)),
        }
    }
}

/// Normalize a weight to canonical lbs
pub fn to_lbs(value: f64, unit: WeightUnit) -> f64 {
    match unit {
        WeightUnit::Lbs => value,
        WeightUnit::Kg => value * KG_TO_LBS,
    }
}

/// Convert a canonical lbs value back to the requested unit
pub fn from_lbs(value_lbs: f64, unit: WeightUnit) -> f64 {
    match unit {
        WeightUnit::Lbs => value_lbs,
        WeightUnit::Kg => value_lbs / KG_TO_LBS,
    }
}
