//! Per-tool input validation
//!
//! Structural checks only (types, ranges, cross-field consistency,
//! banned characters); the progression safety gate is separate and runs
//! after validation. Errors are collected per field so the caller can
//! return all of them at once.

use serde_json::Value;

use super::units::{to_lbs, WeightUnit};
use crate::config::ToolConfig;
use crate::types::FieldError;

/// Validated parameters for `log_workout`
#[derive(Debug, Clone, PartialEq)]
pub struct WorkoutParams {
    pub exercise_key: String,
    /// Weight as submitted
    pub original_value: f64,
    pub unit: WeightUnit,
    /// Weight normalized to canonical lbs
    pub weight_lbs: f64,
    /// Reps per set; length equals `sets`
    pub reps: Vec<u32>,
    pub sets: u32,
}

/// Validated parameters for `log_bodyweight`
#[derive(Debug, Clone, PartialEq)]
pub struct BodyweightParams {
    pub original_value: f64,
    pub unit: WeightUnit,
    pub weight_lbs: f64,
}

fn field_err(errors: &mut Vec<FieldError>, field: &str, message: impl Into<String>) {
    errors.push(FieldError {
        field: field.to_string(),
        message: message.into(),
    });
}

fn has_banned_chars(text: &str) -> bool {
    text.chars().any(|c| {
        let cp = c as u32;
        c.is_control()
            || matches!(cp,
                0x1F000..=0x1FAFF | 0x2600..=0x27BF | 0xFE00..=0xFE0F | 0x200D)
    })
}

fn get_f64(value: &Value, field: &str, errors: &mut Vec<FieldError>) -> Option<f64> {
    match value.get(field) {
        Some(v) => match v.as_f64() {
            Some(n) if n.is_finite() => Some(n),
            _ => {
                field_err(errors, field, "must be a finite number");
                None
            }
        },
        None => {
            field_err(errors, field, "is required");
            None
        }
    }
}

fn get_unit(value: &Value, errors: &mut Vec<FieldError>) -> WeightUnit {
    match value.get("unit") {
        None => WeightUnit::Lbs,
        Some(v) => match v.as_str().map(str::parse) {
            Some(Ok(unit)) => unit,
            _ => {
                field_err(errors, "unit", "must be one of: lbs, kg");
                WeightUnit::Lbs
            }
        },
    }
}

/// Validate `log_workout` parameters
pub fn parse_workout(
    params: &Value,
    config: &ToolConfig,
) -> std::result::Result<WorkoutParams, Vec<FieldError>> {
    let mut errors = Vec::new();

    let exercise_key = match params.get("exercise").and_then(|v| v.as_str()) {
        Some(s) => {
            let key = s.trim().to_lowercase().replace([' ', '-'], "_");
            if key.is_empty() {
                field_err(&mut errors, "exercise", "must not be empty");
            } else if has_banned_chars(&key)
                || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                field_err(
                    &mut errors,
                    "exercise",
                    "may only contain letters, digits, and underscores",
                );
            }
            key
        }
        None => {
            field_err(&mut errors, "exercise", "is required");
            String::new()
        }
    };

    let unit = get_unit(params, &mut errors);
    let original_value = get_f64(params, "weight", &mut errors).unwrap_or(0.0);
    let weight_lbs = to_lbs(original_value, unit);
    if original_value <= 0.0 {
        field_err(&mut errors, "weight", "must be positive");
    } else if weight_lbs > config.max_weight_lbs {
        field_err(
            &mut errors,
            "weight",
            format!("must not exceed {} lbs", config.max_weight_lbs),
        );
    }

    let sets = match params.get("sets").and_then(|v| v.as_u64()) {
        Some(n) if n >= 1 && n <= config.max_sets as u64 => n as u32,
        Some(_) => {
            field_err(
                &mut errors,
                "sets",
                format!("must be between 1 and {}", config.max_sets),
            );
            0
        }
        None => {
            field_err(&mut errors, "sets", "is required and must be an integer");
            0
        }
    };

    let reps: Vec<u32> = match params.get("reps").and_then(|v| v.as_array()) {
        Some(arr) => {
            let mut parsed = Vec::with_capacity(arr.len());
            for (i, v) in arr.iter().enumerate() {
                match v.as_u64() {
                    Some(n) if n >= 1 && n <= config.max_reps as u64 => parsed.push(n as u32),
                    _ => field_err(
                        &mut errors,
                        "reps",
                        format!("entry {} must be between 1 and {}", i, config.max_reps),
                    ),
                }
            }
            parsed
        }
        None => {
            field_err(&mut errors, "reps", "is required and must be an array");
            Vec::new()
        }
    };

    // cross-field: one reps entry per set
    if sets > 0 && !reps.is_empty() && reps.len() != sets as usize {
        field_err(
            &mut errors,
            "reps",
            format!("length {} must equal sets {}", reps.len(), sets),
        );
    }

    if errors.is_empty() {
        Ok(WorkoutParams {
            exercise_key,
            original_value,
            unit,
            weight_lbs,
            reps,
            sets,
        })
    } else {
        Err(errors)
    }
}

/// Validate `log_bodyweight` parameters
pub fn parse_bodyweight(
    params: &Value,
    config: &ToolConfig,
) -> std::result::Result<BodyweightParams, Vec<FieldError>> {
    let mut errors = Vec::new();

    let unit = get_unit(params, &mut errors);
    let original_value = get_f64(params, "weight", &mut errors).unwrap_or(0.0);
    let weight_lbs = to_lbs(original_value, unit);
    if original_value <= 0.0 {
        field_err(&mut errors, "weight", "must be positive");
    } else if weight_lbs > config.max_weight_lbs {
        field_err(
            &mut errors,
            "weight",
            format!("must not exceed {} lbs", config.max_weight_lbs),
        );
    }

    if errors.is_empty() {
        Ok(BodyweightParams {
            original_value,
            unit,
            weight_lbs,
        })
    } else {
        Err(errors)
    }
}
