//! Query layer over the SQLite schema
//!
//! Free functions over `&Connection`, grouped by table. Vector similarity
//! is computed in-process: candidate vectors are fetched per owner and
//! scored with cosine similarity.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use uuid::Uuid;

use crate::embedding::cosine_similarity;
use crate::error::{Result, SpotterError};
use crate::types::{
    ExperimentAssignment, MemoryInput, MemoryItem, ProgressionEntry, Segment, UserProfile,
    WorkoutRecord,
};

fn parse_dt(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn embedding_from_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

// ---------------------------------------------------------------------------
// User profiles
// ---------------------------------------------------------------------------

/// Insert or update a user profile
pub fn upsert_profile(conn: &Connection, profile: &UserProfile) -> Result<()> {
    conn.execute(
        "INSERT INTO user_profiles (user_id, created_at, last_active_at)
         VALUES (?, ?, ?)
         ON CONFLICT(user_id) DO UPDATE SET last_active_at = excluded.last_active_at",
        params![
            profile.user_id,
            profile.created_at.to_rfc3339(),
            profile.last_active_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Mark a user as active now, creating the profile on first contact
pub fn touch_profile(conn: &Connection, user_id: &str, now: DateTime<Utc>) -> Result<UserProfile> {
    let existing = get_profile(conn, user_id)?;
    match existing {
        Some(profile) => {
            conn.execute(
                "UPDATE user_profiles SET last_active_at = ? WHERE user_id = ?",
                params![now.to_rfc3339(), user_id],
            )?;
            // Returned profile keeps the pre-touch last_active_at so the
            // segment classifier sees the inactivity gap that just ended.
            Ok(profile)
        }
        None => {
            let profile = UserProfile {
                user_id: user_id.to_string(),
                created_at: now,
                last_active_at: now,
            };
            upsert_profile(conn, &profile)?;
            Ok(profile)
        }
    }
}

pub fn get_profile(conn: &Connection, user_id: &str) -> Result<Option<UserProfile>> {
    let row = conn
        .query_row(
            "SELECT user_id, created_at, last_active_at FROM user_profiles WHERE user_id = ?",
            params![user_id],
            |row| {
                let created: String = row.get(1)?;
                let active: String = row.get(2)?;
                Ok(UserProfile {
                    user_id: row.get(0)?,
                    created_at: parse_dt(&created),
                    last_active_at: parse_dt(&active),
                })
            },
        )
        .optional()?;
    Ok(row)
}

// ---------------------------------------------------------------------------
// Memory items
// ---------------------------------------------------------------------------

/// A memory ready for persistence: sanitized text plus its embedding
#[derive(Debug, Clone)]
pub struct EmbeddedMemory {
    pub input: MemoryInput,
    pub embedding: Vec<f32>,
}

/// Persist a batch of embedded memories, returning their ids
pub fn insert_memories(
    conn: &Connection,
    batch: &[EmbeddedMemory],
    model: &str,
    now: DateTime<Utc>,
) -> Result<Vec<i64>> {
    let mut ids = Vec::with_capacity(batch.len());
    let mut stmt = conn.prepare(
        "INSERT INTO memories
             (owner_id, scope_id, text, embedding, embedding_model, metadata, importance, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )?;
    for item in batch {
        stmt.execute(params![
            item.input.owner_id,
            item.input.scope_id,
            item.input.text,
            embedding_to_bytes(&item.embedding),
            model,
            serde_json::to_string(&item.input.metadata)?,
            item.input.importance,
            now.to_rfc3339(),
        ])?;
        ids.push(conn.last_insert_rowid());
    }
    Ok(ids)
}

fn memory_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryItem> {
    let embedding_bytes: Vec<u8> = row.get(3)?;
    let metadata_str: String = row.get(5)?;
    let created: String = row.get(8)?;
    Ok(MemoryItem {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        scope_id: row.get(2)?,
        text: row.get(9)?,
        embedding: embedding_from_bytes(&embedding_bytes),
        embedding_model: row.get(4)?,
        metadata: serde_json::from_str(&metadata_str).unwrap_or_default(),
        importance: row.get(6)?,
        redacted: row.get(7)?,
        created_at: parse_dt(&created),
    })
}

const MEMORY_COLS: &str =
    "id, owner_id, scope_id, embedding, embedding_model, metadata, importance, redacted, created_at, text";

/// Fetch the top candidates for a query vector by cosine similarity.
///
/// Only non-redacted items embedded by `model` participate; vectors from a
/// different model are never compared against the query. Results are sorted
/// by similarity descending and truncated to `pool`.
pub fn similarity_candidates(
    conn: &Connection,
    owner_id: &str,
    scope_id: Option<&str>,
    model: &str,
    query: &[f32],
    pool: usize,
) -> Result<Vec<(MemoryItem, f32)>> {
    let mut sql = format!(
        "SELECT {} FROM memories
         WHERE owner_id = ? AND redacted = 0 AND embedding_model = ?",
        MEMORY_COLS
    );
    let mut bindings: Vec<Box<dyn rusqlite::ToSql>> =
        vec![Box::new(owner_id.to_string()), Box::new(model.to_string())];
    if let Some(scope) = scope_id {
        sql.push_str(" AND scope_id = ?");
        bindings.push(Box::new(scope.to_string()));
    }

    let params_ref: Vec<&dyn rusqlite::ToSql> = bindings.iter().map(|b| b.as_ref()).collect();
    let mut stmt = conn.prepare(&sql)?;
    let mut scored: Vec<(MemoryItem, f32)> = stmt
        .query_map(params_ref.as_slice(), memory_from_row)?
        .filter_map(|r| r.ok())
        .map(|item| {
            let score = cosine_similarity(query, &item.embedding);
            (item, score)
        })
        .collect();

    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(pool);
    Ok(scored)
}

/// Fetch the newest non-redacted memories for an owner
pub fn recent_memories(conn: &Connection, owner_id: &str, limit: usize) -> Result<Vec<MemoryItem>> {
    let sql = format!(
        "SELECT {} FROM memories
         WHERE owner_id = ? AND redacted = 0
         ORDER BY created_at DESC, id DESC LIMIT ?",
        MEMORY_COLS
    );
    let mut stmt = conn.prepare(&sql)?;
    let items = stmt
        .query_map(params![owner_id, limit as i64], memory_from_row)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(items)
}

/// Soft-delete all of an owner's memories newer than `since`.
/// Returns the number of redacted rows. Never hard-deletes.
pub fn redact_since(
    conn: &Connection,
    owner_id: &str,
    since: DateTime<Utc>,
    reason: &str,
) -> Result<usize> {
    let changed = conn.execute(
        "UPDATE memories SET redacted = 1, redaction_reason = ?
         WHERE owner_id = ? AND redacted = 0 AND created_at >= ?",
        params![reason, owner_id, since.to_rfc3339()],
    )?;
    Ok(changed)
}

// ---------------------------------------------------------------------------
// Workouts
// ---------------------------------------------------------------------------

/// Persist a workout record with its write-time aggregates
pub fn insert_workout(conn: &Connection, record: &WorkoutRecord) -> Result<i64> {
    conn.execute(
        "INSERT INTO workout_sets
             (owner_id, scope_id, exercise_key, weight_lbs, original_value, original_unit,
              reps, sets, total_volume_lbs, total_reps, max_weight_lbs, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            record.owner_id,
            record.scope_id,
            record.exercise_key,
            record.weight_lbs,
            record.original_value,
            record.original_unit,
            serde_json::to_string(&record.reps)?,
            record.sets,
            record.total_volume_lbs,
            record.total_reps,
            record.max_weight_lbs,
            record.created_at.to_rfc3339(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Load the progression history for one (owner, exercise) key,
/// most recent first
pub fn exercise_history(
    conn: &Connection,
    owner_id: &str,
    scope_id: Option<&str>,
    exercise_key: &str,
    limit: usize,
) -> Result<Vec<ProgressionEntry>> {
    let mut sql = String::from(
        "SELECT max_weight_lbs, created_at FROM workout_sets
         WHERE owner_id = ? AND exercise_key = ?",
    );
    let mut bindings: Vec<Box<dyn rusqlite::ToSql>> = vec![
        Box::new(owner_id.to_string()),
        Box::new(exercise_key.to_string()),
    ];
    if let Some(scope) = scope_id {
        sql.push_str(" AND scope_id = ?");
        bindings.push(Box::new(scope.to_string()));
    }
    sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ?");
    bindings.push(Box::new(limit as i64));

    let params_ref: Vec<&dyn rusqlite::ToSql> = bindings.iter().map(|b| b.as_ref()).collect();
    let mut stmt = conn.prepare(&sql)?;
    let entries = stmt
        .query_map(params_ref.as_slice(), |row| {
            let created: String = row.get(1)?;
            Ok(ProgressionEntry {
                value: row.get(0)?,
                created_at: parse_dt(&created),
            })
        })?
        .filter_map(|r| r.ok())
        .collect();
    Ok(entries)
}

/// Count personal records (new all-time max per exercise) set since `since`
pub fn pr_count_since(conn: &Connection, owner_id: &str, since: DateTime<Utc>) -> Result<i64> {
    let mut stmt = conn.prepare(
        "SELECT exercise_key, max_weight_lbs, created_at FROM workout_sets
         WHERE owner_id = ? ORDER BY created_at ASC, id ASC",
    )?;
    let rows: Vec<(String, f64, DateTime<Utc>)> = stmt
        .query_map(params![owner_id], |row| {
            let created: String = row.get(2)?;
            Ok((row.get(0)?, row.get(1)?, parse_dt(&created)))
        })?
        .filter_map(|r| r.ok())
        .collect();

    let mut best: HashMap<String, f64> = HashMap::new();
    let mut prs = 0_i64;
    for (exercise, weight, created_at) in rows {
        let entry = best.entry(exercise).or_insert(0.0);
        if weight > *entry {
            if created_at >= since && *entry > 0.0 {
                prs += 1;
            }
            *entry = weight;
        }
    }
    Ok(prs)
}

/// Persist a bodyweight log entry
pub fn insert_bodyweight(
    conn: &Connection,
    owner_id: &str,
    weight_lbs: f64,
    original_value: f64,
    original_unit: &str,
    now: DateTime<Utc>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO bodyweight_log (owner_id, weight_lbs, original_value, original_unit, created_at)
         VALUES (?, ?, ?, ?, ?)",
        params![owner_id, weight_lbs, original_value, original_unit, now.to_rfc3339()],
    )?;
    Ok(conn.last_insert_rowid())
}

// ---------------------------------------------------------------------------
// Experiment assignments
// ---------------------------------------------------------------------------

/// Insert or replace the assignment for (user, session)
pub fn upsert_assignment(conn: &Connection, assignment: &ExperimentAssignment) -> Result<()> {
    conn.execute(
        "INSERT INTO assignments
             (id, user_id, session_id, variant_id, segment, variant_config, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(user_id, session_id) DO UPDATE SET
             id = excluded.id,
             variant_id = excluded.variant_id,
             segment = excluded.segment,
             variant_config = excluded.variant_config,
             created_at = excluded.created_at,
             outcome = NULL,
             metrics = NULL,
             completed_at = NULL",
        params![
            assignment.id.to_string(),
            assignment.user_id,
            assignment.session_id,
            assignment.variant_id,
            assignment.segment.to_string(),
            assignment.variant_config.to_string(),
            assignment.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn assignment_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExperimentAssignment> {
    let id_str: String = row.get(0)?;
    let segment_str: String = row.get(4)?;
    let config_str: String = row.get(5)?;
    let created: String = row.get(6)?;
    let metrics_str: Option<String> = row.get(8)?;
    let completed: Option<String> = row.get(9)?;
    Ok(ExperimentAssignment {
        id: Uuid::parse_str(&id_str).unwrap_or_default(),
        user_id: row.get(1)?,
        session_id: row.get(2)?,
        variant_id: row.get(3)?,
        segment: segment_str.parse().unwrap_or(Segment::Beginner),
        variant_config: serde_json::from_str(&config_str).unwrap_or(serde_json::Value::Null),
        created_at: parse_dt(&created),
        outcome: row.get(7)?,
        metrics: metrics_str.and_then(|s| serde_json::from_str(&s).ok()),
        completed_at: completed.map(|s| parse_dt(&s)),
    })
}

const ASSIGNMENT_COLS: &str =
    "id, user_id, session_id, variant_id, segment, variant_config, created_at, outcome, metrics, completed_at";

pub fn get_assignment(
    conn: &Connection,
    user_id: &str,
    session_id: &str,
) -> Result<Option<ExperimentAssignment>> {
    let sql = format!(
        "SELECT {} FROM assignments WHERE user_id = ? AND session_id = ?",
        ASSIGNMENT_COLS
    );
    let row = conn
        .query_row(&sql, params![user_id, session_id], assignment_from_row)
        .optional()?;
    Ok(row)
}

/// Attach an outcome to a persisted assignment
pub fn record_outcome(
    conn: &Connection,
    assignment_id: Uuid,
    outcome: &str,
    metrics: Option<&serde_json::Value>,
    now: DateTime<Utc>,
) -> Result<()> {
    let changed = conn.execute(
        "UPDATE assignments SET outcome = ?, metrics = ?, completed_at = ? WHERE id = ?",
        params![
            outcome,
            metrics.map(|m| m.to_string()),
            now.to_rfc3339(),
            assignment_id.to_string(),
        ],
    )?;
    if changed == 0 {
        return Err(SpotterError::InvalidInput(format!(
            "unknown assignment: {}",
            assignment_id
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Safety events & quality windows
// ---------------------------------------------------------------------------

/// Record an unsafe-pattern match observed in assistant output
pub fn record_safety_event(
    conn: &Connection,
    user_id: &str,
    variant_id: Option<&str>,
    category: &str,
    detail: Option<&str>,
    now: DateTime<Utc>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO safety_events (user_id, variant_id, category, detail, created_at)
         VALUES (?, ?, ?, ?, ?)",
        params![user_id, variant_id, category, detail, now.to_rfc3339()],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Safety event counts since `since`, grouped by implicated variant
pub fn safety_event_counts(
    conn: &Connection,
    since: DateTime<Utc>,
) -> Result<Vec<(Option<String>, i64)>> {
    let mut stmt = conn.prepare(
        "SELECT variant_id, COUNT(*) FROM safety_events
         WHERE created_at >= ? GROUP BY variant_id",
    )?;
    let counts = stmt
        .query_map(params![since.to_rfc3339()], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?
        .filter_map(|r| r.ok())
        .collect();
    Ok(counts)
}

/// Aggregate over terminal action-log entries in a trailing window
#[derive(Debug, Clone, Default)]
pub struct WindowStats {
    pub total: i64,
    pub failed: i64,
    /// Execution times of terminal entries, unsorted
    pub latencies_ms: Vec<i64>,
}

impl WindowStats {
    pub fn error_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.failed as f64 / self.total as f64
        }
    }

    /// Nearest-rank percentile over recorded latencies
    pub fn latency_percentile(&self, pct: f64) -> i64 {
        if self.latencies_ms.is_empty() {
            return 0;
        }
        let mut sorted = self.latencies_ms.clone();
        sorted.sort_unstable();
        let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
        sorted[rank.clamp(1, sorted.len()) - 1]
    }
}

/// Load terminal action-log aggregates since `since`
pub fn action_window_stats(conn: &Connection, since: DateTime<Utc>) -> Result<WindowStats> {
    let mut stmt = conn.prepare(
        "SELECT status, execution_time_ms FROM action_log
         WHERE created_at >= ? AND status != 'pending'",
    )?;
    let mut stats = WindowStats::default();
    let rows = stmt.query_map(params![since.to_rfc3339()], |row| {
        let status: String = row.get(0)?;
        let latency: Option<i64> = row.get(1)?;
        Ok((status, latency))
    })?;
    for row in rows.filter_map(|r| r.ok()) {
        stats.total += 1;
        if row.0 == "failed" {
            stats.failed += 1;
        }
        if let Some(ms) = row.1 {
            stats.latencies_ms.push(ms);
        }
    }
    Ok(stats)
}

/// Per-variant terminal call totals since `since`, keyed by variant id.
/// Attribution goes through the session's persisted assignment.
pub fn variant_call_stats(
    conn: &Connection,
    since: DateTime<Utc>,
) -> Result<HashMap<String, (i64, i64)>> {
    let mut stmt = conn.prepare(
        "SELECT a.variant_id, l.status, COUNT(*)
         FROM action_log l
         JOIN assignments a ON a.user_id = l.user_id AND a.session_id = l.session_id
         WHERE l.created_at >= ? AND l.status != 'pending'
         GROUP BY a.variant_id, l.status",
    )?;
    let mut stats: HashMap<String, (i64, i64)> = HashMap::new();
    let rows = stmt.query_map(params![since.to_rfc3339()], |row| {
        let variant: String = row.get(0)?;
        let status: String = row.get(1)?;
        let count: i64 = row.get(2)?;
        Ok((variant, status, count))
    })?;
    for (variant, status, count) in rows.filter_map(|r| r.ok()) {
        let entry = stats.entry(variant).or_insert((0, 0));
        entry.0 += count;
        if status == "failed" {
            entry.1 += count;
        }
    }
    Ok(stats)
}
