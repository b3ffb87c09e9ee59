//! Schema migrations, tracked via PRAGMA user_version

use rusqlite::Connection;

use crate::error::Result;

const SCHEMA_VERSION: i64 = 1;

/// Run any pending migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    if version < 1 {
        migrate_v1(conn)?;
    }

    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS memories (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            owner_id TEXT NOT NULL,
            scope_id TEXT,
            text TEXT NOT NULL,
            embedding BLOB NOT NULL,
            embedding_model TEXT NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}',
            importance REAL NOT NULL DEFAULT 1.0,
            redacted INTEGER NOT NULL DEFAULT 0,
            redaction_reason TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_memories_owner
            ON memories(owner_id, redacted, created_at DESC);

        CREATE TABLE IF NOT EXISTS workout_sets (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            owner_id TEXT NOT NULL,
            scope_id TEXT,
            exercise_key TEXT NOT NULL,
            weight_lbs REAL NOT NULL,
            original_value REAL NOT NULL,
            original_unit TEXT NOT NULL,
            reps TEXT NOT NULL,
            sets INTEGER NOT NULL,
            total_volume_lbs REAL NOT NULL,
            total_reps INTEGER NOT NULL,
            max_weight_lbs REAL NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_workouts_exercise
            ON workout_sets(owner_id, exercise_key, created_at DESC);

        CREATE TABLE IF NOT EXISTS bodyweight_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            owner_id TEXT NOT NULL,
            weight_lbs REAL NOT NULL,
            original_value REAL NOT NULL,
            original_unit TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS action_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            session_id TEXT NOT NULL,
            tool_name TEXT NOT NULL,
            request_payload TEXT NOT NULL,
            result_payload TEXT,
            status TEXT NOT NULL,
            error_code TEXT,
            execution_time_ms INTEGER,
            request_id TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_action_log_request ON action_log(request_id);
        CREATE INDEX IF NOT EXISTS idx_action_log_created ON action_log(created_at);

        CREATE TABLE IF NOT EXISTS assignments (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            session_id TEXT NOT NULL,
            variant_id TEXT NOT NULL,
            segment TEXT NOT NULL,
            variant_config TEXT NOT NULL,
            created_at TEXT NOT NULL,
            outcome TEXT,
            metrics TEXT,
            completed_at TEXT,
            UNIQUE(user_id, session_id)
        );

        CREATE TABLE IF NOT EXISTS user_profiles (
            user_id TEXT PRIMARY KEY,
            created_at TEXT NOT NULL,
            last_active_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS safety_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            variant_id TEXT,
            category TEXT NOT NULL,
            detail TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_safety_events_created ON safety_events(created_at);
        "#,
    )?;
    Ok(())
}
