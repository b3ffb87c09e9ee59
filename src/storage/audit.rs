//! Append-only action log
//!
//! Every tool invocation writes one pending entry before execution and
//! exactly one terminal entry (success or failed) afterward, both sharing
//! one request id. A second terminal entry for the same request id is an
//! integrity violation and is raised, never repaired.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::error::{Result, SpotterError};
use crate::types::{ActionLogEntry, ActionStatus};

/// Write the pending entry for a just-received tool invocation
pub fn append_pending(
    conn: &Connection,
    user_id: &str,
    session_id: &str,
    tool_name: &str,
    request_payload: &serde_json::Value,
    request_id: Uuid,
    now: DateTime<Utc>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO action_log
             (user_id, session_id, tool_name, request_payload, status, request_id, created_at)
         VALUES (?, ?, ?, ?, 'pending', ?, ?)",
        params![
            user_id,
            session_id,
            tool_name,
            request_payload.to_string(),
            request_id.to_string(),
            now.to_rfc3339(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Write the single terminal entry for a request id.
///
/// Fails with [`SpotterError::Integrity`] if a terminal entry already
/// exists, or if no pending entry preceded this call.
#[allow(clippy::too_many_arguments)]
pub fn append_terminal(
    conn: &Connection,
    request_id: Uuid,
    status: ActionStatus,
    result_payload: Option<&serde_json::Value>,
    error_code: Option<&str>,
    execution_time_ms: i64,
    now: DateTime<Utc>,
) -> Result<i64> {
    if !status.is_terminal() {
        return Err(SpotterError::Integrity(format!(
            "non-terminal status {} for request {}",
            status.as_str(),
            request_id
        )));
    }

    let (pending, terminal): (i64, i64) = conn.query_row(
        "SELECT
             SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END),
             SUM(CASE WHEN status != 'pending' THEN 1 ELSE 0 END)
         FROM action_log WHERE request_id = ?",
        params![request_id.to_string()],
        |row| {
            Ok((
                row.get::<_, Option<i64>>(0)?.unwrap_or(0),
                row.get::<_, Option<i64>>(1)?.unwrap_or(0),
            ))
        },
    )?;

    if pending == 0 {
        return Err(SpotterError::Integrity(format!(
            "terminal entry without preceding pending entry for request {}",
            request_id
        )));
    }
    if terminal > 0 {
        return Err(SpotterError::Integrity(format!(
            "duplicate terminal entry for request {}",
            request_id
        )));
    }

    // Carry identifying fields over from the pending entry
    let (user_id, session_id, tool_name, request_payload): (String, String, String, String) = conn
        .query_row(
            "SELECT user_id, session_id, tool_name, request_payload
             FROM action_log WHERE request_id = ? AND status = 'pending'",
            params![request_id.to_string()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;

    conn.execute(
        "INSERT INTO action_log
             (user_id, session_id, tool_name, request_payload, result_payload,
              status, error_code, execution_time_ms, request_id, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            user_id,
            session_id,
            tool_name,
            request_payload,
            result_payload.map(|p| p.to_string()),
            status.as_str(),
            error_code,
            execution_time_ms,
            request_id.to_string(),
            now.to_rfc3339(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Filter for querying the action log
#[derive(Debug, Clone, Default)]
pub struct ActionLogFilter {
    pub user_id: Option<String>,
    pub request_id: Option<Uuid>,
    pub status: Option<ActionStatus>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

/// Query action log entries, newest first
pub fn query_action_log(conn: &Connection, filter: &ActionLogFilter) -> Result<Vec<ActionLogEntry>> {
    let mut sql = String::from(
        "SELECT id, user_id, session_id, tool_name, request_payload, result_payload,
                status, error_code, execution_time_ms, request_id, created_at
         FROM action_log WHERE 1=1",
    );
    let mut bindings: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(ref user_id) = filter.user_id {
        sql.push_str(" AND user_id = ?");
        bindings.push(Box::new(user_id.clone()));
    }
    if let Some(request_id) = filter.request_id {
        sql.push_str(" AND request_id = ?");
        bindings.push(Box::new(request_id.to_string()));
    }
    if let Some(status) = filter.status {
        sql.push_str(" AND status = ?");
        bindings.push(Box::new(status.as_str().to_string()));
    }
    if let Some(ref since) = filter.since {
        sql.push_str(" AND created_at >= ?");
        bindings.push(Box::new(since.to_rfc3339()));
    }

    sql.push_str(" ORDER BY id DESC");
    if let Some(limit) = filter.limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }

    let params_ref: Vec<&dyn rusqlite::ToSql> = bindings.iter().map(|b| b.as_ref()).collect();
    let mut stmt = conn.prepare(&sql)?;
    let entries = stmt
        .query_map(params_ref.as_slice(), |row| {
            let payload_str: String = row.get(4)?;
            let result_str: Option<String> = row.get(5)?;
            let status_str: String = row.get(6)?;
            let request_id_str: String = row.get(9)?;
            let created: String = row.get(10)?;
            Ok(ActionLogEntry {
                id: row.get(0)?,
                user_id: row.get(1)?,
                session_id: row.get(2)?,
                tool_name: row.get(3)?,
                request_payload: serde_json::from_str(&payload_str)
                    .unwrap_or(serde_json::Value::Null),
                result_payload: result_str.and_then(|s| serde_json::from_str(&s).ok()),
                status: status_str.parse().unwrap_or(ActionStatus::Failed),
                error_code: row.get(7)?,
                execution_time_ms: row.get(8)?,
                request_id: Uuid::parse_str(&request_id_str).unwrap_or_default(),
                created_at: DateTime::parse_from_rfc3339(&created)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            })
        })?
        .filter_map(|r| r.ok())
        .collect();
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    fn pending(conn: &Connection, request_id: Uuid) -> i64 {
        append_pending(
            conn,
            "u1",
            "s1",
            "log_workout",
            &serde_json::json!({"exercise": "squat"}),
            request_id,
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn test_pending_then_terminal() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                let request_id = Uuid::new_v4();
                pending(conn, request_id);
                append_terminal(
                    conn,
                    request_id,
                    ActionStatus::Success,
                    Some(&serde_json::json!({"id": 1})),
                    None,
                    42,
                    Utc::now(),
                )?;

                let entries = query_action_log(
                    conn,
                    &ActionLogFilter {
                        request_id: Some(request_id),
                        ..Default::default()
                    },
                )?;
                assert_eq!(entries.len(), 2);
                // newest first
                assert_eq!(entries[0].status, ActionStatus::Success);
                assert_eq!(entries[1].status, ActionStatus::Pending);
                assert!(entries[1].id < entries[0].id);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_duplicate_terminal_is_integrity_violation() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                let request_id = Uuid::new_v4();
                pending(conn, request_id);
                append_terminal(conn, request_id, ActionStatus::Failed, None, Some("validation"), 5, Utc::now())?;

                let second = append_terminal(
                    conn,
                    request_id,
                    ActionStatus::Success,
                    None,
                    None,
                    7,
                    Utc::now(),
                );
                assert!(matches!(second, Err(SpotterError::Integrity(_))));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_terminal_without_pending_is_integrity_violation() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                let result = append_terminal(
                    conn,
                    Uuid::new_v4(),
                    ActionStatus::Success,
                    None,
                    None,
                    1,
                    Utc::now(),
                );
                assert!(matches!(result, Err(SpotterError::Integrity(_))));
                Ok(())
            })
            .unwrap();
    }
}
