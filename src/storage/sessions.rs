//! Queries over the `session_tool_history` table

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::error::Result;
use crate::types::{SessionHistoryEntry, SessionStats};

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// All tools recorded for a session, oldest first
pub fn get_session_history(conn: &Connection, session_id: &str) -> Result<Vec<SessionHistoryEntry>> {
    let mut stmt = conn.prepare_cached(
        "SELECT session_id, tool_md5, tool_name, retrieved_at
         FROM session_tool_history
         WHERE session_id = ?
         ORDER BY id ASC",
    )?;
    let rows = stmt.query_map(params![session_id], |row| {
        let retrieved_at: String = row.get(3)?;
        Ok(SessionHistoryEntry {
            session_id: row.get(0)?,
            tool_md5: row.get(1)?,
            tool_name: row.get(2)?,
            retrieved_at: parse_timestamp(&retrieved_at),
        })
    })?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

/// Whether a tool identity has already been surfaced to a session
pub fn is_retrieved(conn: &Connection, session_id: &str, tool_md5: &str) -> Result<bool> {
    let mut stmt = conn.prepare_cached(
        "SELECT COUNT(*) FROM session_tool_history WHERE session_id = ? AND tool_md5 = ?",
    )?;
    let count: i64 = stmt.query_row(params![session_id, tool_md5], |row| row.get(0))?;
    Ok(count > 0)
}

/// Record one surfaced tool. Idempotent on `(session_id, tool_md5)`.
pub fn record_retrieved(
    conn: &Connection,
    session_id: &str,
    tool_md5: &str,
    tool_name: &str,
) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT OR IGNORE INTO session_tool_history (session_id, tool_md5, tool_name, retrieved_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![session_id, tool_md5, tool_name, now],
    )?;
    Ok(())
}

/// Record a batch of surfaced tools in one pass
pub fn record_retrieved_batch(
    conn: &Connection,
    session_id: &str,
    tools: &[(String, String)],
) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    let mut stmt = conn.prepare_cached(
        "INSERT OR IGNORE INTO session_tool_history (session_id, tool_md5, tool_name, retrieved_at)
         VALUES (?1, ?2, ?3, ?4)",
    )?;
    for (tool_md5, tool_name) in tools {
        stmt.execute(params![session_id, tool_md5, tool_name, now])?;
    }
    Ok(())
}

/// Forget everything a session has been shown
pub fn clear_session(conn: &Connection, session_id: &str) -> Result<usize> {
    let deleted = conn.execute(
        "DELETE FROM session_tool_history WHERE session_id = ?",
        params![session_id],
    )?;
    Ok(deleted)
}

/// Aggregate statistics for a session
pub fn session_stats(conn: &Connection, session_id: &str) -> Result<SessionStats> {
    let mut stmt = conn.prepare_cached(
        "SELECT COUNT(*), MIN(retrieved_at), MAX(retrieved_at)
         FROM session_tool_history WHERE session_id = ?",
    )?;
    let (total, first, last): (i64, Option<String>, Option<String>) =
        stmt.query_row(params![session_id], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?;

    Ok(SessionStats {
        session_id: session_id.to_string(),
        total_tools: total as usize,
        first_retrieved_at: first.map(|s| parse_timestamp(&s)),
        last_retrieved_at: last.map(|s| parse_timestamp(&s)),
    })
}
