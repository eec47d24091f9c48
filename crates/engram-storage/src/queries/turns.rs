// SPDX-FileCopyrightText: 2026 Engram Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Conversation turn operations.
//!
//! Turns are append-only. Each insert claims the next `turn_index` for its
//! session inside a transaction, so ordering is strict even with
//! interleaved writers.

use engram_core::EngramError;
use rusqlite::params;

use crate::database::Database;
use crate::models::ConversationTurn;

fn row_to_turn(row: &rusqlite::Row) -> Result<ConversationTurn, rusqlite::Error> {
    Ok(ConversationTurn {
        id: row.get(0)?,
        session_id: row.get(1)?,
        turn_index: row.get(2)?,
        role: row.get(3)?,
        content: row.get(4)?,
        tool_calls: row.get(5)?,
        tool_results: row.get(6)?,
        extracted: row.get::<_, i64>(7)? != 0,
        created_at: row.get(8)?,
    })
}

const TURN_COLUMNS: &str =
    "id, session_id, turn_index, role, content, tool_calls, tool_results, extracted, created_at";

/// Append a turn to a session, claiming the next turn index atomically.
pub async fn insert_turn(
    db: &Database,
    session_id: &str,
    role: &str,
    content: &str,
    tool_calls: Option<String>,
    tool_results: Option<String>,
) -> Result<ConversationTurn, EngramError> {
    let id = uuid::Uuid::new_v4().to_string();
    let session_id = session_id.to_string();
    let role = role.to_string();
    let content = content.to_string();

    db.connection()
        .call(move |conn| {
            let tx = conn.transaction()?;
            let next_index: i64 = tx.query_row(
                "SELECT COALESCE(MAX(turn_index), -1) + 1 FROM turns WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT INTO turns (id, session_id, turn_index, role, content, tool_calls, tool_results)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![id, session_id, next_index, role, content, tool_calls, tool_results],
            )?;
            let turn = tx.query_row(
                &format!("SELECT {TURN_COLUMNS} FROM turns WHERE id = ?1"),
                params![id],
                row_to_turn,
            )?;
            tx.commit()?;
            Ok(turn)
        })
        .await
        .map_err(crate::database::map_tr_err)
}

/// All turns of a session in turn order.
pub async fn get_turns(
    db: &Database,
    session_id: &str,
) -> Result<Vec<ConversationTurn>, EngramError> {
    let session_id = session_id.to_string();
    db.connection()
        .call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TURN_COLUMNS} FROM turns WHERE session_id = ?1 ORDER BY turn_index ASC"
            ))?;
            let turns = stmt
                .query_map(params![session_id], row_to_turn)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(turns)
        })
        .await
        .map_err(crate::database::map_tr_err)
}

/// The last `n` turns of a session, oldest first.
pub async fn recent_turns(
    db: &Database,
    session_id: &str,
    n: usize,
) -> Result<Vec<ConversationTurn>, EngramError> {
    let session_id = session_id.to_string();
    db.connection()
        .call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TURN_COLUMNS} FROM (
                     SELECT {TURN_COLUMNS} FROM turns WHERE session_id = ?1
                     ORDER BY turn_index DESC LIMIT ?2
                 ) ORDER BY turn_index ASC"
            ))?;
            let turns = stmt
                .query_map(params![session_id, n as i64], row_to_turn)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(turns)
        })
        .await
        .map_err(crate::database::map_tr_err)
}

/// Turns not yet consumed by extraction, oldest first.
///
/// Pass `None` to scan across all sessions (lifecycle backfill).
pub async fn unextracted_turns(
    db: &Database,
    session_id: Option<&str>,
    limit: usize,
) -> Result<Vec<ConversationTurn>, EngramError> {
    let session_id = session_id.map(|s| s.to_string());
    db.connection()
        .call(move |conn| {
            let turns = match session_id {
                Some(sid) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {TURN_COLUMNS} FROM turns
                         WHERE extracted = 0 AND session_id = ?1
                         ORDER BY session_id, turn_index ASC LIMIT ?2"
                    ))?;
                    stmt.query_map(params![sid, limit as i64], row_to_turn)?
                        .collect::<Result<Vec<_>, _>>()?
                }
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {TURN_COLUMNS} FROM turns
                         WHERE extracted = 0
                         ORDER BY session_id, turn_index ASC LIMIT ?1"
                    ))?;
                    stmt.query_map(params![limit as i64], row_to_turn)?
                        .collect::<Result<Vec<_>, _>>()?
                }
            };
            Ok(turns)
        })
        .await
        .map_err(crate::database::map_tr_err)
}

/// Mark the given turns as consumed by extraction.
pub async fn mark_extracted(db: &Database, ids: &[String]) -> Result<(), EngramError> {
    if ids.is_empty() {
        return Ok(());
    }
    let ids = ids.to_vec();
    db.connection()
        .call(move |conn| {
            let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{i}")).collect();
            let sql = format!(
                "UPDATE turns SET extracted = 1 WHERE id IN ({})",
                placeholders.join(", ")
            );
            let params: Vec<&dyn rusqlite::types::ToSql> =
                ids.iter().map(|id| id as &dyn rusqlite::types::ToSql).collect();
            conn.execute(&sql, params.as_slice())?;
            Ok(())
        })
        .await
        .map_err(crate::database::map_tr_err)
}

/// The highest turn index a session has reached, if any.
pub async fn max_turn_index(db: &Database, session_id: &str) -> Result<Option<i64>, EngramError> {
    let session_id = session_id.to_string();
    db.connection()
        .call(move |conn| {
            let max: Option<i64> = conn.query_row(
                "SELECT MAX(turn_index) FROM turns WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )?;
            Ok(max)
        })
        .await
        .map_err(crate::database::map_tr_err)
}
