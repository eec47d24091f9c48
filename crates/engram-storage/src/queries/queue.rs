// SPDX-FileCopyrightText: 2026 Engram Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Extraction retry queue.
//!
//! Failed or deferred extraction work lands here before the triggering
//! call returns, so nothing is lost on crash. Workers claim batches with a
//! 5-minute lock; stale locks are reclaimed on the next claim.

use engram_core::EngramError;
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::database::Database;
use crate::models::{ConversationTurn, QueueEntry};

/// What kind of extraction work a queue entry carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionJob {
    Facts,
    Episode,
    Scratchpad,
}

/// The serialized body of a queue entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionPayload {
    pub job: ExtractionJob,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub turns: Vec<ConversationTurn>,
}

/// Enqueue extraction work. Returns the queue entry id.
pub async fn enqueue(
    db: &Database,
    payload: &ExtractionPayload,
    max_attempts: u32,
) -> Result<i64, EngramError> {
    let session_id = payload.session_id.clone();
    let body = serde_json::to_string(payload)
        .map_err(|e| EngramError::Internal(format!("payload serialization failed: {e}")))?;
    db.connection()
        .call(move |conn| {
            conn.execute(
                "INSERT INTO extraction_queue (session_id, payload, max_attempts) VALUES (?1, ?2, ?3)",
                params![session_id, body, max_attempts],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
        .map_err(crate::database::map_tr_err)
}

fn row_to_entry(row: &rusqlite::Row) -> Result<QueueEntry, rusqlite::Error> {
    Ok(QueueEntry {
        id: row.get(0)?,
        session_id: row.get(1)?,
        payload: row.get(2)?,
        status: row.get(3)?,
        attempts: row.get(4)?,
        max_attempts: row.get(5)?,
        last_error: row.get(6)?,
        locked_until: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

/// Claim up to `n` entries for processing.
///
/// Atomically selects pending entries (plus processing entries whose lock
/// has expired) and marks them "processing" with a 5-minute lock.
pub async fn claim_batch(db: &Database, n: usize) -> Result<Vec<QueueEntry>, EngramError> {
    db.connection()
        .call(move |conn| {
            let tx = conn.transaction()?;
            let entries = {
                let mut stmt = tx.prepare(
                    "SELECT id, session_id, payload, status, attempts, max_attempts,
                            last_error, locked_until, created_at, updated_at
                     FROM extraction_queue
                     WHERE status = 'pending'
                        OR (status = 'processing'
                            AND locked_until < strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
                     ORDER BY id ASC
                     LIMIT ?1",
                )?;
                stmt.query_map(params![n as i64], row_to_entry)?
                    .collect::<Result<Vec<_>, _>>()?
            };
            for entry in &entries {
                tx.execute(
                    "UPDATE extraction_queue SET status = 'processing',
                     locked_until = strftime('%Y-%m-%dT%H:%M:%fZ', 'now', '+5 minutes'),
                     updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
                     WHERE id = ?1",
                    params![entry.id],
                )?;
            }
            tx.commit()?;
            Ok(entries
                .into_iter()
                .map(|entry| QueueEntry {
                    status: "processing".to_string(),
                    ..entry
                })
                .collect())
        })
        .await
        .map_err(crate::database::map_tr_err)
}

/// Acknowledge successful processing: the entry is deleted.
pub async fn ack(db: &Database, id: i64) -> Result<(), EngramError> {
    db.connection()
        .call(move |conn| {
            conn.execute("DELETE FROM extraction_queue WHERE id = ?1", params![id])?;
            Ok(())
        })
        .await
        .map_err(crate::database::map_tr_err)
}

/// Record a failed attempt.
///
/// Increments attempts. At `max_attempts` the entry is parked as "failed";
/// otherwise it returns to "pending" with the lock cleared.
pub async fn fail(db: &Database, id: i64, error: &str) -> Result<(), EngramError> {
    let error = error.to_string();
    db.connection()
        .call(move |conn| {
            let (attempts, max_attempts): (i32, i32) = conn.query_row(
                "SELECT attempts, max_attempts FROM extraction_queue WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;

            let new_attempts = attempts + 1;
            let status = if new_attempts >= max_attempts {
                "failed"
            } else {
                "pending"
            };
            conn.execute(
                "UPDATE extraction_queue SET status = ?1, attempts = ?2,
                 last_error = ?3, locked_until = NULL,
                 updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
                 WHERE id = ?4",
                params![status, new_attempts, error, id],
            )?;
            Ok(())
        })
        .await
        .map_err(crate::database::map_tr_err)
}

/// Count of entries by status, for stats reporting.
pub async fn count_by_status(db: &Database, status: &str) -> Result<i64, EngramError> {
    let status = status.to_string();
    db.connection()
        .call(move |conn| {
            conn.query_row(
                "SELECT count(*) FROM extraction_queue WHERE status = ?1",
                params![status],
                |row| row.get(0),
            )
        })
        .await
        .map_err(crate::database::map_tr_err)
}
