// SPDX-FileCopyrightText: 2026 Engram Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Content-hash cache for remote embeddings.
//!
//! Keyed by sha256 of `"{model}:{text}"` so the same text re-embedded under
//! a different model never collides.

use engram_core::EngramError;
use rusqlite::params;

use crate::database::Database;
use crate::models::CachedEmbedding;

/// Look up a cached embedding by content hash.
pub async fn get(db: &Database, content_hash: &str) -> Result<Option<CachedEmbedding>, EngramError> {
    let content_hash = content_hash.to_string();
    db.connection()
        .call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT content_hash, model, dims, embedding FROM embedding_cache WHERE content_hash = ?1",
            )?;
            let result = stmt.query_row(params![content_hash], |row| {
                Ok(CachedEmbedding {
                    content_hash: row.get(0)?,
                    model: row.get(1)?,
                    dims: row.get(2)?,
                    embedding: row.get(3)?,
                })
            });
            match result {
                Ok(hit) => Ok(Some(hit)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e),
            }
        })
        .await
        .map_err(crate::database::map_tr_err)
}

/// Insert or replace a cached embedding.
pub async fn put(
    db: &Database,
    content_hash: &str,
    model: &str,
    dims: i64,
    embedding: Vec<u8>,
) -> Result<(), EngramError> {
    let content_hash = content_hash.to_string();
    let model = model.to_string();
    db.connection()
        .call(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO embedding_cache (content_hash, model, dims, embedding)
                 VALUES (?1, ?2, ?3, ?4)",
                params![content_hash, model, dims, embedding],
            )?;
            Ok(())
        })
        .await
        .map_err(crate::database::map_tr_err)
}

/// Number of cached vectors, for stats reporting.
pub async fn count(db: &Database) -> Result<i64, EngramError> {
    db.connection()
        .call(|conn| conn.query_row("SELECT count(*) FROM embedding_cache", [], |row| row.get(0)))
        .await
        .map_err(crate::database::map_tr_err)
}
