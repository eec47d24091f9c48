// SPDX-FileCopyrightText: 2026 Engram Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! FTS5 keyword search over the memories table.
//!
//! The index is an external-content FTS5 table kept in sync by triggers,
//! so `index`/`remove` are no-ops here. Always available; serves as the
//! fallback for every other backend.

use async_trait::async_trait;
use engram_core::EngramError;
use engram_storage::{map_tr_err, Database};

use crate::types::MemoryKind;

use super::{BackendKind, SearchBackend, SearchHit};

pub struct LexicalBackend {
    db: Database,
}

impl LexicalBackend {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Build a safe FTS5 MATCH expression from free-form text.
    ///
    /// Each alphanumeric token becomes a quoted term; terms are OR-ed so a
    /// partial match still scores. Returns `None` for queries with no
    /// indexable tokens.
    fn match_expression(query: &str) -> Option<String> {
        let terms: Vec<String> = query
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| format!("\"{t}\""))
            .collect();
        if terms.is_empty() {
            None
        } else {
            Some(terms.join(" OR "))
        }
    }
}

#[async_trait]
impl SearchBackend for LexicalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Lexical
    }

    async fn available(&self) -> bool {
        true
    }

    async fn index(&self, _id: &str, _text: &str) -> Result<(), EngramError> {
        // Triggers on the memories table keep FTS5 current.
        Ok(())
    }

    async fn remove(&self, _id: &str) -> Result<(), EngramError> {
        Ok(())
    }

    async fn search(
        &self,
        query: &str,
        kind: Option<MemoryKind>,
        limit: usize,
    ) -> Result<Vec<SearchHit>, EngramError> {
        let Some(expr) = Self::match_expression(query) else {
            return Ok(Vec::new());
        };
        let kind = kind.map(|k| k.as_str());
        self.db
            .connection()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT m.id, bm25(memories_fts) AS rank
                     FROM memories_fts
                     JOIN memories m ON m.rowid = memories_fts.rowid
                     WHERE memories_fts MATCH ?1
                       AND m.archived = 0 AND m.superseded_by IS NULL
                       AND (?3 IS NULL OR m.kind = ?3)
                     ORDER BY rank
                     LIMIT ?2",
                )?;
                let hits = stmt
                    .query_map(rusqlite::params![expr, limit as i64, kind], |row| {
                        let id: String = row.get(0)?;
                        let rank: f64 = row.get(1)?;
                        // BM25 ranks are negative (more negative = better);
                        // map to a (0, 1] score.
                        Ok(SearchHit {
                            id,
                            score: (1.0 / (1.0 + rank.abs())) as f32,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(hits)
            })
            .await
            .map_err(map_tr_err)
    }

    async fn rebuild(&self, _entries: Vec<(String, String)>) -> Result<(), EngramError> {
        // Rebuild the external-content index from the memories table.
        self.db
            .connection()
            .call(|conn| -> Result<(), rusqlite::Error> {
                conn.execute(
                    "INSERT INTO memories_fts(memories_fts) VALUES ('rebuild')",
                    [],
                )?;
                Ok(())
            })
            .await
            .map_err(map_tr_err)
    }
}
