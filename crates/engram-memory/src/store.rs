// SPDX-FileCopyrightText: 2026 Engram Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Unified persistence layer over semantic memories, episodes, scratchpads
//! and attachments.
//!
//! SQLite rows are the source of truth; search indexes are derived state.
//! A failed index write is logged and repaired by the next reconciliation
//! pass, never surfaced to the caller as a lost memory.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use engram_core::EngramError;
use engram_storage::queries::{embedding_cache, queue};
use engram_storage::{map_tr_err, Database};
use rusqlite::params;
use tracing::warn;

use crate::search::{SearchRouter, SearchHit};
use crate::types::{
    format_ts, parse_ts, parse_ts_opt, ActionNode, Attachment, AttachmentDirection, Episode,
    EpisodeOutcome, MediaType, MemoryKind, MemoryStats, Scratchpad, SemanticMemory,
    SCRATCHPAD_MAX_CHARS,
};

const MEMORY_COLUMNS: &str = "id, kind, priority, subject, predicate, content, source, \
     source_episode_id, tags, importance, confidence, access_count, decay_rate, archived, \
     superseded_by, source_turn_at, expires_at, created_at, updated_at, last_accessed_at";

const EPISODE_COLUMNS: &str = "id, title, summary, goal, outcome, action_nodes, entities, \
     tools, source, session_id, importance, access_count, started_at, ended_at, created_at, \
     last_accessed_at";

const ATTACHMENT_COLUMNS: &str = "id, session_id, filename, media_type, mime_type, size_bytes, \
     storage_path, direction, description, transcription, extracted_text, tags, \
     linked_memory_ids, created_at";

fn row_to_memory(row: &rusqlite::Row<'_>) -> rusqlite::Result<SemanticMemory> {
    let kind: String = row.get(1)?;
    let priority: String = row.get(2)?;
    let tags: String = row.get(8)?;
    let created_at: String = row.get(17)?;
    let updated_at: String = row.get(18)?;
    Ok(SemanticMemory {
        id: row.get(0)?,
        kind: MemoryKind::from_str_value(&kind),
        priority: crate::types::MemoryPriority::from_str_value(&priority),
        subject: row.get(3)?,
        predicate: row.get(4)?,
        content: row.get(5)?,
        source: row.get(6)?,
        source_episode_id: row.get(7)?,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        importance: row.get(9)?,
        confidence: row.get(10)?,
        access_count: row.get(11)?,
        decay_rate: row.get(12)?,
        archived: row.get::<_, i64>(13)? != 0,
        superseded_by: row.get(14)?,
        source_turn_at: parse_ts_opt(row.get(15)?),
        expires_at: parse_ts_opt(row.get(16)?),
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
        last_accessed_at: parse_ts_opt(row.get(19)?),
    })
}

fn row_to_episode(row: &rusqlite::Row<'_>) -> rusqlite::Result<Episode> {
    let outcome: String = row.get(4)?;
    let action_nodes: String = row.get(5)?;
    let entities: String = row.get(6)?;
    let tools: String = row.get(7)?;
    let created_at: String = row.get(14)?;
    Ok(Episode {
        id: row.get(0)?,
        title: row.get(1)?,
        summary: row.get(2)?,
        goal: row.get(3)?,
        outcome: EpisodeOutcome::from_str_value(&outcome),
        action_nodes: serde_json::from_str::<Vec<ActionNode>>(&action_nodes).unwrap_or_default(),
        entities: serde_json::from_str(&entities).unwrap_or_default(),
        tools: serde_json::from_str(&tools).unwrap_or_default(),
        source: row.get(8)?,
        session_id: row.get(9)?,
        importance: row.get(10)?,
        access_count: row.get(11)?,
        started_at: parse_ts_opt(row.get(12)?),
        ended_at: parse_ts_opt(row.get(13)?),
        created_at: parse_ts(&created_at),
        last_accessed_at: parse_ts_opt(row.get(15)?),
    })
}

fn row_to_attachment(row: &rusqlite::Row<'_>) -> rusqlite::Result<Attachment> {
    let media_type: String = row.get(3)?;
    let direction: String = row.get(7)?;
    let tags: String = row.get(11)?;
    let linked: String = row.get(12)?;
    let created_at: String = row.get(13)?;
    Ok(Attachment {
        id: row.get(0)?,
        session_id: row.get(1)?,
        filename: row.get(2)?,
        media_type: MediaType::from_str_value(&media_type),
        mime_type: row.get(4)?,
        size_bytes: row.get(5)?,
        storage_path: row.get(6)?,
        direction: AttachmentDirection::from_str_value(&direction),
        description: row.get(8)?,
        transcription: row.get(9)?,
        extracted_text: row.get(10)?,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        linked_memory_ids: serde_json::from_str(&linked).unwrap_or_default(),
        created_at: parse_ts(&created_at),
    })
}

/// Partial update of a semantic memory. `None` fields are left untouched.
#[derive(Debug, Default, Clone)]
pub struct SemanticUpdate {
    pub content: Option<String>,
    pub importance: Option<f64>,
    pub tags: Option<Vec<String>>,
    pub priority: Option<crate::types::MemoryPriority>,
    /// `Some(None)` clears the expiry, `Some(Some(_))` replaces it.
    pub expires_at: Option<Option<DateTime<Utc>>>,
}

pub struct UnifiedStore {
    db: Database,
    search: Arc<SearchRouter>,
}

impl UnifiedStore {
    pub fn new(db: Database, search: Arc<SearchRouter>) -> Self {
        Self { db, search }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn search_router(&self) -> &Arc<SearchRouter> {
        &self.search
    }

    // ---- semantic memories ----

    pub async fn save_semantic(&self, memory: &SemanticMemory) -> Result<(), EngramError> {
        let m = memory.clone();
        self.db
            .connection()
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO memories (id, kind, priority, subject, predicate, content, \
                     source, source_episode_id, tags, importance, confidence, access_count, \
                     decay_rate, archived, superseded_by, source_turn_at, expires_at, \
                     created_at, updated_at, last_accessed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, \
                     ?15, ?16, ?17, ?18, ?19, ?20)",
                    params![
                        m.id,
                        m.kind.as_str(),
                        m.priority.as_str(),
                        m.subject,
                        m.predicate,
                        m.content,
                        m.source,
                        m.source_episode_id,
                        serde_json::to_string(&m.tags).unwrap_or_else(|_| "[]".to_string()),
                        m.importance,
                        m.confidence,
                        m.access_count,
                        m.decay_rate,
                        m.archived as i64,
                        m.superseded_by,
                        m.source_turn_at.map(format_ts),
                        m.expires_at.map(format_ts),
                        format_ts(m.created_at),
                        format_ts(m.updated_at),
                        m.last_accessed_at.map(format_ts),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(map_tr_err)?;

        metrics::counter!("engram_memories_saved_total").increment(1);
        if let Err(e) = self.search.index(&memory.id, &memory.index_text()).await {
            warn!(id = %memory.id, error = %e, "memory saved but index write failed");
        }
        Ok(())
    }

    pub async fn get_semantic(&self, id: &str) -> Result<Option<SemanticMemory>, EngramError> {
        let id = id.to_string();
        self.db
            .connection()
            .call(move |conn| {
                let sql = format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE id = ?1");
                let result = conn.query_row(&sql, params![id], row_to_memory);
                match result {
                    Ok(m) => Ok(Some(m)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e),
                }
            })
            .await
            .map_err(map_tr_err)
    }

    /// Find the active memory for an entity key, if one exists.
    ///
    /// At most one active memory per (subject, predicate) pair is the
    /// store's invariant; supersession preserves it.
    pub async fn find_active_by_entity(
        &self,
        subject: &str,
        predicate: &str,
    ) -> Result<Option<SemanticMemory>, EngramError> {
        let subject = subject.to_string();
        let predicate = predicate.to_string();
        self.db
            .connection()
            .call(move |conn| {
                let sql = format!(
                    "SELECT {MEMORY_COLUMNS} FROM memories
                     WHERE subject = ?1 AND predicate = ?2
                       AND superseded_by IS NULL AND archived = 0
                     ORDER BY updated_at DESC LIMIT 1"
                );
                let result = conn.query_row(&sql, params![subject, predicate], row_to_memory);
                match result {
                    Ok(m) => Ok(Some(m)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e),
                }
            })
            .await
            .map_err(map_tr_err)
    }

    pub async fn update_semantic(
        &self,
        id: &str,
        update: SemanticUpdate,
    ) -> Result<Option<SemanticMemory>, EngramError> {
        let Some(mut memory) = self.get_semantic(id).await? else {
            return Ok(None);
        };
        if let Some(content) = update.content {
            memory.content = content;
        }
        if let Some(importance) = update.importance {
            memory.importance = importance.clamp(0.0, 1.0);
        }
        if let Some(tags) = update.tags {
            memory.tags = tags;
        }
        if let Some(priority) = update.priority {
            memory.priority = priority;
        }
        if let Some(expires_at) = update.expires_at {
            memory.expires_at = expires_at;
        }
        memory.updated_at = Utc::now();

        let m = memory.clone();
        self.db
            .connection()
            .call(move |conn| {
                conn.execute(
                    "UPDATE memories SET content = ?2, importance = ?3, tags = ?4, \
                     priority = ?5, expires_at = ?6, updated_at = ?7 WHERE id = ?1",
                    params![
                        m.id,
                        m.content,
                        m.importance,
                        serde_json::to_string(&m.tags).unwrap_or_else(|_| "[]".to_string()),
                        m.priority.as_str(),
                        m.expires_at.map(format_ts),
                        format_ts(m.updated_at),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(map_tr_err)?;

        if memory.is_active() {
            if let Err(e) = self.search.index(&memory.id, &memory.index_text()).await {
                warn!(id = %memory.id, error = %e, "memory updated but index write failed");
            }
        }
        Ok(Some(memory))
    }

    /// Same fact observed again: keep the stronger importance and raise
    /// confidence. `source_turn_at` advances to the newer observation.
    pub async fn reinforce(
        &self,
        id: &str,
        importance: f64,
        source_turn_at: Option<DateTime<Utc>>,
    ) -> Result<(), EngramError> {
        let id = id.to_string();
        let now = format_ts(Utc::now());
        let turn_at = source_turn_at.map(format_ts);
        self.db
            .connection()
            .call(move |conn| {
                conn.execute(
                    "UPDATE memories SET importance = MAX(importance, ?2), \
                     confidence = MIN(1.0, confidence + 0.1), \
                     source_turn_at = COALESCE(?3, source_turn_at), \
                     updated_at = ?4 WHERE id = ?1",
                    params![id, importance, turn_at, now],
                )?;
                Ok(())
            })
            .await
            .map_err(map_tr_err)
    }

    /// Replace an existing memory with a newer version atomically. The old
    /// row stays as history with its forward link set.
    pub async fn supersede(
        &self,
        old_id: &str,
        replacement: &SemanticMemory,
    ) -> Result<(), EngramError> {
        let old_id_owned = old_id.to_string();
        let m = replacement.clone();
        self.db
            .connection()
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO memories (id, kind, priority, subject, predicate, content, \
                     source, source_episode_id, tags, importance, confidence, access_count, \
                     decay_rate, archived, superseded_by, source_turn_at, expires_at, \
                     created_at, updated_at, last_accessed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, \
                     ?15, ?16, ?17, ?18, ?19, ?20)",
                    params![
                        m.id,
                        m.kind.as_str(),
                        m.priority.as_str(),
                        m.subject,
                        m.predicate,
                        m.content,
                        m.source,
                        m.source_episode_id,
                        serde_json::to_string(&m.tags).unwrap_or_else(|_| "[]".to_string()),
                        m.importance,
                        m.confidence,
                        m.access_count,
                        m.decay_rate,
                        m.archived as i64,
                        m.superseded_by,
                        m.source_turn_at.map(format_ts),
                        m.expires_at.map(format_ts),
                        format_ts(m.created_at),
                        format_ts(m.updated_at),
                        m.last_accessed_at.map(format_ts),
                    ],
                )?;
                tx.execute(
                    "UPDATE memories SET superseded_by = ?2, updated_at = ?3 WHERE id = ?1",
                    params![old_id_owned, m.id, format_ts(Utc::now())],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(map_tr_err)?;

        metrics::counter!("engram_memories_superseded_total").increment(1);
        if let Err(e) = self.search.remove(old_id).await {
            warn!(id = %old_id, error = %e, "failed to remove superseded memory from index");
        }
        if let Err(e) = self
            .search
            .index(&replacement.id, &replacement.index_text())
            .await
        {
            warn!(id = %replacement.id, error = %e, "replacement saved but index write failed");
        }
        Ok(())
    }

    /// Hide a memory from retrieval without destroying it.
    pub async fn archive_semantic(&self, id: &str) -> Result<bool, EngramError> {
        let id_owned = id.to_string();
        let now = format_ts(Utc::now());
        let changed = self
            .db
            .connection()
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE memories SET archived = 1, updated_at = ?2 \
                     WHERE id = ?1 AND archived = 0",
                    params![id_owned, now],
                )?;
                Ok(n)
            })
            .await
            .map_err(map_tr_err)?;

        if changed > 0 {
            metrics::counter!("engram_memories_archived_total").increment(1);
            if let Err(e) = self.search.remove(id).await {
                warn!(id = %id, error = %e, "failed to remove archived memory from index");
            }
        }
        Ok(changed > 0)
    }

    /// Record that memories were served into context.
    pub async fn bump_access(&self, ids: &[String]) -> Result<(), EngramError> {
        if ids.is_empty() {
            return Ok(());
        }
        let ids = ids.to_vec();
        let now = format_ts(Utc::now());
        self.db
            .connection()
            .call(move |conn| {
                let tx = conn.transaction()?;
                for id in &ids {
                    tx.execute(
                        "UPDATE memories SET access_count = access_count + 1, \
                         last_accessed_at = ?2 WHERE id = ?1",
                        params![id, now],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(map_tr_err)
    }

    pub async fn list_semantic(
        &self,
        kind: Option<MemoryKind>,
        include_archived: bool,
        limit: usize,
    ) -> Result<Vec<SemanticMemory>, EngramError> {
        self.db
            .connection()
            .call(move |conn| {
                let mut sql = format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE 1=1");
                if !include_archived {
                    sql.push_str(" AND archived = 0 AND superseded_by IS NULL");
                }
                if kind.is_some() {
                    sql.push_str(" AND kind = ?1");
                }
                sql.push_str(" ORDER BY importance DESC, updated_at DESC LIMIT ");
                sql.push_str(&limit.to_string());

                let mut stmt = conn.prepare(&sql)?;
                let rows = match kind {
                    Some(k) => stmt
                        .query_map(params![k.as_str()], row_to_memory)?
                        .collect::<Result<Vec<_>, _>>()?,
                    None => stmt
                        .query_map([], row_to_memory)?
                        .collect::<Result<Vec<_>, _>>()?,
                };
                Ok(rows)
            })
            .await
            .map_err(map_tr_err)
    }

    /// All memories visible to retrieval, for decay and reconciliation.
    pub async fn active_memories(&self) -> Result<Vec<SemanticMemory>, EngramError> {
        self.db
            .connection()
            .call(|conn| {
                let sql = format!(
                    "SELECT {MEMORY_COLUMNS} FROM memories \
                     WHERE archived = 0 AND superseded_by IS NULL ORDER BY created_at"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([], row_to_memory)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(map_tr_err)
    }

    /// Search active memories through the router, returning full rows with
    /// backend scores. Hits whose rows disappeared or went inactive between
    /// index and fetch are dropped.
    pub async fn search_semantic(
        &self,
        query: &str,
        kind: Option<MemoryKind>,
        limit: usize,
    ) -> Result<Vec<(SemanticMemory, f32)>, EngramError> {
        let hits: Vec<SearchHit> = self.search.search(query, kind, limit).await?;
        let mut results = Vec::with_capacity(hits.len());
        for hit in hits {
            if let Some(memory) = self.get_semantic(&hit.id).await? {
                if memory.is_active() {
                    results.push((memory, hit.score));
                }
            }
        }
        Ok(results)
    }

    /// Archive every non-permanent memory whose expiry has passed.
    pub async fn cleanup_expired(&self) -> Result<u64, EngramError> {
        let now = format_ts(Utc::now());
        let archived = self
            .db
            .connection()
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE memories SET archived = 1, updated_at = ?1 \
                     WHERE archived = 0 AND expires_at IS NOT NULL AND expires_at < ?1",
                    params![now],
                )?;
                Ok(n as u64)
            })
            .await
            .map_err(map_tr_err)?;
        Ok(archived)
    }

    /// Delete transient memories that expired more than `grace_hours` ago.
    /// The only path that ever deletes a memory row.
    pub async fn purge_transient(&self, grace_hours: u64) -> Result<u64, EngramError> {
        let cutoff = format_ts(Utc::now() - chrono::Duration::hours(grace_hours as i64));
        let ids: Vec<String> = self
            .db
            .connection()
            .call(move |conn| {
                let tx = conn.transaction()?;
                let ids = {
                    let mut stmt = tx.prepare(
                        "SELECT id FROM memories \
                         WHERE priority = 'TRANSIENT' AND expires_at IS NOT NULL \
                           AND expires_at < ?1",
                    )?;
                    stmt.query_map(params![cutoff], |row| row.get::<_, String>(0))?
                        .collect::<Result<Vec<_>, _>>()?
                };
                for id in &ids {
                    tx.execute("DELETE FROM memories WHERE id = ?1", params![id])?;
                    tx.execute("DELETE FROM vector_index WHERE memory_id = ?1", params![id])?;
                }
                tx.commit()?;
                Ok(ids)
            })
            .await
            .map_err(map_tr_err)?;

        for id in &ids {
            if let Err(e) = self.search.remove(id).await {
                warn!(id = %id, error = %e, "failed to remove purged memory from index");
            }
        }
        Ok(ids.len() as u64)
    }

    // ---- episodes ----

    pub async fn save_episode(&self, episode: &Episode) -> Result<(), EngramError> {
        let e = episode.clone();
        self.db
            .connection()
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO episodes (id, title, summary, goal, outcome, action_nodes, \
                     entities, tools, source, session_id, importance, access_count, \
                     started_at, ended_at, created_at, last_accessed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, \
                     ?15, ?16)",
                    params![
                        e.id,
                        e.title,
                        e.summary,
                        e.goal,
                        e.outcome.as_str(),
                        serde_json::to_string(&e.action_nodes)
                            .unwrap_or_else(|_| "[]".to_string()),
                        serde_json::to_string(&e.entities).unwrap_or_else(|_| "[]".to_string()),
                        serde_json::to_string(&e.tools).unwrap_or_else(|_| "[]".to_string()),
                        e.source,
                        e.session_id,
                        e.importance,
                        e.access_count,
                        e.started_at.map(format_ts),
                        e.ended_at.map(format_ts),
                        format_ts(e.created_at),
                        e.last_accessed_at.map(format_ts),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(map_tr_err)
    }

    pub async fn get_episode(&self, id: &str) -> Result<Option<Episode>, EngramError> {
        let id = id.to_string();
        self.db
            .connection()
            .call(move |conn| {
                let sql = format!("SELECT {EPISODE_COLUMNS} FROM episodes WHERE id = ?1");
                let result = conn.query_row(&sql, params![id], row_to_episode);
                match result {
                    Ok(e) => Ok(Some(e)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e),
                }
            })
            .await
            .map_err(map_tr_err)
    }

    /// Episodes mentioning an entity, newest first. Entity membership is a
    /// substring match over the stored entity list, title and summary.
    pub async fn episodes_by_entity(
        &self,
        entity: &str,
        limit: usize,
    ) -> Result<Vec<Episode>, EngramError> {
        let pattern = format!("%{}%", entity.to_lowercase());
        self.db
            .connection()
            .call(move |conn| {
                let sql = format!(
                    "SELECT {EPISODE_COLUMNS} FROM episodes \
                     WHERE lower(entities) LIKE ?1 OR lower(title) LIKE ?1 \
                        OR lower(summary) LIKE ?1 \
                     ORDER BY created_at DESC LIMIT {limit}"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![pattern], row_to_episode)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(map_tr_err)
    }

    pub async fn recent_episodes(&self, limit: usize) -> Result<Vec<Episode>, EngramError> {
        self.db
            .connection()
            .call(move |conn| {
                let sql = format!(
                    "SELECT {EPISODE_COLUMNS} FROM episodes ORDER BY created_at DESC LIMIT {limit}"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([], row_to_episode)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(map_tr_err)
    }

    /// Whether any episode was already captured for a session. Guards
    /// backfill against generating duplicates.
    pub async fn session_has_episode(&self, session_id: &str) -> Result<bool, EngramError> {
        let session_id = session_id.to_string();
        self.db
            .connection()
            .call(move |conn| {
                let exists: i64 = conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM episodes WHERE session_id = ?1)",
                    params![session_id],
                    |row| row.get(0),
                )?;
                Ok(exists != 0)
            })
            .await
            .map_err(map_tr_err)
    }

    pub async fn bump_episode_access(&self, ids: &[String]) -> Result<(), EngramError> {
        if ids.is_empty() {
            return Ok(());
        }
        let ids = ids.to_vec();
        let now = format_ts(Utc::now());
        self.db
            .connection()
            .call(move |conn| {
                let tx = conn.transaction()?;
                for id in &ids {
                    tx.execute(
                        "UPDATE episodes SET access_count = access_count + 1, \
                         last_accessed_at = ?2 WHERE id = ?1",
                        params![id, now],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(map_tr_err)
    }

    // ---- scratchpads ----

    pub async fn get_scratchpad(&self, user_id: &str) -> Result<Option<Scratchpad>, EngramError> {
        let user_id = user_id.to_string();
        self.db
            .connection()
            .call(move |conn| {
                let result = conn.query_row(
                    "SELECT user_id, content, updated_at FROM scratchpads WHERE user_id = ?1",
                    params![user_id],
                    |row| {
                        let user_id: String = row.get(0)?;
                        let content: String = row.get(1)?;
                        let updated_at: String = row.get(2)?;
                        Ok(Scratchpad::from_content(user_id, content, parse_ts(&updated_at)))
                    },
                );
                match result {
                    Ok(s) => Ok(Some(s)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e),
                }
            })
            .await
            .map_err(map_tr_err)
    }

    /// Write a user's scratchpad, truncating to the cap on a char boundary.
    pub async fn put_scratchpad(&self, user_id: &str, content: &str) -> Result<(), EngramError> {
        let user_id = user_id.to_string();
        let content: String = content.chars().take(SCRATCHPAD_MAX_CHARS).collect();
        let now = format_ts(Utc::now());
        self.db
            .connection()
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO scratchpads (user_id, content, updated_at) \
                     VALUES (?1, ?2, ?3) \
                     ON CONFLICT(user_id) DO UPDATE SET content = ?2, updated_at = ?3",
                    params![user_id, content, now],
                )?;
                Ok(())
            })
            .await
            .map_err(map_tr_err)
    }

    // ---- attachments ----

    pub async fn save_attachment(&self, attachment: &Attachment) -> Result<(), EngramError> {
        let a = attachment.clone();
        self.db
            .connection()
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO attachments (id, session_id, filename, media_type, mime_type, \
                     size_bytes, storage_path, direction, description, transcription, \
                     extracted_text, tags, linked_memory_ids, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                    params![
                        a.id,
                        a.session_id,
                        a.filename,
                        a.media_type.as_str(),
                        a.mime_type,
                        a.size_bytes,
                        a.storage_path,
                        a.direction.as_str(),
                        a.description,
                        a.transcription,
                        a.extracted_text,
                        serde_json::to_string(&a.tags).unwrap_or_else(|_| "[]".to_string()),
                        serde_json::to_string(&a.linked_memory_ids)
                            .unwrap_or_else(|_| "[]".to_string()),
                        format_ts(a.created_at),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(map_tr_err)
    }

    pub async fn get_attachment(&self, id: &str) -> Result<Option<Attachment>, EngramError> {
        let id = id.to_string();
        self.db
            .connection()
            .call(move |conn| {
                let sql = format!("SELECT {ATTACHMENT_COLUMNS} FROM attachments WHERE id = ?1");
                let result = conn.query_row(&sql, params![id], row_to_attachment);
                match result {
                    Ok(a) => Ok(Some(a)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e),
                }
            })
            .await
            .map_err(map_tr_err)
    }

    /// Keyword search over attachment text fields. Every query term must
    /// match somewhere in the record.
    pub async fn search_attachments(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Attachment>, EngramError> {
        let terms: Vec<String> = query
            .split_whitespace()
            .map(|t| t.to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        self.db
            .connection()
            .call(move |conn| {
                let haystack = "lower(COALESCE(filename, '') || ' ' || \
                     COALESCE(storage_path, '') || ' ' || COALESCE(description, '') || ' ' || \
                     COALESCE(transcription, '') || ' ' || \
                     COALESCE(extracted_text, '') || ' ' || tags)";
                let mut sql =
                    format!("SELECT {ATTACHMENT_COLUMNS} FROM attachments WHERE 1=1");
                for i in 1..=terms.len() {
                    sql.push_str(&format!(" AND {haystack} LIKE ?{i}"));
                }
                sql.push_str(&format!(" ORDER BY created_at DESC LIMIT {limit}"));

                let patterns: Vec<String> =
                    terms.iter().map(|t| format!("%{t}%")).collect();
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(rusqlite::params_from_iter(patterns.iter()), row_to_attachment)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(map_tr_err)
    }

    // ---- stats ----

    pub async fn stats(&self) -> Result<MemoryStats, EngramError> {
        let (active, archived, episodes, attachments) = self
            .db
            .connection()
            .call(|conn| {
                let active: i64 = conn.query_row(
                    "SELECT count(*) FROM memories WHERE archived = 0 AND superseded_by IS NULL",
                    [],
                    |row| row.get(0),
                )?;
                let archived: i64 = conn.query_row(
                    "SELECT count(*) FROM memories WHERE archived = 1 OR superseded_by IS NOT NULL",
                    [],
                    |row| row.get(0),
                )?;
                let episodes: i64 =
                    conn.query_row("SELECT count(*) FROM episodes", [], |row| row.get(0))?;
                let attachments: i64 =
                    conn.query_row("SELECT count(*) FROM attachments", [], |row| row.get(0))?;
                Ok((active, archived, episodes, attachments))
            })
            .await
            .map_err(map_tr_err)?;

        let pending = queue::count_by_status(&self.db, "pending").await?;
        let processing = queue::count_by_status(&self.db, "processing").await?;
        let failed = queue::count_by_status(&self.db, "failed").await?;
        let cached = embedding_cache::count(&self.db).await?;
        Ok(MemoryStats {
            active_memories: active,
            archived_memories: archived,
            episodes,
            attachments,
            pending_queue: pending + processing,
            failed_queue: failed,
            cached_embeddings: cached,
        })
    }
}
