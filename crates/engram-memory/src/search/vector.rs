// SPDX-FileCopyrightText: 2026 Engram Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Local vector search backend.
//!
//! Embeds memory text with the ONNX embedder and stores vectors as BLOBs
//! in the `vector_index` table. Search is brute-force cosine over all
//! indexed vectors, which stays fast well into the tens of thousands of
//! memories.
//!
//! Warm-up (model download + session load) runs on a spawned task;
//! `available()` reports false until it completes and the router serves
//! lexical results in the meantime.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use engram_core::EngramError;
use engram_storage::{map_tr_err, Database};
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::types::{blob_to_vec, cosine_similarity, vec_to_blob, MemoryKind};

use super::embedder::{ensure_model, OnnxEmbedder};
use super::{BackendKind, SearchBackend, SearchHit};

pub struct VectorBackend {
    db: Database,
    data_dir: PathBuf,
    similarity_threshold: f32,
    embedder: RwLock<Option<Arc<OnnxEmbedder>>>,
}

impl VectorBackend {
    pub fn new(db: Database, data_dir: PathBuf, similarity_threshold: f64) -> Self {
        Self {
            db,
            data_dir,
            similarity_threshold: similarity_threshold as f32,
            embedder: RwLock::new(None),
        }
    }

    /// Start model warm-up in the background. Construction never blocks on
    /// the model download.
    pub fn spawn_warmup(self: &Arc<Self>) {
        let backend = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = backend.warm_up().await {
                error!(error = %e, "vector backend warm-up failed; lexical fallback remains active");
            }
        });
    }

    /// Download model files if needed and load the ONNX session.
    pub async fn warm_up(&self) -> Result<(), EngramError> {
        if self.embedder.read().await.is_some() {
            return Ok(());
        }
        let model_path = ensure_model(&self.data_dir).await?;
        let embedder = tokio::task::spawn_blocking(move || OnnxEmbedder::new(&model_path))
            .await
            .map_err(|e| EngramError::Internal(format!("warm-up task panicked: {e}")))??;
        *self.embedder.write().await = Some(Arc::new(embedder));
        info!("vector backend warm, serving semantic search");
        Ok(())
    }

    async fn embedder(&self) -> Option<Arc<OnnxEmbedder>> {
        self.embedder.read().await.clone()
    }

    async fn upsert_vector(&self, id: &str, vector: &[f32]) -> Result<(), EngramError> {
        let id = id.to_string();
        let blob = vec_to_blob(vector);
        self.db
            .connection()
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO vector_index (memory_id, embedding) VALUES (?1, ?2)",
                    rusqlite::params![id, blob],
                )?;
                Ok(())
            })
            .await
            .map_err(map_tr_err)
    }
}

#[async_trait]
impl SearchBackend for VectorBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Vector
    }

    async fn available(&self) -> bool {
        self.embedder.read().await.is_some()
    }

    async fn index(&self, id: &str, text: &str) -> Result<(), EngramError> {
        let Some(embedder) = self.embedder().await else {
            // Not warm yet; reconciliation backfills the gap.
            debug!(id, "vector index skipped, model not warm");
            return Ok(());
        };
        let vector = embedder.embed_text(text)?;
        self.upsert_vector(id, &vector).await
    }

    async fn remove(&self, id: &str) -> Result<(), EngramError> {
        let id = id.to_string();
        self.db
            .connection()
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM vector_index WHERE memory_id = ?1",
                    rusqlite::params![id],
                )?;
                Ok(())
            })
            .await
            .map_err(map_tr_err)
    }

    async fn search(
        &self,
        query: &str,
        kind: Option<MemoryKind>,
        limit: usize,
    ) -> Result<Vec<SearchHit>, EngramError> {
        let Some(embedder) = self.embedder().await else {
            return Ok(Vec::new());
        };
        let query_vec = embedder.embed_text(query)?;
        let kind = kind.map(|k| k.as_str());

        // Only vectors whose memory is still visible to retrieval.
        let rows: Vec<(String, Vec<u8>)> = self
            .db
            .connection()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT v.memory_id, v.embedding
                     FROM vector_index v
                     JOIN memories m ON m.id = v.memory_id
                     WHERE m.archived = 0 AND m.superseded_by IS NULL
                       AND (?1 IS NULL OR m.kind = ?1)",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![kind], |row| {
                        Ok((row.get(0)?, row.get(1)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(map_tr_err)?;

        let mut hits: Vec<SearchHit> = rows
            .into_iter()
            .filter_map(|(id, blob)| {
                let score = cosine_similarity(&query_vec, &blob_to_vec(&blob));
                (score >= self.similarity_threshold).then_some(SearchHit { id, score })
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn rebuild(&self, entries: Vec<(String, String)>) -> Result<(), EngramError> {
        let Some(embedder) = self.embedder().await else {
            debug!("vector rebuild skipped, model not warm");
            return Ok(());
        };

        let mut rows = Vec::with_capacity(entries.len());
        for (id, text) in entries {
            let vector = embedder.embed_text(&text)?;
            rows.push((id, vec_to_blob(&vector)));
        }

        self.db
            .connection()
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM vector_index", [])?;
                for (id, blob) in rows {
                    tx.execute(
                        "INSERT INTO vector_index (memory_id, embedding) VALUES (?1, ?2)",
                        rusqlite::params![id, blob],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(map_tr_err)
    }
}
