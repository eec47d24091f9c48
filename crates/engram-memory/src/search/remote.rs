// SPDX-FileCopyrightText: 2026 Engram Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Remote embedding backend (OpenAI-compatible `/embeddings` endpoint).
//!
//! Every embedding is cached in the `embedding_cache` table keyed by
//! sha256 of `"{model}:{text}"`, so repeated searches over a stable corpus
//! cost one API call per new text. Unavailable without an API key; the
//! router falls back to lexical search.

use async_trait::async_trait;
use engram_core::EngramError;
use engram_storage::queries::embedding_cache;
use engram_storage::{map_tr_err, Database};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::types::{blob_to_vec, cosine_similarity, vec_to_blob, MemoryKind};

use super::{BackendKind, SearchBackend, SearchHit};

/// Texts embedded per API request.
const EMBED_BATCH: usize = 100;
/// Active memories scored per remote search.
const CANDIDATE_LIMIT: usize = 400;

pub struct RemoteBackend {
    db: Database,
    http: reqwest::Client,
    api_base: String,
    api_key: Option<String>,
    model: String,
    similarity_threshold: f32,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

impl RemoteBackend {
    pub fn new(
        db: Database,
        api_base: Option<String>,
        api_key: Option<String>,
        model: String,
        similarity_threshold: f64,
        request_timeout: std::time::Duration,
    ) -> Result<Self, EngramError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| EngramError::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            db,
            http,
            api_base: api_base.unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            api_key,
            model,
            similarity_threshold: similarity_threshold as f32,
        })
    }

    /// Cache key: sha256 over model and text so a model switch never
    /// serves stale vectors.
    fn content_hash(&self, text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.model.as_bytes());
        hasher.update(b":");
        hasher.update(text.as_bytes());
        hex::encode(hasher.finalize())
    }

    async fn call_api(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, EngramError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| EngramError::provider("remote embedding backend has no API key"))?;

        let url = format!("{}/embeddings", self.api_base.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .bearer_auth(api_key)
            .json(&serde_json::json!({ "model": self.model, "input": inputs }))
            .send()
            .await
            .map_err(|e| EngramError::Provider {
                message: format!("embedding request failed: {e}"),
                source: Some(Box::new(e)),
            })?;

        if !response.status().is_success() {
            return Err(EngramError::provider(format!(
                "embedding API returned {}",
                response.status()
            )));
        }

        let body: EmbeddingResponse = response.json().await.map_err(|e| EngramError::Provider {
            message: format!("embedding response decode failed: {e}"),
            source: Some(Box::new(e)),
        })?;

        if body.data.len() != inputs.len() {
            return Err(EngramError::provider(format!(
                "embedding API returned {} vectors for {} inputs",
                body.data.len(),
                inputs.len()
            )));
        }

        let mut data = body.data;
        data.sort_by_key(|d| d.index);
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }

    /// Embed texts, serving from the cache and calling the API only for
    /// misses.
    async fn embed_cached(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EngramError> {
        let mut vectors: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut misses: Vec<usize> = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            let hash = self.content_hash(text);
            match embedding_cache::get(&self.db, &hash).await? {
                Some(hit) => vectors[i] = Some(blob_to_vec(&hit.embedding)),
                None => misses.push(i),
            }
        }

        if !misses.is_empty() {
            debug!(misses = misses.len(), total = texts.len(), "embedding cache misses");
        }

        for chunk in misses.chunks(EMBED_BATCH) {
            let inputs: Vec<String> = chunk.iter().map(|&i| texts[i].clone()).collect();
            let embedded = self.call_api(&inputs).await?;
            for (&i, vector) in chunk.iter().zip(embedded.iter()) {
                let hash = self.content_hash(&texts[i]);
                embedding_cache::put(
                    &self.db,
                    &hash,
                    &self.model,
                    vector.len() as i64,
                    vec_to_blob(vector),
                )
                .await?;
                vectors[i] = Some(vector.clone());
            }
        }

        Ok(vectors.into_iter().flatten().collect())
    }

    /// Active memories with the text they are searched by.
    async fn candidates(
        &self,
        kind: Option<MemoryKind>,
    ) -> Result<Vec<(String, String)>, EngramError> {
        let kind = kind.map(|k| k.as_str());
        self.db
            .connection()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, COALESCE(subject, ''), COALESCE(predicate, ''), content, tags
                     FROM memories
                     WHERE archived = 0 AND superseded_by IS NULL
                       AND (?2 IS NULL OR kind = ?2)
                     ORDER BY updated_at DESC
                     LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![CANDIDATE_LIMIT as i64, kind], |row| {
                        let id: String = row.get(0)?;
                        let subject: String = row.get(1)?;
                        let predicate: String = row.get(2)?;
                        let content: String = row.get(3)?;
                        let tags: String = row.get(4)?;
                        let tags: Vec<String> =
                            serde_json::from_str(&tags).unwrap_or_default();
                        let mut text = String::new();
                        for part in [subject.as_str(), predicate.as_str(), content.as_str()] {
                            if !part.is_empty() {
                                if !text.is_empty() {
                                    text.push(' ');
                                }
                                text.push_str(part);
                            }
                        }
                        if !tags.is_empty() {
                            text.push(' ');
                            text.push_str(&tags.join(" "));
                        }
                        Ok((id, text))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(map_tr_err)
    }
}

#[async_trait]
impl SearchBackend for RemoteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    async fn available(&self) -> bool {
        self.api_key.is_some()
    }

    async fn index(&self, _id: &str, text: &str) -> Result<(), EngramError> {
        // Pre-warm the cache so the next search is one API call cheaper.
        self.embed_cached(std::slice::from_ref(&text.to_string()))
            .await?;
        Ok(())
    }

    async fn remove(&self, _id: &str) -> Result<(), EngramError> {
        // Cached vectors for dead content are harmless; nothing keys them.
        Ok(())
    }

    async fn search(
        &self,
        query: &str,
        kind: Option<MemoryKind>,
        limit: usize,
    ) -> Result<Vec<SearchHit>, EngramError> {
        if self.api_key.is_none() {
            return Ok(Vec::new());
        }

        let query_vec = self
            .embed_cached(std::slice::from_ref(&query.to_string()))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EngramError::provider("embedding API returned nothing for query"))?;

        let candidates = self.candidates(kind).await?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let texts: Vec<String> = candidates.iter().map(|(_, t)| t.clone()).collect();
        let vectors = self.embed_cached(&texts).await?;

        let mut hits: Vec<SearchHit> = candidates
            .iter()
            .zip(vectors.iter())
            .filter_map(|((id, _), vector)| {
                let score = cosine_similarity(&query_vec, vector);
                (score >= self.similarity_threshold).then(|| SearchHit {
                    id: id.clone(),
                    score,
                })
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn rebuild(&self, entries: Vec<(String, String)>) -> Result<(), EngramError> {
        if self.api_key.is_none() {
            return Ok(());
        }
        let texts: Vec<String> = entries.into_iter().map(|(_, t)| t).collect();
        self.embed_cached(&texts).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn keyless_backend() -> RemoteBackend {
        let db = Database::open_in_memory().await.unwrap();
        RemoteBackend::new(
            db,
            None,
            None,
            "text-embedding-3-small".to_string(),
            0.3,
            std::time::Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn keyless_backend_is_unavailable_and_silent() {
        let backend = keyless_backend().await;
        assert!(!backend.available().await);
        assert!(backend.search("anything", None, 10).await.unwrap().is_empty());
        backend.rebuild(vec![("m1".into(), "text".into())]).await.unwrap();
    }

    #[tokio::test]
    async fn content_hash_is_model_scoped() {
        let backend = keyless_backend().await;
        let a = backend.content_hash("hello");
        assert_eq!(a.len(), 64);
        assert_eq!(a, backend.content_hash("hello"));
        assert_ne!(a, backend.content_hash("hello "));

        let db = Database::open_in_memory().await.unwrap();
        let other_model = RemoteBackend::new(
            db,
            None,
            None,
            "text-embedding-3-large".to_string(),
            0.3,
            std::time::Duration::from_secs(5),
        )
        .unwrap();
        assert_ne!(a, other_model.content_hash("hello"));
    }

    #[tokio::test]
    async fn cached_vectors_are_served_without_api() {
        let backend = keyless_backend().await;
        // Seed the cache directly; no API key is configured, so a hit
        // proves the cache path never touches the network.
        let hash = backend.content_hash("warm text");
        embedding_cache::put(&backend.db, &hash, &backend.model, 3, vec_to_blob(&[1.0, 0.0, 0.0]))
            .await
            .unwrap();

        let vectors = backend.embed_cached(&["warm text".to_string()]).await.unwrap();
        assert_eq!(vectors.len(), 1);
        assert_eq!(vectors[0], vec![1.0, 0.0, 0.0]);
    }

    #[tokio::test]
    async fn uncached_text_without_key_errors() {
        let backend = keyless_backend().await;
        let result = backend.embed_cached(&["cold text".to_string()]).await;
        assert!(matches!(result, Err(EngramError::Provider { .. })));
    }
}
