// SPDX-FileCopyrightText: 2026 Engram Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Pluggable search backends.
//!
//! Every backend maintains a derived index keyed by memory id, rebuildable
//! from the memories table at any time. The [`SearchRouter`] wraps the
//! configured primary backend and falls back to lexical search whenever the
//! primary is unavailable or comes back empty.

pub mod embedder;
pub mod lexical;
pub mod remote;
pub mod vector;

use std::sync::Arc;

use async_trait::async_trait;
use engram_core::EngramError;
use tracing::{debug, warn};

use crate::types::MemoryKind;

pub use embedder::OnnxEmbedder;
pub use lexical::LexicalBackend;
pub use remote::RemoteBackend;
pub use vector::VectorBackend;

/// Which backend implementation produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Lexical,
    Vector,
    Remote,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Lexical => "lexical",
            BackendKind::Vector => "vector",
            BackendKind::Remote => "remote",
        }
    }
}

/// A single search result: memory id plus a relevance score in [0, 1].
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: String,
    pub score: f32,
}

/// A search index over semantic memories.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Which implementation this is.
    fn kind(&self) -> BackendKind;

    /// Whether the backend can serve queries right now. Vector backends
    /// report false until their model is warm; remote backends report
    /// false without credentials.
    async fn available(&self) -> bool;

    /// Add or update one entry in the index.
    async fn index(&self, id: &str, text: &str) -> Result<(), EngramError>;

    /// Remove one entry from the index.
    async fn remove(&self, id: &str) -> Result<(), EngramError>;

    /// Query the index, optionally restricted to one memory kind.
    /// Results are sorted by descending score.
    async fn search(
        &self,
        query: &str,
        kind: Option<MemoryKind>,
        limit: usize,
    ) -> Result<Vec<SearchHit>, EngramError>;

    /// Replace the whole index with the given (id, text) entries.
    async fn rebuild(&self, entries: Vec<(String, String)>) -> Result<(), EngramError>;
}

/// Routes searches to the primary backend with transparent lexical fallback.
///
/// Degradation is silent by design: callers always get results from
/// whichever backend can serve them, and only logs reveal which one did.
pub struct SearchRouter {
    primary: Arc<dyn SearchBackend>,
    lexical: Arc<LexicalBackend>,
}

impl SearchRouter {
    pub fn new(primary: Arc<dyn SearchBackend>, lexical: Arc<LexicalBackend>) -> Self {
        Self { primary, lexical }
    }

    /// A router that serves everything lexically.
    pub fn lexical_only(lexical: Arc<LexicalBackend>) -> Self {
        Self {
            primary: lexical.clone(),
            lexical,
        }
    }

    /// The backend that would serve a query issued now.
    pub async fn active_kind(&self) -> BackendKind {
        if self.primary.available().await {
            self.primary.kind()
        } else {
            BackendKind::Lexical
        }
    }

    pub async fn search(
        &self,
        query: &str,
        kind: Option<MemoryKind>,
        limit: usize,
    ) -> Result<Vec<SearchHit>, EngramError> {
        if self.primary.kind() != BackendKind::Lexical {
            if !self.primary.available().await {
                debug!(backend = self.primary.kind().as_str(), "primary backend unavailable, using lexical");
                return self.lexical.search(query, kind, limit).await;
            }
            match self.primary.search(query, kind, limit).await {
                Ok(hits) if !hits.is_empty() => return Ok(hits),
                Ok(_) => {
                    debug!("primary backend returned no hits, retrying lexically");
                }
                Err(e) => {
                    warn!(error = %e, backend = self.primary.kind().as_str(), "primary backend search failed, falling back to lexical");
                }
            }
        }
        self.lexical.search(query, kind, limit).await
    }

    /// Index an entry in the primary backend.
    ///
    /// The lexical index is trigger-maintained, so only the primary needs
    /// an explicit write. Indexing failures are reported, not fatal: the
    /// durable record already exists and reconciliation repairs the index.
    pub async fn index(&self, id: &str, text: &str) -> Result<(), EngramError> {
        self.primary.index(id, text).await
    }

    pub async fn remove(&self, id: &str) -> Result<(), EngramError> {
        self.primary.remove(id).await
    }

    pub async fn rebuild(&self, entries: Vec<(String, String)>) -> Result<(), EngramError> {
        self.lexical.rebuild(entries.clone()).await?;
        if self.primary.kind() != BackendKind::Lexical {
            self.primary.rebuild(entries).await?;
        }
        Ok(())
    }
}
