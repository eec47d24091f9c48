// SPDX-FileCopyrightText: 2026 Engram Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The engine facade: one object wiring storage, search, extraction,
//! retrieval, lifecycle and the compression bridge together for a host
//! agent.

use std::sync::Arc;

use engram_config::{EngramConfig, SearchBackendChoice};
use engram_core::{CompletionProvider, EngramError};
use engram_storage::models::ConversationTurn;
use engram_storage::queries::turns;
use engram_storage::Database;
use tracing::info;

use crate::bridge::{CaptureReport, ContextBridge};
use crate::extractor::MemoryExtractor;
use crate::lifecycle::{LifecycleManager, MaintenanceReport};
use crate::retrieval::RetrievalEngine;
use crate::search::{
    BackendKind, LexicalBackend, RemoteBackend, SearchRouter, VectorBackend,
};
use crate::store::{SemanticUpdate, UnifiedStore};
use crate::types::{Attachment, MemoryKind, MemoryStats, Scratchpad, SemanticMemory};

/// Turns fed to retrieval when building injection context.
const INJECTION_CONTEXT_TURNS: usize = 6;
/// Upper bound on turns consumed by one session-end extraction.
const SESSION_END_TURN_LIMIT: usize = 200;

pub struct MemoryEngine {
    db: Database,
    store: Arc<UnifiedStore>,
    extractor: Arc<MemoryExtractor>,
    retrieval: RetrievalEngine,
    lifecycle: LifecycleManager,
    bridge: ContextBridge,
}

impl MemoryEngine {
    /// Open the configured database and assemble the engine.
    pub async fn new(
        config: EngramConfig,
        provider: Arc<dyn CompletionProvider>,
    ) -> Result<Self, EngramError> {
        let path = config.storage.resolved_database_path();
        let db = Database::open(&path, config.storage.busy_timeout_ms).await?;
        Self::with_database(config, provider, db)
    }

    /// Assemble the engine over an already-open database. Tests use this
    /// with an in-memory database.
    pub fn with_database(
        config: EngramConfig,
        provider: Arc<dyn CompletionProvider>,
        db: Database,
    ) -> Result<Self, EngramError> {
        let lexical = Arc::new(LexicalBackend::new(db.clone()));
        let router = match config.search.backend {
            SearchBackendChoice::Lexical => SearchRouter::lexical_only(lexical),
            SearchBackendChoice::Vector => {
                let backend = Arc::new(VectorBackend::new(
                    db.clone(),
                    config.search.resolved_model_dir(),
                    config.search.similarity_threshold,
                ));
                // Model download and session load happen off the hot path;
                // lexical search carries queries until the backend is warm.
                backend.spawn_warmup();
                SearchRouter::new(backend, lexical)
            }
            SearchBackendChoice::Remote => {
                let backend = Arc::new(RemoteBackend::new(
                    db.clone(),
                    config.search.api_base.clone(),
                    config.search.api_key.clone(),
                    config.search.api_model.clone(),
                    config.search.similarity_threshold,
                    std::time::Duration::from_secs(config.search.request_timeout_secs),
                )?);
                SearchRouter::new(backend, lexical)
            }
        };

        let store = Arc::new(UnifiedStore::new(db.clone(), Arc::new(router)));
        let extractor = Arc::new(MemoryExtractor::new(
            store.clone(),
            provider,
            config.extraction.clone(),
        ));
        let retrieval = RetrievalEngine::new(store.clone(), config.retrieval.clone());
        let lifecycle =
            LifecycleManager::new(store.clone(), extractor.clone(), config.lifecycle.clone());
        let bridge = ContextBridge::new(store.clone(), extractor.clone(), config.extraction);

        info!(backend = ?config.search.backend, "memory engine assembled");
        Ok(Self {
            db,
            store,
            extractor,
            retrieval,
            lifecycle,
            bridge,
        })
    }

    pub fn store(&self) -> &Arc<UnifiedStore> {
        &self.store
    }

    // ---- session lifecycle ----

    /// Begin (or resume) a session; returns the next turn index.
    pub async fn start_session(&self, session_id: &str) -> Result<i64, EngramError> {
        let next = turns::max_turn_index(&self.db, session_id)
            .await?
            .map(|i| i + 1)
            .unwrap_or(0);
        info!(session = session_id, next_turn = next, "session started");
        Ok(next)
    }

    /// Append one turn to the session log.
    pub async fn record_turn(
        &self,
        session_id: &str,
        role: &str,
        content: &str,
        tool_calls: Option<String>,
        tool_results: Option<String>,
    ) -> Result<ConversationTurn, EngramError> {
        turns::insert_turn(&self.db, session_id, role, content, tool_calls, tool_results).await
    }

    /// The memory block to inject before the next model call, or `None`
    /// when nothing relevant is known.
    pub async fn get_injection_context(
        &self,
        user_id: Option<&str>,
        session_id: &str,
    ) -> Result<Option<String>, EngramError> {
        self.get_injection_context_with(user_id, session_id, None, None)
            .await
    }

    /// Like [`get_injection_context`](Self::get_injection_context) but with
    /// per-call persona and token-budget overrides; `None` keeps the
    /// configured value.
    pub async fn get_injection_context_with(
        &self,
        user_id: Option<&str>,
        session_id: &str,
        persona: Option<&str>,
        max_tokens: Option<usize>,
    ) -> Result<Option<String>, EngramError> {
        let recent = turns::recent_turns(&self.db, session_id, INJECTION_CONTEXT_TURNS).await?;
        self.retrieval
            .build_injection_with(user_id, &recent, persona, max_tokens)
            .await
    }

    /// Extract everything durable from the finished session: facts, an
    /// episode, and a scratchpad rewrite. Provider failures queue retries;
    /// the turns are marked consumed either way since queued payloads carry
    /// their own copies.
    pub async fn on_session_end(
        &self,
        session_id: &str,
        user_id: Option<&str>,
    ) -> Result<(), EngramError> {
        let session_turns =
            turns::unextracted_turns(&self.db, Some(session_id), SESSION_END_TURN_LIMIT).await?;
        if session_turns.is_empty() {
            return Ok(());
        }

        self.extractor
            .extract_facts_durable(Some(session_id), &session_turns)
            .await?;
        let ids: Vec<String> = session_turns.iter().map(|t| t.id.clone()).collect();
        turns::mark_extracted(&self.db, &ids).await?;

        self.extractor
            .generate_episode_durable(session_id, "session_end", &session_turns)
            .await?;
        if let Some(user_id) = user_id {
            self.extractor
                .update_scratchpad_durable(user_id, Some(session_id), &session_turns)
                .await?;
        }
        Ok(())
    }

    /// Capture memory before the host compresses its context window.
    pub async fn on_context_compressing(
        &self,
        session_id: &str,
    ) -> Result<CaptureReport, EngramError> {
        let session_turns =
            turns::unextracted_turns(&self.db, Some(session_id), SESSION_END_TURN_LIMIT).await?;
        self.bridge
            .on_context_compressing(session_id, &session_turns)
            .await
    }

    // ---- direct memory operations ----

    pub async fn get_memory(&self, id: &str) -> Result<Option<SemanticMemory>, EngramError> {
        self.store.get_semantic(id).await
    }

    pub async fn list_memories(
        &self,
        kind: Option<MemoryKind>,
        include_archived: bool,
        limit: usize,
    ) -> Result<Vec<SemanticMemory>, EngramError> {
        self.store.list_semantic(kind, include_archived, limit).await
    }

    pub async fn search_memories(
        &self,
        query: &str,
        kind: Option<MemoryKind>,
        limit: usize,
    ) -> Result<Vec<(SemanticMemory, f32)>, EngramError> {
        self.store.search_semantic(query, kind, limit).await
    }

    pub async fn remember(&self, memory: &SemanticMemory) -> Result<(), EngramError> {
        self.store.save_semantic(memory).await
    }

    pub async fn update_memory(
        &self,
        id: &str,
        update: SemanticUpdate,
    ) -> Result<Option<SemanticMemory>, EngramError> {
        self.store.update_semantic(id, update).await
    }

    /// Forgetting archives; nothing is destroyed.
    pub async fn forget_memory(&self, id: &str) -> Result<bool, EngramError> {
        self.store.archive_semantic(id).await
    }

    pub async fn get_scratchpad(&self, user_id: &str) -> Result<Option<Scratchpad>, EngramError> {
        self.store.get_scratchpad(user_id).await
    }

    pub async fn record_attachment(&self, attachment: &Attachment) -> Result<(), EngramError> {
        self.store.save_attachment(attachment).await
    }

    pub async fn search_attachments(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Attachment>, EngramError> {
        self.store.search_attachments(query, limit).await
    }

    // ---- maintenance ----

    /// Run one maintenance pass now.
    pub async fn consolidate(&self) -> MaintenanceReport {
        self.lifecycle.run().await
    }

    /// Rewrite the on-disk digest without running the other passes.
    ///
    /// Returns false when no digest path is configured.
    pub async fn rebuild_digest(&self) -> Result<bool, EngramError> {
        self.lifecycle.refresh_digest().await
    }

    /// Drain one batch of queued extraction work without the full pass.
    pub async fn drain_queue(&self) -> Result<(), EngramError> {
        self.extractor.process_queue().await.map(|_| ())
    }

    pub async fn stats(&self) -> Result<MemoryStats, EngramError> {
        self.store.stats().await
    }

    /// The search backend that would serve a query right now.
    pub async fn active_search_backend(&self) -> BackendKind {
        self.store.search_router().active_kind().await
    }

    /// Flush the WAL before shutdown.
    pub async fn shutdown(&self) -> Result<(), EngramError> {
        self.db.checkpoint().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use engram_core::{CompletionRequest, CompletionResponse};
    use std::sync::Mutex;

    struct ScriptedProvider {
        responses: Mutex<Vec<String>>,
    }

    impl ScriptedProvider {
        fn new(responses: Vec<&str>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into_iter().map(str::to_string).rev().collect()),
            })
        }
    }

    #[async_trait]
    impl CompletionProvider for ScriptedProvider {
        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, EngramError> {
            let next = self.responses.lock().unwrap().pop();
            match next {
                Some(content) => Ok(CompletionResponse {
                    content,
                    usage: None,
                }),
                None => Err(EngramError::provider("scripted provider exhausted")),
            }
        }
    }

    async fn engine(provider: Arc<ScriptedProvider>) -> MemoryEngine {
        let db = Database::open_in_memory().await.unwrap();
        MemoryEngine::with_database(EngramConfig::default(), provider, db).unwrap()
    }

    #[tokio::test]
    async fn full_session_flow_persists_and_recalls() {
        let provider = ScriptedProvider::new(vec![
            // Fact extraction at session end.
            r#"[{"kind": "PREFERENCE", "subject": "user", "predicate": "editor", "content": "prefers helix for rust work", "importance": 0.7}]"#,
            // Episode summary.
            r#"{"title": "Editor setup", "summary": "Configured helix for the rust project.", "outcome": "success"}"#,
            // Scratchpad rewrite.
            "## Current focus\nEditor configuration finished",
        ]);
        let engine = engine(provider).await;

        assert_eq!(engine.start_session("s1").await.unwrap(), 0);
        engine
            .record_turn("s1", "user", "set up helix as my editor please", None, None)
            .await
            .unwrap();
        engine
            .record_turn("s1", "assistant", "done, helix configured", None, None)
            .await
            .unwrap();
        assert_eq!(engine.start_session("s1").await.unwrap(), 2);

        engine.on_session_end("s1", Some("alice")).await.unwrap();

        let memories = engine.list_memories(None, false, 10).await.unwrap();
        assert_eq!(memories.len(), 1);
        assert_eq!(memories[0].content, "prefers helix for rust work");

        let pad = engine.get_scratchpad("alice").await.unwrap().unwrap();
        assert!(pad.content.contains("Editor configuration"));

        // A later session sees the memory in its injection context.
        engine
            .record_turn("s2", "user", "which editor do I use for rust?", None, None)
            .await
            .unwrap();
        let block = engine
            .get_injection_context(Some("alice"), "s2")
            .await
            .unwrap()
            .unwrap();
        assert!(block.contains("prefers helix"));
        assert!(block.contains("## Working notes"));

        let stats = engine.stats().await.unwrap();
        assert_eq!(stats.active_memories, 1);
        assert_eq!(stats.episodes, 1);
    }

    #[tokio::test]
    async fn session_end_is_idempotent_over_extracted_turns() {
        let provider = ScriptedProvider::new(vec![
            r#"[{"content": "works in fintech"}]"#,
            r#"{"title": "t", "summary": "s"}"#,
        ]);
        let engine = engine(provider).await;
        engine
            .record_turn("s1", "user", "I work in fintech these days", None, None)
            .await
            .unwrap();

        engine.on_session_end("s1", None).await.unwrap();
        // Second call sees no unextracted turns and does nothing, even
        // though the provider script is exhausted.
        engine.on_session_end("s1", None).await.unwrap();
        assert_eq!(engine.list_memories(None, false, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn forget_archives_instead_of_deleting() {
        let provider = ScriptedProvider::new(vec![]);
        let engine = engine(provider).await;
        let m = SemanticMemory::new(MemoryKind::Fact, "owns a dog named Miso", 0.6);
        engine.remember(&m).await.unwrap();

        assert!(engine.forget_memory(&m.id).await.unwrap());
        assert!(engine.list_memories(None, false, 10).await.unwrap().is_empty());
        // The row survives for audit.
        let row = engine.get_memory(&m.id).await.unwrap().unwrap();
        assert!(row.archived);
        assert!(!engine.forget_memory(&m.id).await.unwrap());
    }

    #[tokio::test]
    async fn compression_capture_feeds_the_queue_and_consolidate_drains_it() {
        // Provider fails during capture (episode) and succeeds during the
        // maintenance retry.
        let provider = ScriptedProvider::new(vec![]);
        let engine = engine(provider).await;
        engine
            .record_turn(
                "s1",
                "user",
                "I prefer explicit error types over anyhow in libraries",
                None,
                None,
            )
            .await
            .unwrap();

        let report = engine.on_context_compressing("s1").await.unwrap();
        assert_eq!(report.direct_memories, 1);
        assert_eq!(report.queued_jobs, 1);

        let stats = engine.stats().await.unwrap();
        assert!(stats.pending_queue >= 1);

        // The quick-scan capture is immediately searchable.
        let hits = engine
            .search_memories("explicit error types", None, 5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.source, "context_compress");
    }

    #[tokio::test]
    async fn lexical_backend_is_active_by_default() {
        let provider = ScriptedProvider::new(vec![]);
        let engine = engine(provider).await;
        assert_eq!(engine.active_search_backend().await, BackendKind::Lexical);
        engine.shutdown().await.unwrap();
    }
}
