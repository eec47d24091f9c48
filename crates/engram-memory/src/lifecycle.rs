// SPDX-FileCopyrightText: 2026 Engram Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Background maintenance: backfill, queue drain, dedup, decay, purge,
//! index reconciliation and the on-disk digest.
//!
//! Steps run in a fixed order and each failure is recorded and skipped, so
//! one broken step never blocks the rest of the pass.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use engram_config::LifecycleConfig;
use engram_core::EngramError;
use engram_storage::queries::turns;
use tracing::{info, warn};

use crate::extractor::MemoryExtractor;
use crate::store::{SemanticUpdate, UnifiedStore};
use crate::types::{MemoryKind, MemoryPriority, SemanticMemory};

/// Effective importance below which an unused memory is archived.
const ARCHIVE_THRESHOLD: f64 = 0.1;
/// Accesses that protect a memory from archive regardless of decay.
const ARCHIVE_ACCESS_FLOOR: i64 = 3;
/// Effective importance below which a memory is demoted to transient.
const DEMOTE_THRESHOLD: f64 = 0.3;
/// Turns pulled per backfill pass.
const BACKFILL_LIMIT: usize = 500;
/// Similar memories fetched per dedup probe.
const DEDUP_PROBE_LIMIT: usize = 5;

const DEDUP_PROMPT: &str = r#"These memory records were flagged as likely duplicates of each other.
Answer MERGE if they state the same fact (possibly worded differently), or KEEP if they are genuinely distinct facts that should all be retained.

Records:
{records}

Answer with exactly one word: MERGE or KEEP."#;

/// What one maintenance pass did.
#[derive(Debug, Default, Clone)]
pub struct MaintenanceReport {
    pub backfilled_sessions: usize,
    pub queue_processed: usize,
    pub queue_failed: usize,
    pub duplicates_merged: usize,
    pub decay_archived: u64,
    pub decay_demoted: u64,
    pub expired_archived: u64,
    pub transient_purged: u64,
    pub reindexed: usize,
    pub digest_written: bool,
    pub errors: Vec<String>,
}

pub struct LifecycleManager {
    store: Arc<UnifiedStore>,
    extractor: Arc<MemoryExtractor>,
    config: LifecycleConfig,
}

impl LifecycleManager {
    pub fn new(
        store: Arc<UnifiedStore>,
        extractor: Arc<MemoryExtractor>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            store,
            extractor,
            config,
        }
    }

    /// Run one full maintenance pass.
    pub async fn run(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();

        if let Err(e) = self.backfill(&mut report).await {
            report.errors.push(format!("backfill: {e}"));
        }
        match self.extractor.process_queue().await {
            Ok(drained) => {
                report.queue_processed = drained.processed;
                report.queue_failed = drained.failed;
            }
            Err(e) => report.errors.push(format!("queue drain: {e}")),
        }
        if let Err(e) = self.dedup(&mut report).await {
            report.errors.push(format!("dedup: {e}"));
        }
        if let Err(e) = self.decay(&mut report).await {
            report.errors.push(format!("decay: {e}"));
        }
        match self.store.cleanup_expired().await {
            Ok(n) => report.expired_archived = n,
            Err(e) => report.errors.push(format!("expiry: {e}")),
        }
        match self
            .store
            .purge_transient(self.config.transient_ttl_hours.max(0) as u64)
            .await
        {
            Ok(n) => report.transient_purged = n,
            Err(e) => report.errors.push(format!("purge: {e}")),
        }
        if let Err(e) = self.reconcile(&mut report).await {
            report.errors.push(format!("reconcile: {e}"));
        }
        match self.refresh_digest().await {
            Ok(written) => report.digest_written = written,
            Err(e) => report.errors.push(format!("digest: {e}")),
        }

        metrics::counter!("engram_maintenance_runs_total").increment(1);
        metrics::counter!("engram_dedup_merged_total")
            .increment(report.duplicates_merged as u64);
        metrics::counter!("engram_decay_archived_total").increment(report.decay_archived);
        metrics::counter!("engram_decay_demoted_total").increment(report.decay_demoted);
        metrics::counter!("engram_transient_purged_total").increment(report.transient_purged);
        info!(
            backfilled = report.backfilled_sessions,
            merged = report.duplicates_merged,
            archived = report.decay_archived + report.expired_archived,
            purged = report.transient_purged,
            errors = report.errors.len(),
            "maintenance pass complete"
        );
        report
    }

    /// Extract from turns that never went through session-end processing,
    /// one session at a time.
    async fn backfill(&self, report: &mut MaintenanceReport) -> Result<(), EngramError> {
        let pending =
            turns::unextracted_turns(self.store.database(), None, BACKFILL_LIMIT).await?;
        if pending.is_empty() {
            return Ok(());
        }

        let mut by_session: HashMap<String, Vec<engram_storage::models::ConversationTurn>> =
            HashMap::new();
        for turn in pending {
            by_session.entry(turn.session_id.clone()).or_default().push(turn);
        }

        for (session_id, session_turns) in by_session {
            self.extractor
                .extract_facts_durable(Some(&session_id), &session_turns)
                .await?;
            // Sessions that ended without session-end processing also miss
            // their episode; generate it from the same turns.
            if !self.store.session_has_episode(&session_id).await? {
                self.extractor
                    .generate_episode_durable(&session_id, "backfill", &session_turns)
                    .await?;
            }
            let ids: Vec<String> = session_turns.iter().map(|t| t.id.clone()).collect();
            turns::mark_extracted(self.store.database(), &ids).await?;
            report.backfilled_sessions += 1;
        }
        Ok(())
    }

    /// Merge duplicate memories within each kind. Exact content duplicates
    /// always merge; near-duplicates merge when the search backend scores
    /// them above the configured threshold.
    async fn dedup(&self, report: &mut MaintenanceReport) -> Result<(), EngramError> {
        for kind in MemoryKind::all() {
            let memories = self.store.list_semantic(Some(kind), false, 10_000).await?;
            if memories.len() < 2 {
                continue;
            }

            let mut merged: Vec<String> = Vec::new();
            // Exact duplicates, keyed by normalized content.
            let mut by_content: HashMap<String, Vec<&SemanticMemory>> = HashMap::new();
            for memory in &memories {
                by_content
                    .entry(memory.content.trim().to_lowercase())
                    .or_default()
                    .push(memory);
            }
            for cluster in by_content.values().filter(|c| c.len() > 1) {
                self.merge_cluster(cluster, &mut merged).await?;
            }

            // Near-duplicates via the search backend.
            for memory in &memories {
                if merged.contains(&memory.id) {
                    continue;
                }
                let hits = self
                    .store
                    .search_semantic(&memory.index_text(), Some(kind), DEDUP_PROBE_LIMIT)
                    .await?;
                let cluster: Vec<&SemanticMemory> = std::iter::once(memory)
                    .chain(memories.iter().filter(|other| {
                        other.id != memory.id
                            && !merged.contains(&other.id)
                            && hits.iter().any(|(hit, score)| {
                                hit.id == other.id
                                    && f64::from(*score) >= self.config.dedup_threshold
                            })
                    }))
                    .collect();
                if cluster.len() > 1 && self.cluster_should_merge(&cluster).await {
                    self.merge_cluster(&cluster, &mut merged).await?;
                }
            }
            report.duplicates_merged += merged.len();
        }
        Ok(())
    }

    /// Ask the completion provider whether a similarity cluster states one
    /// fact or several. Provider failure keeps the cluster for the next run.
    async fn cluster_should_merge(&self, cluster: &[&SemanticMemory]) -> bool {
        let records = cluster
            .iter()
            .enumerate()
            .map(|(i, m)| format!("{}. [{}] {}", i + 1, m.kind.as_str(), m.content))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = DEDUP_PROMPT.replace("{records}", &records);
        match self.extractor.complete(prompt).await {
            Ok(response) => response.trim().to_uppercase().starts_with("MERGE"),
            Err(e) => {
                warn!(error = %e, "dedup judgment failed, keeping cluster");
                false
            }
        }
    }

    /// Archive everything in the cluster except the strongest member, which
    /// absorbs the cluster's peak importance.
    async fn merge_cluster(
        &self,
        cluster: &[&SemanticMemory],
        merged: &mut Vec<String>,
    ) -> Result<(), EngramError> {
        let Some(winner) = cluster.iter().max_by(|a, b| {
            (a.importance, a.access_count, a.content.len())
                .partial_cmp(&(b.importance, b.access_count, b.content.len()))
                .unwrap_or(std::cmp::Ordering::Equal)
        }) else {
            return Ok(());
        };
        let peak = cluster.iter().map(|m| m.importance).fold(0.0, f64::max);
        if peak > winner.importance {
            self.store.reinforce(&winner.id, peak, None).await?;
        }
        for loser in cluster.iter().filter(|m| m.id != winner.id) {
            self.store.archive_semantic(&loser.id).await?;
            merged.push(loser.id.clone());
        }
        Ok(())
    }

    /// Apply time decay. Permanent memories are exempt; everything else is
    /// archived once decayed and unused, or demoted to transient on the way
    /// down.
    async fn decay(&self, report: &mut MaintenanceReport) -> Result<(), EngramError> {
        let now = Utc::now();
        for memory in self.store.active_memories().await? {
            if memory.priority == MemoryPriority::Permanent {
                continue;
            }
            // Decay runs against the last time the memory was useful, not
            // the last time it was written.
            let reference = memory.last_accessed_at.unwrap_or(memory.updated_at);
            let age_days = ((now - reference).num_seconds() as f64 / 86_400.0).max(0.0);
            let effective = memory.importance * (1.0 - memory.decay_rate).powf(age_days);

            if effective < ARCHIVE_THRESHOLD && memory.access_count < ARCHIVE_ACCESS_FLOOR {
                self.store.archive_semantic(&memory.id).await?;
                report.decay_archived += 1;
            } else if effective < DEMOTE_THRESHOLD && memory.priority != MemoryPriority::Transient
            {
                self.store
                    .update_semantic(
                        &memory.id,
                        SemanticUpdate {
                            priority: Some(MemoryPriority::Transient),
                            expires_at: Some(
                                MemoryPriority::Transient.ttl().map(|ttl| now + ttl),
                            ),
                            ..Default::default()
                        },
                    )
                    .await?;
                report.decay_demoted += 1;
            }
        }
        Ok(())
    }

    /// Rebuild the search indexes from the durable rows. Repairs any drift
    /// from failed index writes or a cold-start vector backend.
    async fn reconcile(&self, report: &mut MaintenanceReport) -> Result<(), EngramError> {
        let active = self.store.active_memories().await?;
        let entries: Vec<(String, String)> = active
            .iter()
            .map(|m| (m.id.clone(), m.index_text()))
            .collect();
        report.reindexed = entries.len();
        self.store.search_router().rebuild(entries).await
    }

    /// Render the digest to disk atomically: write a temp file, back up the
    /// previous digest, then rename into place.
    pub async fn refresh_digest(&self) -> Result<bool, EngramError> {
        let Some(path) = self.config.digest_path.as_deref() else {
            return Ok(false);
        };
        let digest = self.render_digest().await?;

        let path = std::path::Path::new(path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(EngramError::storage)?;
            }
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &digest)
            .await
            .map_err(EngramError::storage)?;
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            let backup = path.with_extension("bak");
            if let Err(e) = tokio::fs::copy(path, &backup).await {
                warn!(error = %e, "failed to back up previous digest");
            }
        }
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(EngramError::storage)?;
        Ok(true)
    }

    async fn render_digest(&self) -> Result<String, EngramError> {
        let mut out = format!(
            "# Memory digest\n\nGenerated {}\n",
            Utc::now().format("%Y-%m-%d %H:%M UTC")
        );
        for kind in MemoryKind::all() {
            let memories = self
                .store
                .list_semantic(Some(kind), false, self.config.digest_per_kind)
                .await?;
            if memories.is_empty() {
                continue;
            }
            out.push_str(&format!("\n## {}\n", kind.as_str()));
            for memory in memories {
                out.push_str(&format!("- {}\n", memory.content));
                if out.chars().count() >= self.config.digest_max_chars {
                    break;
                }
            }
            if out.chars().count() >= self.config.digest_max_chars {
                break;
            }
        }
        if out.chars().count() > self.config.digest_max_chars {
            out = out.chars().take(self.config.digest_max_chars).collect();
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::{LexicalBackend, SearchRouter};
    use async_trait::async_trait;
    use engram_config::ExtractionConfig;
    use engram_core::{CompletionProvider, CompletionRequest, CompletionResponse};
    use engram_storage::Database;

    struct SilentProvider;

    #[async_trait]
    impl CompletionProvider for SilentProvider {
        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, EngramError> {
            Ok(CompletionResponse {
                content: "NONE".to_string(),
                usage: None,
            })
        }
    }

    struct FixedProvider(&'static str);

    #[async_trait]
    impl CompletionProvider for FixedProvider {
        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, EngramError> {
            Ok(CompletionResponse {
                content: self.0.to_string(),
                usage: None,
            })
        }
    }

    async fn manager_with(config: LifecycleConfig) -> (LifecycleManager, Arc<UnifiedStore>) {
        manager_with_provider(config, Arc::new(SilentProvider)).await
    }

    async fn manager_with_provider(
        config: LifecycleConfig,
        provider: Arc<dyn CompletionProvider>,
    ) -> (LifecycleManager, Arc<UnifiedStore>) {
        let db = Database::open_in_memory().await.unwrap();
        let lexical = Arc::new(LexicalBackend::new(db.clone()));
        let router = Arc::new(SearchRouter::lexical_only(lexical));
        let store = Arc::new(UnifiedStore::new(db, router));
        let extractor = Arc::new(MemoryExtractor::new(
            store.clone(),
            provider,
            ExtractionConfig::default(),
        ));
        (
            LifecycleManager::new(store.clone(), extractor, config),
            store,
        )
    }

    fn aged(content: &str, importance: f64, age_days: i64) -> SemanticMemory {
        let mut m = SemanticMemory::new(MemoryKind::Fact, content, importance);
        m.updated_at = Utc::now() - chrono::Duration::days(age_days);
        m.expires_at = None;
        m
    }

    #[tokio::test]
    async fn decayed_unused_memories_are_archived() {
        let (manager, store) = manager_with(LifecycleConfig::default()).await;
        // 0.2 * 0.99^400 is far below the archive threshold.
        let stale = aged("old trivia nobody asked about", 0.2, 400);
        store.save_semantic(&stale).await.unwrap();
        let fresh = aged("current project uses sqlite", 0.8, 1);
        store.save_semantic(&fresh).await.unwrap();

        let report = manager.run().await;
        assert!(report.errors.is_empty(), "{:?}", report.errors);
        assert_eq!(report.decay_archived, 1);

        assert!(store.get_semantic(&stale.id).await.unwrap().unwrap().archived);
        assert!(!store.get_semantic(&fresh.id).await.unwrap().unwrap().archived);
    }

    #[tokio::test]
    async fn fading_memories_are_demoted_to_transient() {
        let (manager, store) = manager_with(LifecycleConfig::default()).await;
        let mut fading = aged("minor note about logging format", 0.28, 0);
        fading.access_count = 5;
        store.save_semantic(&fading).await.unwrap();

        let report = manager.run().await;
        assert_eq!(report.decay_demoted, 1);
        let loaded = store.get_semantic(&fading.id).await.unwrap().unwrap();
        assert_eq!(loaded.priority, MemoryPriority::Transient);
        assert!(loaded.expires_at.is_some());
    }

    #[tokio::test]
    async fn recently_accessed_memories_resist_decay() {
        let (manager, store) = manager_with(LifecycleConfig::default()).await;
        // Written long ago but served into context yesterday; decay must
        // measure from the access, not the write.
        let mut consulted = aged("favourite database is postgres", 0.2, 400);
        consulted.last_accessed_at = Some(Utc::now() - chrono::Duration::days(1));
        store.save_semantic(&consulted).await.unwrap();

        let report = manager.run().await;
        assert_eq!(report.decay_archived, 0);
        assert!(store.get_semantic(&consulted.id).await.unwrap().unwrap().is_active());
    }

    #[tokio::test]
    async fn permanent_memories_never_decay() {
        let (manager, store) = manager_with(LifecycleConfig::default()).await;
        let mut rule = SemanticMemory::new(MemoryKind::Rule, "always run the linter", 0.05);
        rule.updated_at = Utc::now() - chrono::Duration::days(1000);
        store.save_semantic(&rule).await.unwrap();

        let report = manager.run().await;
        assert_eq!(report.decay_archived, 0);
        assert!(store.get_semantic(&rule.id).await.unwrap().unwrap().is_active());
    }

    #[tokio::test]
    async fn exact_duplicates_are_merged_keeping_the_strongest() {
        let (manager, store) = manager_with(LifecycleConfig::default()).await;
        let weak = SemanticMemory::new(MemoryKind::Preference, "prefers dark mode", 0.5);
        let mut strong = SemanticMemory::new(MemoryKind::Preference, "Prefers dark mode", 0.8);
        strong.access_count = 4;
        store.save_semantic(&weak).await.unwrap();
        store.save_semantic(&strong).await.unwrap();

        let report = manager.run().await;
        assert_eq!(report.duplicates_merged, 1);
        assert!(store.get_semantic(&weak.id).await.unwrap().unwrap().archived);
        assert!(store.get_semantic(&strong.id).await.unwrap().unwrap().is_active());
    }

    #[tokio::test]
    async fn near_duplicates_merge_when_provider_agrees() {
        let config = LifecycleConfig {
            dedup_threshold: 0.05,
            ..Default::default()
        };
        let (manager, store) =
            manager_with_provider(config, Arc::new(FixedProvider("MERGE"))).await;
        let a = SemanticMemory::new(MemoryKind::Preference, "user prefers tabs over spaces", 0.7);
        let b = SemanticMemory::new(
            MemoryKind::Preference,
            "user prefers tabs over spaces always",
            0.6,
        );
        store.save_semantic(&a).await.unwrap();
        store.save_semantic(&b).await.unwrap();

        let report = manager.run().await;
        assert_eq!(report.duplicates_merged, 1);
        assert!(store.get_semantic(&a.id).await.unwrap().unwrap().is_active());
        assert!(store.get_semantic(&b.id).await.unwrap().unwrap().archived);
    }

    #[tokio::test]
    async fn near_duplicates_survive_when_provider_says_keep() {
        let config = LifecycleConfig {
            dedup_threshold: 0.05,
            ..Default::default()
        };
        let (manager, store) =
            manager_with_provider(config, Arc::new(FixedProvider("KEEP"))).await;
        let a = SemanticMemory::new(MemoryKind::Fact, "python version is 3.12 on laptop", 0.7);
        let b = SemanticMemory::new(MemoryKind::Fact, "python version is 3.11 on server", 0.7);
        store.save_semantic(&a).await.unwrap();
        store.save_semantic(&b).await.unwrap();

        let report = manager.run().await;
        assert_eq!(report.duplicates_merged, 0);
        assert!(store.get_semantic(&a.id).await.unwrap().unwrap().is_active());
        assert!(store.get_semantic(&b.id).await.unwrap().unwrap().is_active());
    }

    #[tokio::test]
    async fn backfill_marks_turns_extracted() {
        let (manager, store) = manager_with(LifecycleConfig::default()).await;
        turns::insert_turn(store.database(), "s1", "user", "I work at a bakery", None, None)
            .await
            .unwrap();
        turns::insert_turn(store.database(), "s2", "user", "remind me about flour", None, None)
            .await
            .unwrap();

        let report = manager.run().await;
        assert_eq!(report.backfilled_sessions, 2);
        assert!(
            turns::unextracted_turns(store.database(), None, 10)
                .await
                .unwrap()
                .is_empty()
        );
        // Each session got its missing episode.
        assert!(store.session_has_episode("s1").await.unwrap());
        assert!(store.session_has_episode("s2").await.unwrap());
    }

    #[tokio::test]
    async fn backfill_skips_sessions_that_already_have_an_episode() {
        let (manager, store) = manager_with(LifecycleConfig::default()).await;
        let mut existing = crate::types::Episode::new("Earlier work", "Captured at session end");
        existing.session_id = Some("s1".to_string());
        store.save_episode(&existing).await.unwrap();
        turns::insert_turn(store.database(), "s1", "user", "a straggler turn", None, None)
            .await
            .unwrap();

        let report = manager.run().await;
        assert_eq!(report.backfilled_sessions, 1);
        assert_eq!(store.recent_episodes(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn digest_is_written_and_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let digest_path = dir.path().join("digest.md");
        let config = LifecycleConfig {
            digest_path: Some(digest_path.to_string_lossy().into_owned()),
            digest_max_chars: 300,
            ..Default::default()
        };
        let (manager, store) = manager_with(config).await;
        for i in 0..10 {
            let m = SemanticMemory::new(
                MemoryKind::Fact,
                format!("long remembered fact number {i} about the deployment environment"),
                0.9,
            );
            store.save_semantic(&m).await.unwrap();
        }

        let report = manager.run().await;
        assert!(report.digest_written);
        let digest = std::fs::read_to_string(&digest_path).unwrap();
        assert!(digest.starts_with("# Memory digest"));
        assert!(digest.contains("## FACT"));
        assert!(digest.chars().count() <= 300);

        // A second pass backs up the previous digest.
        manager.run().await;
        assert!(digest_path.with_extension("bak").exists());
    }

    #[tokio::test]
    async fn expired_then_purged_in_one_pass_sequence() {
        let (manager, store) = manager_with(LifecycleConfig::default()).await;
        let mut gone = SemanticMemory::new(MemoryKind::Fact, "meeting at noon today", 0.4);
        gone.priority = MemoryPriority::Transient;
        gone.expires_at = Some(Utc::now() - chrono::Duration::days(5));
        store.save_semantic(&gone).await.unwrap();

        let report = manager.run().await;
        assert_eq!(report.expired_archived, 1);
        assert_eq!(report.transient_purged, 1);
        assert!(store.get_semantic(&gone.id).await.unwrap().is_none());
    }
}
