// SPDX-FileCopyrightText: 2026 Engram Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Context retrieval: recall candidates from every memory surface, rerank
//! them, and pack the best into a bounded markdown block for injection.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use engram_config::RetrievalConfig;
use engram_core::EngramError;
use engram_storage::models::ConversationTurn;
use tracing::{debug, warn};

use crate::store::UnifiedStore;
use crate::types::MemoryKind;

/// Rerank weights. Relevance dominates but never alone decides.
const W_RELEVANCE: f64 = 0.4;
const W_RECENCY: f64 = 0.25;
const W_IMPORTANCE: f64 = 0.2;
const W_FREQUENCY: f64 = 0.15;

/// Relevance priors per recall path, applied where the path has no
/// per-candidate score of its own.
const PRIOR_SEMANTIC: f64 = 0.8;
const PRIOR_EPISODE_ENTITY: f64 = 0.6;
const PRIOR_EPISODE_RECENT: f64 = 0.5;
const PRIOR_RECENT: f64 = 0.5;
const PRIOR_ATTACHMENT: f64 = 0.85;

const SEMANTIC_LIMIT: usize = 10;
const EPISODE_LIMIT: usize = 3;
const ATTACHMENT_LIMIT: usize = 3;
/// Characters of each recent turn contributing to the recall query.
const QUERY_TURN_CHARS: usize = 100;
/// Don't bother truncating a candidate into fewer tokens than this.
const MIN_TRUNCATED_TOKENS: usize = 20;

const MEDIA_KEYWORDS: [&str; 12] = [
    "image", "photo", "screenshot", "picture", "diagram", "audio", "recording", "video",
    "file", "document", "pdf", "attachment",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CandidateKind {
    Semantic,
    Episode,
    Attachment,
}

struct Candidate {
    id: String,
    kind: CandidateKind,
    line: String,
    score: f64,
}

pub struct RetrievalEngine {
    store: Arc<UnifiedStore>,
    config: RetrievalConfig,
}

impl RetrievalEngine {
    pub fn new(store: Arc<UnifiedStore>, config: RetrievalConfig) -> Self {
        Self { store, config }
    }

    /// Build with per-call persona and token-budget overrides; `None`
    /// keeps the configured value.
    pub async fn build_injection_with(
        &self,
        user_id: Option<&str>,
        turns: &[ConversationTurn],
        persona: Option<&str>,
        max_tokens: Option<usize>,
    ) -> Result<Option<String>, EngramError> {
        if persona.is_none() && max_tokens.is_none() {
            return self.build_injection(user_id, turns).await;
        }
        let mut config = self.config.clone();
        if let Some(persona) = persona {
            config.persona = Some(persona.to_string());
        }
        if let Some(max_tokens) = max_tokens {
            config.max_tokens = max_tokens;
        }
        let scoped = Self {
            store: Arc::clone(&self.store),
            config,
        };
        scoped.build_injection(user_id, turns).await
    }

    /// Build the memory block to inject before the next model call.
    /// Returns `None` when nothing relevant is known.
    pub async fn build_injection(
        &self,
        user_id: Option<&str>,
        turns: &[ConversationTurn],
    ) -> Result<Option<String>, EngramError> {
        let query = recall_query(turns);
        let mut candidates: Vec<Candidate> = Vec::new();

        if !query.is_empty() {
            self.collect_semantic(&query, &mut candidates).await;
            self.collect_episodes(&query, &mut candidates).await;
            self.collect_attachments(&query, &mut candidates).await;
        }
        self.collect_recent(&mut candidates).await;

        // Multiple paths can surface the same record; keep the best score.
        let mut best: HashMap<String, Candidate> = HashMap::new();
        for candidate in candidates {
            match best.get(&candidate.id) {
                Some(existing) if existing.score >= candidate.score => {}
                _ => {
                    best.insert(candidate.id.clone(), candidate);
                }
            }
        }
        let mut ranked: Vec<Candidate> = best.into_values().collect();
        ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        let scratchpad = match user_id {
            Some(user_id) => self
                .store
                .get_scratchpad(user_id)
                .await?
                .map(|pad| pad.content)
                .filter(|c| !c.trim().is_empty()),
            None => None,
        };

        if ranked.is_empty() && scratchpad.is_none() {
            return Ok(None);
        }

        let (block, included) = pack(&ranked, scratchpad.as_deref(), self.config.max_tokens);
        if block.is_empty() {
            return Ok(None);
        }

        // Only memories that actually made it into context count as accessed.
        let memory_ids: Vec<String> = included
            .iter()
            .filter(|c| c.kind == CandidateKind::Semantic)
            .map(|c| c.id.clone())
            .collect();
        let episode_ids: Vec<String> = included
            .iter()
            .filter(|c| c.kind == CandidateKind::Episode)
            .map(|c| c.id.clone())
            .collect();
        if let Err(e) = self.store.bump_access(&memory_ids).await {
            warn!(error = %e, "failed to record memory access");
        }
        if let Err(e) = self.store.bump_episode_access(&episode_ids).await {
            warn!(error = %e, "failed to record episode access");
        }

        metrics::counter!("engram_injections_total").increment(1);
        debug!(
            memories = memory_ids.len(),
            episodes = episode_ids.len(),
            chars = block.len(),
            "built injection context"
        );
        Ok(Some(block))
    }

    async fn collect_semantic(&self, query: &str, out: &mut Vec<Candidate>) {
        let hits = match self.store.search_semantic(query, None, SEMANTIC_LIMIT).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!(error = %e, "semantic recall failed");
                return;
            }
        };
        let now = Utc::now();
        for (memory, backend_score) in hits {
            let relevance = PRIOR_SEMANTIC * f64::from(backend_score);
            let age_days = (now - memory.updated_at).num_seconds() as f64 / 86_400.0;
            let score = self.rerank(
                relevance,
                age_days,
                memory.importance,
                memory.access_count,
                Some(memory.kind),
            );
            out.push(Candidate {
                id: memory.id.clone(),
                kind: CandidateKind::Semantic,
                line: format!("- [{}] {}", memory.kind.as_str(), memory.content),
                score,
            });
        }
    }

    async fn collect_episodes(&self, query: &str, out: &mut Vec<Candidate>) {
        let now = Utc::now();
        let mut push = |episode: &crate::types::Episode, prior: f64, out: &mut Vec<Candidate>| {
            let age_days = (now - episode.created_at).num_seconds() as f64 / 86_400.0;
            let score = self.rerank(prior, age_days, episode.importance, episode.access_count, None);
            out.push(Candidate {
                id: episode.id.clone(),
                kind: CandidateKind::Episode,
                line: format!(
                    "- [EPISODE:{}] {}: {}",
                    episode.outcome.as_str(),
                    episode.title,
                    episode.summary
                ),
                score,
            });
        };

        // Entity-keyed recall on the longest query terms.
        let mut terms: Vec<&str> = query
            .split_whitespace()
            .filter(|t| t.len() > 3)
            .collect();
        terms.sort_by_key(|t| std::cmp::Reverse(t.len()));
        for term in terms.into_iter().take(3) {
            match self.store.episodes_by_entity(term, EPISODE_LIMIT).await {
                Ok(episodes) => {
                    for episode in &episodes {
                        push(episode, PRIOR_EPISODE_ENTITY, out);
                    }
                }
                Err(e) => warn!(error = %e, "entity episode recall failed"),
            }
        }

        match self.store.recent_episodes(EPISODE_LIMIT).await {
            Ok(episodes) => {
                for episode in &episodes {
                    push(episode, PRIOR_EPISODE_RECENT, out);
                }
            }
            Err(e) => warn!(error = %e, "recent episode recall failed"),
        }
    }

    /// High-importance memories touched recently, regardless of the query.
    async fn collect_recent(&self, out: &mut Vec<Candidate>) {
        let memories = match self.store.active_memories().await {
            Ok(memories) => memories,
            Err(e) => {
                warn!(error = %e, "recency recall failed");
                return;
            }
        };
        let now = Utc::now();
        let window = chrono::Duration::days(self.config.recent_days);
        for memory in memories {
            if now - memory.updated_at > window
                || memory.importance < self.config.min_recent_importance
            {
                continue;
            }
            let age_days = (now - memory.updated_at).num_seconds() as f64 / 86_400.0;
            let score = self.rerank(
                PRIOR_RECENT,
                age_days,
                memory.importance,
                memory.access_count,
                Some(memory.kind),
            );
            out.push(Candidate {
                id: memory.id.clone(),
                kind: CandidateKind::Semantic,
                line: format!("- [{}] {}", memory.kind.as_str(), memory.content),
                score,
            });
        }
    }

    /// Attachment recall only runs when the query sounds like it is about
    /// media or documents.
    async fn collect_attachments(&self, query: &str, out: &mut Vec<Candidate>) {
        let lowered = query.to_lowercase();
        if !MEDIA_KEYWORDS.iter().any(|k| lowered.contains(k)) {
            return;
        }
        // Recall per significant term; conversational filler like "show me
        // that" would otherwise empty an all-terms match.
        let mut attachments: Vec<crate::types::Attachment> = Vec::new();
        for term in lowered
            .split_whitespace()
            .filter(|t| t.len() > 3 && !MEDIA_KEYWORDS.contains(t))
            .take(4)
        {
            match self.store.search_attachments(term, ATTACHMENT_LIMIT).await {
                Ok(hits) => {
                    for hit in hits {
                        if !attachments.iter().any(|a| a.id == hit.id) {
                            attachments.push(hit);
                        }
                    }
                }
                Err(e) => warn!(error = %e, "attachment recall failed"),
            }
        }
        attachments.truncate(ATTACHMENT_LIMIT);
        let now = Utc::now();
        for attachment in attachments {
            let age_days = (now - attachment.created_at).num_seconds() as f64 / 86_400.0;
            let score = self.rerank(PRIOR_ATTACHMENT, age_days, 0.5, 0, None);
            let summary = attachment
                .description
                .as_deref()
                .or(attachment.transcription.as_deref())
                .or(attachment.extracted_text.as_deref())
                .unwrap_or("no derived text");
            let summary: String = summary.chars().take(200).collect();
            let mut line = format!(
                "- [{}] {}: {}",
                attachment.media_type.as_str().to_uppercase(),
                attachment.filename.as_deref().unwrap_or("unnamed"),
                summary
            );
            // The agent can re-open the raw bytes when it knows where
            // they live.
            if let Some(path) = attachment.storage_path.as_deref() {
                line.push_str(&format!(" (at {path})"));
            }
            out.push(Candidate {
                id: attachment.id.clone(),
                kind: CandidateKind::Attachment,
                line,
                score,
            });
        }
    }

    fn rerank(
        &self,
        relevance: f64,
        age_days: f64,
        importance: f64,
        access_count: i64,
        kind: Option<MemoryKind>,
    ) -> f64 {
        let recency = (-0.1 * age_days.max(0.0)).exp();
        let frequency = ((1.0 + access_count as f64).ln() / 5.0).min(1.0);
        let mut score = W_RELEVANCE * relevance
            + W_RECENCY * recency
            + W_IMPORTANCE * importance
            + W_FREQUENCY * frequency;
        if self.config.persona.as_deref() == Some("technical")
            && matches!(kind, Some(MemoryKind::Skill) | Some(MemoryKind::Error))
        {
            score *= 1.2;
        }
        score
    }
}

/// The recall query: the tail of the conversation, newest-last, with each
/// turn capped so one long message cannot drown the rest.
fn recall_query(turns: &[ConversationTurn]) -> String {
    let tail = turns.iter().rev().take(3).collect::<Vec<_>>();
    tail.iter()
        .rev()
        .map(|t| t.content.chars().take(QUERY_TURN_CHARS).collect::<String>())
        .collect::<Vec<_>>()
        .join(" ")
        .trim()
        .to_string()
}

fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Greedily pack ranked candidates into the token budget. The first
/// candidate that no longer fits is truncated into the remaining budget;
/// everything after it is dropped.
fn pack<'a>(
    ranked: &'a [Candidate],
    scratchpad: Option<&str>,
    max_tokens: usize,
) -> (String, Vec<&'a Candidate>) {
    let mut sections = String::new();
    let mut remaining = max_tokens;
    let mut included: Vec<&Candidate> = Vec::new();

    if let Some(pad) = scratchpad {
        let section = format!("## Working notes\n{pad}\n");
        let cost = estimate_tokens(&section);
        if cost <= remaining {
            sections.push_str(&section);
            remaining -= cost;
        }
    }

    let mut lines = String::new();
    for candidate in ranked {
        let cost = estimate_tokens(&candidate.line) + 1;
        if cost <= remaining {
            lines.push_str(&candidate.line);
            lines.push('\n');
            remaining -= cost;
            included.push(candidate);
            continue;
        }
        // The top-ranked candidate is always represented, however small
        // the remaining budget; later ones only when a useful amount is
        // left.
        if included.is_empty() || remaining >= MIN_TRUNCATED_TOKENS {
            let truncated: String = candidate.line.chars().take(remaining.max(1) * 4).collect();
            lines.push_str(&truncated);
            lines.push('\n');
            included.push(candidate);
        }
        break;
    }

    if !lines.is_empty() {
        if !sections.is_empty() {
            sections.push('\n');
        }
        sections.push_str("## Relevant memories\n");
        sections.push_str(&lines);
    }
    (sections.trim_end().to_string(), included)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::{LexicalBackend, SearchRouter};
    use crate::types::{Episode, SemanticMemory};
    use engram_storage::Database;

    async fn engine_with(config: RetrievalConfig) -> (RetrievalEngine, Arc<UnifiedStore>) {
        let db = Database::open_in_memory().await.unwrap();
        let lexical = Arc::new(LexicalBackend::new(db.clone()));
        let router = Arc::new(SearchRouter::lexical_only(lexical));
        let store = Arc::new(UnifiedStore::new(db, router));
        (RetrievalEngine::new(store.clone(), config), store)
    }

    fn turn(content: &str) -> ConversationTurn {
        ConversationTurn {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: "s1".to_string(),
            turn_index: 0,
            role: "user".to_string(),
            content: content.to_string(),
            tool_calls: None,
            tool_results: None,
            extracted: false,
            created_at: crate::types::format_ts(Utc::now()),
        }
    }

    #[tokio::test]
    async fn empty_store_yields_no_injection() {
        let (engine, _store) = engine_with(RetrievalConfig::default()).await;
        let block = engine
            .build_injection(None, &[turn("anything at all")])
            .await
            .unwrap();
        assert!(block.is_none());
    }

    #[tokio::test]
    async fn relevant_memory_is_injected_and_access_counted() {
        let (engine, store) = engine_with(RetrievalConfig::default()).await;
        let mut m = SemanticMemory::new(MemoryKind::Preference, "prefers tabs over spaces", 0.7);
        m.subject = Some("user".to_string());
        m.predicate = Some("indentation".to_string());
        store.save_semantic(&m).await.unwrap();

        let block = engine
            .build_injection(None, &[turn("how should I format indentation, tabs?")])
            .await
            .unwrap()
            .unwrap();
        assert!(block.contains("prefers tabs over spaces"));
        assert!(block.contains("[PREFERENCE]"));

        let loaded = store.get_semantic(&m.id).await.unwrap().unwrap();
        assert_eq!(loaded.access_count, 1);
    }

    #[tokio::test]
    async fn recent_important_memory_surfaces_without_query_match() {
        let (engine, store) = engine_with(RetrievalConfig::default()).await;
        let m = SemanticMemory::new(MemoryKind::Rule, "never push directly to main", 0.9);
        store.save_semantic(&m).await.unwrap();

        // Query shares no terms with the memory.
        let block = engine
            .build_injection(None, &[turn("zzzz qqqq")])
            .await
            .unwrap()
            .unwrap();
        assert!(block.contains("never push directly to main"));
    }

    #[tokio::test]
    async fn episodes_surface_for_matching_entities() {
        let (engine, store) = engine_with(RetrievalConfig::default()).await;
        let mut e = Episode::new("Fix grafana alerts", "Silenced the flapping grafana alerts");
        e.entities = vec!["grafana".to_string()];
        store.save_episode(&e).await.unwrap();

        let block = engine
            .build_injection(None, &[turn("the grafana dashboard looks odd again")])
            .await
            .unwrap()
            .unwrap();
        assert!(block.contains("Fix grafana alerts"));
        assert!(block.contains("[EPISODE:success]"));

        let loaded = store.get_episode(&e.id).await.unwrap().unwrap();
        assert_eq!(loaded.access_count, 1);
    }

    #[tokio::test]
    async fn attachments_only_surface_for_media_queries() {
        let (engine, store) = engine_with(RetrievalConfig::default()).await;
        let mut a = crate::types::Attachment::new(crate::types::MediaType::Image);
        a.filename = Some("topology.png".to_string());
        a.storage_path = Some("/blobs/topology.png".to_string());
        a.description = Some("network topology sketch".to_string());
        store.save_attachment(&a).await.unwrap();

        let with_keyword = engine
            .build_injection(None, &[turn("show me that topology diagram")])
            .await
            .unwrap()
            .unwrap();
        assert!(with_keyword.contains("topology.png"));
        assert!(with_keyword.contains("(at /blobs/topology.png)"));

        let without_keyword = engine
            .build_injection(None, &[turn("tell me about the topology")])
            .await
            .unwrap();
        // No media keyword, no attachment recall; and nothing else matches.
        assert!(without_keyword.is_none() || !without_keyword.unwrap().contains("topology.png"));
    }

    #[tokio::test]
    async fn scratchpad_leads_the_injection() {
        let (engine, store) = engine_with(RetrievalConfig::default()).await;
        store
            .put_scratchpad("alice", "## Current focus\nMigrating the cache")
            .await
            .unwrap();

        let block = engine
            .build_injection(Some("alice"), &[turn("where were we?")])
            .await
            .unwrap()
            .unwrap();
        assert!(block.starts_with("## Working notes"));
        assert!(block.contains("Migrating the cache"));
    }

    #[tokio::test]
    async fn packing_respects_the_token_budget() {
        let config = RetrievalConfig {
            max_tokens: 60,
            ..Default::default()
        };
        let (engine, store) = engine_with(config).await;
        for i in 0..20 {
            let m = SemanticMemory::new(
                MemoryKind::Fact,
                format!("the build farm node fleet machine number {i} runs debian"),
                0.9,
            );
            store.save_semantic(&m).await.unwrap();
        }

        let block = engine
            .build_injection(None, &[turn("what do the fleet machines run")])
            .await
            .unwrap()
            .unwrap();
        assert!(estimate_tokens(&block) <= 60 + 10);
        assert!(block.len() < 400);
    }

    #[tokio::test]
    async fn tiny_budget_still_represents_top_candidate() {
        let config = RetrievalConfig {
            max_tokens: 10,
            ..Default::default()
        };
        let (engine, store) = engine_with(config).await;
        let m = SemanticMemory::new(
            MemoryKind::Fact,
            "the staging cluster only accepts deploys signed with the release key",
            0.95,
        );
        store.save_semantic(&m).await.unwrap();

        let block = engine
            .build_injection(None, &[turn("how do deploys to the staging cluster work")])
            .await
            .unwrap()
            .unwrap();
        // Too small for the full line, but the best candidate is truncated
        // in rather than dropped.
        assert!(block.contains("[FACT]"));

        let loaded = store.get_semantic(&m.id).await.unwrap().unwrap();
        assert_eq!(loaded.access_count, 1);
    }

    #[tokio::test]
    async fn persona_boosts_skill_memories() {
        let config = RetrievalConfig {
            persona: Some("technical".to_string()),
            max_tokens: 40,
            ..Default::default()
        };
        let (engine, store) = engine_with(config).await;

        let fact = SemanticMemory::new(MemoryKind::Fact, "cargo features note plain", 0.7);
        let skill =
            SemanticMemory::new(MemoryKind::Skill, "cargo features note skilled", 0.7);
        store.save_semantic(&fact).await.unwrap();
        store.save_semantic(&skill).await.unwrap();

        let block = engine
            .build_injection(None, &[turn("cargo features note")])
            .await
            .unwrap()
            .unwrap();
        // Budget fits roughly one bullet; the boosted skill wins the slot.
        assert!(block.contains("[SKILL]"));
    }

    #[tokio::test]
    async fn per_call_overrides_shadow_the_config() {
        let (engine, store) = engine_with(RetrievalConfig::default()).await;
        let fact = SemanticMemory::new(MemoryKind::Fact, "cargo features note plain", 0.7);
        let skill = SemanticMemory::new(MemoryKind::Skill, "cargo features note skilled", 0.7);
        store.save_semantic(&fact).await.unwrap();
        store.save_semantic(&skill).await.unwrap();

        // Persona and budget passed per call, not from config: the
        // boosted skill takes the single slot the tiny budget leaves.
        let block = engine
            .build_injection_with(
                None,
                &[turn("cargo features note")],
                Some("technical"),
                Some(40),
            )
            .await
            .unwrap()
            .unwrap();
        assert!(block.contains("[SKILL]"));
        assert!(estimate_tokens(&block) <= 50);

        // Without overrides the default budget fits both bullets.
        let block = engine
            .build_injection(None, &[turn("cargo features note")])
            .await
            .unwrap()
            .unwrap();
        assert!(block.contains("[FACT]") && block.contains("[SKILL]"));
    }

    #[test]
    fn recall_query_uses_last_three_turns_capped() {
        let turns: Vec<ConversationTurn> = ["one", "two", "three", "four"]
            .iter()
            .map(|c| turn(c))
            .collect();
        let q = recall_query(&turns);
        assert!(!q.contains("one"));
        assert!(q.contains("two") && q.contains("four"));

        let long = "y".repeat(500);
        let q = recall_query(&[turn(&long)]);
        assert_eq!(q.len(), QUERY_TURN_CHARS);
    }
}
