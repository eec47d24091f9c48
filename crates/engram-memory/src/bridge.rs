// SPDX-FileCopyrightText: 2026 Engram Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Pre-compression capture.
//!
//! When the host agent is about to compress its context window, anything not
//! yet extracted is at risk of being summarized away. The bridge makes the
//! high-signal content durable before that happens: a synchronous regex scan
//! saves obvious preferences and rules immediately, the remaining turns are
//! enqueued for full extraction, and an episode records the arc so far. The
//! call returns only once the queue entry is durable.

use std::sync::{Arc, LazyLock};

use engram_core::EngramError;
use engram_config::ExtractionConfig;
use engram_storage::models::ConversationTurn;
use engram_storage::queries::queue::{self, ExtractionJob, ExtractionPayload};
use regex::Regex;
use tracing::{debug, info};

use crate::extractor::MemoryExtractor;
use crate::store::UnifiedStore;
use crate::types::{MemoryKind, MemoryPriority, SemanticMemory};

/// Shortest user turn worth queueing for full extraction.
const MIN_TURN_CHARS: usize = 20;
/// Upper bound on turns carried into one queued extraction.
const MAX_QUEUED_TURNS: usize = 10;
/// Captured statements are clipped to this length.
const CAPTURE_CHARS: usize = 200;

static PREFERENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(i prefer|i like|i'd rather|i always|i never|i usually|i use)\b")
        .unwrap_or_else(|_| unreachable!("preference pattern is static"))
});

static RULE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(always|never|don't|do not|must(?: not)?)\b")
        .unwrap_or_else(|_| unreachable!("rule pattern is static"))
});

static PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:~|/)[A-Za-z0-9_.][\w./-]{3,}")
        .unwrap_or_else(|_| unreachable!("path pattern is static"))
});

/// What a compression capture saved and deferred.
#[derive(Debug, Default, Clone, Copy)]
pub struct CaptureReport {
    pub direct_memories: usize,
    pub queued_jobs: usize,
    pub episode_recorded: bool,
}

pub struct ContextBridge {
    store: Arc<UnifiedStore>,
    extractor: Arc<MemoryExtractor>,
    config: ExtractionConfig,
}

impl ContextBridge {
    pub fn new(
        store: Arc<UnifiedStore>,
        extractor: Arc<MemoryExtractor>,
        config: ExtractionConfig,
    ) -> Self {
        Self {
            store,
            extractor,
            config,
        }
    }

    /// Capture memory from turns about to be compressed away.
    pub async fn on_context_compressing(
        &self,
        session_id: &str,
        turns: &[ConversationTurn],
    ) -> Result<CaptureReport, EngramError> {
        let mut report = CaptureReport::default();
        if turns.is_empty() {
            return Ok(report);
        }

        report.direct_memories = self.quick_scan(turns).await?;

        let queued: Vec<ConversationTurn> = turns
            .iter()
            .filter(|t| t.role == "user" && t.content.chars().count() >= MIN_TURN_CHARS)
            .take(MAX_QUEUED_TURNS)
            .cloned()
            .collect();
        if !queued.is_empty() {
            let payload = ExtractionPayload {
                job: ExtractionJob::Facts,
                session_id: Some(session_id.to_string()),
                user_id: None,
                turns: queued,
            };
            queue::enqueue(self.store.database(), &payload, self.config.max_retries).await?;
            report.queued_jobs = 1;
        }

        let episode = self
            .extractor
            .generate_episode_durable(session_id, "context_compress", turns)
            .await?;
        report.episode_recorded = episode.is_some();

        info!(
            session = session_id,
            direct = report.direct_memories,
            queued = report.queued_jobs,
            "captured context before compression"
        );
        Ok(report)
    }

    /// Synchronous heuristic pass over user turns. No model call, so it
    /// cannot fail for provider reasons and always completes before the
    /// compression proceeds.
    async fn quick_scan(&self, turns: &[ConversationTurn]) -> Result<usize, EngramError> {
        let mut saved = 0;
        let mut seen: Vec<String> = Vec::new();

        for turn in turns.iter().filter(|t| t.role == "user") {
            let text = turn.content.trim();
            if text.is_empty() {
                continue;
            }

            let capture = if RULE_RE.is_match(text) {
                Some((MemoryKind::Rule, 0.75, clip(text)))
            } else if PREFERENCE_RE.is_match(text) {
                Some((MemoryKind::Preference, 0.6, clip(text)))
            } else {
                None
            };

            if let Some((kind, importance, content)) = capture {
                let key = content.to_lowercase();
                if seen.contains(&key) {
                    continue;
                }
                seen.push(key);
                if self.save_capture(kind, importance, content, turn).await? {
                    saved += 1;
                }
            }

            for path in PATH_RE.find_iter(text).take(3) {
                let content = format!("works with {}", path.as_str());
                let key = content.to_lowercase();
                if seen.contains(&key) {
                    continue;
                }
                seen.push(key);
                if self
                    .save_capture(MemoryKind::Fact, 0.4, content, turn)
                    .await?
                {
                    saved += 1;
                }
            }
        }
        Ok(saved)
    }

    async fn save_capture(
        &self,
        kind: MemoryKind,
        importance: f64,
        content: String,
        turn: &ConversationTurn,
    ) -> Result<bool, EngramError> {
        // The same statement captured in an earlier compression is not
        // saved twice.
        let existing = self
            .store
            .list_semantic(Some(kind), false, 1000)
            .await?
            .into_iter()
            .any(|m| m.content.eq_ignore_ascii_case(&content));
        if existing {
            debug!(content = %content, "skipping already-captured statement");
            return Ok(false);
        }

        let mut memory = SemanticMemory::new(kind, content, importance);
        memory.priority = if kind == MemoryKind::Rule {
            MemoryPriority::Permanent
        } else {
            MemoryPriority::LongTerm
        };
        memory.expires_at = memory.priority.ttl().map(|ttl| memory.created_at + ttl);
        memory.source = "context_compress".to_string();
        memory.source_turn_at = Some(crate::types::parse_ts(&turn.created_at));
        self.store.save_semantic(&memory).await?;
        Ok(true)
    }
}

fn clip(text: &str) -> String {
    text.chars().take(CAPTURE_CHARS).collect()
}
