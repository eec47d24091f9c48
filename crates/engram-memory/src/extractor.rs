// SPDX-FileCopyrightText: 2026 Engram Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! LLM-driven extraction of durable memories from conversation turns.
//!
//! Every extraction path is durable: a transient provider failure enqueues
//! the work instead of dropping it, and the retry queue drains during the
//! next maintenance pass. Malformed model output is tolerated and yields
//! nothing rather than an error.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use chrono::Utc;
use engram_core::{CompletionProvider, CompletionRequest, EngramError};
use engram_config::ExtractionConfig;
use engram_storage::models::ConversationTurn;
use engram_storage::queries::queue::{self, ExtractionJob, ExtractionPayload};
use regex::Regex;
use tracing::{debug, info, warn};

use crate::store::UnifiedStore;
use crate::types::{
    parse_ts, ActionNode, Episode, EpisodeOutcome, ExtractedFact, SemanticMemory,
    SCRATCHPAD_MAX_CHARS,
};

/// Characters of a single turn included in an extraction prompt.
const TURN_CONTENT_CAP: usize = 2000;
/// Most entities kept per episode.
const MAX_ENTITIES: usize = 10;

const FACT_PROMPT: &str = "\
You extract durable memories from a conversation between a user and an AI assistant.

Return a JSON array. Each element:
{\"kind\": \"FACT|PREFERENCE|RULE|SKILL|ERROR\", \"subject\": \"entity or null\", \
\"predicate\": \"attribute or null\", \"content\": \"the fact as a standalone statement\", \
\"importance\": 0.0-1.0, \"duration\": \"permanent|7d|24h|session\", \
\"is_update\": true if this replaces a previously known value, \"tags\": [\"...\"]}

Only extract information worth remembering across sessions: stable facts about \
the user, preferences, standing instructions, learned techniques, and notable \
failures. Skip small talk and one-off task details. If nothing qualifies, \
return NONE.

Conversation:
{conversation}";

const EPISODE_PROMPT: &str = "\
Summarize this working session as a single JSON object:
{\"title\": \"short imperative title\", \"summary\": \"2-3 sentence account of what \
was attempted and how it ended\", \"goal\": \"what the user wanted, or null\", \
\"outcome\": \"success|partial|failure\", \"entities\": [\"systems, files, projects \
mentioned\"], \"importance\": 0.0-1.0}

Conversation:
{conversation}";

const SCRATCHPAD_PROMPT: &str = "\
You maintain a user's working-memory scratchpad: a short markdown document with \
sections \"## Active projects\", \"## Current focus\", \"## Open questions\", and \
\"## Next steps\". Rewrite it to reflect the conversation below, dropping \
finished items and keeping it under 2000 characters. Return only the document.

Current scratchpad:
{scratchpad}

Conversation:
{conversation}";

static ENTITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    // Capitalized identifiers, dotted names and unix-style paths.
    Regex::new(r"(?:[A-Z][A-Za-z0-9_-]{2,}|[a-zA-Z0-9_-]+\.[a-z]{2,4}\b|/[\w./-]{3,})")
        .unwrap_or_else(|_| unreachable!("entity pattern is static"))
});

pub struct MemoryExtractor {
    store: Arc<UnifiedStore>,
    provider: Arc<dyn CompletionProvider>,
    config: ExtractionConfig,
}

/// Outcome of a queue drain.
#[derive(Debug, Default, Clone, Copy)]
pub struct QueueDrainReport {
    pub processed: usize,
    pub failed: usize,
}

impl MemoryExtractor {
    pub fn new(
        store: Arc<UnifiedStore>,
        provider: Arc<dyn CompletionProvider>,
        config: ExtractionConfig,
    ) -> Self {
        Self {
            store,
            provider,
            config,
        }
    }

    pub(crate) async fn complete(&self, prompt: String) -> Result<String, EngramError> {
        let mut request = CompletionRequest::single(prompt);
        request.model = self.config.model.clone();
        let duration = Duration::from_secs(self.config.timeout_secs);
        match tokio::time::timeout(duration, self.provider.complete(request)).await {
            Ok(Ok(response)) => Ok(response.content),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(EngramError::Timeout { duration }),
        }
    }

    // ---- fact extraction ----

    /// Extract facts from turns and apply them to the store. On transient
    /// provider failure the work is enqueued and 0 is returned; the caller
    /// never loses the turns.
    pub async fn extract_facts_durable(
        &self,
        session_id: Option<&str>,
        turns: &[ConversationTurn],
    ) -> Result<usize, EngramError> {
        if turns.is_empty() {
            return Ok(0);
        }
        match self.extract_and_apply_facts(turns).await {
            Ok(applied) => Ok(applied),
            Err(e) if e.is_transient() => {
                warn!(error = %e, turns = turns.len(), "fact extraction failed, queueing for retry");
                let payload = ExtractionPayload {
                    job: ExtractionJob::Facts,
                    session_id: session_id.map(str::to_string),
                    user_id: None,
                    turns: turns.to_vec(),
                };
                queue::enqueue(self.store.database(), &payload, self.config.max_retries).await?;
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    async fn extract_and_apply_facts(
        &self,
        turns: &[ConversationTurn],
    ) -> Result<usize, EngramError> {
        let prompt = FACT_PROMPT.replace("{conversation}", &render_conversation(turns));
        let response = self.complete(prompt).await?;
        let facts = parse_fact_response(&response);
        if facts.is_empty() {
            debug!("extraction produced no facts");
            return Ok(0);
        }
        // Facts inherit the timestamp of the newest turn they came from, so
        // later extractions of older turns cannot clobber newer knowledge.
        let source_turn_at = turns
            .iter()
            .map(|t| parse_ts(&t.created_at))
            .max()
            .unwrap_or_else(Utc::now);
        let mut applied = 0;
        for fact in facts {
            if self.apply_fact(&fact, source_turn_at).await? {
                applied += 1;
            }
        }
        info!(applied, "extraction pass complete");
        Ok(applied)
    }

    /// Apply one extracted fact: reinforce an identical active memory,
    /// supersede a stale value for the same entity, or insert fresh.
    /// Returns false when the fact was dropped as causally stale.
    async fn apply_fact(
        &self,
        fact: &ExtractedFact,
        source_turn_at: chrono::DateTime<Utc>,
    ) -> Result<bool, EngramError> {
        let content = fact.content.trim();
        if content.is_empty() {
            return Ok(false);
        }

        let existing = match (&fact.subject, &fact.predicate) {
            (Some(subject), Some(predicate)) => {
                self.store.find_active_by_entity(subject, predicate).await?
            }
            _ => None,
        };

        if let Some(existing) = existing {
            if existing.content.trim().eq_ignore_ascii_case(content) {
                self.store
                    .reinforce(&existing.id, fact.importance, Some(source_turn_at))
                    .await?;
                return Ok(true);
            }
            // Supersession must be causal: a fact extracted from older
            // turns never replaces one learned from newer turns.
            let existing_seen_at = existing.source_turn_at.unwrap_or(existing.updated_at);
            if source_turn_at <= existing_seen_at {
                debug!(id = %existing.id, "dropping stale extraction for already-updated entity");
                return Ok(false);
            }
            let replacement = self.build_memory(fact, source_turn_at);
            self.store.supersede(&existing.id, &replacement).await?;
            return Ok(true);
        }

        let memory = self.build_memory(fact, source_turn_at);
        self.store.save_semantic(&memory).await?;
        Ok(true)
    }

    fn build_memory(
        &self,
        fact: &ExtractedFact,
        source_turn_at: chrono::DateTime<Utc>,
    ) -> SemanticMemory {
        let mut memory = SemanticMemory::new(fact.kind(), fact.content.trim(), fact.importance);
        memory.subject = fact.subject.clone();
        memory.predicate = fact.predicate.clone();
        memory.tags = fact.tags.clone();
        memory.source_turn_at = Some(source_turn_at);
        memory.expires_at = fact.expires_at(memory.created_at);
        memory
    }

    // ---- episodes ----

    /// Build and store an episode for the session. Transient provider
    /// failures enqueue the work; unusable model output falls back to a
    /// mechanical episode so the session always leaves a trace.
    pub async fn generate_episode_durable(
        &self,
        session_id: &str,
        source: &str,
        turns: &[ConversationTurn],
    ) -> Result<Option<Episode>, EngramError> {
        if turns.is_empty() {
            return Ok(None);
        }
        match self.generate_episode(session_id, source, turns).await {
            Ok(episode) => Ok(Some(episode)),
            Err(e) if e.is_transient() => {
                warn!(error = %e, session = session_id, "episode generation failed, queueing for retry");
                let payload = ExtractionPayload {
                    job: ExtractionJob::Episode,
                    session_id: Some(session_id.to_string()),
                    user_id: None,
                    turns: turns.to_vec(),
                };
                queue::enqueue(self.store.database(), &payload, self.config.max_retries).await?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn generate_episode(
        &self,
        session_id: &str,
        source: &str,
        turns: &[ConversationTurn],
    ) -> Result<Episode, EngramError> {
        let prompt = EPISODE_PROMPT.replace("{conversation}", &render_conversation(turns));
        let response = self.complete(prompt).await?;

        let (action_nodes, tools) = action_nodes_from_turns(turns);
        let mut episode = match parse_episode_response(&response) {
            Some(parsed) => parsed,
            None => {
                warn!("episode response unusable, building mechanical fallback");
                fallback_episode(turns)
            }
        };
        if episode.entities.is_empty() {
            episode.entities = extract_entities(&render_conversation(turns));
        }
        episode.action_nodes = action_nodes;
        episode.tools = tools;
        episode.session_id = Some(session_id.to_string());
        episode.source = source.to_string();
        episode.started_at = turns.first().map(|t| parse_ts(&t.created_at));
        episode.ended_at = turns.last().map(|t| parse_ts(&t.created_at));
        if source == "context_compress" {
            // The session is still running; its outcome is not known yet.
            episode.outcome = EpisodeOutcome::Ongoing;
            episode.ended_at = None;
        }

        self.store.save_episode(&episode).await?;
        Ok(episode)
    }

    // ---- scratchpad ----

    /// Rewrite the user's scratchpad from recent turns. Transient failures
    /// enqueue a retry; an empty rewrite falls back to a dated note appended
    /// to the existing pad.
    pub async fn update_scratchpad_durable(
        &self,
        user_id: &str,
        session_id: Option<&str>,
        turns: &[ConversationTurn],
    ) -> Result<(), EngramError> {
        if turns.is_empty() {
            return Ok(());
        }
        match self.update_scratchpad(user_id, turns).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_transient() => {
                warn!(error = %e, user = user_id, "scratchpad update failed, queueing for retry");
                let payload = ExtractionPayload {
                    job: ExtractionJob::Scratchpad,
                    session_id: session_id.map(str::to_string),
                    user_id: Some(user_id.to_string()),
                    turns: turns.to_vec(),
                };
                queue::enqueue(self.store.database(), &payload, self.config.max_retries).await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn update_scratchpad(
        &self,
        user_id: &str,
        turns: &[ConversationTurn],
    ) -> Result<(), EngramError> {
        let current = self
            .store
            .get_scratchpad(user_id)
            .await?
            .map(|pad| pad.content)
            .unwrap_or_default();

        let prompt = SCRATCHPAD_PROMPT
            .replace("{scratchpad}", if current.is_empty() { "(empty)" } else { &current })
            .replace("{conversation}", &render_conversation(turns));
        let response = self.complete(prompt).await?;
        let rewritten = strip_code_fences(&response);

        let content = if rewritten.trim().is_empty() {
            fallback_scratchpad_note(&current, turns)
        } else {
            rewritten.trim().to_string()
        };
        self.store.put_scratchpad(user_id, &content).await
    }

    // ---- retry queue ----

    /// Drain up to one batch of queued extraction work.
    pub async fn process_queue(&self) -> Result<QueueDrainReport, EngramError> {
        let entries =
            queue::claim_batch(self.store.database(), self.config.queue_batch_size).await?;
        let mut report = QueueDrainReport::default();

        for entry in entries {
            let payload: ExtractionPayload = match serde_json::from_str(&entry.payload) {
                Ok(p) => p,
                Err(e) => {
                    // A payload that cannot parse will never succeed; let the
                    // attempt counter retire it.
                    queue::fail(
                        self.store.database(),
                        entry.id,
                        &format!("payload parse error: {e}"),
                    )
                    .await?;
                    report.failed += 1;
                    continue;
                }
            };

            let result = match payload.job {
                ExtractionJob::Facts => self
                    .extract_and_apply_facts(&payload.turns)
                    .await
                    .map(|_| ()),
                ExtractionJob::Episode => {
                    let session_id = payload.session_id.as_deref().unwrap_or("unknown");
                    self.generate_episode(session_id, "session_end", &payload.turns)
                        .await
                        .map(|_| ())
                }
                ExtractionJob::Scratchpad => {
                    let user_id = payload.user_id.as_deref().unwrap_or("default");
                    self.update_scratchpad(user_id, &payload.turns).await
                }
            };

            match result {
                Ok(()) => {
                    queue::ack(self.store.database(), entry.id).await?;
                    report.processed += 1;
                }
                Err(e) => {
                    warn!(id = entry.id, error = %e, "queued extraction attempt failed");
                    queue::fail(self.store.database(), entry.id, &e.to_string()).await?;
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }
}

/// Render turns as a plain transcript, capping each turn's length.
fn render_conversation(turns: &[ConversationTurn]) -> String {
    let mut out = String::new();
    for turn in turns {
        let content: String = turn.content.chars().take(TURN_CONTENT_CAP).collect();
        out.push_str(&turn.role);
        out.push_str(": ");
        out.push_str(&content);
        out.push('\n');
    }
    out
}

/// Remove markdown code fences the model may wrap its output in.
fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    // Skip the language tag line, drop the closing fence.
    let body = rest.split_once('\n').map(|(_, b)| b).unwrap_or(rest);
    body.trim_end_matches('`').trim().to_string()
}

/// Parse the fact-extraction response. Tolerant: fences are stripped, the
/// array is located by brackets, and anything unusable yields an empty list.
fn parse_fact_response(response: &str) -> Vec<ExtractedFact> {
    let cleaned = strip_code_fences(response);
    if cleaned.trim().eq_ignore_ascii_case("none") || cleaned.trim().is_empty() {
        return Vec::new();
    }
    let Some(start) = cleaned.find('[') else {
        warn!("fact response contained no JSON array");
        return Vec::new();
    };
    let Some(end) = cleaned.rfind(']') else {
        warn!("fact response contained an unterminated JSON array");
        return Vec::new();
    };
    match serde_json::from_str::<Vec<ExtractedFact>>(&cleaned[start..=end]) {
        Ok(facts) => facts,
        Err(e) => {
            warn!(error = %e, "fact response failed to parse");
            Vec::new()
        }
    }
}

#[derive(serde::Deserialize)]
struct EpisodeResponse {
    title: String,
    summary: String,
    #[serde(default)]
    goal: Option<String>,
    #[serde(default)]
    outcome: Option<String>,
    #[serde(default)]
    entities: Vec<String>,
    #[serde(default)]
    importance: Option<f64>,
}

fn parse_episode_response(response: &str) -> Option<Episode> {
    let cleaned = strip_code_fences(response);
    let start = cleaned.find('{')?;
    let end = cleaned.rfind('}')?;
    let parsed: EpisodeResponse = serde_json::from_str(&cleaned[start..=end]).ok()?;
    let mut episode = Episode::new(parsed.title, parsed.summary);
    episode.goal = parsed.goal;
    episode.outcome = parsed
        .outcome
        .as_deref()
        .map(EpisodeOutcome::from_str_value)
        .unwrap_or(EpisodeOutcome::Success);
    episode.entities = parsed.entities.into_iter().take(MAX_ENTITIES).collect();
    episode.importance = parsed.importance.unwrap_or(0.5).clamp(0.0, 1.0);
    Some(episode)
}

/// Mechanical episode when the model's summary is unusable: title from the
/// first user turn, outcome from tool errors.
fn fallback_episode(turns: &[ConversationTurn]) -> Episode {
    let first_user = turns
        .iter()
        .find(|t| t.role == "user")
        .map(|t| t.content.as_str())
        .unwrap_or("Working session");
    let title: String = first_user.chars().take(80).collect();
    let had_errors = turns.iter().any(|t| {
        t.tool_results
            .as_deref()
            .is_some_and(|r| r.contains("\"is_error\":true") || r.contains("\"is_error\": true"))
    });
    let mut episode = Episode::new(
        title,
        format!("Session of {} turns; no model summary available.", turns.len()),
    );
    episode.outcome = if had_errors {
        EpisodeOutcome::Partial
    } else {
        EpisodeOutcome::Success
    };
    episode.importance = 0.3;
    episode
}

/// Build the episode's action chain mechanically from logged tool activity.
/// Params are filtered to the identifying keys so secrets in arguments never
/// land in a memory.
fn action_nodes_from_turns(turns: &[ConversationTurn]) -> (Vec<ActionNode>, Vec<String>) {
    const KEPT_PARAMS: [&str; 5] = ["command", "path", "query", "url", "filename"];
    /// Characters of tool output kept as a step's result summary.
    const RESULT_SUMMARY_CAP: usize = 200;
    let mut nodes = Vec::new();
    let mut tools: Vec<String> = Vec::new();

    for turn in turns {
        let Some(raw_calls) = turn.tool_calls.as_deref() else {
            continue;
        };
        let Ok(calls) = serde_json::from_str::<Vec<serde_json::Value>>(raw_calls) else {
            continue;
        };
        let results: Vec<serde_json::Value> = turn
            .tool_results
            .as_deref()
            .and_then(|r| serde_json::from_str(r).ok())
            .unwrap_or_default();

        for (i, call) in calls.iter().enumerate() {
            let tool = call
                .get("name")
                .or_else(|| call.get("tool"))
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string();
            let args = call
                .get("arguments")
                .or_else(|| call.get("params"))
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            let mut params = serde_json::Map::new();
            if let Some(obj) = args.as_object() {
                for key in KEPT_PARAMS {
                    if let Some(value) = obj.get(key) {
                        params.insert(key.to_string(), value.clone());
                    }
                }
            }
            let success = results
                .get(i)
                .and_then(|r| r.get("is_error"))
                .and_then(|v| v.as_bool())
                .map(|is_error| !is_error)
                .unwrap_or(true);
            let output = results
                .get(i)
                .and_then(|r| r.get("output"))
                .and_then(|v| v.as_str())
                .map(|o| o.chars().take(RESULT_SUMMARY_CAP).collect::<String>())
                .filter(|o| !o.is_empty());
            let (result_summary, error_message) = if success {
                (output, None)
            } else {
                (None, output)
            };

            if !tools.contains(&tool) {
                tools.push(tool.clone());
            }
            nodes.push(ActionNode {
                action: format!("called {tool}"),
                tool: Some(tool),
                params: serde_json::Value::Object(params),
                success,
                result_summary,
                error_message,
                decision: None,
                timestamp: Some(parse_ts(&turn.created_at)),
            });
        }
    }
    (nodes, tools)
}

/// Named things worth keying episode recall on.
fn extract_entities(text: &str) -> Vec<String> {
    let mut entities: Vec<String> = Vec::new();
    for m in ENTITY_RE.find_iter(text) {
        let candidate = m.as_str().to_string();
        if !entities.contains(&candidate) {
            entities.push(candidate);
        }
        if entities.len() >= MAX_ENTITIES {
            break;
        }
    }
    entities
}

/// Append a dated note rather than lose the session when the model returned
/// nothing usable.
fn fallback_scratchpad_note(current: &str, turns: &[ConversationTurn]) -> String {
    let first_user = turns
        .iter()
        .find(|t| t.role == "user")
        .map(|t| t.content.as_str())
        .unwrap_or("session activity");
    let note: String = first_user.chars().take(120).collect();
    let dated = format!("- {}: {}", Utc::now().format("%Y-%m-%d"), note.trim());
    let combined = if current.is_empty() {
        format!("## Notes\n{dated}")
    } else {
        format!("{current}\n{dated}")
    };
    combined.chars().take(SCRATCHPAD_MAX_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::{LexicalBackend, SearchRouter};
    use async_trait::async_trait;
    use engram_core::CompletionResponse;
    use engram_storage::Database;
    use std::sync::Mutex;

    /// Provider returning canned responses in order; errors once exhausted.
    struct MockProvider {
        responses: Mutex<Vec<String>>,
    }

    impl MockProvider {
        fn new(responses: Vec<&str>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into_iter().map(str::to_string).rev().collect()),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CompletionProvider for MockProvider {
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
                None => Err(EngramError::provider("mock provider exhausted")),
            }
        }
    }

    async fn extractor_with(provider: Arc<MockProvider>) -> (MemoryExtractor, Arc<UnifiedStore>) {
        let db = Database::open_in_memory().await.unwrap();
        let lexical = Arc::new(LexicalBackend::new(db.clone()));
        let router = Arc::new(SearchRouter::lexical_only(lexical));
        let store = Arc::new(UnifiedStore::new(db, router));
        let extractor =
            MemoryExtractor::new(store.clone(), provider, ExtractionConfig::default());
        (extractor, store)
    }

    fn turn(role: &str, content: &str) -> ConversationTurn {
        ConversationTurn {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: "s1".to_string(),
            turn_index: 0,
            role: role.to_string(),
            content: content.to_string(),
            tool_calls: None,
            tool_results: None,
            extracted: false,
            created_at: crate::types::format_ts(Utc::now()),
        }
    }

    #[test]
    fn fact_parsing_tolerates_fences_and_noise() {
        let fenced = "```json\n[{\"content\": \"likes rust\"}]\n```";
        assert_eq!(parse_fact_response(fenced).len(), 1);

        let chatty = "Here are the facts:\n[{\"content\": \"likes rust\"}]\nHope that helps!";
        assert_eq!(parse_fact_response(chatty).len(), 1);

        assert!(parse_fact_response("NONE").is_empty());
        assert!(parse_fact_response("no array here").is_empty());
        assert!(parse_fact_response("[{\"content\": broken").is_empty());
    }

    #[test]
    fn action_nodes_filter_params_and_track_errors() {
        let mut t = turn("assistant", "running the command");
        t.tool_calls = Some(
            r#"[{"name": "bash", "arguments": {"command": "ls /tmp", "api_key": "secret"}}]"#
                .to_string(),
        );
        t.tool_results = Some(r#"[{"is_error": true, "output": "denied"}]"#.to_string());

        let (nodes, tools) = action_nodes_from_turns(&[t]);
        assert_eq!(nodes.len(), 1);
        assert_eq!(tools, vec!["bash"]);
        assert!(!nodes[0].success);
        assert_eq!(nodes[0].params["command"], "ls /tmp");
        assert!(nodes[0].params.get("api_key").is_none());
        // Failed steps carry the output as the error, not the summary.
        assert_eq!(nodes[0].error_message.as_deref(), Some("denied"));
        assert!(nodes[0].result_summary.is_none());
        assert!(nodes[0].timestamp.is_some());
    }

    #[test]
    fn successful_action_nodes_keep_a_truncated_result() {
        let mut t = turn("assistant", "listing the directory");
        t.tool_calls = Some(r#"[{"name": "bash", "arguments": {"command": "ls"}}]"#.to_string());
        let long_output = "x".repeat(500);
        t.tool_results = Some(format!(r#"[{{"is_error": false, "output": "{long_output}"}}]"#));

        let (nodes, _) = action_nodes_from_turns(&[t]);
        assert!(nodes[0].success);
        assert!(nodes[0].error_message.is_none());
        assert_eq!(nodes[0].result_summary.as_ref().unwrap().len(), 200);
    }

    #[test]
    fn entities_come_from_names_and_paths() {
        let entities =
            extract_entities("Deployed Grafana and edited /etc/nginx/nginx.conf for api.example.com");
        assert!(entities.iter().any(|e| e == "Grafana"));
        assert!(entities.iter().any(|e| e.starts_with("/etc/nginx")));
    }

    #[tokio::test]
    async fn extracted_facts_are_stored() {
        let provider = MockProvider::new(vec![
            r#"[{"kind": "PREFERENCE", "subject": "user", "predicate": "editor", "content": "uses neovim", "importance": 0.7}]"#,
        ]);
        let (extractor, store) = extractor_with(provider).await;

        let applied = extractor
            .extract_facts_durable(Some("s1"), &[turn("user", "I always edit in neovim")])
            .await
            .unwrap();
        assert_eq!(applied, 1);

        let found = store
            .find_active_by_entity("user", "editor")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.content, "uses neovim");
        assert_eq!(found.kind, crate::types::MemoryKind::Preference);
        assert!(found.source_turn_at.is_some());
    }

    #[tokio::test]
    async fn repeated_fact_reinforces_instead_of_duplicating() {
        let response =
            r#"[{"subject": "user", "predicate": "city", "content": "lives in Berlin", "importance": 0.6}]"#;
        let provider = MockProvider::new(vec![response, response]);
        let (extractor, store) = extractor_with(provider).await;

        let turns = [turn("user", "I live in Berlin")];
        extractor.extract_facts_durable(None, &turns).await.unwrap();
        extractor.extract_facts_durable(None, &turns).await.unwrap();

        let all = store
            .list_semantic(None, true, 100)
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        assert!((all[0].confidence - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn changed_fact_supersedes_old_value() {
        let provider = MockProvider::new(vec![
            r#"[{"subject": "user", "predicate": "city", "content": "lives in Berlin"}]"#,
            r#"[{"subject": "user", "predicate": "city", "content": "lives in Lisbon", "is_update": true}]"#,
        ]);
        let (extractor, store) = extractor_with(provider).await;

        extractor
            .extract_facts_durable(None, &[turn("user", "I live in Berlin")])
            .await
            .unwrap();
        // The second extraction comes from a strictly newer turn.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        extractor
            .extract_facts_durable(None, &[turn("user", "I moved to Lisbon")])
            .await
            .unwrap();

        let active = store
            .find_active_by_entity("user", "city")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active.content, "lives in Lisbon");

        let all = store.list_semantic(None, true, 100).await.unwrap();
        assert_eq!(all.len(), 2);
        let old = all.iter().find(|m| m.content == "lives in Berlin").unwrap();
        assert_eq!(old.superseded_by.as_deref(), Some(active.id.as_str()));
    }

    #[tokio::test]
    async fn stale_extraction_never_overwrites_newer_value() {
        let provider = MockProvider::new(vec![
            r#"[{"subject": "user", "predicate": "python version", "content": "3.12"}]"#,
            r#"[{"subject": "user", "predicate": "python version", "content": "3.10", "is_update": true}]"#,
        ]);
        let (extractor, store) = extractor_with(provider).await;

        extractor
            .extract_facts_durable(None, &[turn("user", "I upgraded to python 3.12")])
            .await
            .unwrap();

        // A delayed extraction of an older turn arrives after the upgrade
        // was already recorded.
        let mut old_turn = turn("user", "still on python 3.10 here");
        old_turn.created_at =
            crate::types::format_ts(Utc::now() - chrono::Duration::hours(1));
        let applied = extractor
            .extract_facts_durable(None, &[old_turn])
            .await
            .unwrap();
        assert_eq!(applied, 0);

        let active = store
            .find_active_by_entity("user", "python version")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active.content, "3.12");
        // The stale value never landed as a row at all.
        assert_eq!(store.list_semantic(None, true, 100).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn provider_failure_enqueues_for_retry() {
        let (extractor, store) = extractor_with(MockProvider::failing()).await;

        let applied = extractor
            .extract_facts_durable(Some("s1"), &[turn("user", "remember this")])
            .await
            .unwrap();
        assert_eq!(applied, 0);
        assert_eq!(
            queue::count_by_status(store.database(), "pending").await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn queued_work_is_retried_and_acked() {
        // First call fails and queues; the retry succeeds and drains.
        let (extractor, store) = extractor_with(MockProvider::failing()).await;
        extractor
            .extract_facts_durable(Some("s1"), &[turn("user", "I prefer tabs")])
            .await
            .unwrap();

        let provider = MockProvider::new(vec![
            r#"[{"subject": "user", "predicate": "indentation", "content": "prefers tabs"}]"#,
        ]);
        let retrying = MemoryExtractor::new(store.clone(), provider, ExtractionConfig::default());
        let report = retrying.process_queue().await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(
            queue::count_by_status(store.database(), "pending").await.unwrap(),
            0
        );
        assert!(store
            .find_active_by_entity("user", "indentation")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn episode_generation_parses_model_summary() {
        let provider = MockProvider::new(vec![
            r#"{"title": "Fix flaky deploy", "summary": "Diagnosed and fixed the deploy job.", "outcome": "success", "entities": ["deploy-job"], "importance": 0.8}"#,
        ]);
        let (extractor, store) = extractor_with(provider).await;

        let mut t = turn("assistant", "I'll rerun the deploy");
        t.tool_calls = Some(r#"[{"name": "bash", "arguments": {"command": "make deploy"}}]"#.into());
        t.tool_results = Some(r#"[{"is_error": false}]"#.into());

        let episode = extractor
            .generate_episode_durable("s1", "session_end", &[t])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(episode.title, "Fix flaky deploy");
        assert_eq!(episode.tools, vec!["bash"]);
        assert_eq!(episode.action_nodes.len(), 1);
        // Episode span comes from the turn timestamps.
        assert!(episode.started_at.is_some());
        assert!(episode.ended_at.is_some());

        let stored = store.get_episode(&episode.id).await.unwrap().unwrap();
        assert_eq!(stored.session_id.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn mid_session_episodes_stay_ongoing() {
        let provider = MockProvider::new(vec![
            r#"{"title": "Cache migration", "summary": "Started moving the cache.", "outcome": "success", "entities": [], "importance": 0.5}"#,
        ]);
        let (extractor, _store) = extractor_with(provider).await;

        let episode = extractor
            .generate_episode_durable("s1", "context_compress", &[turn("user", "let's keep going")])
            .await
            .unwrap()
            .unwrap();
        // The model's outcome is overridden while the session is in flight.
        assert_eq!(episode.outcome, EpisodeOutcome::Ongoing);
        assert!(episode.ended_at.is_none());
    }

    #[tokio::test]
    async fn unusable_episode_summary_falls_back_mechanically() {
        let provider = MockProvider::new(vec!["I could not summarize that."]);
        let (extractor, _store) = extractor_with(provider).await;

        let episode = extractor
            .generate_episode_durable("s1", "session_end", &[turn("user", "help me debug the cache")])
            .await
            .unwrap()
            .unwrap();
        assert!(episode.title.contains("help me debug"));
        assert!((episode.importance - 0.3).abs() < 1e-9);
    }

    #[tokio::test]
    async fn scratchpad_rewrite_is_stored_and_bounded() {
        let provider = MockProvider::new(vec![
            "## Current focus\nMigrating the cache layer\n\n## Open threads\n- benchmark redis",
        ]);
        let (extractor, store) = extractor_with(provider).await;

        extractor
            .update_scratchpad_durable("alice", Some("s1"), &[turn("user", "let's migrate the cache")])
            .await
            .unwrap();
        let pad = store.get_scratchpad("alice").await.unwrap().unwrap();
        assert!(pad.content.contains("Migrating the cache layer"));
    }

    #[tokio::test]
    async fn empty_scratchpad_rewrite_appends_dated_note() {
        let provider = MockProvider::new(vec![""]);
        let (extractor, store) = extractor_with(provider).await;
        store.put_scratchpad("alice", "## Notes\n- old note").await.unwrap();

        extractor
            .update_scratchpad_durable("alice", None, &[turn("user", "investigating the flaky test")])
            .await
            .unwrap();
        let pad = store.get_scratchpad("alice").await.unwrap().unwrap();
        assert!(pad.content.contains("- old note"));
        assert!(pad.content.contains("investigating the flaky test"));
    }
}
