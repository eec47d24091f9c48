// SPDX-FileCopyrightText: 2026 Engram Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Memory domain types.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Character cap for a user's scratchpad.
pub const SCRATCHPAD_MAX_CHARS: usize = 2000;

/// What kind of knowledge a semantic memory carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryKind {
    /// A stable fact about the user or the world.
    Fact,
    /// A user preference.
    Preference,
    /// An imperative the agent must follow.
    Rule,
    /// A learned technique or how-to.
    Skill,
    /// A recorded failure and its cause.
    Error,
}

impl MemoryKind {
    /// Convert to string for SQLite storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::Fact => "FACT",
            MemoryKind::Preference => "PREFERENCE",
            MemoryKind::Rule => "RULE",
            MemoryKind::Skill => "SKILL",
            MemoryKind::Error => "ERROR",
        }
    }

    /// Parse from SQLite string.
    pub fn from_str_value(s: &str) -> Self {
        match s {
            "PREFERENCE" => MemoryKind::Preference,
            "RULE" => MemoryKind::Rule,
            "SKILL" => MemoryKind::Skill,
            "ERROR" => MemoryKind::Error,
            _ => MemoryKind::Fact,
        }
    }

    pub fn all() -> [MemoryKind; 5] {
        [
            MemoryKind::Fact,
            MemoryKind::Preference,
            MemoryKind::Rule,
            MemoryKind::Skill,
            MemoryKind::Error,
        ]
    }
}

/// Retention class of a semantic memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryPriority {
    /// Session-scoped; purged by the lifecycle pass once expired.
    Transient,
    ShortTerm,
    LongTerm,
    /// Never expires, never decays below retention.
    Permanent,
}

impl MemoryPriority {
    /// Convert to string for SQLite storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryPriority::Transient => "TRANSIENT",
            MemoryPriority::ShortTerm => "SHORT_TERM",
            MemoryPriority::LongTerm => "LONG_TERM",
            MemoryPriority::Permanent => "PERMANENT",
        }
    }

    /// Parse from SQLite string.
    pub fn from_str_value(s: &str) -> Self {
        match s {
            "TRANSIENT" => MemoryPriority::Transient,
            "SHORT_TERM" => MemoryPriority::ShortTerm,
            "PERMANENT" => MemoryPriority::Permanent,
            _ => MemoryPriority::LongTerm,
        }
    }

    /// Default retention window for this class.
    pub fn ttl(&self) -> Option<chrono::Duration> {
        match self {
            MemoryPriority::Transient => Some(chrono::Duration::days(1)),
            MemoryPriority::ShortTerm => Some(chrono::Duration::days(3)),
            MemoryPriority::LongTerm => Some(chrono::Duration::days(30)),
            MemoryPriority::Permanent => None,
        }
    }

    /// Assign a priority from extraction importance and kind.
    ///
    /// Rules are always permanent: an imperative that silently expires is
    /// worse than no rule at all.
    pub fn from_importance(importance: f64, kind: MemoryKind) -> Self {
        if kind == MemoryKind::Rule || importance >= 0.85 {
            MemoryPriority::Permanent
        } else if importance >= 0.6 {
            MemoryPriority::LongTerm
        } else {
            MemoryPriority::ShortTerm
        }
    }
}

/// A single semantic memory: an entity-attribute fact with provenance and
/// lifecycle metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticMemory {
    pub id: String,
    pub kind: MemoryKind,
    pub priority: MemoryPriority,
    /// Entity the fact is about (e.g. a user name).
    pub subject: Option<String>,
    /// Attribute of the entity (e.g. "Python version").
    pub predicate: Option<String>,
    /// The fact as a standalone statement.
    pub content: String,
    /// Where this memory came from (conversation, context_compress, manual).
    pub source: String,
    /// Episode this fact was distilled from, if any.
    pub source_episode_id: Option<String>,
    pub tags: Vec<String>,
    /// Importance score in [0, 1], decayed over time.
    pub importance: f64,
    /// Extraction confidence in [0, 1], raised on reinforcement.
    pub confidence: f64,
    /// Times this memory was included in injected context.
    pub access_count: i64,
    /// Daily decay factor applied by the lifecycle pass.
    pub decay_rate: f64,
    /// Archived memories are invisible to retrieval but never deleted.
    pub archived: bool,
    /// If superseded, the id of the newer memory. Links only point forward.
    pub superseded_by: Option<String>,
    /// Timestamp of the conversation turn this fact was extracted from.
    /// Used to keep supersession causal when extractions complete out of order.
    pub source_turn_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_accessed_at: Option<DateTime<Utc>>,
}

impl SemanticMemory {
    /// Create a memory with fresh id and timestamps. Priority and expiry
    /// are derived from importance unless adjusted afterwards.
    pub fn new(kind: MemoryKind, content: impl Into<String>, importance: f64) -> Self {
        let now = Utc::now();
        let priority = MemoryPriority::from_importance(importance, kind);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            priority,
            subject: None,
            predicate: None,
            content: content.into(),
            source: "conversation".to_string(),
            source_episode_id: None,
            tags: Vec::new(),
            importance,
            confidence: 0.8,
            access_count: 0,
            decay_rate: 0.01,
            archived: false,
            superseded_by: None,
            source_turn_at: None,
            expires_at: priority.ttl().map(|ttl| now + ttl),
            created_at: now,
            updated_at: now,
            last_accessed_at: None,
        }
    }

    /// Active means visible to retrieval: not archived, not superseded.
    pub fn is_active(&self) -> bool {
        !self.archived && self.superseded_by.is_none()
    }

    /// The text the search backends index for this memory.
    pub fn index_text(&self) -> String {
        let mut parts = Vec::with_capacity(4);
        if let Some(subject) = &self.subject {
            parts.push(subject.clone());
        }
        if let Some(predicate) = &self.predicate {
            parts.push(predicate.clone());
        }
        parts.push(self.content.clone());
        if !self.tags.is_empty() {
            parts.push(self.tags.join(" "));
        }
        parts.join(" ")
    }
}

/// Outcome of an episodic task trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpisodeOutcome {
    Success,
    Partial,
    Failure,
    /// Task still in flight when the episode was captured (context
    /// compression mid-session).
    Ongoing,
}

impl EpisodeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EpisodeOutcome::Success => "success",
            EpisodeOutcome::Partial => "partial",
            EpisodeOutcome::Failure => "failure",
            EpisodeOutcome::Ongoing => "ongoing",
        }
    }

    pub fn from_str_value(s: &str) -> Self {
        match s {
            "partial" => EpisodeOutcome::Partial,
            "failure" => EpisodeOutcome::Failure,
            "ongoing" => EpisodeOutcome::Ongoing,
            _ => EpisodeOutcome::Success,
        }
    }
}

/// One step in an episode's action chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionNode {
    /// Short description of the step.
    pub action: String,
    /// Tool invoked, if the step used one.
    #[serde(default)]
    pub tool: Option<String>,
    /// Key parameters of the invocation (command, path, query, url).
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default = "default_true")]
    pub success: bool,
    /// Truncated tool output for successful steps.
    #[serde(default)]
    pub result_summary: Option<String>,
    /// Tool error text for failed steps.
    #[serde(default)]
    pub error_message: Option<String>,
    /// Why this step was taken, when the trace records it.
    #[serde(default)]
    pub decision: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

/// An episodic memory: what was attempted, how, and how it ended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub id: String,
    pub title: String,
    pub summary: String,
    pub goal: Option<String>,
    pub outcome: EpisodeOutcome,
    pub action_nodes: Vec<ActionNode>,
    /// Entities mentioned, used for entity-keyed recall.
    pub entities: Vec<String>,
    pub tools: Vec<String>,
    /// What produced this episode (session_end, context_compress).
    pub source: String,
    pub session_id: Option<String>,
    pub importance: f64,
    pub access_count: i64,
    /// Timestamp of the first turn covered by this episode.
    pub started_at: Option<DateTime<Utc>>,
    /// Timestamp of the last turn covered by this episode.
    pub ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: Option<DateTime<Utc>>,
}

impl Episode {
    pub fn new(title: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            summary: summary.into(),
            goal: None,
            outcome: EpisodeOutcome::Success,
            action_nodes: Vec::new(),
            entities: Vec::new(),
            tools: Vec::new(),
            source: "session_end".to_string(),
            session_id: None,
            importance: 0.5,
            access_count: 0,
            started_at: None,
            ended_at: None,
            created_at: Utc::now(),
            last_accessed_at: None,
        }
    }
}

/// Per-user working memory, a single bounded markdown document.
///
/// The markdown is the stored form; the structured fields are derived
/// from its section headings on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scratchpad {
    pub user_id: String,
    pub content: String,
    pub updated_at: DateTime<Utc>,
    /// Bullets under "## Active projects".
    #[serde(default)]
    pub active_projects: Vec<String>,
    /// Body of "## Current focus".
    #[serde(default)]
    pub current_focus: Option<String>,
    /// Bullets under "## Open questions" (or "## Open threads").
    #[serde(default)]
    pub open_questions: Vec<String>,
    /// Bullets under "## Next steps".
    #[serde(default)]
    pub next_steps: Vec<String>,
}

impl Scratchpad {
    pub fn from_content(
        user_id: impl Into<String>,
        content: impl Into<String>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        let content = content.into();
        let mut pad = Self {
            user_id: user_id.into(),
            content: String::new(),
            updated_at,
            active_projects: Vec::new(),
            current_focus: None,
            open_questions: Vec::new(),
            next_steps: Vec::new(),
        };
        pad.derive_sections(&content);
        pad.content = content;
        pad
    }

    fn derive_sections(&mut self, content: &str) {
        let mut section: Option<&str> = None;
        let mut focus_lines: Vec<&str> = Vec::new();
        for line in content.lines() {
            let trimmed = line.trim();
            if let Some(heading) = trimmed.strip_prefix("## ") {
                section = match heading.trim().to_ascii_lowercase().as_str() {
                    "active projects" => Some("projects"),
                    "current focus" => Some("focus"),
                    "open questions" | "open threads" => Some("questions"),
                    "next steps" => Some("steps"),
                    _ => None,
                };
                continue;
            }
            let bullet = trimmed.strip_prefix("- ").map(str::trim);
            match section {
                Some("projects") => {
                    if let Some(item) = bullet.filter(|s| !s.is_empty()) {
                        self.active_projects.push(item.to_string());
                    }
                }
                Some("questions") => {
                    if let Some(item) = bullet.filter(|s| !s.is_empty()) {
                        self.open_questions.push(item.to_string());
                    }
                }
                Some("steps") => {
                    if let Some(item) = bullet.filter(|s| !s.is_empty()) {
                        self.next_steps.push(item.to_string());
                    }
                }
                Some("focus") => {
                    if !trimmed.is_empty() {
                        focus_lines.push(trimmed);
                    }
                }
                _ => {}
            }
        }
        if !focus_lines.is_empty() {
            self.current_focus = Some(focus_lines.join(" "));
        }
    }
}

/// Media type of an attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Audio,
    Video,
    File,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Image => "image",
            MediaType::Audio => "audio",
            MediaType::Video => "video",
            MediaType::File => "file",
        }
    }

    pub fn from_str_value(s: &str) -> Self {
        match s {
            "image" => MediaType::Image,
            "audio" => MediaType::Audio,
            "video" => MediaType::Video,
            _ => MediaType::File,
        }
    }
}

/// Whether an attachment was received from the user or produced for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentDirection {
    Inbound,
    Outbound,
}

impl AttachmentDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentDirection::Inbound => "inbound",
            AttachmentDirection::Outbound => "outbound",
        }
    }

    pub fn from_str_value(s: &str) -> Self {
        match s {
            "outbound" => AttachmentDirection::Outbound,
            _ => AttachmentDirection::Inbound,
        }
    }
}

/// A media or document record with searchable derived text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub session_id: Option<String>,
    pub filename: Option<String>,
    pub media_type: MediaType,
    /// IANA media type as reported at ingest (e.g. image/png).
    pub mime_type: Option<String>,
    pub size_bytes: Option<i64>,
    /// Where the raw bytes live (path or URL); the store only keeps
    /// derived text.
    pub storage_path: Option<String>,
    pub direction: AttachmentDirection,
    /// Model-generated description (images, video).
    pub description: Option<String>,
    /// Speech transcription (audio, video).
    pub transcription: Option<String>,
    /// Extracted document text (files).
    pub extracted_text: Option<String>,
    pub tags: Vec<String>,
    /// Semantic memories distilled from this attachment.
    pub linked_memory_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Attachment {
    pub fn new(media_type: MediaType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: None,
            filename: None,
            media_type,
            mime_type: None,
            size_bytes: None,
            storage_path: None,
            direction: AttachmentDirection::Inbound,
            description: None,
            transcription: None,
            extracted_text: None,
            tags: Vec::new(),
            linked_memory_ids: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// All text fields concatenated for keyword search.
    pub fn searchable_text(&self) -> String {
        let mut parts = Vec::new();
        if let Some(f) = &self.filename {
            parts.push(f.clone());
        }
        for field in [
            &self.storage_path,
            &self.description,
            &self.transcription,
            &self.extracted_text,
        ] {
            if let Some(text) = field {
                parts.push(text.clone());
            }
        }
        if !self.tags.is_empty() {
            parts.push(self.tags.join(" "));
        }
        parts.join(" ")
    }
}

/// A fact candidate produced by extraction, before it is applied to the store.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractedFact {
    #[serde(default = "default_kind_string")]
    pub kind: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub predicate: Option<String>,
    pub content: String,
    #[serde(default = "default_importance")]
    pub importance: f64,
    /// Retention hint: permanent, 7d, 24h, or session.
    #[serde(default)]
    pub duration: Option<String>,
    /// True when this fact replaces an existing value for its entity.
    #[serde(default)]
    pub is_update: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_kind_string() -> String {
    "FACT".to_string()
}

fn default_importance() -> f64 {
    0.5
}

impl ExtractedFact {
    pub fn kind(&self) -> MemoryKind {
        MemoryKind::from_str_value(&self.kind)
    }

    /// Expiry implied by the duration hint, relative to `now`.
    pub fn expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.duration.as_deref() {
            Some("permanent") => None,
            Some("7d") => Some(now + chrono::Duration::days(7)),
            Some("24h") => Some(now + chrono::Duration::hours(24)),
            Some("session") => Some(now + chrono::Duration::hours(2)),
            _ => MemoryPriority::from_importance(self.importance, self.kind())
                .ttl()
                .map(|ttl| now + ttl),
        }
    }
}

/// Store-wide counters for stats reporting.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryStats {
    pub active_memories: i64,
    pub archived_memories: i64,
    pub episodes: i64,
    pub attachments: i64,
    pub pending_queue: i64,
    pub failed_queue: i64,
    pub cached_embeddings: i64,
}

/// Format a timestamp the way SQLite's strftime defaults do (millisecond
/// precision, trailing Z).
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored timestamp, tolerating missing or malformed values.
pub fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Parse an optional stored timestamp.
pub fn parse_ts_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|v| {
        DateTime::parse_from_rfc3339(&v)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}

/// Convert f32 vector to bytes for SQLite BLOB storage.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    vec.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Convert SQLite BLOB back to f32 vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes(chunk.try_into().unwrap_or([0; 4])))
        .collect()
}

/// Cosine similarity between two vectors.
///
/// For L2-normalized vectors this is the dot product. Mismatched lengths
/// (model changed under the cache) score zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm_a <= f32::EPSILON || norm_b <= f32::EPSILON {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_and_priority_round_trip() {
        for kind in MemoryKind::all() {
            assert_eq!(MemoryKind::from_str_value(kind.as_str()), kind);
        }
        for priority in [
            MemoryPriority::Transient,
            MemoryPriority::ShortTerm,
            MemoryPriority::LongTerm,
            MemoryPriority::Permanent,
        ] {
            assert_eq!(MemoryPriority::from_str_value(priority.as_str()), priority);
        }
        // Unknown strings fall back rather than fail.
        assert_eq!(MemoryKind::from_str_value("???"), MemoryKind::Fact);
        assert_eq!(MemoryPriority::from_str_value("???"), MemoryPriority::LongTerm);
    }

    #[test]
    fn priority_from_importance() {
        assert_eq!(
            MemoryPriority::from_importance(0.9, MemoryKind::Fact),
            MemoryPriority::Permanent
        );
        assert_eq!(
            MemoryPriority::from_importance(0.7, MemoryKind::Fact),
            MemoryPriority::LongTerm
        );
        assert_eq!(
            MemoryPriority::from_importance(0.3, MemoryKind::Fact),
            MemoryPriority::ShortTerm
        );
        // Rules are permanent regardless of importance.
        assert_eq!(
            MemoryPriority::from_importance(0.2, MemoryKind::Rule),
            MemoryPriority::Permanent
        );
    }

    #[test]
    fn new_memory_is_active_with_expiry() {
        let m = SemanticMemory::new(MemoryKind::Fact, "user lives in Berlin", 0.7);
        assert!(m.is_active());
        assert_eq!(m.priority, MemoryPriority::LongTerm);
        assert!(m.expires_at.is_some());

        let permanent = SemanticMemory::new(MemoryKind::Rule, "never force-push", 0.5);
        assert!(permanent.expires_at.is_none());
    }

    #[test]
    fn index_text_includes_entity_and_tags() {
        let mut m = SemanticMemory::new(MemoryKind::Fact, "3.12", 0.7);
        m.subject = Some("user".to_string());
        m.predicate = Some("python version".to_string());
        m.tags = vec!["python".to_string()];
        let text = m.index_text();
        assert!(text.contains("user"));
        assert!(text.contains("python version"));
        assert!(text.contains("3.12"));
    }

    #[test]
    fn extracted_fact_duration_hints() {
        let now = Utc::now();
        let fact: ExtractedFact = serde_json::from_str(
            r#"{"kind":"PREFERENCE","content":"prefers dark mode","importance":0.7,"duration":"permanent"}"#,
        )
        .unwrap();
        assert_eq!(fact.expires_at(now), None);

        let fact: ExtractedFact =
            serde_json::from_str(r#"{"content":"meeting at 3pm","duration":"24h"}"#).unwrap();
        let expires = fact.expires_at(now).unwrap();
        assert_eq!((expires - now).num_hours(), 24);

        // No hint falls back to the priority TTL.
        let fact: ExtractedFact =
            serde_json::from_str(r#"{"content":"likes rust","importance":0.7}"#).unwrap();
        let expires = fact.expires_at(now).unwrap();
        assert_eq!((expires - now).num_days(), 30);
    }

    #[test]
    fn attachment_searchable_text() {
        let mut a = Attachment::new(MediaType::Image);
        a.filename = Some("diagram.png".to_string());
        a.description = Some("architecture diagram of the retrieval engine".to_string());
        a.tags = vec!["architecture".to_string()];
        let text = a.searchable_text();
        assert!(text.contains("diagram.png"));
        assert!(text.contains("retrieval engine"));
        assert!(text.contains("architecture"));
    }

    #[test]
    fn scratchpad_sections_are_derived_from_markdown() {
        let content = "## Active projects\n- engram migration\n- docs rewrite\n\n\
                       ## Current focus\nShipping the v2 retrieval path.\n\n\
                       ## Open questions\n- which embedding model?\n\n\
                       ## Next steps\n- benchmark packing\n";
        let pad = Scratchpad::from_content("u1", content, Utc::now());
        assert_eq!(pad.active_projects, vec!["engram migration", "docs rewrite"]);
        assert_eq!(
            pad.current_focus.as_deref(),
            Some("Shipping the v2 retrieval path.")
        );
        assert_eq!(pad.open_questions, vec!["which embedding model?"]);
        assert_eq!(pad.next_steps, vec!["benchmark packing"]);

        // "Open threads" is the older heading for the same section.
        let pad = Scratchpad::from_content("u1", "## Open threads\n- pending PR\n", Utc::now());
        assert_eq!(pad.open_questions, vec!["pending PR"]);

        // Freeform notes with no headings derive nothing.
        let pad = Scratchpad::from_content("u1", "just some notes", Utc::now());
        assert!(pad.active_projects.is_empty());
        assert!(pad.current_focus.is_none());
    }

    #[test]
    fn episode_outcome_round_trip() {
        for outcome in [
            EpisodeOutcome::Success,
            EpisodeOutcome::Partial,
            EpisodeOutcome::Failure,
            EpisodeOutcome::Ongoing,
        ] {
            assert_eq!(EpisodeOutcome::from_str_value(outcome.as_str()), outcome);
        }
    }

    #[test]
    fn action_node_optional_fields_default() {
        let node: ActionNode =
            serde_json::from_str(r#"{"action":"ran tests","tool":"bash"}"#).unwrap();
        assert!(node.success);
        assert!(node.result_summary.is_none());
        assert!(node.error_message.is_none());
        assert!(node.decision.is_none());
        assert!(node.timestamp.is_none());
    }

    #[test]
    fn vec_to_blob_roundtrip() {
        let original = vec![0.1_f32, 0.2, 0.3, -0.5, 1.0];
        let blob = vec_to_blob(&original);
        assert_eq!(blob.len(), 20);
        let recovered = blob_to_vec(&blob);
        for (a, b) in original.iter().zip(recovered.iter()) {
            assert!((a - b).abs() < f32::EPSILON);
        }
    }

    #[test]
    fn cosine_similarity_cases() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < f32::EPSILON);
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 0.001);
        // Length mismatch scores zero instead of panicking.
        assert_eq!(cosine_similarity(&a, &[1.0, 0.0, 0.0]), 0.0);
    }

    #[test]
    fn timestamps_round_trip_through_storage_format() {
        let now = Utc::now();
        let parsed = parse_ts(&format_ts(now));
        assert!((now - parsed).num_milliseconds().abs() < 2);
        assert_eq!(parse_ts_opt(None), None);
        assert_eq!(parse_ts_opt(Some("garbage".to_string())), None);
    }
}
