// SPDX-FileCopyrightText: 2026 Engram Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Row models for the infrastructure tables (turns, queue, embedding cache).

use serde::{Deserialize, Serialize};

/// One turn of the append-only conversation log.
///
/// `turn_index` is strictly increasing per session and assigned by the
/// store at insert time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub id: String,
    pub session_id: String,
    pub turn_index: i64,
    pub role: String,
    pub content: String,
    /// JSON array of tool invocations, if any.
    pub tool_calls: Option<String>,
    /// JSON array of tool results, if any.
    pub tool_results: Option<String>,
    /// Set once the extraction pipeline has consumed this turn.
    pub extracted: bool,
    pub created_at: String,
}

/// One entry of the extraction retry queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: i64,
    pub session_id: Option<String>,
    /// Serialized [`super::queries::queue::ExtractionPayload`].
    pub payload: String,
    pub status: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    pub locked_until: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// A cached remote embedding, keyed by sha256(model:text).
#[derive(Debug, Clone)]
pub struct CachedEmbedding {
    pub content_hash: String,
    pub model: String,
    pub dims: i64,
    pub embedding: Vec<u8>,
}
