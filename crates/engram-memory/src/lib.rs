// SPDX-FileCopyrightText: 2026 Engram Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Long-term memory for AI agents: extraction, storage, retrieval and
//! lifecycle over a single SQLite database.
//!
//! The [`MemoryEngine`] facade is the intended entry point. It records
//! conversation turns, extracts semantic memories and episodes at session
//! boundaries, serves a bounded injection-context block before model calls,
//! and runs background maintenance (dedup, decay, expiry, index
//! reconciliation, digest refresh).
//!
//! Search is pluggable: SQLite FTS5 lexical search always works; a local
//! ONNX embedding backend or a remote embedding API can be layered on top,
//! with silent lexical fallback whenever they cannot serve.

pub mod bridge;
pub mod engine;
pub mod extractor;
pub mod lifecycle;
pub mod retrieval;
pub mod search;
pub mod store;
pub mod types;

pub use bridge::{CaptureReport, ContextBridge};
pub use engine::MemoryEngine;
pub use extractor::MemoryExtractor;
pub use lifecycle::{LifecycleManager, MaintenanceReport};
pub use retrieval::RetrievalEngine;
pub use search::{BackendKind, SearchBackend, SearchHit, SearchRouter};
pub use store::{SemanticUpdate, UnifiedStore};
pub use types::{
    Attachment, Episode, EpisodeOutcome, MediaType, MemoryKind, MemoryPriority, MemoryStats,
    Scratchpad, SemanticMemory,
};
