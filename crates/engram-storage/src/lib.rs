// SPDX-FileCopyrightText: 2026 Engram Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! SQLite persistence layer for the Engram memory engine.
//!
//! Provides the async [`Database`] handle (WAL mode, single background
//! writer), embedded refinery migrations, and typed query modules for the
//! infrastructure tables: conversation turns, the extraction retry queue,
//! and the remote-embedding cache.
//!
//! The memory domain tables (memories, episodes, scratchpads, attachments)
//! are queried by `engram-memory`'s unified store on top of this handle.

pub mod database;
pub mod migrations;
pub mod models;
pub mod queries;

pub use database::{map_tr_err, Database};
pub use models::{CachedEmbedding, ConversationTurn, QueueEntry};
pub use queries::queue::{ExtractionJob, ExtractionPayload};
