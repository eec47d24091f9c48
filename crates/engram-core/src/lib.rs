// SPDX-FileCopyrightText: 2026 Engram Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core library for the Engram memory engine.
//!
//! This crate provides the foundational trait definitions, error types, and
//! common types used throughout the Engram workspace. The engine consumes
//! external LLM and embedding capabilities exclusively through the traits
//! defined here.

pub mod error;
pub mod traits;
pub mod types;

// Re-export key items at crate root for ergonomic imports.
pub use error::EngramError;
pub use types::{
    ChatMessage, CompletionRequest, CompletionResponse, HealthStatus, Role, SessionId, TokenUsage,
};

// Re-export provider traits at crate root.
pub use traits::{CompletionProvider, EmbeddingProvider};
