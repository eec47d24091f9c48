// SPDX-FileCopyrightText: 2026 Engram Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Completion provider trait for LLM integrations.

use async_trait::async_trait;

use crate::error::EngramError;
use crate::types::{CompletionRequest, CompletionResponse, HealthStatus};

/// A language-model completion backend.
///
/// The memory engine uses completions for fact extraction, episode
/// summarization, scratchpad rewriting, and deduplication decisions.
/// Callers are expected to wrap each call in a timeout.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Sends a completion request and returns the full response.
    async fn complete(&self, request: CompletionRequest)
        -> Result<CompletionResponse, EngramError>;

    /// Performs a health check and returns the provider's current status.
    async fn health_check(&self) -> Result<HealthStatus, EngramError> {
        Ok(HealthStatus::Healthy)
    }
}
