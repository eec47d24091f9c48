// SPDX-FileCopyrightText: 2026 Engram Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Embedding provider trait for vector embedding generation.

use async_trait::async_trait;

use crate::error::EngramError;
use crate::types::HealthStatus;

/// A backend that converts text into vector representations.
///
/// Embedding providers power the semantic search backends. Vectors from
/// the same provider must have a stable dimensionality.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generates one embedding per input text, in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EngramError>;

    /// Dimensionality of the vectors this provider produces.
    fn dimensions(&self) -> usize;

    /// Identifier of the underlying model (used to key embedding caches).
    fn model_id(&self) -> &str;

    /// Performs a health check and returns the provider's current status.
    async fn health_check(&self) -> Result<HealthStatus, EngramError> {
        Ok(HealthStatus::Healthy)
    }
}
