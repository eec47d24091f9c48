// SPDX-FileCopyrightText: 2026 Engram Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for the Engram memory engine.

use thiserror::Error;

/// The primary error type used across all Engram crates.
#[derive(Debug, Error)]
pub enum EngramError {
    /// Configuration errors (invalid TOML, missing required fields, type mismatches).
    #[error("configuration error: {0}")]
    Config(String),

    /// Storage errors (database connection, query failure, migration failure).
    ///
    /// Storage errors are fatal to the operation that raised them; they are
    /// never swallowed into the retry queue.
    #[error("storage error: {source}")]
    Storage {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// LLM or embedding provider errors (API failure, model not found, bad response).
    #[error("provider error: {message}")]
    Provider {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A provider or backend response could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),

    /// Operation timed out.
    #[error("operation timed out after {duration:?}")]
    Timeout { duration: std::time::Duration },

    /// Internal or unexpected errors.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngramError {
    /// Wrap any error as a storage error.
    pub fn storage(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        EngramError::Storage {
            source: Box::new(source),
        }
    }

    /// Build a provider error from a message alone.
    pub fn provider(message: impl Into<String>) -> Self {
        EngramError::Provider {
            message: message.into(),
            source: None,
        }
    }

    /// True for failures that should be retried via the extraction queue
    /// rather than surfaced to the caller.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngramError::Provider { .. } | EngramError::Parse(_) | EngramError::Timeout { .. }
        )
    }
}
