// SPDX-FileCopyrightText: 2026 Engram Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Provider trait definitions.
//!
//! External LLM and embedding capabilities are consumed only through these
//! traits, using `#[async_trait]` for dynamic dispatch compatibility.

pub mod embedding;
pub mod provider;

pub use embedding::EmbeddingProvider;
pub use provider::CompletionProvider;
