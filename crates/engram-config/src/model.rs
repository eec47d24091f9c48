// SPDX-FileCopyrightText: 2026 Engram Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration model structs for the Engram memory engine.
//!
//! All structs use `#[serde(deny_unknown_fields)]` to reject unrecognized
//! config keys at startup, providing actionable error messages.

use serde::{Deserialize, Serialize};

/// Top-level Engram configuration.
///
/// Loaded from TOML files following XDG hierarchy, with environment variable
/// overrides. All sections are optional and default to sensible values.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EngramConfig {
    /// Durable storage settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Search backend settings.
    #[serde(default)]
    pub search: SearchConfig,

    /// Context injection and reranking settings.
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Memory extraction settings.
    #[serde(default)]
    pub extraction: ExtractionConfig,

    /// Background maintenance settings.
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

/// Durable storage configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// SQLite database file path. `None` uses the XDG data directory
    /// (`~/.local/share/engram/engram.db`).
    #[serde(default)]
    pub database_path: Option<String>,

    /// SQLite busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

/// Which search backend serves primary recall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchBackendChoice {
    /// FTS5 keyword search. Always available, no model required.
    Lexical,
    /// Local ONNX embedding model with cosine similarity.
    Vector,
    /// Remote embedding API with a content-hash vector cache.
    Remote,
}

impl Default for SearchBackendChoice {
    fn default() -> Self {
        SearchBackendChoice::Lexical
    }
}

/// Search backend configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SearchConfig {
    /// Primary backend. Lexical search remains the fallback regardless.
    #[serde(default)]
    pub backend: SearchBackendChoice,

    /// Name of the local embedding model.
    #[serde(default = "default_model_name")]
    pub model_name: String,

    /// Directory for downloaded model files. `None` uses the XDG data dir.
    #[serde(default)]
    pub model_dir: Option<String>,

    /// Base URL of the remote embedding API (OpenAI-compatible).
    #[serde(default)]
    pub api_base: Option<String>,

    /// API key for the remote embedding API. `None` disables the remote
    /// backend (lexical fallback takes over).
    #[serde(default)]
    pub api_key: Option<String>,

    /// Model name sent to the remote embedding API.
    #[serde(default = "default_api_model")]
    pub api_model: String,

    /// Minimum cosine similarity for a vector hit to count (0.0-1.0).
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,

    /// Maximum candidates returned per search call.
    #[serde(default = "default_max_results")]
    pub max_results: usize,

    /// Timeout for remote embedding requests, in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            backend: SearchBackendChoice::default(),
            model_name: default_model_name(),
            model_dir: None,
            api_base: None,
            api_key: None,
            api_model: default_api_model(),
            similarity_threshold: default_similarity_threshold(),
            max_results: default_max_results(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_model_name() -> String {
    "sentence-transformers/all-MiniLM-L6-v2".to_string()
}

fn default_api_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_similarity_threshold() -> f64 {
    0.3
}

fn default_max_results() -> usize {
    10
}

fn default_request_timeout_secs() -> u64 {
    30
}

/// Context injection and reranking configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RetrievalConfig {
    /// Token budget for the injected memory block.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Window for the recency recall path, in days.
    #[serde(default = "default_recent_days")]
    pub recent_days: i64,

    /// Minimum importance for the recency recall path.
    #[serde(default = "default_min_recent_importance")]
    pub min_recent_importance: f64,

    /// Active persona tag. `"technical"` boosts skill and error memories.
    #[serde(default)]
    pub persona: Option<String>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            recent_days: default_recent_days(),
            min_recent_importance: default_min_recent_importance(),
            persona: None,
        }
    }
}

fn default_max_tokens() -> usize {
    700
}

fn default_recent_days() -> i64 {
    7
}

fn default_min_recent_importance() -> f64 {
    0.5
}

/// Memory extraction configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ExtractionConfig {
    /// Model override for extraction calls. `None` uses the provider default.
    #[serde(default)]
    pub model: Option<String>,

    /// Maximum retry attempts for a queued extraction before it is marked failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Timeout for each extraction LLM call, in seconds.
    #[serde(default = "default_extraction_timeout_secs")]
    pub timeout_secs: u64,

    /// Queue entries drained per maintenance pass.
    #[serde(default = "default_queue_batch_size")]
    pub queue_batch_size: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            model: None,
            max_retries: default_max_retries(),
            timeout_secs: default_extraction_timeout_secs(),
            queue_batch_size: default_queue_batch_size(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_extraction_timeout_secs() -> u64 {
    30
}

fn default_queue_batch_size() -> usize {
    10
}

/// Background maintenance configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LifecycleConfig {
    /// Similarity threshold for duplicate clustering (0.0-1.0).
    #[serde(default = "default_dedup_threshold")]
    pub dedup_threshold: f64,

    /// Hours after expiry before a transient memory is purged.
    #[serde(default = "default_transient_ttl_hours")]
    pub transient_ttl_hours: i64,

    /// Path for the rendered memory digest. `None` disables digest refresh.
    #[serde(default)]
    pub digest_path: Option<String>,

    /// Upper bound on digest size, in characters.
    #[serde(default = "default_digest_max_chars")]
    pub digest_max_chars: usize,

    /// Memories listed per kind in the digest.
    #[serde(default = "default_digest_per_kind")]
    pub digest_per_kind: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            dedup_threshold: default_dedup_threshold(),
            transient_ttl_hours: default_transient_ttl_hours(),
            digest_path: None,
            digest_max_chars: default_digest_max_chars(),
            digest_per_kind: default_digest_per_kind(),
        }
    }
}

fn default_dedup_threshold() -> f64 {
    0.7
}

fn default_transient_ttl_hours() -> i64 {
    24
}

fn default_digest_max_chars() -> usize {
    1200
}

fn default_digest_per_kind() -> usize {
    4
}

impl StorageConfig {
    /// Resolve the database path, falling back to the XDG data directory.
    pub fn resolved_database_path(&self) -> std::path::PathBuf {
        match &self.database_path {
            Some(p) => std::path::PathBuf::from(p),
            None => dirs::data_dir()
                .unwrap_or_else(|| std::path::PathBuf::from("."))
                .join("engram/engram.db"),
        }
    }
}

impl SearchConfig {
    /// Resolve the directory for downloaded model files, falling back to
    /// the XDG data directory.
    pub fn resolved_model_dir(&self) -> std::path::PathBuf {
        match &self.model_dir {
            Some(p) => std::path::PathBuf::from(p),
            None => dirs::data_dir()
                .unwrap_or_else(|| std::path::PathBuf::from("."))
                .join("engram"),
        }
    }
}
