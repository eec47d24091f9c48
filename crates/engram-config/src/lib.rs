// SPDX-FileCopyrightText: 2026 Engram Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration system for the Engram memory engine.
//!
//! Provides TOML configuration parsing with strict validation
//! (`deny_unknown_fields`), XDG file hierarchy lookup, and environment
//! variable overrides.
//!
//! # Usage
//!
//! ```no_run
//! use engram_config::load_and_validate;
//!
//! let config = load_and_validate().expect("config errors");
//! println!("retrieval budget: {}", config.retrieval.max_tokens);
//! ```

pub mod loader;
pub mod model;

pub use loader::{load_config, load_config_from_path, load_config_from_str};
pub use model::{
    EngramConfig, ExtractionConfig, LifecycleConfig, RetrievalConfig, SearchBackendChoice,
    SearchConfig, StorageConfig,
};

use engram_core::EngramError;

/// Load configuration from the XDG hierarchy and validate it.
///
/// Figment errors and range violations are both surfaced as
/// [`EngramError::Config`].
pub fn load_and_validate() -> Result<EngramConfig, EngramError> {
    let config = loader::load_config().map_err(|e| EngramError::Config(e.to_string()))?;
    validate(&config)?;
    Ok(config)
}

/// Load configuration from a TOML string and validate it.
pub fn load_and_validate_str(toml_content: &str) -> Result<EngramConfig, EngramError> {
    let config =
        loader::load_config_from_str(toml_content).map_err(|e| EngramError::Config(e.to_string()))?;
    validate(&config)?;
    Ok(config)
}

/// Post-deserialization range checks.
fn validate(config: &EngramConfig) -> Result<(), EngramError> {
    if !(0.0..=1.0).contains(&config.search.similarity_threshold) {
        return Err(EngramError::Config(format!(
            "search.similarity_threshold must be in [0.0, 1.0], got {}",
            config.search.similarity_threshold
        )));
    }
    if !(0.0..=1.0).contains(&config.lifecycle.dedup_threshold) {
        return Err(EngramError::Config(format!(
            "lifecycle.dedup_threshold must be in [0.0, 1.0], got {}",
            config.lifecycle.dedup_threshold
        )));
    }
    if config.retrieval.max_tokens == 0 {
        return Err(EngramError::Config(
            "retrieval.max_tokens must be greater than zero".to_string(),
        ));
    }
    if config.search.backend == SearchBackendChoice::Remote && config.search.api_key.is_none() {
        tracing::warn!(
            "search.backend = \"remote\" but no search.api_key is set; lexical fallback will serve all queries"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_out_of_range_threshold() {
        let result = load_and_validate_str(
            r#"
            [search]
            similarity_threshold = 1.5
            "#,
        );
        assert!(matches!(result, Err(EngramError::Config(_))));
    }

    #[test]
    fn validate_rejects_zero_budget() {
        let result = load_and_validate_str(
            r#"
            [retrieval]
            max_tokens = 0
            "#,
        );
        assert!(matches!(result, Err(EngramError::Config(_))));
    }

    #[test]
    fn validate_accepts_defaults() {
        let config = load_and_validate_str("").unwrap();
        assert_eq!(config.extraction.queue_batch_size, 10);
    }
}
