// SPDX-FileCopyrightText: 2026 Engram Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Local ONNX embedder using all-MiniLM-L6-v2.
//!
//! Produces 384-dimensional embeddings on CPU with zero external API calls.
//! Model files are downloaded from HuggingFace on first use and cached in
//! the data directory.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use ndarray::Array2;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::TensorRef;
use tracing::info;

use engram_core::{EmbeddingProvider, EngramError, HealthStatus};

/// Embedding dimensions for all-MiniLM-L6-v2.
pub const EMBEDDING_DIM: usize = 384;

const MODEL_URL: &str =
    "https://huggingface.co/onnx-community/all-MiniLM-L6-v2-ONNX/resolve/main/onnx/model_quantized.onnx";
const TOKENIZER_URL: &str =
    "https://huggingface.co/sentence-transformers/all-MiniLM-L6-v2/resolve/main/tokenizer.json";

/// Directory where model files live under the given data dir.
pub fn model_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("models").join("all-MiniLM-L6-v2")
}

/// Whether both model files are present on disk.
pub fn model_available(data_dir: &Path) -> bool {
    let dir = model_dir(data_dir);
    dir.join("model.onnx").exists() && dir.join("tokenizer.json").exists()
}

/// Ensure the model and tokenizer exist locally, downloading on first run.
///
/// Returns the path to `model.onnx`.
pub async fn ensure_model(data_dir: &Path) -> Result<PathBuf, EngramError> {
    let dir = model_dir(data_dir);
    let model_path = dir.join("model.onnx");
    if model_available(data_dir) {
        return Ok(model_path);
    }

    info!("embedding model not found, downloading from HuggingFace");
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| EngramError::Internal(format!("failed to create model directory: {e}")))?;

    for (filename, url) in [("model.onnx", MODEL_URL), ("tokenizer.json", TOKENIZER_URL)] {
        let dest = dir.join(filename);
        if dest.exists() {
            continue;
        }
        match download_file(url, &dest).await {
            Ok(size) => info!(filename, size, "model file downloaded"),
            Err(e) => {
                // Clean up partial download.
                let _ = tokio::fs::remove_file(&dest).await;
                return Err(e);
            }
        }
    }

    info!(dir = %dir.display(), "embedding model ready");
    Ok(model_path)
}

async fn download_file(url: &str, dest: &Path) -> Result<usize, EngramError> {
    let response = reqwest::get(url).await.map_err(|e| EngramError::Provider {
        message: format!("failed to download {url}: {e}"),
        source: Some(Box::new(e)),
    })?;

    if !response.status().is_success() {
        return Err(EngramError::provider(format!(
            "download failed with status {}: {url}",
            response.status()
        )));
    }

    let bytes = response.bytes().await.map_err(|e| EngramError::Provider {
        message: format!("failed to read response body from {url}: {e}"),
        source: Some(Box::new(e)),
    })?;

    let size = bytes.len();
    tokio::fs::write(dest, &bytes)
        .await
        .map_err(|e| EngramError::Internal(format!("failed to write {}: {e}", dest.display())))?;
    Ok(size)
}

/// ONNX-based embedding provider using all-MiniLM-L6-v2.
///
/// Loads the quantized INT8 ONNX model and tokenizer from disk.
/// All inference runs on CPU with a single thread.
pub struct OnnxEmbedder {
    /// ONNX Runtime session (not Send, wrapped in Mutex for safety).
    session: Mutex<Session>,
    /// HuggingFace tokenizer.
    tokenizer: tokenizers::Tokenizer,
}

// Safety: Session is accessed through Mutex which provides synchronization.
// The tokenizer is thread-safe for encoding operations.
unsafe impl Send for OnnxEmbedder {}
unsafe impl Sync for OnnxEmbedder {}

impl OnnxEmbedder {
    /// Creates a new embedder from model files on disk.
    ///
    /// Expects `tokenizer.json` in the same directory as the model file.
    pub fn new(model_path: &Path) -> Result<Self, EngramError> {
        let model_dir = model_path
            .parent()
            .ok_or_else(|| EngramError::Internal("invalid model path".to_string()))?;

        let tokenizer_path = model_dir.join("tokenizer.json");
        let tokenizer = tokenizers::Tokenizer::from_file(&tokenizer_path).map_err(|e| {
            EngramError::Internal(format!(
                "failed to load tokenizer from {}: {e}",
                tokenizer_path.display()
            ))
        })?;

        let session = Session::builder()
            .map_err(|e| EngramError::Internal(format!("failed to create ONNX session builder: {e}")))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| EngramError::Internal(format!("failed to set optimization level: {e}")))?
            .with_intra_threads(1)
            .map_err(|e| EngramError::Internal(format!("failed to set thread count: {e}")))?
            .commit_from_file(model_path)
            .map_err(|e| {
                EngramError::Internal(format!(
                    "failed to load ONNX model from {}: {e}",
                    model_path.display()
                ))
            })?;

        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
        })
    }

    /// Embed a single text string, returning a 384-dim L2-normalized vector.
    pub fn embed_text(&self, text: &str) -> Result<Vec<f32>, EngramError> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| EngramError::Internal(format!("tokenization failed: {e}")))?;

        let input_ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
        let attention_mask: Vec<i64> = encoding
            .get_attention_mask()
            .iter()
            .map(|&m| m as i64)
            .collect();
        let token_type_ids: Vec<i64> = encoding
            .get_type_ids()
            .iter()
            .map(|&t| t as i64)
            .collect();

        let seq_len = input_ids.len();

        let input_ids_array = Array2::from_shape_vec((1, seq_len), input_ids)
            .map_err(|e| EngramError::Internal(format!("failed to create input_ids tensor: {e}")))?;
        let attention_mask_array = Array2::from_shape_vec((1, seq_len), attention_mask.clone())
            .map_err(|e| {
                EngramError::Internal(format!("failed to create attention_mask tensor: {e}"))
            })?;
        let token_type_ids_array = Array2::from_shape_vec((1, seq_len), token_type_ids)
            .map_err(|e| {
                EngramError::Internal(format!("failed to create token_type_ids tensor: {e}"))
            })?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| EngramError::Internal(format!("failed to lock ONNX session: {e}")))?;

        let input_ids_tensor = TensorRef::from_array_view(&input_ids_array)
            .map_err(|e| EngramError::Internal(format!("failed to create input_ids TensorRef: {e}")))?;
        let attention_mask_tensor = TensorRef::from_array_view(&attention_mask_array)
            .map_err(|e| {
                EngramError::Internal(format!("failed to create attention_mask TensorRef: {e}"))
            })?;
        let token_type_ids_tensor = TensorRef::from_array_view(&token_type_ids_array)
            .map_err(|e| {
                EngramError::Internal(format!("failed to create token_type_ids TensorRef: {e}"))
            })?;

        let outputs = session
            .run(ort::inputs![
                "input_ids" => input_ids_tensor,
                "attention_mask" => attention_mask_tensor,
                "token_type_ids" => token_type_ids_tensor
            ])
            .map_err(|e| EngramError::Internal(format!("ONNX inference failed: {e}")))?;

        // Extract output: shape [1, seq_len, 384]
        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EngramError::Internal(format!("failed to extract output tensor: {e}")))?;

        let hidden_size = shape[shape.len() - 1] as usize;
        let pooled = mean_pool_with_attention(data, &attention_mask, seq_len, hidden_size);

        Ok(l2_normalize(&pooled))
    }
}

/// Apply attention-masked mean pooling over token embeddings.
fn mean_pool_with_attention(
    embeddings: &[f32],
    attention_mask: &[i64],
    seq_len: usize,
    hidden_size: usize,
) -> Vec<f32> {
    let mut sum = vec![0.0f32; hidden_size];
    let mut count = 0.0f32;

    for i in 0..seq_len {
        if attention_mask[i] > 0 {
            for j in 0..hidden_size {
                sum[j] += embeddings[i * hidden_size + j];
            }
            count += 1.0;
        }
    }

    if count > 0.0 {
        for val in &mut sum {
            *val /= count;
        }
    }

    sum
}

/// L2-normalize a vector.
fn l2_normalize(vec: &[f32]) -> Vec<f32> {
    let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        vec.iter().map(|v| v / norm).collect()
    } else {
        vec.to_vec()
    }
}

#[async_trait]
impl EmbeddingProvider for OnnxEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EngramError> {
        let mut embeddings = Vec::with_capacity(texts.len());
        for text in texts {
            embeddings.push(self.embed_text(text)?);
        }
        Ok(embeddings)
    }

    fn dimensions(&self) -> usize {
        EMBEDDING_DIM
    }

    fn model_id(&self) -> &str {
        "all-MiniLM-L6-v2"
    }

    async fn health_check(&self) -> Result<HealthStatus, EngramError> {
        match self.session.lock() {
            Ok(_) => Ok(HealthStatus::Healthy),
            Err(e) => Ok(HealthStatus::Unhealthy(format!("session lock poisoned: {e}"))),
        }
    }
}
