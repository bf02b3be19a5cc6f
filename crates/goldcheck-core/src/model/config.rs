//! Model configuration (`config.json`).

use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

/// Split boundaries of a fused `qkv_proj`.
///
/// Rows `[0, num_query_features)` are the query projection, the next
/// `num_key_value_features` rows the key projection, the rest the value
/// projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FusedQkvConfig {
    /// Output rows of the query projection.
    pub num_query_features: usize,
    /// Output rows of each of the key and value projections.
    pub num_key_value_features: usize,
}

/// Configuration for a Llama-style decoder.
///
/// Keys this crate does not interpret are kept in `extra` so a config
/// written back out carries everything it was read with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Vocabulary size.
    pub vocab_size: usize,
    /// Hidden dimension.
    pub hidden_size: usize,
    /// Intermediate dimension (FFN).
    pub intermediate_size: usize,
    /// Number of attention heads.
    pub num_attention_heads: usize,
    /// Number of KV heads (for GQA). Defaults to `num_attention_heads`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_key_value_heads: Option<usize>,
    /// Number of layers.
    pub num_hidden_layers: usize,
    /// Maximum sequence length.
    pub max_position_embeddings: usize,
    /// RMS norm epsilon.
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    /// Rope theta.
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    /// Explicit head dimension, when it is not `hidden_size / num_attention_heads`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head_dim: Option<usize>,
    /// Whether the LM head shares the embedding matrix.
    #[serde(default)]
    pub tie_word_embeddings: bool,
    /// Model architecture type.
    #[serde(default)]
    pub model_type: String,
    /// Split of a fused `qkv_proj`, present on converted checkpoints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fused_qkv: Option<FusedQkvConfig>,
    /// Every other key of the original file.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_rms_norm_eps() -> f64 {
    1e-5
}

fn default_rope_theta() -> f64 {
    10000.0
}

impl ModelConfig {
    /// Calculate head dimension.
    pub fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads)
    }

    /// Number of KV heads.
    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    /// Get GQA ratio.
    pub fn gqa_ratio(&self) -> usize {
        self.num_attention_heads / self.num_kv_heads()
    }

    /// Rows of the query projection.
    pub fn num_query_features(&self) -> usize {
        self.num_attention_heads * self.head_dim()
    }

    /// Rows of each of the key and value projections.
    pub fn num_key_value_features(&self) -> usize {
        self.num_kv_heads() * self.head_dim()
    }

    /// Set (or replace) an uninterpreted key.
    pub fn set_extra(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.extra.insert(key.into(), value.into());
    }

    /// Load from JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        Ok(config)
    }

    /// Write as pretty-printed JSON.
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// A tiny configuration for tests and examples.
    pub fn tiny() -> Self {
        Self {
            vocab_size: 32,
            hidden_size: 16,
            intermediate_size: 32,
            num_attention_heads: 4,
            num_key_value_heads: Some(2),
            num_hidden_layers: 2,
            max_position_embeddings: 64,
            rms_norm_eps: 1e-5,
            rope_theta: 10000.0,
            head_dim: None,
            tie_word_embeddings: false,
            model_type: "llama".to_string(),
            fused_qkv: None,
            extra: Map::new(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        // Llama-2-7B
        Self {
            vocab_size: 32000,
            hidden_size: 4096,
            intermediate_size: 11008,
            num_attention_heads: 32,
            num_key_value_heads: Some(32),
            num_hidden_layers: 32,
            max_position_embeddings: 4096,
            rms_norm_eps: 1e-5,
            rope_theta: 10000.0,
            head_dim: None,
            tie_word_embeddings: false,
            model_type: "llama".to_string(),
            fused_qkv: None,
            extra: Map::new(),
        }
    }
}
