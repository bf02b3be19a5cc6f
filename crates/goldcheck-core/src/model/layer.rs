//! Transformer decoder layer.
//!
//! A single pre-norm decoder layer combining:
//! - Pre-attention RMSNorm
//! - Grouped Query Attention
//! - Post-attention RMSNorm
//! - SwiGLU MLP

use super::{Attention, RmsNorm, RotaryEmbedding, SwiGluMlp};
use crate::error::Result;
use candle_core::Tensor;

/// A single transformer decoder layer.
#[derive(Debug, Clone)]
pub struct DecoderLayer {
    input_layernorm: RmsNorm,
    attention: Attention,
    post_attention_layernorm: RmsNorm,
    mlp: SwiGluMlp,
    /// Layer index (for debugging).
    layer_idx: usize,
}

impl DecoderLayer {
    /// Create a new decoder layer.
    pub fn new(
        input_layernorm: RmsNorm,
        attention: Attention,
        post_attention_layernorm: RmsNorm,
        mlp: SwiGluMlp,
        layer_idx: usize,
    ) -> Self {
        Self {
            input_layernorm,
            attention,
            post_attention_layernorm,
            mlp,
            layer_idx,
        }
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `hidden_states` - [batch, seq_len, hidden_size]
    /// * `rope` - Rotary position embeddings
    /// * `positions` - `u32` position ids [batch, seq_len]
    /// * `mask` - Additive attention mask [batch, 1, seq_len, seq_len]
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        rope: &RotaryEmbedding,
        positions: &Tensor,
        mask: &Tensor,
    ) -> Result<Tensor> {
        let normed = self.input_layernorm.forward(hidden_states)?;
        let attn_output = self.attention.forward(&normed, rope, positions, mask)?;
        let hidden_states = (hidden_states + attn_output)?;

        let normed = self.post_attention_layernorm.forward(&hidden_states)?;
        let mlp_output = self.mlp.forward(&normed)?;

        Ok((hidden_states + mlp_output)?)
    }

    /// Get the layer index.
    pub fn layer_idx(&self) -> usize {
        self.layer_idx
    }

    /// Get the attention module.
    pub fn attention(&self) -> &Attention {
        &self.attention
    }

    /// Get the MLP module.
    pub fn mlp(&self) -> &SwiGluMlp {
        &self.mlp
    }
}
