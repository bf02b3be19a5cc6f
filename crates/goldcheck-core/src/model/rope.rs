//! Rotary Position Embeddings (RoPE).
//!
//! Positions come from the batch (`decoder_positions`) rather than from a
//! running offset, so every row can carry its own position ids.
//!
//! # Reference
//!
//! [RoFormer: Enhanced Transformer with Rotary Position Embedding](https://arxiv.org/abs/2104.09864)

use crate::error::{GoldcheckError, Result};
use candle_core::{DType, Device, Tensor};

/// Rotary Position Embedding implementation.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    /// Cosine table: [max_seq_len, head_dim / 2].
    cos_cache: Tensor,
    /// Sine table: [max_seq_len, head_dim / 2].
    sin_cache: Tensor,
    head_dim: usize,
    max_seq_len: usize,
}

impl RotaryEmbedding {
    /// Create a new rotary embedding.
    ///
    /// # Arguments
    ///
    /// * `head_dim` - Dimension of each attention head
    /// * `max_seq_len` - Maximum position to cache
    /// * `theta` - Base frequency
    /// * `device` - Device for tensors
    pub fn new(head_dim: usize, max_seq_len: usize, theta: f64, device: &Device) -> Result<Self> {
        let half_dim = head_dim / 2;
        let inv_freq: Vec<f32> = (0..half_dim)
            .map(|i| 1.0 / theta.powf(2.0 * i as f64 / head_dim as f64) as f32)
            .collect();
        let inv_freq = Tensor::from_vec(inv_freq, (1, half_dim), device)?;

        let positions = Tensor::arange(0u32, max_seq_len as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_seq_len, 1))?;
        let freqs = positions.matmul(&inv_freq)?;

        Ok(Self {
            cos_cache: freqs.cos()?,
            sin_cache: freqs.sin()?,
            head_dim,
            max_seq_len,
        })
    }

    /// Apply rotary embeddings to query and key tensors.
    ///
    /// # Arguments
    ///
    /// * `query` - [batch, num_heads, seq_len, head_dim]
    /// * `key` - [batch, num_kv_heads, seq_len, head_dim]
    /// * `positions` - `u32` position ids [batch, seq_len]
    pub fn apply(
        &self,
        query: &Tensor,
        key: &Tensor,
        positions: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let (batch, seq_len) = positions.dims2()?;
        let max_position = positions.flatten_all()?.max(0)?.to_scalar::<u32>()?;
        if max_position as usize >= self.max_seq_len {
            return Err(GoldcheckError::ShapeMismatch(format!(
                "position {} beyond rotary table of {} positions",
                max_position, self.max_seq_len
            )));
        }

        let half_dim = self.head_dim / 2;
        let flat = positions.flatten_all()?;
        // [batch, 1, seq_len, half_dim], broadcast over heads
        let cos = self
            .cos_cache
            .index_select(&flat, 0)?
            .reshape((batch, 1, seq_len, half_dim))?
            .to_dtype(query.dtype())?;
        let sin = self
            .sin_cache
            .index_select(&flat, 0)?
            .reshape((batch, 1, seq_len, half_dim))?
            .to_dtype(query.dtype())?;

        Ok((
            self.rotate_half(query, &cos, &sin)?,
            self.rotate_half(key, &cos, &sin)?,
        ))
    }

    /// `[x1, x2] -> [x1*cos - x2*sin, x2*cos + x1*sin]`
    fn rotate_half(&self, x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
        let half_dim = self.head_dim / 2;
        let x1 = x.narrow(3, 0, half_dim)?;
        let x2 = x.narrow(3, half_dim, half_dim)?;

        let out1 = (x1.broadcast_mul(cos)? - x2.broadcast_mul(sin)?)?;
        let out2 = (x2.broadcast_mul(cos)? + x1.broadcast_mul(sin)?)?;

        Ok(Tensor::cat(&[out1, out2], 3)?)
    }

    /// Get the maximum sequence length this embedding supports.
    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    /// Get the head dimension.
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }
}
