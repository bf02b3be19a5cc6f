//! Grouped-query self-attention.
//!
//! The q/k/v projections are stored either as three matrices or as one
//! fused `qkv_proj` matrix whose rows are `[query | key | value]`. Both
//! layouts produce identical projections.

use super::RotaryEmbedding;
use crate::error::{GoldcheckError, Result};
use candle_core::{DType, Device, Tensor};

/// Storage of the query/key/value projections.
#[derive(Debug, Clone)]
pub enum QkvProjection {
    /// Three independent matrices (Hugging Face layout).
    Separate {
        /// [num_heads * head_dim, hidden_size]
        q_proj: Tensor,
        /// [num_kv_heads * head_dim, hidden_size]
        k_proj: Tensor,
        /// [num_kv_heads * head_dim, hidden_size]
        v_proj: Tensor,
        /// Optional biases, all present or all absent.
        biases: Option<(Tensor, Tensor, Tensor)>,
    },
    /// One matrix, rows split at the recorded boundaries.
    Fused {
        /// [num_query_features + 2 * num_key_value_features, hidden_size]
        qkv_proj: Tensor,
        /// Optional [rows] bias.
        qkv_bias: Option<Tensor>,
        /// Rows belonging to the query projection.
        num_query_features: usize,
        /// Rows belonging to each of the key and value projections.
        num_key_value_features: usize,
    },
}

impl QkvProjection {
    /// Output rows of the query projection.
    pub fn num_query_features(&self) -> usize {
        match self {
            Self::Separate { q_proj, .. } => q_proj.dims()[0],
            Self::Fused {
                num_query_features, ..
            } => *num_query_features,
        }
    }

    /// Output rows of each of the key and value projections.
    pub fn num_key_value_features(&self) -> usize {
        match self {
            Self::Separate { k_proj, .. } => k_proj.dims()[0],
            Self::Fused {
                num_key_value_features,
                ..
            } => *num_key_value_features,
        }
    }

    /// Input width.
    pub fn hidden_size(&self) -> usize {
        match self {
            Self::Separate { q_proj, .. } => q_proj.dims()[1],
            Self::Fused { qkv_proj, .. } => qkv_proj.dims()[1],
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            Self::Separate {
                q_proj,
                k_proj,
                v_proj,
                biases,
            } => {
                let (_, hidden) = q_proj.dims2()?;
                if k_proj.dims() != v_proj.dims() || k_proj.dims2()?.1 != hidden {
                    return Err(GoldcheckError::ShapeMismatch(format!(
                        "q/k/v projections disagree: q={:?} k={:?} v={:?}",
                        q_proj.dims(),
                        k_proj.dims(),
                        v_proj.dims()
                    )));
                }
                if let Some((q_bias, k_bias, v_bias)) = biases {
                    if q_bias.dims() != [q_proj.dims()[0]]
                        || k_bias.dims() != [k_proj.dims()[0]]
                        || v_bias.dims() != [v_proj.dims()[0]]
                    {
                        return Err(GoldcheckError::ShapeMismatch(
                            "q/k/v biases do not match their projections".to_string(),
                        ));
                    }
                }
            }
            Self::Fused {
                qkv_proj,
                qkv_bias,
                num_query_features,
                num_key_value_features,
            } => {
                let (rows, _) = qkv_proj.dims2()?;
                let expected = num_query_features + 2 * num_key_value_features;
                if rows != expected {
                    return Err(GoldcheckError::ShapeMismatch(format!(
                        "qkv_proj has {} rows, split expects {}",
                        rows, expected
                    )));
                }
                if let Some(bias) = qkv_bias {
                    if bias.dims() != [rows] {
                        return Err(GoldcheckError::ShapeMismatch(format!(
                            "qkv bias {:?} does not match {} rows",
                            bias.dims(),
                            rows
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Project `[tokens, hidden]` to `([tokens, q], [tokens, kv], [tokens, kv])`.
    pub fn forward(&self, x_2d: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        match self {
            Self::Separate {
                q_proj,
                k_proj,
                v_proj,
                biases,
            } => {
                let q = x_2d.matmul(&q_proj.t()?)?;
                let k = x_2d.matmul(&k_proj.t()?)?;
                let v = x_2d.matmul(&v_proj.t()?)?;
                match biases {
                    Some((q_bias, k_bias, v_bias)) => Ok((
                        q.broadcast_add(q_bias)?,
                        k.broadcast_add(k_bias)?,
                        v.broadcast_add(v_bias)?,
                    )),
                    None => Ok((q, k, v)),
                }
            }
            Self::Fused {
                qkv_proj,
                qkv_bias,
                num_query_features,
                num_key_value_features,
            } => {
                let mut qkv = x_2d.matmul(&qkv_proj.t()?)?;
                if let Some(bias) = qkv_bias {
                    qkv = qkv.broadcast_add(bias)?;
                }
                let q = qkv.narrow(1, 0, *num_query_features)?;
                let k = qkv.narrow(1, *num_query_features, *num_key_value_features)?;
                let v = qkv.narrow(
                    1,
                    num_query_features + num_key_value_features,
                    *num_key_value_features,
                )?;
                Ok((q, k, v))
            }
        }
    }
}

/// Self-attention module for decoder layers.
#[derive(Debug, Clone)]
pub struct Attention {
    qkv: QkvProjection,
    /// Output projection: [hidden_size, num_heads * head_dim]
    o_proj: Tensor,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl Attention {
    /// Create attention with provided weights.
    pub fn new(
        qkv: QkvProjection,
        o_proj: Tensor,
        num_heads: usize,
        num_kv_heads: usize,
        head_dim: usize,
    ) -> Result<Self> {
        qkv.validate()?;
        if qkv.num_query_features() != num_heads * head_dim
            || qkv.num_key_value_features() != num_kv_heads * head_dim
        {
            return Err(GoldcheckError::ShapeMismatch(format!(
                "projection split ({}, {}) does not match {} heads / {} kv heads of dim {}",
                qkv.num_query_features(),
                qkv.num_key_value_features(),
                num_heads,
                num_kv_heads,
                head_dim
            )));
        }
        if num_kv_heads == 0 || num_heads % num_kv_heads != 0 {
            return Err(GoldcheckError::ShapeMismatch(format!(
                "{} heads cannot be grouped over {} kv heads",
                num_heads, num_kv_heads
            )));
        }
        if o_proj.dims() != [qkv.hidden_size(), num_heads * head_dim] {
            return Err(GoldcheckError::ShapeMismatch(format!(
                "o_proj: expected {:?}, got {:?}",
                [qkv.hidden_size(), num_heads * head_dim],
                o_proj.dims()
            )));
        }

        Ok(Self {
            qkv,
            o_proj,
            num_heads,
            num_kv_heads,
            head_dim,
        })
    }

    /// Create attention with random separate projections (for testing).
    pub fn random(
        hidden_size: usize,
        num_heads: usize,
        num_kv_heads: usize,
        head_dim: usize,
        device: &Device,
    ) -> Result<Self> {
        let qkv = QkvProjection::Separate {
            q_proj: Tensor::randn(0.0f32, 0.02, &[num_heads * head_dim, hidden_size], device)?,
            k_proj: Tensor::randn(0.0f32, 0.02, &[num_kv_heads * head_dim, hidden_size], device)?,
            v_proj: Tensor::randn(0.0f32, 0.02, &[num_kv_heads * head_dim, hidden_size], device)?,
            biases: None,
        };
        let o_proj = Tensor::randn(0.0f32, 0.02, &[hidden_size, num_heads * head_dim], device)?;
        Self::new(qkv, o_proj, num_heads, num_kv_heads, head_dim)
    }

    /// Compute Q, K, V reshaped for attention:
    /// - query: [batch, num_heads, seq_len, head_dim]
    /// - key: [batch, num_kv_heads, seq_len, head_dim]
    /// - value: [batch, num_kv_heads, seq_len, head_dim]
    pub fn project(&self, x: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let (batch, seq_len, hidden) = x.dims3()?;
        let x_2d = x.reshape((batch * seq_len, hidden))?;

        let (q, k, v) = self.qkv.forward(&x_2d)?;

        let q = q
            .reshape((batch, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = k
            .reshape((batch, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = v
            .reshape((batch, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        Ok((q, k, v))
    }

    /// Full attention block: projections, rotary embedding, masked
    /// scaled dot-product attention and output projection.
    ///
    /// * `x` - [batch, seq_len, hidden_size]
    /// * `positions` - `u32` [batch, seq_len]
    /// * `mask` - additive [batch, 1, seq_len, seq_len]
    pub fn forward(
        &self,
        x: &Tensor,
        rope: &RotaryEmbedding,
        positions: &Tensor,
        mask: &Tensor,
    ) -> Result<Tensor> {
        let (q, k, v) = self.project(x)?;
        let (q, k) = rope.apply(&q, &k, positions)?;
        let attn = self.scaled_dot_product(&q, &k, &v, mask)?;
        self.output(&attn)
    }

    fn scaled_dot_product(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: &Tensor,
    ) -> Result<Tensor> {
        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let repeat = self.num_heads / self.num_kv_heads;
        let k = repeat_kv(k, repeat)?;
        let v = repeat_kv(v, repeat)?;

        // Scores and softmax in f32
        let dtype = q.dtype();
        let scores = (q
            .to_dtype(DType::F32)?
            .matmul(&k.to_dtype(DType::F32)?.t()?)?
            * scale)?;
        let scores = scores.broadcast_add(&mask.to_dtype(DType::F32)?)?;
        let weights = candle_nn::ops::softmax_last_dim(&scores)?.to_dtype(dtype)?;

        Ok(weights.matmul(&v)?)
    }

    /// Input: [batch, num_heads, seq_len, head_dim]
    /// Output: [batch, seq_len, hidden_size]
    pub fn output(&self, attn_output: &Tensor) -> Result<Tensor> {
        let (batch, _, seq_len, _) = attn_output.dims4()?;
        let features = self.num_heads * self.head_dim;

        let x = attn_output
            .transpose(1, 2)?
            .reshape((batch * seq_len, features))?;
        let out = x.matmul(&self.o_proj.t()?)?;
        Ok(out.reshape((batch, seq_len, self.o_proj.dims()[0]))?)
    }

    /// The projection storage.
    pub fn qkv(&self) -> &QkvProjection {
        &self.qkv
    }

    /// Get the number of heads.
    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    /// Get the number of KV heads.
    pub fn num_kv_heads(&self) -> usize {
        self.num_kv_heads
    }

    /// Get the head dimension.
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }
}

/// Repeat KV heads for GQA.
fn repeat_kv(x: &Tensor, repeat: usize) -> Result<Tensor> {
    if repeat == 1 {
        return Ok(x.clone());
    }

    let (batch, num_kv_heads, seq_len, head_dim) = x.dims4()?;
    // [batch, kv, seq, d] -> [batch, kv, repeat, seq, d] -> [batch, kv * repeat, seq, d]
    let x = x
        .unsqueeze(2)?
        .expand((batch, num_kv_heads, repeat, seq_len, head_dim))?
        .reshape((batch, num_kv_heads * repeat, seq_len, head_dim))?;

    Ok(x)
}

/// Additive attention mask from segment ids.
///
/// `mask[b, 0, i, j]` is 0 when `j <= i` and both positions belong to the
/// same segment, `-inf` otherwise. Padding (segment 0) only attends to
/// earlier padding, so no row is ever fully masked.
///
/// Output: [batch, 1, seq_len, seq_len]
pub fn segment_causal_mask(segment_ids: &Tensor) -> Result<Tensor> {
    let (batch, seq_len) = segment_ids.dims2()?;
    let segments: Vec<Vec<u32>> = segment_ids.to_vec2()?;

    let neg_inf = f32::NEG_INFINITY;
    let mut mask_data = vec![0.0f32; batch * seq_len * seq_len];
    for (b, row) in segments.iter().enumerate() {
        for i in 0..seq_len {
            for j in 0..seq_len {
                if j > i || row[i] != row[j] {
                    mask_data[(b * seq_len + i) * seq_len + j] = neg_inf;
                }
            }
        }
    }

    let mask = Tensor::from_vec(mask_data, (batch, 1, seq_len, seq_len), segment_ids.device())?;
    Ok(mask)
}
