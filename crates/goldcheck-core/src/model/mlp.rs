//! SwiGLU MLP (Swish-Gated Linear Unit).
//!
//! `SwiGLU(x) = (silu(x @ gate_proj^T) * (x @ up_proj^T)) @ down_proj^T`
//!
//! # Reference
//!
//! [GLU Variants Improve Transformer](https://arxiv.org/abs/2002.05202)

use crate::error::{GoldcheckError, Result};
use candle_core::{Device, Tensor};
use candle_nn::ops::silu;

/// SwiGLU MLP block.
#[derive(Debug, Clone)]
pub struct SwiGluMlp {
    /// Gate projection: [intermediate, hidden]
    gate_proj: Tensor,
    /// Up projection: [intermediate, hidden]
    up_proj: Tensor,
    /// Down projection: [hidden, intermediate]
    down_proj: Tensor,
}

impl SwiGluMlp {
    /// Create a new SwiGLU MLP with given weights.
    pub fn new(gate_proj: Tensor, up_proj: Tensor, down_proj: Tensor) -> Result<Self> {
        let (intermediate_size, hidden_size) = gate_proj.dims2()?;
        if up_proj.dims() != gate_proj.dims() {
            return Err(GoldcheckError::ShapeMismatch(format!(
                "up_proj: expected {:?}, got {:?}",
                gate_proj.dims(),
                up_proj.dims()
            )));
        }
        if down_proj.dims() != [hidden_size, intermediate_size] {
            return Err(GoldcheckError::ShapeMismatch(format!(
                "down_proj: expected {:?}, got {:?}",
                [hidden_size, intermediate_size],
                down_proj.dims()
            )));
        }

        Ok(Self {
            gate_proj,
            up_proj,
            down_proj,
        })
    }

    /// Create a new SwiGLU MLP with random weights (for testing).
    pub fn random(hidden_size: usize, intermediate_size: usize, device: &Device) -> Result<Self> {
        Self::new(
            Tensor::randn(0.0f32, 0.02, &[intermediate_size, hidden_size], device)?,
            Tensor::randn(0.0f32, 0.02, &[intermediate_size, hidden_size], device)?,
            Tensor::randn(0.0f32, 0.02, &[hidden_size, intermediate_size], device)?,
        )
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor [batch, seq_len, hidden_size] or [tokens, hidden_size]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dims = x.dims().to_vec();
        let hidden = dims[dims.len() - 1];
        let tokens = x.elem_count() / hidden;
        let x_2d = x.reshape((tokens, hidden))?;

        let gate = silu(&x_2d.matmul(&self.gate_proj.t()?)?)?;
        let up = x_2d.matmul(&self.up_proj.t()?)?;
        let output = (gate * up)?.matmul(&self.down_proj.t()?)?;

        let mut out_dims = dims;
        let last = out_dims.len() - 1;
        out_dims[last] = self.hidden_size();
        Ok(output.reshape(out_dims)?)
    }

    /// Get the hidden size.
    pub fn hidden_size(&self) -> usize {
        self.gate_proj.dims()[1]
    }

    /// Get the intermediate size.
    pub fn intermediate_size(&self) -> usize {
        self.gate_proj.dims()[0]
    }
}
