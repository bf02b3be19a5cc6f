//! Root Mean Square Layer Normalization.
//!
//! `RMSNorm(x) = x * weight / sqrt(mean(x^2) + eps)`
//!
//! The reduction runs in f32 whatever the input precision, then the result
//! is cast back, matching the reference Llama implementation.

use crate::error::{GoldcheckError, Result};
use candle_core::{DType, Device, Tensor, D};

/// RMS Layer Normalization.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    /// Learnable scale parameter.
    weight: Tensor,
    /// Small constant for numerical stability.
    eps: f64,
}

impl RmsNorm {
    /// Create a new RMSNorm layer with given weight.
    pub fn new(weight: Tensor, eps: f64) -> Result<Self> {
        if weight.rank() != 1 {
            return Err(GoldcheckError::ShapeMismatch(format!(
                "norm weight must be rank 1, got {:?}",
                weight.dims()
            )));
        }
        Ok(Self { weight, eps })
    }

    /// Create a new RMSNorm layer with ones (for testing).
    pub fn ones(hidden_size: usize, eps: f64, device: &Device) -> Result<Self> {
        Self::new(Tensor::ones(hidden_size, DType::F32, device)?, eps)
    }

    /// Forward pass over the last dimension.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;

        let mean_sq = x.sqr()?.mean_keepdim(D::Minus1)?;
        let rsqrt = (mean_sq + self.eps)?.sqrt()?.recip()?;
        let normalized = x.broadcast_mul(&rsqrt)?.to_dtype(dtype)?;

        Ok(normalized.broadcast_mul(&self.weight.to_dtype(dtype)?)?)
    }

    /// Get the hidden size.
    pub fn hidden_size(&self) -> usize {
        self.weight.dims()[0]
    }
}
