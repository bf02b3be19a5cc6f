//! Error types for goldcheck.

use thiserror::Error;

/// Result type alias for goldcheck operations.
pub type Result<T> = std::result::Result<T, GoldcheckError>;

/// Errors that can occur while checking logits or converting checkpoints.
#[derive(Error, Debug)]
pub enum GoldcheckError {
    /// A golden data record is malformed.
    #[error("golden data line {line}: {message}")]
    DataFormat {
        /// 1-based line number in the golden file.
        line: usize,
        /// What was wrong with the record.
        message: String,
    },

    /// Tensor shapes do not line up.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Model loading or structure error.
    #[error("model error: {0}")]
    ModelError(String),

    /// Invalid run configuration.
    #[error("config error: {0}")]
    ConfigError(String),

    /// A golden comparison exceeded its threshold.
    #[error("check failed: {0}")]
    CheckFailed(String),

    /// I/O error.
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    /// Candle tensor error.
    #[error("tensor error: {0}")]
    TensorError(#[from] candle_core::Error),

    /// SafeTensors encoding or decoding error.
    #[error("safetensors error: {0}")]
    SafeTensorError(#[from] safetensors::SafeTensorError),

    /// Model hub error.
    #[error("hub error: {0}")]
    HubError(#[from] hf_hub::api::sync::ApiError),
}

impl GoldcheckError {
    /// Build a [`GoldcheckError::DataFormat`] for the given line.
    pub fn data_format(line: usize, message: impl Into<String>) -> Self {
        Self::DataFormat {
            line,
            message: message.into(),
        }
    }

    /// Whether this error is a threshold verdict rather than a malfunction.
    pub fn is_check_failure(&self) -> bool {
        matches!(self, Self::CheckFailed(_))
    }
}
