//! # Goldcheck Core
//!
//! Numerical regression checks and checkpoint conversion for Llama-style
//! models, built on candle.
//!
//! This crate provides:
//! - **Golden data** loading and per-case batch construction
//! - **Forward execution** of a causal LM, locally or across row shards
//! - **Divergence checks**: elementwise closeness or per-position KL divergence
//! - **Projection fusion** of q/k/v attention weights into one `qkv_proj`
//! - **Checkpoint output** in (optionally sharded) safetensors

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod compare;
pub mod config;
pub mod error;
pub mod fusion;
pub mod golden;
pub mod model;
pub mod pipeline;
pub mod runner;

pub use error::{GoldcheckError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::compare::{CheckConfig, CheckMode, ComparisonResult, DivergenceChecker};
    pub use crate::config::RunConfig;
    pub use crate::error::{GoldcheckError, Result};
    pub use crate::fusion::{CheckpointWriter, ProjectionFuser, WriterOptions};
    pub use crate::golden::{BatchInputBuilder, BatchedInput, GoldenCase, GoldenCaseLoader};
    pub use crate::model::{
        CausalLm, HubModelLoader, Llama, LoadOptions, ModelConfig, PretrainedModel,
    };
    pub use crate::pipeline::{CheckSummary, LogitChecker};
    pub use crate::runner::{ForwardBackend, ForwardRunner, LocalBackend, ShardedBackend};
}
