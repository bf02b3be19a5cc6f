//! Model loading and inference.
//!
//! Provides the pieces of a Llama-style decoder:
//! - Model configuration (`config.json`)
//! - SafeTensors weight loading, locally or from the Hub
//! - Forward pass producing logits for a [`BatchedInput`](crate::golden::BatchedInput)

mod attention;
mod config;
mod hub;
mod layer;
mod llama;
mod loader;
mod mlp;
mod rmsnorm;
mod rope;

pub use attention::{segment_causal_mask, Attention, QkvProjection};
pub use config::{FusedQkvConfig, ModelConfig};
pub use hub::{HubModelLoader, LoadOptions, PretrainedModel};
pub use layer::DecoderLayer;
pub use llama::{CausalLm, Llama};
pub use loader::{tensor_to_bytes, view_to_tensor, WeightLoader};
pub use mlp::SwiGluMlp;
pub use rmsnorm::RmsNorm;
pub use rope::RotaryEmbedding;
