//! Attention projection fusion and converted checkpoint output.
//!
//! - [`ProjectionFuser`] - replaces the q/k/v projections of every attention
//!   block with one `qkv_proj`
//! - [`CheckpointWriter`] - writes the converted config and safetensors

mod checkpoint;
mod fuser;

pub use checkpoint::{
    shard_file_name, CheckpointWriter, WriterOptions, WrittenCheckpoint, CONFIG_DIR, INDEX_FILE,
    SINGLE_FILE,
};
pub use fuser::{AttentionProjections, FusedAttention, FusedBlock, FusedCheckpoint, ProjectionFuser};
