//! Convert a Llama checkpoint to fused q/k/v attention projections.
//!
//! ```text
//! fuse-qkv --model_dir out --hf_token hf_... [--model_id meta-llama/Llama-2-7b-hf]
//! ```
//!
//! Writes `<model_dir>/my_config/config.json` and the converted checkpoint to
//! `<model_dir>/<checkpoint_name>`.

use anyhow::Context;
use clap::Parser;
use goldcheck::config::parse_dtype;
use goldcheck::prelude::*;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "fuse-qkv")]
#[command(about = "Fuse q/k/v attention projections into a single qkv_proj", long_about = None)]
#[command(version)]
struct Cli {
    /// Output root directory
    #[arg(long = "model_dir")]
    model_dir: PathBuf,

    /// Hugging Face token with access to the model
    #[arg(long = "hf_token")]
    hf_token: String,

    /// Hub model to convert
    #[arg(long = "model_id", default_value = "meta-llama/Llama-2-7b-hf")]
    model_id: String,

    /// Hub revision
    #[arg(long, default_value = "main")]
    revision: String,

    /// Parameter precision: f32, f16 or bf16
    #[arg(long, default_value = "bf16")]
    dtype: String,

    /// Load from a local directory instead of the Hub
    #[arg(long = "source_dir")]
    source_dir: Option<PathBuf>,

    /// Name of the checkpoint directory under model_dir
    #[arg(long = "checkpoint_name", default_value = "llama2-7b")]
    checkpoint_name: String,

    /// Largest safetensors file, in bytes
    #[arg(long = "max_shard_size", default_value_t = 5_000_000_000)]
    max_shard_size: u64,
}

fn main() -> anyhow::Result<()> {
    goldcheck::init_logging();
    let cli = Cli::parse();

    let options = LoadOptions {
        dtype: parse_dtype(&cli.dtype)?,
        ..LoadOptions::default()
    };
    let model = match &cli.source_dir {
        Some(dir) => PretrainedModel::from_dir(dir, &options)
            .with_context(|| format!("failed to load {}", dir.display()))?,
        None => HubModelLoader::new(&cli.model_id)
            .with_revision(&cli.revision)
            .with_token(&cli.hf_token)
            .load(&options)
            .with_context(|| format!("failed to fetch {}", cli.model_id))?,
    };

    let fused = ProjectionFuser::default().fuse_model(&model)?;

    let writer = CheckpointWriter::new(WriterOptions {
        max_shard_size: cli.max_shard_size,
        checkpoint_name: cli.checkpoint_name.clone(),
    });
    let written = writer.write(&fused, &cli.model_dir)?;

    info!(
        config = %written.config_path.display(),
        checkpoint = %written.checkpoint_dir.display(),
        files = written.weight_files.len(),
        "Conversion complete"
    );
    Ok(())
}
