//! Converted checkpoint output.
//!
//! Layout under the output root:
//!
//! ```text
//! <model_dir>/my_config/config.json
//! <model_dir>/<checkpoint_name>/config.json
//! <model_dir>/<checkpoint_name>/model.safetensors                  (small models)
//! <model_dir>/<checkpoint_name>/model-00001-of-0000N.safetensors   (sharded)
//! <model_dir>/<checkpoint_name>/model.safetensors.index.json       (sharded)
//! ```
//!
//! Writes are not atomic.

use crate::error::Result;
use crate::model::{tensor_to_bytes, PretrainedModel};
use safetensors::tensor::TensorView;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::info;

/// Name of the standalone config directory.
pub const CONFIG_DIR: &str = "my_config";
/// Single-file weights name.
pub const SINGLE_FILE: &str = "model.safetensors";
/// Shard index name.
pub const INDEX_FILE: &str = "model.safetensors.index.json";

/// Options for [`CheckpointWriter`].
#[derive(Debug, Clone)]
pub struct WriterOptions {
    /// Largest payload of one safetensors file, in bytes.
    pub max_shard_size: u64,
    /// Directory name of the checkpoint under the output root.
    pub checkpoint_name: String,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            max_shard_size: 5_000_000_000,
            checkpoint_name: "llama2-7b".to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct IndexMetadata {
    total_size: u64,
}

#[derive(Debug, Serialize)]
struct ShardIndex<'a> {
    metadata: IndexMetadata,
    weight_map: BTreeMap<&'a str, String>,
}

/// What was written.
#[derive(Debug, Clone)]
pub struct WrittenCheckpoint {
    /// `<model_dir>/my_config/config.json`
    pub config_path: PathBuf,
    /// `<model_dir>/<checkpoint_name>`
    pub checkpoint_dir: PathBuf,
    /// Safetensors files in shard order.
    pub weight_files: Vec<PathBuf>,
    /// Sum of tensor payload bytes.
    pub total_size: u64,
}

/// Serializes a model's config and parameters.
#[derive(Debug, Clone, Default)]
pub struct CheckpointWriter {
    options: WriterOptions,
}

impl CheckpointWriter {
    /// Create a writer.
    pub fn new(options: WriterOptions) -> Self {
        Self { options }
    }

    /// Get the writer options.
    pub fn options(&self) -> &WriterOptions {
        &self.options
    }

    /// Write `model` under `model_dir`.
    pub fn write(&self, model: &PretrainedModel, model_dir: &Path) -> Result<WrittenCheckpoint> {
        let config_dir = model_dir.join(CONFIG_DIR);
        std::fs::create_dir_all(&config_dir)?;
        let config_path = config_dir.join("config.json");
        model.config.to_file(&config_path)?;

        let checkpoint_dir = model_dir.join(&self.options.checkpoint_name);
        std::fs::create_dir_all(&checkpoint_dir)?;
        model.config.to_file(&checkpoint_dir.join("config.json"))?;

        let mut encoded = Vec::with_capacity(model.tensors.len());
        for (name, tensor) in &model.tensors {
            let (dtype, bytes) = tensor_to_bytes(tensor)?;
            encoded.push((name.as_str(), dtype, tensor.dims().to_vec(), bytes));
        }
        let total_size: u64 = encoded.iter().map(|(_, _, _, b)| b.len() as u64).sum();

        let shards = plan_shards(
            encoded.iter().map(|(_, _, _, b)| b.len() as u64),
            self.options.max_shard_size,
        );
        let metadata: Option<HashMap<String, String>> =
            Some(HashMap::from([("format".to_string(), "pt".to_string())]));

        let num_shards = shards.len();
        let mut weight_files = Vec::with_capacity(num_shards);
        let mut weight_map = BTreeMap::new();
        for (shard_idx, range) in shards.into_iter().enumerate() {
            let file_name = if num_shards == 1 {
                SINGLE_FILE.to_string()
            } else {
                shard_file_name(shard_idx + 1, num_shards)
            };

            let mut views = Vec::with_capacity(range.len());
            for (name, dtype, shape, bytes) in &encoded[range] {
                views.push((name.to_string(), TensorView::new(*dtype, shape.clone(), bytes)?));
                weight_map.insert(*name, file_name.clone());
            }

            let path = checkpoint_dir.join(&file_name);
            safetensors::serialize_to_file(views, &metadata, &path)?;
            weight_files.push(path);
        }

        if num_shards > 1 {
            let index = ShardIndex {
                metadata: IndexMetadata { total_size },
                weight_map,
            };
            std::fs::write(
                checkpoint_dir.join(INDEX_FILE),
                serde_json::to_string_pretty(&index)?,
            )?;
        }

        info!(
            dir = %checkpoint_dir.display(),
            files = weight_files.len(),
            total_size,
            "Wrote checkpoint"
        );

        Ok(WrittenCheckpoint {
            config_path,
            checkpoint_dir,
            weight_files,
            total_size,
        })
    }
}

/// `model-00001-of-00003.safetensors`
pub fn shard_file_name(index: usize, total: usize) -> String {
    format!("model-{:05}-of-{:05}.safetensors", index, total)
}

/// Greedy split of tensors, in order, into shards of at most `max_size`
/// bytes. A tensor larger than the limit gets a shard of its own. Always
/// returns at least one (possibly empty) shard.
fn plan_shards(sizes: impl Iterator<Item = u64>, max_size: u64) -> Vec<std::ops::Range<usize>> {
    let mut shards = Vec::new();
    let mut start = 0;
    let mut current = 0u64;
    let mut count = 0;
    for (idx, size) in sizes.enumerate() {
        if idx > start && current + size > max_size {
            shards.push(start..idx);
            start = idx;
            current = 0;
        }
        current += size;
        count = idx + 1;
    }
    shards.push(start..count);
    shards
}
