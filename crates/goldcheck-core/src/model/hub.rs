//! Pretrained model instantiation, from the Hugging Face Hub or a local
//! directory.

use super::{ModelConfig, WeightLoader};
use crate::error::{GoldcheckError, Result};
use candle_core::{DType, Device, Tensor};
use hf_hub::api::sync::{ApiBuilder, ApiRepo};
use hf_hub::{Repo, RepoType};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// Options applied while instantiating a model.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Precision every floating point tensor is converted to.
    pub dtype: DType,
    /// Attention kernel the serving stack should select.
    pub attn_implementation: String,
    /// Overrides `max_position_embeddings` when set.
    pub max_position_embeddings: Option<usize>,
    /// Value recorded as `use_cache`.
    pub use_cache: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            dtype: DType::BF16,
            attn_implementation: "flash_attention_2".to_string(),
            max_position_embeddings: Some(8192),
            use_cache: false,
        }
    }
}

impl LoadOptions {
    /// Write the options into a configuration.
    pub fn apply(&self, config: &mut ModelConfig) {
        if let Some(max_positions) = self.max_position_embeddings {
            config.max_position_embeddings = max_positions;
        }
        config.set_extra("use_cache", self.use_cache);
        config.set_extra("_attn_implementation", self.attn_implementation.clone());
        config.set_extra("torch_dtype", dtype_name(self.dtype));
    }
}

/// Name of a dtype as written in `config.json`.
fn dtype_name(dtype: DType) -> &'static str {
    match dtype {
        DType::BF16 => "bfloat16",
        DType::F16 => "float16",
        DType::F32 => "float32",
        DType::F64 => "float64",
        _ => "float32",
    }
}

/// A model's configuration and all of its parameters.
#[derive(Debug, Clone)]
pub struct PretrainedModel {
    /// Configuration with load options applied.
    pub config: ModelConfig,
    /// Parameters by Hugging Face name.
    pub tensors: BTreeMap<String, Tensor>,
}

impl PretrainedModel {
    /// Assemble from a config file and safetensors files, applying options.
    pub fn from_files(
        config_path: &Path,
        weight_paths: &[PathBuf],
        options: &LoadOptions,
    ) -> Result<Self> {
        let mut config = ModelConfig::from_file(config_path)?;
        options.apply(&mut config);

        let weights =
            WeightLoader::from_files(weight_paths, &Device::Cpu)?.convert_floats(options.dtype)?;
        info!(
            files = weight_paths.len(),
            tensors = weights.len(),
            dtype = ?options.dtype,
            "Loaded pretrained weights"
        );

        Ok(Self {
            config,
            tensors: weights.into_tensors(),
        })
    }

    /// Load from a local directory holding `config.json` and safetensors.
    pub fn from_dir(dir: &Path, options: &LoadOptions) -> Result<Self> {
        let weight_paths = WeightLoader::list_dir(dir)?;
        Self::from_files(&dir.join("config.json"), &weight_paths, options)
    }
}

const INDEX_FILE: &str = "model.safetensors.index.json";
const SINGLE_FILE: &str = "model.safetensors";

/// `model.safetensors.index.json`
#[derive(Debug, Deserialize)]
struct ShardIndex {
    weight_map: BTreeMap<String, String>,
}

impl ShardIndex {
    /// Distinct shard file names, sorted.
    fn shard_files(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.weight_map.values().map(String::as_str).collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}

/// How a repository stores its weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WeightLayout {
    Sharded,
    Single,
}

/// Pick the weight layout from a repository file listing. The index wins
/// when both are present.
fn weight_layout<'a>(files: impl IntoIterator<Item = &'a str>) -> Result<WeightLayout> {
    let mut single = false;
    for file in files {
        match file {
            INDEX_FILE => return Ok(WeightLayout::Sharded),
            SINGLE_FILE => single = true,
            _ => {}
        }
    }
    if single {
        Ok(WeightLayout::Single)
    } else {
        Err(GoldcheckError::ModelError(format!(
            "repository has neither {} nor {}",
            INDEX_FILE, SINGLE_FILE
        )))
    }
}

/// Downloads a model from the Hugging Face Hub.
#[derive(Debug, Clone)]
pub struct HubModelLoader {
    model_id: String,
    revision: String,
    token: Option<String>,
}

impl HubModelLoader {
    /// Create a loader for `model_id` at the `main` revision.
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            revision: "main".to_string(),
            token: None,
        }
    }

    /// Pin a revision (branch, tag or commit).
    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = revision.into();
        self
    }

    /// Access token for gated repositories.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Repository id, e.g. `meta-llama/Llama-2-7b-hf`.
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    fn repo(&self) -> Result<ApiRepo> {
        let api = ApiBuilder::new().with_token(self.token.clone()).build()?;
        Ok(api.repo(Repo::with_revision(
            self.model_id.clone(),
            RepoType::Model,
            self.revision.clone(),
        )))
    }

    /// Download (or reuse from the local cache) and instantiate the model.
    pub fn load(&self, options: &LoadOptions) -> Result<PretrainedModel> {
        info!(model = %self.model_id, revision = %self.revision, "Fetching model from the Hub");
        let repo = self.repo()?;
        let listing = repo.info()?;
        let layout = weight_layout(listing.siblings.iter().map(|s| s.rfilename.as_str()))?;
        let config_path = repo.get("config.json")?;

        let weight_paths = match layout {
            WeightLayout::Sharded => {
                let index: ShardIndex =
                    serde_json::from_str(&std::fs::read_to_string(repo.get(INDEX_FILE)?)?)?;
                let shard_names = index.shard_files();
                info!(shards = shard_names.len(), "Model is sharded");

                let mut paths = Vec::with_capacity(shard_names.len());
                for shard in shard_names {
                    paths.push(repo.get(shard)?);
                }
                paths
            }
            WeightLayout::Single => vec![repo.get(SINGLE_FILE)?],
        };

        PretrainedModel::from_files(&config_path, &weight_paths, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tensor_to_bytes;
    use safetensors::tensor::TensorView;

    fn write_checkpoint(dir: &Path) {
        ModelConfig::tiny().to_file(&dir.join("config.json")).unwrap();
        let w = Tensor::new(&[[1.0f32, 2.0], [3.0, 4.0]], &Device::Cpu).unwrap();
        let (dtype, bytes) = tensor_to_bytes(&w).unwrap();
        let views = vec![(
            "model.norm.weight".to_string(),
            TensorView::new(dtype, vec![2, 2], &bytes).unwrap(),
        )];
        safetensors::serialize_to_file(views, &None, &dir.join("model.safetensors")).unwrap();
    }

    #[test]
    fn options_written_into_config() {
        let mut config = ModelConfig::tiny();
        LoadOptions::default().apply(&mut config);

        assert_eq!(config.max_position_embeddings, 8192);
        assert_eq!(config.extra["use_cache"], false);
        assert_eq!(config.extra["_attn_implementation"], "flash_attention_2");
        assert_eq!(config.extra["torch_dtype"], "bfloat16");
    }

    #[test]
    fn keeps_max_positions_without_override() {
        let mut config = ModelConfig::tiny();
        let options = LoadOptions {
            max_position_embeddings: None,
            ..LoadOptions::default()
        };
        options.apply(&mut config);
        assert_eq!(config.max_position_embeddings, 64);
    }

    #[test]
    fn local_directory_converted_to_dtype() {
        let dir = tempfile::tempdir().unwrap();
        write_checkpoint(dir.path());

        let model = PretrainedModel::from_dir(dir.path(), &LoadOptions::default()).unwrap();
        assert_eq!(model.tensors.len(), 1);
        assert_eq!(model.tensors["model.norm.weight"].dtype(), DType::BF16);
        assert_eq!(model.config.max_position_embeddings, 8192);
    }

    #[test]
    fn local_directory_without_weights() {
        let dir = tempfile::tempdir().unwrap();
        ModelConfig::tiny().to_file(&dir.path().join("config.json")).unwrap();
        assert!(PretrainedModel::from_dir(dir.path(), &LoadOptions::default()).is_err());
    }

    #[test]
    fn layout_from_listing() {
        let sharded = ["config.json", "model-00001-of-00002.safetensors", INDEX_FILE];
        assert_eq!(weight_layout(sharded).unwrap(), WeightLayout::Sharded);

        let both = [SINGLE_FILE, INDEX_FILE];
        assert_eq!(weight_layout(both).unwrap(), WeightLayout::Sharded);

        let single = ["config.json", SINGLE_FILE, "tokenizer.json"];
        assert_eq!(weight_layout(single).unwrap(), WeightLayout::Single);

        let err = weight_layout(["config.json", "pytorch_model.bin"]).unwrap_err();
        assert!(matches!(err, GoldcheckError::ModelError(_)));
    }

    #[test]
    fn shard_files_deduplicated() {
        let index: ShardIndex = serde_json::from_str(
            r#"{"weight_map": {
                "a": "model-00002-of-00002.safetensors",
                "b": "model-00001-of-00002.safetensors",
                "c": "model-00002-of-00002.safetensors"
            }}"#,
        )
        .unwrap();
        assert_eq!(
            index.shard_files(),
            vec![
                "model-00001-of-00002.safetensors",
                "model-00002-of-00002.safetensors"
            ]
        );
    }

    #[test]
    fn hub_loader_builder() {
        let loader = HubModelLoader::new("meta-llama/Llama-2-7b-hf")
            .with_revision("refs/pr/1")
            .with_token("hf_xxx");
        assert_eq!(loader.model_id(), "meta-llama/Llama-2-7b-hf");
        assert_eq!(loader.revision, "refs/pr/1");
        assert_eq!(loader.token.as_deref(), Some("hf_xxx"));
    }
}
