//! Run configuration for the logit checker.
//!
//! Settings are layered: built-in defaults, then an optional JSON file, then
//! `key=value` overrides from the command line. Values on the right-hand side
//! of an override are parsed as JSON when possible (`num_shards=2`,
//! `dtype="bf16"`) and taken as plain strings otherwise (`dtype=bf16`).

use crate::error::{GoldcheckError, Result};
use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

/// Model and run settings shared by every component of a check run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    /// Model name, used to locate the golden data file.
    pub model_name: String,
    /// Directory holding `config.json` and the safetensors weights.
    pub checkpoint_dir: PathBuf,
    /// Directory holding `golden_data_<model_name>.jsonl`.
    pub golden_data_dir: PathBuf,
    /// Rows evaluated by each shard.
    pub per_device_batch_size: usize,
    /// Number of execution shards the batch is split across.
    pub num_shards: usize,
    /// Sequence length every batch row is expected to have.
    pub max_target_length: usize,
    /// Compute precision: `f32`, `f16` or `bf16`.
    pub dtype: String,
    /// `cpu` or `cuda:<ordinal>`.
    pub device: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            model_name: "llama2-7b".to_string(),
            checkpoint_dir: PathBuf::from("checkpoints/llama2-7b"),
            golden_data_dir: PathBuf::from("test_assets"),
            per_device_batch_size: 1,
            num_shards: 1,
            max_target_length: 4,
            dtype: "f32".to_string(),
            device: "cpu".to_string(),
        }
    }
}

impl RunConfig {
    /// Load from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Build a config from pass-through command line arguments.
    ///
    /// An argument without `=` names a JSON config file (at most one);
    /// every `key=value` argument overrides a single field.
    pub fn from_args<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut base = serde_json::to_value(Self::default())?;
        let mut overrides = Vec::new();
        let mut file: Option<PathBuf> = None;

        for arg in args {
            let arg = arg.as_ref();
            match arg.split_once('=') {
                Some((key, value)) => overrides.push((key.to_string(), value.to_string())),
                None => {
                    if let Some(existing) = &file {
                        return Err(GoldcheckError::ConfigError(format!(
                            "more than one config file given: {} and {}",
                            existing.display(),
                            arg
                        )));
                    }
                    file = Some(PathBuf::from(arg));
                }
            }
        }

        if let Some(path) = file {
            let contents = std::fs::read_to_string(&path)?;
            let from_file: Value = serde_json::from_str(&contents)?;
            merge(&mut base, from_file, &path)?;
        }

        let object = base
            .as_object_mut()
            .ok_or_else(|| GoldcheckError::ConfigError("config is not an object".to_string()))?;
        for (key, raw) in overrides {
            let key = key.trim_start_matches("--").to_string();
            if !object.contains_key(&key) {
                return Err(GoldcheckError::ConfigError(format!("unknown config key: {key}")));
            }
            let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
            object.insert(key, value);
        }

        let config: Self = serde_json::from_value(base)
            .map_err(|e| GoldcheckError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no run could use.
    pub fn validate(&self) -> Result<()> {
        if self.per_device_batch_size == 0 {
            return Err(GoldcheckError::ConfigError(
                "per_device_batch_size must be at least 1".to_string(),
            ));
        }
        if self.num_shards == 0 {
            return Err(GoldcheckError::ConfigError("num_shards must be at least 1".to_string()));
        }
        if self.max_target_length == 0 {
            return Err(GoldcheckError::ConfigError(
                "max_target_length must be at least 1".to_string(),
            ));
        }
        parse_dtype(&self.dtype)?;
        Ok(())
    }

    /// Batch rows across all shards.
    pub fn global_batch_size(&self) -> usize {
        self.per_device_batch_size * self.num_shards
    }

    /// Location of the golden data file for this model.
    pub fn golden_data_path(&self) -> PathBuf {
        self.golden_data_dir
            .join(format!("golden_data_{}.jsonl", self.model_name))
    }

    /// Compute precision.
    pub fn dtype(&self) -> Result<DType> {
        parse_dtype(&self.dtype)
    }

    /// Device the model runs on.
    pub fn device(&self) -> Result<Device> {
        parse_device(&self.device)
    }
}

fn merge(base: &mut Value, overlay: Value, source: &Path) -> Result<()> {
    let overlay = match overlay {
        Value::Object(map) => map,
        _ => {
            return Err(GoldcheckError::ConfigError(format!(
                "{} does not contain a JSON object",
                source.display()
            )))
        }
    };
    let base: &mut Map<String, Value> = base
        .as_object_mut()
        .ok_or_else(|| GoldcheckError::ConfigError("config is not an object".to_string()))?;
    for (key, value) in overlay {
        base.insert(key, value);
    }
    Ok(())
}

/// Parse a precision name.
pub fn parse_dtype(name: &str) -> Result<DType> {
    match name.to_ascii_lowercase().as_str() {
        "f32" | "float32" => Ok(DType::F32),
        "f16" | "float16" => Ok(DType::F16),
        "bf16" | "bfloat16" => Ok(DType::BF16),
        other => Err(GoldcheckError::ConfigError(format!("unsupported dtype: {other}"))),
    }
}

/// Parse a device name.
pub fn parse_device(name: &str) -> Result<Device> {
    if name.eq_ignore_ascii_case("cpu") {
        return Ok(Device::Cpu);
    }
    if let Some(ordinal) = name.strip_prefix("cuda") {
        let ordinal = ordinal.trim_start_matches(':');
        let ordinal = if ordinal.is_empty() {
            0
        } else {
            ordinal
                .parse()
                .map_err(|_| GoldcheckError::ConfigError(format!("bad cuda ordinal: {name}")))?
        };
        return Ok(Device::new_cuda(ordinal)?);
    }
    Err(GoldcheckError::ConfigError(format!("unsupported device: {name}")))
}
