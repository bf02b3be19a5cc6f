//! SafeTensors weight loading.
//!
//! Loads every tensor of a checkpoint into memory, keyed by its Hugging Face
//! name (`model.layers.0.self_attn.q_proj.weight`, ...).
//!
//! # Example
//!
//! ```ignore
//! use goldcheck_core::model::WeightLoader;
//!
//! let loader = WeightLoader::from_dir(Path::new("/path/to/model"), &Device::Cpu)?;
//! let tensor = loader.get_tensor("model.embed_tokens.weight")?;
//! ```

use crate::error::{GoldcheckError, Result};
use candle_core::{DType, Device, Tensor};
use safetensors::SafeTensors;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Weight loader for SafeTensors format.
#[derive(Debug)]
pub struct WeightLoader {
    /// Loaded tensors indexed by name.
    tensors: BTreeMap<String, Tensor>,
    /// Device for loaded tensors.
    device: Device,
}

impl WeightLoader {
    /// Create a new weight loader from a model directory.
    ///
    /// Loads all .safetensors files in the directory.
    pub fn from_dir(dir: &Path, device: &Device) -> Result<Self> {
        Self::from_files(&Self::list_dir(dir)?, device)
    }

    /// Sorted `.safetensors` files directly under `dir`. Errors when there
    /// are none.
    pub fn list_dir(dir: &Path) -> Result<Vec<PathBuf>> {
        let mut safetensor_files: Vec<PathBuf> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().map_or(false, |e| e == "safetensors") {
                safetensor_files.push(path);
            }
        }

        if safetensor_files.is_empty() {
            return Err(GoldcheckError::ModelError(format!(
                "No .safetensors files found in {}",
                dir.display()
            )));
        }
        safetensor_files.sort();
        Ok(safetensor_files)
    }

    /// Create a weight loader from a list of files (e.g. the shards of one checkpoint).
    pub fn from_files(paths: &[PathBuf], device: &Device) -> Result<Self> {
        let mut paths = paths.to_vec();
        // Sort for deterministic loading order
        paths.sort();

        let mut tensors = BTreeMap::new();
        for path in &paths {
            tensors.extend(Self::load_safetensors_file(path, device)?);
        }

        Ok(Self {
            tensors,
            device: device.clone(),
        })
    }

    /// Create a weight loader from a single file.
    pub fn from_file(path: &Path, device: &Device) -> Result<Self> {
        Self::from_files(&[path.to_path_buf()], device)
    }

    /// Load tensors from a single safetensors file.
    fn load_safetensors_file(path: &Path, device: &Device) -> Result<BTreeMap<String, Tensor>> {
        let data = fs::read(path)?;
        let safetensors = SafeTensors::deserialize(&data).map_err(|e| {
            GoldcheckError::ModelError(format!("Failed to deserialize {}: {}", path.display(), e))
        })?;

        let mut tensors = BTreeMap::new();
        for (name, view) in safetensors.tensors() {
            let tensor = view_to_tensor(&view, device)?;
            tensors.insert(name.to_string(), tensor);
        }

        Ok(tensors)
    }

    /// Get a tensor by name.
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    /// Get a tensor by name, returning an error if not found.
    pub fn get_tensor(&self, name: &str) -> Result<Tensor> {
        self.tensors
            .get(name)
            .cloned()
            .ok_or_else(|| GoldcheckError::ModelError(format!("Tensor not found: {}", name)))
    }

    /// Check if a tensor exists.
    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    /// Get all tensor names, sorted.
    pub fn tensor_names(&self) -> Vec<&str> {
        self.tensors.keys().map(|s| s.as_str()).collect()
    }

    /// Get the number of loaded tensors.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Check if no tensors are loaded.
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Get the device tensors are loaded to.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Convert every floating point tensor to `dtype`. Integer tensors are kept.
    pub fn convert_floats(self, dtype: DType) -> Result<Self> {
        let mut tensors = BTreeMap::new();
        for (name, tensor) in self.tensors {
            let tensor = if tensor.dtype().is_float() && tensor.dtype() != dtype {
                tensor.to_dtype(dtype)?
            } else {
                tensor
            };
            tensors.insert(name, tensor);
        }
        Ok(Self {
            tensors,
            device: self.device,
        })
    }

    /// Take ownership of the loaded tensors.
    pub fn into_tensors(self) -> BTreeMap<String, Tensor> {
        self.tensors
    }
}

/// Convert a SafeTensors view to a Candle tensor.
pub fn view_to_tensor(view: &safetensors::tensor::TensorView, device: &Device) -> Result<Tensor> {
    let shape: Vec<usize> = view.shape().to_vec();
    let data = view.data();

    let tensor = match view.dtype() {
        safetensors::Dtype::F32 => {
            let values: Vec<f32> = bytemuck::pod_collect_to_vec(data);
            Tensor::from_vec(values, shape, device)?
        }
        safetensors::Dtype::F16 => {
            let values: Vec<half::f16> = bytemuck::pod_collect_to_vec(data);
            Tensor::from_vec(values, shape, device)?
        }
        safetensors::Dtype::BF16 => {
            let values: Vec<half::bf16> = bytemuck::pod_collect_to_vec(data);
            Tensor::from_vec(values, shape, device)?
        }
        safetensors::Dtype::I64 => {
            let values: Vec<i64> = bytemuck::pod_collect_to_vec(data);
            Tensor::from_vec(values, shape, device)?
        }
        safetensors::Dtype::I32 => {
            // Candle has no I32, upcast
            let values: Vec<i32> = bytemuck::pod_collect_to_vec(data);
            let values: Vec<i64> = values.into_iter().map(i64::from).collect();
            Tensor::from_vec(values, shape, device)?
        }
        safetensors::Dtype::U32 => {
            let values: Vec<u32> = bytemuck::pod_collect_to_vec(data);
            Tensor::from_vec(values, shape, device)?
        }
        safetensors::Dtype::U8 => Tensor::from_slice(data, shape, device)?,
        other => {
            return Err(GoldcheckError::ModelError(format!(
                "Unsupported dtype: {:?}",
                other
            )));
        }
    };

    Ok(tensor)
}

/// Raw little-endian bytes of a tensor, with its SafeTensors dtype.
pub fn tensor_to_bytes(tensor: &Tensor) -> Result<(safetensors::Dtype, Vec<u8>)> {
    let flat = tensor.flatten_all()?;
    let encoded: (safetensors::Dtype, Vec<u8>) = match tensor.dtype() {
        DType::F32 => (
            safetensors::Dtype::F32,
            bytemuck::cast_slice(&flat.to_vec1::<f32>()?).to_vec(),
        ),
        DType::F16 => (
            safetensors::Dtype::F16,
            bytemuck::cast_slice(&flat.to_vec1::<half::f16>()?).to_vec(),
        ),
        DType::BF16 => (
            safetensors::Dtype::BF16,
            bytemuck::cast_slice(&flat.to_vec1::<half::bf16>()?).to_vec(),
        ),
        DType::I64 => (
            safetensors::Dtype::I64,
            bytemuck::cast_slice(&flat.to_vec1::<i64>()?).to_vec(),
        ),
        DType::U32 => (
            safetensors::Dtype::U32,
            bytemuck::cast_slice(&flat.to_vec1::<u32>()?).to_vec(),
        ),
        DType::U8 => (safetensors::Dtype::U8, flat.to_vec1::<u8>()?),
        other => {
            return Err(GoldcheckError::ModelError(format!(
                "Unsupported dtype for serialization: {:?}",
                other
            )));
        }
    };
    Ok(encoded)
}
