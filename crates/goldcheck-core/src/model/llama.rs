//! Llama causal language model.
//!
//! Built from a Hugging Face style tensor map. Attention projections may be
//! stored separately (`q_proj`/`k_proj`/`v_proj`) or fused (`qkv_proj`), as
//! written by [`ProjectionFuser`](crate::fusion::ProjectionFuser).

use super::{
    segment_causal_mask, Attention, DecoderLayer, ModelConfig, QkvProjection, RmsNorm,
    RotaryEmbedding, SwiGluMlp, WeightLoader,
};
use crate::error::{GoldcheckError, Result};
use crate::golden::BatchedInput;
use candle_core::{DType, Device, Tensor};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, trace};

/// A model that maps a batch of token ids to next-token logits.
pub trait CausalLm: Send + Sync {
    /// One forward evaluation.
    ///
    /// Returns f32 logits [batch, seq_len, vocab_size].
    fn forward(&self, input: &BatchedInput) -> Result<Tensor>;

    /// Size of the output vocabulary.
    fn vocab_size(&self) -> usize;
}

/// Llama-architecture decoder.
#[derive(Debug, Clone)]
pub struct Llama {
    config: ModelConfig,
    /// [vocab_size, hidden_size]
    embed_tokens: Tensor,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    /// [vocab_size, hidden_size]
    lm_head: Tensor,
    rope: RotaryEmbedding,
    device: Device,
}

impl Llama {
    /// Load `config.json` and every `.safetensors` file of a directory,
    /// converting floating point weights to `dtype`.
    pub fn load(dir: &Path, dtype: DType, device: &Device) -> Result<Self> {
        let config = ModelConfig::from_file(&dir.join("config.json"))?;
        let weights = WeightLoader::from_dir(dir, device)?.convert_floats(dtype)?;
        info!(
            dir = %dir.display(),
            tensors = weights.len(),
            layers = config.num_hidden_layers,
            dtype = ?dtype,
            "Loading Llama checkpoint"
        );
        Self::from_tensors(config, &weights.into_tensors(), device)
    }

    /// Build the model from named tensors.
    pub fn from_tensors(
        config: ModelConfig,
        tensors: &BTreeMap<String, Tensor>,
        device: &Device,
    ) -> Result<Self> {
        let get = |name: &str| -> Result<Tensor> {
            tensors
                .get(name)
                .cloned()
                .ok_or_else(|| GoldcheckError::ModelError(format!("Tensor not found: {}", name)))
        };

        let embed_tokens = get("model.embed_tokens.weight")?;
        let (vocab_size, hidden_size) = embed_tokens.dims2()?;
        if vocab_size != config.vocab_size || hidden_size != config.hidden_size {
            return Err(GoldcheckError::ShapeMismatch(format!(
                "embed_tokens is {:?}, config expects [{}, {}]",
                embed_tokens.dims(),
                config.vocab_size,
                config.hidden_size
            )));
        }

        let lm_head = match tensors.get("lm_head.weight") {
            Some(head) => head.clone(),
            None => {
                debug!("lm_head.weight absent, tying to embed_tokens");
                embed_tokens.clone()
            }
        };

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for idx in 0..config.num_hidden_layers {
            let prefix = format!("model.layers.{}", idx);
            let qkv = load_qkv(&config, tensors, &prefix)?;
            let attention = Attention::new(
                qkv,
                get(&format!("{}.self_attn.o_proj.weight", prefix))?,
                config.num_attention_heads,
                config.num_kv_heads(),
                config.head_dim(),
            )?;
            let mlp = SwiGluMlp::new(
                get(&format!("{}.mlp.gate_proj.weight", prefix))?,
                get(&format!("{}.mlp.up_proj.weight", prefix))?,
                get(&format!("{}.mlp.down_proj.weight", prefix))?,
            )?;
            layers.push(DecoderLayer::new(
                RmsNorm::new(
                    get(&format!("{}.input_layernorm.weight", prefix))?,
                    config.rms_norm_eps,
                )?,
                attention,
                RmsNorm::new(
                    get(&format!("{}.post_attention_layernorm.weight", prefix))?,
                    config.rms_norm_eps,
                )?,
                mlp,
                idx,
            ));
        }

        let norm = RmsNorm::new(get("model.norm.weight")?, config.rms_norm_eps)?;
        let rope = RotaryEmbedding::new(
            config.head_dim(),
            config.max_position_embeddings,
            config.rope_theta,
            device,
        )?;

        Ok(Self {
            config,
            embed_tokens,
            layers,
            norm,
            lm_head,
            rope,
            device: device.clone(),
        })
    }

    /// Random f32 weights under Hugging Face names (for tests and examples).
    pub fn random_tensors(
        config: &ModelConfig,
        device: &Device,
    ) -> Result<BTreeMap<String, Tensor>> {
        let hidden = config.hidden_size;
        let inter = config.intermediate_size;
        let q_rows = config.num_query_features();
        let kv_rows = config.num_key_value_features();
        let randn = |shape: &[usize]| Tensor::randn(0.0f32, 0.02, shape, device);

        let mut tensors = BTreeMap::new();
        tensors.insert(
            "model.embed_tokens.weight".to_string(),
            randn(&[config.vocab_size, hidden])?,
        );
        tensors.insert("model.norm.weight".to_string(), Tensor::ones(hidden, DType::F32, device)?);
        if !config.tie_word_embeddings {
            tensors.insert("lm_head.weight".to_string(), randn(&[config.vocab_size, hidden])?);
        }
        for idx in 0..config.num_hidden_layers {
            let p = format!("model.layers.{}", idx);
            tensors.insert(format!("{}.self_attn.q_proj.weight", p), randn(&[q_rows, hidden])?);
            tensors.insert(format!("{}.self_attn.k_proj.weight", p), randn(&[kv_rows, hidden])?);
            tensors.insert(format!("{}.self_attn.v_proj.weight", p), randn(&[kv_rows, hidden])?);
            tensors.insert(format!("{}.self_attn.o_proj.weight", p), randn(&[hidden, q_rows])?);
            tensors.insert(format!("{}.mlp.gate_proj.weight", p), randn(&[inter, hidden])?);
            tensors.insert(format!("{}.mlp.up_proj.weight", p), randn(&[inter, hidden])?);
            tensors.insert(format!("{}.mlp.down_proj.weight", p), randn(&[hidden, inter])?);
            tensors.insert(
                format!("{}.input_layernorm.weight", p),
                Tensor::ones(hidden, DType::F32, device)?,
            );
            tensors.insert(
                format!("{}.post_attention_layernorm.weight", p),
                Tensor::ones(hidden, DType::F32, device)?,
            );
        }
        Ok(tensors)
    }

    /// A model with random weights (for tests and examples).
    pub fn random(config: ModelConfig, device: &Device) -> Result<Self> {
        let tensors = Self::random_tensors(&config, device)?;
        Self::from_tensors(config, &tensors, device)
    }

    /// Get the model configuration.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Number of decoder layers.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Get the device.
    pub fn device(&self) -> &Device {
        &self.device
    }
}

/// Separate or fused projections for one layer.
fn load_qkv(
    config: &ModelConfig,
    tensors: &BTreeMap<String, Tensor>,
    prefix: &str,
) -> Result<QkvProjection> {
    let name = |proj: &str, kind: &str| format!("{}.self_attn.{}.{}", prefix, proj, kind);

    if let Some(qkv_proj) = tensors.get(&name("qkv_proj", "weight")) {
        let (num_query_features, num_key_value_features) = match config.fused_qkv {
            Some(split) => (split.num_query_features, split.num_key_value_features),
            None => (config.num_query_features(), config.num_key_value_features()),
        };
        return Ok(QkvProjection::Fused {
            qkv_proj: qkv_proj.clone(),
            qkv_bias: tensors.get(&name("qkv_proj", "bias")).cloned(),
            num_query_features,
            num_key_value_features,
        });
    }

    let weight = |proj: &str| -> Result<Tensor> {
        tensors.get(&name(proj, "weight")).cloned().ok_or_else(|| {
            GoldcheckError::ModelError(format!(
                "Tensor not found: {} (and no fused qkv_proj)",
                name(proj, "weight")
            ))
        })
    };
    let biases = match (
        tensors.get(&name("q_proj", "bias")),
        tensors.get(&name("k_proj", "bias")),
        tensors.get(&name("v_proj", "bias")),
    ) {
        (Some(q), Some(k), Some(v)) => Some((q.clone(), k.clone(), v.clone())),
        (None, None, None) => None,
        _ => {
            return Err(GoldcheckError::ShapeMismatch(format!(
                "{}: only some of the q/k/v biases are present",
                prefix
            )))
        }
    };

    Ok(QkvProjection::Separate {
        q_proj: weight("q_proj")?,
        k_proj: weight("k_proj")?,
        v_proj: weight("v_proj")?,
        biases,
    })
}

impl CausalLm for Llama {
    fn forward(&self, input: &BatchedInput) -> Result<Tensor> {
        let (batch, seq_len) = input.ids.dims2()?;
        let hidden = self.config.hidden_size;

        let mut hidden_states = self
            .embed_tokens
            .index_select(&input.ids.flatten_all()?, 0)?
            .reshape((batch, seq_len, hidden))?;
        let mask = segment_causal_mask(&input.decoder_segment_ids)?;

        for layer in &self.layers {
            hidden_states =
                layer.forward(&hidden_states, &self.rope, &input.decoder_positions, &mask)?;
            trace!(layer = layer.layer_idx(), "Decoder layer done");
        }

        let normed = self
            .norm
            .forward(&hidden_states)?
            .reshape((batch * seq_len, hidden))?;
        let logits = normed
            .matmul(&self.lm_head.t()?)?
            .reshape((batch, seq_len, self.config.vocab_size))?
            .to_dtype(DType::F32)?;

        Ok(logits)
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }
}
