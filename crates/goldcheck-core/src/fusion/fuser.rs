//! q/k/v projection fusion.
//!
//! `qkv_weight = cat([q_weight, k_weight, v_weight], dim = 0)`, and likewise
//! for biases. Rows `[0, q)` are the query, `[q, q + kv)` the key and
//! `[q + kv, q + 2kv)` the value projection.

use crate::error::{GoldcheckError, Result};
use crate::model::{FusedQkvConfig, PretrainedModel};
use candle_core::Tensor;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Separate projections of one attention block.
#[derive(Debug, Clone)]
pub struct AttentionProjections {
    /// [q_features, hidden]
    pub q_weight: Tensor,
    /// [kv_features, hidden]
    pub k_weight: Tensor,
    /// [kv_features, hidden]
    pub v_weight: Tensor,
    /// [q_features]
    pub q_bias: Option<Tensor>,
    /// [kv_features]
    pub k_bias: Option<Tensor>,
    /// [kv_features]
    pub v_bias: Option<Tensor>,
}

impl AttentionProjections {
    /// Projections without biases.
    pub fn new(q_weight: Tensor, k_weight: Tensor, v_weight: Tensor) -> Self {
        Self {
            q_weight,
            k_weight,
            v_weight,
            q_bias: None,
            k_bias: None,
            v_bias: None,
        }
    }

    /// Attach biases.
    pub fn with_biases(mut self, q_bias: Tensor, k_bias: Tensor, v_bias: Tensor) -> Self {
        self.q_bias = Some(q_bias);
        self.k_bias = Some(k_bias);
        self.v_bias = Some(v_bias);
        self
    }

    /// Whether the block carries biases. Errors when only some are set.
    pub fn has_bias(&self) -> Result<bool> {
        match (&self.q_bias, &self.k_bias, &self.v_bias) {
            (Some(_), Some(_), Some(_)) => Ok(true),
            (None, None, None) => Ok(false),
            _ => Err(GoldcheckError::ShapeMismatch(
                "only some of the q/k/v biases are present".to_string(),
            )),
        }
    }
}

/// One combined projection replacing q/k/v.
#[derive(Debug, Clone)]
pub struct FusedAttention {
    /// [num_query_features + 2 * num_key_value_features, hidden]
    pub qkv_weight: Tensor,
    /// Concatenated biases, when the block had them.
    pub qkv_bias: Option<Tensor>,
    /// Rows of the query projection.
    pub num_query_features: usize,
    /// Rows of each of the key and value projections.
    pub num_key_value_features: usize,
}

impl FusedAttention {
    /// Split boundaries, as recorded in the converted config.
    pub fn split_config(&self) -> FusedQkvConfig {
        FusedQkvConfig {
            num_query_features: self.num_query_features,
            num_key_value_features: self.num_key_value_features,
        }
    }

    /// Recover the separate projections.
    pub fn split(&self) -> Result<AttentionProjections> {
        let q = self.num_query_features;
        let kv = self.num_key_value_features;
        let rows = |t: &Tensor| -> Result<(Tensor, Tensor, Tensor)> {
            Ok((t.narrow(0, 0, q)?, t.narrow(0, q, kv)?, t.narrow(0, q + kv, kv)?))
        };

        let (q_weight, k_weight, v_weight) = rows(&self.qkv_weight)?;
        let projections = AttentionProjections::new(q_weight, k_weight, v_weight);
        match &self.qkv_bias {
            Some(bias) => {
                let (q_bias, k_bias, v_bias) = rows(bias)?;
                Ok(projections.with_biases(q_bias, k_bias, v_bias))
            }
            None => Ok(projections),
        }
    }
}

/// A fused attention block of a converted checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FusedBlock {
    /// Tensor name prefix, e.g. `model.layers.0.self_attn`.
    pub prefix: String,
    /// Row split of the fused projection.
    pub split: FusedQkvConfig,
    /// Whether a `qkv_proj.bias` was written.
    pub has_bias: bool,
}

/// Tensor map after fusion plus what was fused.
#[derive(Debug, Clone)]
pub struct FusedCheckpoint {
    /// Every tensor of the converted checkpoint.
    pub tensors: BTreeMap<String, Tensor>,
    /// Fused blocks in name order.
    pub blocks: Vec<FusedBlock>,
}

impl FusedCheckpoint {
    /// The split shared by every block, if they agree.
    pub fn common_split(&self) -> Option<FusedQkvConfig> {
        let first = self.blocks.first()?.split;
        self.blocks
            .iter()
            .all(|b| b.split == first)
            .then_some(first)
    }
}

/// Fuses the q/k/v projections of every matching attention block.
#[derive(Debug, Clone)]
pub struct ProjectionFuser {
    module_name: String,
}

impl Default for ProjectionFuser {
    fn default() -> Self {
        Self::new("self_attn")
    }
}

impl ProjectionFuser {
    /// Fuse blocks whose tensor prefix ends with `module_name`.
    pub fn new(module_name: impl Into<String>) -> Self {
        Self {
            module_name: module_name.into(),
        }
    }

    /// Attention module name blocks are matched on.
    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    /// Concatenate one block's projections in q, k, v order.
    pub fn fuse(&self, projections: &AttentionProjections) -> Result<FusedAttention> {
        let (num_query_features, q_in) = projections.q_weight.dims2()?;
        let (num_key_value_features, k_in) = projections.k_weight.dims2()?;
        if projections.v_weight.dims() != projections.k_weight.dims() {
            return Err(GoldcheckError::ShapeMismatch(format!(
                "k_proj {:?} and v_proj {:?} differ",
                projections.k_weight.dims(),
                projections.v_weight.dims()
            )));
        }
        if q_in != k_in {
            return Err(GoldcheckError::ShapeMismatch(format!(
                "q_proj input width {} differs from k_proj input width {}",
                q_in, k_in
            )));
        }

        let qkv_weight = Tensor::cat(
            &[&projections.q_weight, &projections.k_weight, &projections.v_weight],
            0,
        )?;

        let qkv_bias = match (&projections.q_bias, &projections.k_bias, &projections.v_bias) {
            (Some(q), Some(k), Some(v)) => {
                if q.dims() != [num_query_features]
                    || k.dims() != [num_key_value_features]
                    || v.dims() != [num_key_value_features]
                {
                    return Err(GoldcheckError::ShapeMismatch(format!(
                        "bias shapes q={:?} k={:?} v={:?} do not match projections",
                        q.dims(),
                        k.dims(),
                        v.dims()
                    )));
                }
                Some(Tensor::cat(&[q, k, v], 0)?)
            }
            (None, None, None) => None,
            _ => {
                projections.has_bias()?;
                None
            }
        };

        Ok(FusedAttention {
            qkv_weight,
            qkv_bias,
            num_query_features,
            num_key_value_features,
        })
    }

    /// Fuse every matching block of a tensor map.
    ///
    /// The input map is not modified. Tensors outside the fused blocks are
    /// carried over unchanged.
    pub fn fuse_checkpoint(&self, tensors: &BTreeMap<String, Tensor>) -> Result<FusedCheckpoint> {
        let suffix = ".q_proj.weight";
        let prefixes: Vec<String> = tensors
            .keys()
            .filter_map(|name| name.strip_suffix(suffix))
            .filter(|prefix| {
                *prefix == self.module_name
                    || prefix.ends_with(&format!(".{}", self.module_name))
            })
            .map(str::to_string)
            .collect();

        let mut out = tensors.clone();
        let mut blocks = Vec::with_capacity(prefixes.len());
        for prefix in prefixes {
            let mut take =
                |proj: &str, kind: &str| out.remove(&format!("{}.{}.{}", prefix, proj, kind));
            let q_weight = take("q_proj", "weight");
            let k_weight = take("k_proj", "weight");
            let v_weight = take("v_proj", "weight");
            let q_bias = take("q_proj", "bias");
            let k_bias = take("k_proj", "bias");
            let v_bias = take("v_proj", "bias");

            let (q_weight, k_weight, v_weight) = match (q_weight, k_weight, v_weight) {
                (Some(q), Some(k), Some(v)) => (q, k, v),
                _ => {
                    return Err(GoldcheckError::ModelError(format!(
                        "{}: q_proj present without k_proj and v_proj",
                        prefix
                    )))
                }
            };

            let fused = self.fuse(&AttentionProjections {
                q_weight,
                k_weight,
                v_weight,
                q_bias,
                k_bias,
                v_bias,
            })?;
            debug!(
                prefix = %prefix,
                rows = fused.qkv_weight.dims()[0],
                bias = fused.qkv_bias.is_some(),
                "Replacing attention projections"
            );

            out.insert(format!("{}.qkv_proj.weight", prefix), fused.qkv_weight.clone());
            if let Some(bias) = &fused.qkv_bias {
                out.insert(format!("{}.qkv_proj.bias", prefix), bias.clone());
            }
            blocks.push(FusedBlock {
                prefix,
                split: fused.split_config(),
                has_bias: fused.qkv_bias.is_some(),
            });
        }

        info!(blocks = blocks.len(), module = %self.module_name, "Fused attention blocks");
        Ok(FusedCheckpoint {
            tensors: out,
            blocks,
        })
    }

    /// Fuse a whole model and record the split in its config.
    pub fn fuse_model(&self, model: &PretrainedModel) -> Result<PretrainedModel> {
        let fused = self.fuse_checkpoint(&model.tensors)?;
        if fused.blocks.is_empty() {
            return Err(GoldcheckError::ModelError(format!(
                "no `{}` blocks with q/k/v projections found",
                self.module_name
            )));
        }
        let split = fused.common_split().ok_or_else(|| {
            GoldcheckError::ModelError("attention blocks disagree on the q/k/v split".to_string())
        })?;

        let mut config = model.config.clone();
        config.fused_qkv = Some(split);
        Ok(PretrainedModel {
            config,
            tensors: fused.tensors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelConfig;
    use candle_core::{DType, Device};

    fn randn(shape: &[usize]) -> Tensor {
        Tensor::randn(0.0f32, 1.0, shape, &Device::Cpu).unwrap()
    }

    fn projections() -> AttentionProjections {
        AttentionProjections::new(randn(&[8, 6]), randn(&[4, 6]), randn(&[4, 6]))
    }

    #[test]
    fn fuse_stacks_rows() {
        let p = projections();
        let fused = ProjectionFuser::default().fuse(&p).unwrap();

        assert_eq!(fused.qkv_weight.dims(), &[16, 6]);
        assert_eq!(fused.num_query_features, 8);
        assert_eq!(fused.num_key_value_features, 4);
        assert!(fused.qkv_bias.is_none());

        let rows: Vec<Vec<f32>> = fused.qkv_weight.to_vec2().unwrap();
        assert_eq!(rows[..8].to_vec(), p.q_weight.to_vec2::<f32>().unwrap());
        assert_eq!(rows[8..12].to_vec(), p.k_weight.to_vec2::<f32>().unwrap());
        assert_eq!(rows[12..].to_vec(), p.v_weight.to_vec2::<f32>().unwrap());
    }

    #[test]
    fn fuse_biases() {
        let p = projections().with_biases(randn(&[8]), randn(&[4]), randn(&[4]));
        let fused = ProjectionFuser::default().fuse(&p).unwrap();

        let bias: Vec<f32> = fused.qkv_bias.as_ref().unwrap().to_vec1().unwrap();
        assert_eq!(bias.len(), 16);
        assert_eq!(bias[8..12].to_vec(), p.k_bias.unwrap().to_vec1::<f32>().unwrap());
    }

    #[test]
    fn split_recovers_parts() {
        let p = projections().with_biases(randn(&[8]), randn(&[4]), randn(&[4]));
        let back = ProjectionFuser::default().fuse(&p).unwrap().split().unwrap();

        assert_eq!(back.v_weight.to_vec2::<f32>().unwrap(), p.v_weight.to_vec2::<f32>().unwrap());
        assert_eq!(
            back.q_bias.unwrap().to_vec1::<f32>().unwrap(),
            p.q_bias.unwrap().to_vec1::<f32>().unwrap()
        );
    }

    #[test]
    fn shape_errors() {
        let fuser = ProjectionFuser::default();

        let p = AttentionProjections::new(randn(&[8, 6]), randn(&[4, 6]), randn(&[2, 6]));
        assert!(matches!(fuser.fuse(&p), Err(GoldcheckError::ShapeMismatch(_))));

        let p = AttentionProjections::new(randn(&[8, 5]), randn(&[4, 6]), randn(&[4, 6]));
        assert!(matches!(fuser.fuse(&p), Err(GoldcheckError::ShapeMismatch(_))));

        let mut p = projections();
        p.q_bias = Some(randn(&[8]));
        assert!(matches!(fuser.fuse(&p), Err(GoldcheckError::ShapeMismatch(_))));
    }

    #[test]
    fn checkpoint_fusion_is_pure() {
        let mut tensors = BTreeMap::new();
        for layer in 0..2 {
            let p = format!("model.layers.{}.self_attn", layer);
            tensors.insert(format!("{}.q_proj.weight", p), randn(&[8, 6]));
            tensors.insert(format!("{}.k_proj.weight", p), randn(&[4, 6]));
            tensors.insert(format!("{}.v_proj.weight", p), randn(&[4, 6]));
            tensors.insert(format!("{}.o_proj.weight", p), randn(&[6, 8]));
        }
        tensors.insert("model.embed_tokens.weight".to_string(), randn(&[10, 6]));
        // Not an attention block of the target module
        tensors.insert("vision.cross_attn.q_proj.weight".to_string(), randn(&[2, 6]));

        let fused = ProjectionFuser::default().fuse_checkpoint(&tensors).unwrap();

        assert_eq!(tensors.len(), 10);
        assert!(tensors.contains_key("model.layers.0.self_attn.q_proj.weight"));

        assert_eq!(fused.blocks.len(), 2);
        assert_eq!(fused.blocks[1].prefix, "model.layers.1.self_attn");
        assert_eq!(
            fused.common_split(),
            Some(FusedQkvConfig {
                num_query_features: 8,
                num_key_value_features: 4
            })
        );
        assert_eq!(fused.tensors.len(), 6);
        assert!(fused.tensors.contains_key("vision.cross_attn.q_proj.weight"));
        assert!(!fused.tensors.contains_key("model.layers.0.self_attn.k_proj.weight"));
        assert_eq!(
            fused.tensors["model.layers.0.self_attn.qkv_proj.weight"].dims(),
            &[16, 6]
        );
    }

    #[test]
    fn missing_key_projection() {
        let mut tensors = BTreeMap::new();
        tensors.insert("l.self_attn.q_proj.weight".to_string(), randn(&[4, 4]));
        tensors.insert("l.self_attn.v_proj.weight".to_string(), randn(&[4, 4]));
        let err = ProjectionFuser::default().fuse_checkpoint(&tensors).unwrap_err();
        assert!(matches!(err, GoldcheckError::ModelError(_)));
    }

    #[test]
    fn fuse_model_records_split() {
        let config = ModelConfig::tiny();
        let model = PretrainedModel {
            tensors: crate::model::Llama::random_tensors(&config, &Device::Cpu).unwrap(),
            config,
        };
        let fused = ProjectionFuser::default().fuse_model(&model).unwrap();

        assert_eq!(
            fused.config.fused_qkv,
            Some(FusedQkvConfig {
                num_query_features: 16,
                num_key_value_features: 8
            })
        );
        assert!(model.config.fused_qkv.is_none());
        assert_eq!(
            fused.tensors["model.layers.1.self_attn.qkv_proj.weight"].dtype(),
            DType::F32
        );
    }

    #[test]
    fn fuse_model_without_attention() {
        let model = PretrainedModel {
            config: ModelConfig::tiny(),
            tensors: BTreeMap::new(),
        };
        assert!(ProjectionFuser::default().fuse_model(&model).is_err());
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use candle_core::Device;
    use proptest::prelude::*;

    fn matrix(rows: usize, cols: usize, seed: u32) -> Tensor {
        let data: Vec<f32> = (0..rows * cols).map(|i| (i as u32 * 7 + seed) as f32).collect();
        Tensor::from_vec(data, (rows, cols), &Device::Cpu).unwrap()
    }

    proptest! {
        /// Row slices of the fused matrix are exactly the original projections
        #[test]
        fn invariant_fused_rows_are_originals(
            q in 1usize..12,
            kv in 1usize..8,
            hidden in 1usize..10,
            with_bias in any::<bool>(),
        ) {
            let mut p = AttentionProjections::new(
                matrix(q, hidden, 1),
                matrix(kv, hidden, 1000),
                matrix(kv, hidden, 2000),
            );
            if with_bias {
                p = p.with_biases(matrix(1, q, 3).flatten_all().unwrap(),
                                  matrix(1, kv, 4).flatten_all().unwrap(),
                                  matrix(1, kv, 5).flatten_all().unwrap());
            }

            let fused = ProjectionFuser::default().fuse(&p).unwrap();
            prop_assert_eq!(fused.qkv_weight.dims(), &[q + 2 * kv, hidden]);
            prop_assert_eq!(fused.qkv_bias.is_some(), with_bias);

            let back = fused.split().unwrap();
            prop_assert_eq!(
                back.q_weight.to_vec2::<f32>().unwrap(),
                p.q_weight.to_vec2::<f32>().unwrap()
            );
            prop_assert_eq!(
                back.k_weight.to_vec2::<f32>().unwrap(),
                p.k_weight.to_vec2::<f32>().unwrap()
            );
            prop_assert_eq!(
                back.v_weight.to_vec2::<f32>().unwrap(),
                p.v_weight.to_vec2::<f32>().unwrap()
            );
        }
    }
}
