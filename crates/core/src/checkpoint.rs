//! Checkpoint loading and state-dict surgery.
//!
//! Two checkpoints (a base diffusion checkpoint and a specialized
//! restoration checkpoint) are merged into one dictionary, partitioned into
//! per-submodule shards by key prefix, remapped where the checkpoint layout
//! differs from the model library's, cast to the working precision, and
//! optionally stored 8-bit quantized for the largest shard.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use anyhow::{bail, Context, Result};
use candle_core::quantized::{GgmlDType, QTensor};
use candle_core::{DType, Device, Tensor};
use candle_transformers::models::stable_diffusion::clip;
use tracing::{debug, info};

pub const DIFFUSION_PREFIX: &str = "model.diffusion_model.";
pub const CONTROL_PREFIX: &str = "model.control_model.";
pub const FIRST_STAGE_PREFIX: &str = "first_stage_model.";
pub const CLIP_PRIMARY_PREFIX: &str = "conditioner.embedders.0.transformer.";
pub const CLIP_SECONDARY_PREFIX: &str = "conditioner.embedders.1.model.";

/// Load a serialized weight dictionary onto the host.
///
/// Shards stay CPU-resident; device copies are made per stage when the
/// stage is built.
pub fn load_checkpoint(path: &Path) -> Result<HashMap<String, Tensor>> {
    let tensors = candle_core::safetensors::load(path, &Device::Cpu)
        .with_context(|| format!("failed to load checkpoint: {}", path.display()))?;
    info!(
        checkpoint = %path.display(),
        tensors = tensors.len(),
        "loaded checkpoint"
    );
    Ok(tensors)
}

/// Merge two state dicts. Keys present in `overlay` override `base`.
pub fn merge_state_dicts(
    base: HashMap<String, Tensor>,
    overlay: HashMap<String, Tensor>,
) -> HashMap<String, Tensor> {
    let mut merged = base;
    for (key, tensor) in overlay {
        merged.insert(key, tensor);
    }
    merged
}

/// Strip `prefix` from matching keys. When `keep_unmatched` is false,
/// non-matching keys are dropped entirely (prefix filtering); otherwise they
/// are carried over unchanged.
pub fn strip_prefix(
    map: &HashMap<String, Tensor>,
    prefix: &str,
    keep_unmatched: bool,
) -> HashMap<String, Tensor> {
    let mut out = HashMap::new();
    for (key, tensor) in map {
        if let Some(stripped) = key.strip_prefix(prefix) {
            out.insert(stripped.to_string(), tensor.clone());
        } else if keep_unmatched {
            out.insert(key.clone(), tensor.clone());
        }
    }
    out
}

fn ensure_nonempty(shard: &HashMap<String, Tensor>, what: &str) -> Result<()> {
    if shard.is_empty() {
        bail!("checkpoint is missing all '{what}' keys after prefix filtering");
    }
    Ok(())
}

fn ensure_key<'a>(
    shard: &'a HashMap<String, Tensor>,
    key: &str,
    what: &str,
) -> Result<&'a Tensor> {
    shard
        .get(key)
        .with_context(|| format!("checkpoint is missing required {what} key '{key}'"))
}

/// The merged checkpoint partitioned into per-submodule shards.
pub struct CheckpointShards {
    pub diffusion: HashMap<String, Tensor>,
    pub control: HashMap<String, Tensor>,
    pub first_stage: HashMap<String, Tensor>,
    /// Primary text tower, already in the model library's key layout.
    pub clip_primary: HashMap<String, Tensor>,
    /// Secondary text tower in the checkpoint's native (fused-attention)
    /// layout; remap with [`remap_secondary_tower`] before use.
    pub clip_secondary_raw: HashMap<String, Tensor>,
}

pub fn partition_merged(merged: &HashMap<String, Tensor>) -> Result<CheckpointShards> {
    let control = strip_prefix(merged, CONTROL_PREFIX, false);
    let diffusion = strip_prefix(merged, DIFFUSION_PREFIX, false);
    let first_stage = strip_prefix(merged, FIRST_STAGE_PREFIX, false);
    let clip_primary = strip_prefix(merged, CLIP_PRIMARY_PREFIX, false);
    let clip_secondary_raw = strip_prefix(merged, CLIP_SECONDARY_PREFIX, false);

    ensure_nonempty(&diffusion, "diffusion backbone")?;
    ensure_nonempty(&control, "control backbone")?;
    ensure_nonempty(&first_stage, "first-stage codec")?;
    ensure_nonempty(&clip_primary, "primary text tower")?;
    ensure_nonempty(&clip_secondary_raw, "secondary text tower")?;
    ensure_key(
        &clip_primary,
        "text_model.embeddings.token_embedding.weight",
        "primary text tower",
    )?;

    debug!(
        diffusion = diffusion.len(),
        control = control.len(),
        first_stage = first_stage.len(),
        clip_primary = clip_primary.len(),
        clip_secondary = clip_secondary_raw.len(),
        "partitioned merged checkpoint"
    );

    Ok(CheckpointShards {
        diffusion,
        control,
        first_stage,
        clip_primary,
        clip_secondary_raw,
    })
}

/// Architecture of the secondary text tower, inferred from tensor shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextTowerSpec {
    pub embed_dim: usize,
    pub context_length: usize,
    pub vocab_size: usize,
    pub width: usize,
    pub heads: usize,
    pub layers: usize,
}

/// Reconstruct the secondary tower's hyperparameters from its state dict:
/// projection width, positional-embedding length, token-embedding rows,
/// final-norm width, heads at 64 channels each, and the residual-block
/// count from the key set.
pub fn infer_text_tower_spec(sd: &HashMap<String, Tensor>) -> Result<TextTowerSpec> {
    let projection = ensure_key(sd, "text_projection", "secondary text tower")?;
    let positional = ensure_key(sd, "positional_embedding", "secondary text tower")?;
    let token = ensure_key(sd, "token_embedding.weight", "secondary text tower")?;
    let ln_final = ensure_key(sd, "ln_final.weight", "secondary text tower")?;

    let embed_dim = projection.dim(1)?;
    let context_length = positional.dim(0)?;
    let vocab_size = token.dim(0)?;
    let width = ln_final.dim(0)?;
    if width % 64 != 0 {
        bail!("secondary text tower width {width} is not divisible by the 64-channel head size");
    }

    let mut block_indices = BTreeSet::new();
    for key in sd.keys() {
        if let Some(rest) = key.strip_prefix("transformer.resblocks.") {
            if let Some((index, _)) = rest.split_once('.') {
                let index: usize = index
                    .parse()
                    .with_context(|| format!("malformed residual-block key '{key}'"))?;
                block_indices.insert(index);
            }
        }
    }
    if block_indices.is_empty() {
        bail!("secondary text tower has no 'transformer.resblocks' keys");
    }

    Ok(TextTowerSpec {
        embed_dim,
        context_length,
        vocab_size,
        width,
        heads: width / 64,
        layers: block_indices.len(),
    })
}

impl TextTowerSpec {
    /// Select the model library's config matching the inferred geometry.
    ///
    /// The library parameterizes its text towers by family; reconstruction
    /// therefore validates the checkpoint's shapes against the known family
    /// rather than trusting them blindly.
    pub fn clip_config(&self) -> Result<clip::Config> {
        match (self.width, self.layers) {
            (1280, 32) => Ok(clip::Config::sdxl2()),
            (width, layers) => bail!(
                "unsupported secondary text tower geometry: width {width} with {layers} layers"
            ),
        }
    }
}

/// Remap the secondary tower from the checkpoint's fused-attention layout to
/// the model library's layout. Fused `in_proj` tensors are split row-wise
/// into separate q/k/v projections.
pub fn remap_secondary_tower(
    sd: &HashMap<String, Tensor>,
    spec: &TextTowerSpec,
) -> Result<HashMap<String, Tensor>> {
    let width = spec.width;
    let mut out = HashMap::new();

    for (key, tensor) in sd {
        let mapped: Option<String> = match key.as_str() {
            "token_embedding.weight" => {
                Some("text_model.embeddings.token_embedding.weight".to_string())
            }
            "positional_embedding" => {
                Some("text_model.embeddings.position_embedding.weight".to_string())
            }
            "ln_final.weight" => Some("text_model.final_layer_norm.weight".to_string()),
            "ln_final.bias" => Some("text_model.final_layer_norm.bias".to_string()),
            // The projection and any vision-side leftovers have no
            // counterpart in the text-only tower.
            "text_projection" | "logit_scale" => None,
            other => {
                let Some(rest) = other.strip_prefix("transformer.resblocks.") else {
                    continue;
                };
                let Some((index, field)) = rest.split_once('.') else {
                    continue;
                };
                let layer = format!("text_model.encoder.layers.{index}");
                match field {
                    "ln_1.weight" => Some(format!("{layer}.layer_norm1.weight")),
                    "ln_1.bias" => Some(format!("{layer}.layer_norm1.bias")),
                    "ln_2.weight" => Some(format!("{layer}.layer_norm2.weight")),
                    "ln_2.bias" => Some(format!("{layer}.layer_norm2.bias")),
                    "mlp.c_fc.weight" => Some(format!("{layer}.mlp.fc1.weight")),
                    "mlp.c_fc.bias" => Some(format!("{layer}.mlp.fc1.bias")),
                    "mlp.c_proj.weight" => Some(format!("{layer}.mlp.fc2.weight")),
                    "mlp.c_proj.bias" => Some(format!("{layer}.mlp.fc2.bias")),
                    "attn.out_proj.weight" => Some(format!("{layer}.self_attn.out_proj.weight")),
                    "attn.out_proj.bias" => Some(format!("{layer}.self_attn.out_proj.bias")),
                    "attn.in_proj_weight" | "attn.in_proj_bias" => {
                        let suffix = if field.ends_with("weight") {
                            "weight"
                        } else {
                            "bias"
                        };
                        if tensor.dim(0)? != 3 * width {
                            bail!(
                                "fused attention tensor '{key}' has {} rows, expected {}",
                                tensor.dim(0)?,
                                3 * width
                            );
                        }
                        for (slot, proj) in ["q_proj", "k_proj", "v_proj"].iter().enumerate() {
                            let part = tensor.narrow(0, slot * width, width)?;
                            out.insert(format!("{layer}.self_attn.{proj}.{suffix}"), part);
                        }
                        None
                    }
                    _ => None,
                }
            }
        };

        if let Some(mapped) = mapped {
            out.insert(mapped, tensor.clone());
        }
    }

    ensure_key(
        &out,
        "text_model.embeddings.token_embedding.weight",
        "remapped secondary text tower",
    )?;
    Ok(out)
}

/// Cast every floating tensor to `dtype`; integer tensors (index buffers)
/// are left alone.
pub fn cast_state_dict(
    map: HashMap<String, Tensor>,
    dtype: DType,
) -> Result<HashMap<String, Tensor>> {
    let mut out = HashMap::with_capacity(map.len());
    for (key, tensor) in map {
        let cast = match tensor.dtype() {
            DType::F16 | DType::BF16 | DType::F32 | DType::F64 => tensor.to_dtype(dtype)?,
            _ => tensor,
        };
        out.insert(key, cast);
    }
    Ok(out)
}

const QUANT_BLOCK: usize = 32;

enum StoredTensor {
    Plain(Tensor),
    Quantized(QTensor),
}

/// Host-resident weight shard with optional 8-bit storage.
///
/// Only rank-2 matrices whose inner dimension fits the block size are
/// quantized; convolution kernels, norms, and biases keep the working dtype.
pub struct WeightStore {
    entries: HashMap<String, StoredTensor>,
    quantized: usize,
}

impl WeightStore {
    pub fn plain(map: HashMap<String, Tensor>) -> Self {
        let entries = map
            .into_iter()
            .map(|(k, t)| (k, StoredTensor::Plain(t)))
            .collect();
        Self {
            entries,
            quantized: 0,
        }
    }

    pub fn quantized(map: HashMap<String, Tensor>) -> Result<Self> {
        let mut entries = HashMap::with_capacity(map.len());
        let mut quantized = 0;
        for (key, tensor) in map {
            let eligible = tensor.rank() == 2
                && tensor.dim(1)? % QUANT_BLOCK == 0
                && matches!(
                    tensor.dtype(),
                    DType::F16 | DType::BF16 | DType::F32 | DType::F64
                );
            if eligible {
                let qt = QTensor::quantize(&tensor.to_dtype(DType::F32)?, GgmlDType::Q8_0)
                    .with_context(|| format!("failed to quantize weight '{key}'"))?;
                entries.insert(key, StoredTensor::Quantized(qt));
                quantized += 1;
            } else {
                entries.insert(key, StoredTensor::Plain(tensor));
            }
        }
        debug!(quantized, total = entries.len(), "built 8-bit weight store");
        Ok(Self { entries, quantized })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn quantized_count(&self) -> usize {
        self.quantized
    }

    /// Produce a plain state dict in the working dtype on the given device,
    /// dequantizing 8-bit entries on the way.
    pub fn materialize(&self, dtype: DType, device: &Device) -> Result<HashMap<String, Tensor>> {
        let mut out = HashMap::with_capacity(self.entries.len());
        for (key, stored) in &self.entries {
            let tensor = match stored {
                StoredTensor::Plain(t) => t.to_device(device)?.to_dtype(dtype)?,
                StoredTensor::Quantized(qt) => qt.dequantize(device)?.to_dtype(dtype)?,
            };
            out.insert(key.clone(), tensor);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn t(device: &Device, shape: (usize, usize), fill: f32) -> Tensor {
        Tensor::full(fill, shape, device).expect("tensor should build")
    }

    fn vec1(device: &Device, len: usize, fill: f32) -> Tensor {
        Tensor::full(fill, len, device).expect("tensor should build")
    }

    #[test]
    fn test_merge_later_checkpoint_wins() {
        let device = Device::Cpu;
        let mut base = HashMap::new();
        base.insert("shared".to_string(), t(&device, (2, 2), 1.0));
        base.insert("base_only".to_string(), t(&device, (2, 2), 2.0));
        let mut overlay = HashMap::new();
        overlay.insert("shared".to_string(), t(&device, (2, 2), 9.0));
        overlay.insert("overlay_only".to_string(), t(&device, (2, 2), 3.0));

        let merged = merge_state_dicts(base, overlay);
        assert_eq!(merged.len(), 3);
        let shared = merged["shared"]
            .flatten_all()
            .expect("flatten")
            .to_vec1::<f32>()
            .expect("vec");
        assert_eq!(shared, vec![9.0; 4]);
    }

    #[test]
    fn test_strip_prefix_filters_or_keeps() {
        let device = Device::Cpu;
        let mut map = HashMap::new();
        map.insert("pre.a".to_string(), t(&device, (1, 1), 0.0));
        map.insert("pre.b".to_string(), t(&device, (1, 1), 0.0));
        map.insert("other.c".to_string(), t(&device, (1, 1), 0.0));

        let filtered = strip_prefix(&map, "pre.", false);
        assert_eq!(filtered.len(), 2);
        assert!(filtered.contains_key("a"));
        assert!(filtered.contains_key("b"));

        let kept = strip_prefix(&map, "pre.", true);
        assert_eq!(kept.len(), 3);
        assert!(kept.contains_key("other.c"));
    }

    #[test]
    fn test_load_checkpoint_names_missing_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nope.safetensors");
        let err = load_checkpoint(&path).expect_err("missing file should error");
        assert!(err.to_string().contains("failed to load checkpoint"));
        assert!(err.to_string().contains("nope.safetensors"));
    }

    #[test]
    fn test_load_checkpoint_roundtrip() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("tiny.safetensors");
        let device = Device::Cpu;
        let mut map = HashMap::new();
        map.insert("w".to_string(), t(&device, (2, 3), 1.5));
        candle_core::safetensors::save(&map, &path).expect("save checkpoint");

        let loaded = load_checkpoint(&path).expect("load checkpoint");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded["w"].dims2().expect("dims"), (2, 3));
    }

    fn synthetic_secondary_tower(device: &Device, width: usize, layers: usize) -> HashMap<String, Tensor> {
        let mut sd = HashMap::new();
        sd.insert("text_projection".to_string(), t(device, (width, width / 2), 0.1));
        sd.insert("positional_embedding".to_string(), t(device, (77, width), 0.1));
        sd.insert("token_embedding.weight".to_string(), t(device, (1000, width), 0.1));
        sd.insert("ln_final.weight".to_string(), vec1(device, width, 1.0));
        sd.insert("ln_final.bias".to_string(), vec1(device, width, 0.0));
        sd.insert("logit_scale".to_string(), vec1(device, 1, 1.0));
        for i in 0..layers {
            let p = format!("transformer.resblocks.{i}");
            sd.insert(format!("{p}.ln_1.weight"), vec1(device, width, 1.0));
            sd.insert(format!("{p}.ln_1.bias"), vec1(device, width, 0.0));
            sd.insert(format!("{p}.ln_2.weight"), vec1(device, width, 1.0));
            sd.insert(format!("{p}.ln_2.bias"), vec1(device, width, 0.0));
            sd.insert(format!("{p}.attn.in_proj_weight"), t(device, (3 * width, width), 0.2));
            sd.insert(format!("{p}.attn.in_proj_bias"), vec1(device, 3 * width, 0.0));
            sd.insert(format!("{p}.attn.out_proj.weight"), t(device, (width, width), 0.2));
            sd.insert(format!("{p}.attn.out_proj.bias"), vec1(device, width, 0.0));
            sd.insert(format!("{p}.mlp.c_fc.weight"), t(device, (4 * width, width), 0.2));
            sd.insert(format!("{p}.mlp.c_fc.bias"), vec1(device, 4 * width, 0.0));
            sd.insert(format!("{p}.mlp.c_proj.weight"), t(device, (width, 4 * width), 0.2));
            sd.insert(format!("{p}.mlp.c_proj.bias"), vec1(device, width, 0.0));
        }
        sd
    }

    #[test]
    fn test_infer_text_tower_spec_from_shapes() {
        let device = Device::Cpu;
        let sd = synthetic_secondary_tower(&device, 128, 3);
        let spec = infer_text_tower_spec(&sd).expect("infer spec");
        assert_eq!(
            spec,
            TextTowerSpec {
                embed_dim: 64,
                context_length: 77,
                vocab_size: 1000,
                width: 128,
                heads: 2,
                layers: 3,
            }
        );
    }

    #[test]
    fn test_clip_config_validates_tower_geometry() {
        let known = TextTowerSpec {
            embed_dim: 1280,
            context_length: 77,
            vocab_size: 49408,
            width: 1280,
            heads: 20,
            layers: 32,
        };
        let cfg = known.clip_config().expect("known geometry");
        assert_eq!(cfg.max_position_embeddings, 77);

        let unknown = TextTowerSpec {
            embed_dim: 64,
            context_length: 77,
            vocab_size: 1000,
            width: 128,
            heads: 2,
            layers: 3,
        };
        let err = unknown.clip_config().expect_err("unknown geometry");
        assert!(err.to_string().contains("unsupported secondary text tower"));
    }

    #[test]
    fn test_infer_text_tower_spec_requires_keys() {
        let device = Device::Cpu;
        let mut sd = synthetic_secondary_tower(&device, 64, 1);
        sd.remove("text_projection");
        let err = infer_text_tower_spec(&sd).expect_err("missing key should error");
        assert!(err.to_string().contains("text_projection"));
    }

    #[test]
    fn test_remap_secondary_tower_splits_fused_attention() {
        let device = Device::Cpu;
        let sd = synthetic_secondary_tower(&device, 64, 2);
        let spec = infer_text_tower_spec(&sd).expect("infer spec");
        let remapped = remap_secondary_tower(&sd, &spec).expect("remap");

        assert!(remapped.contains_key("text_model.embeddings.token_embedding.weight"));
        assert!(remapped.contains_key("text_model.embeddings.position_embedding.weight"));
        assert!(remapped.contains_key("text_model.final_layer_norm.weight"));
        assert!(!remapped.contains_key("text_projection"));
        assert!(!remapped.contains_key("logit_scale"));

        for layer in 0..2 {
            for proj in ["q_proj", "k_proj", "v_proj"] {
                let w = &remapped[&format!(
                    "text_model.encoder.layers.{layer}.self_attn.{proj}.weight"
                )];
                assert_eq!(w.dims2().expect("dims"), (64, 64));
                let b = &remapped[&format!(
                    "text_model.encoder.layers.{layer}.self_attn.{proj}.bias"
                )];
                assert_eq!(b.dims1().expect("dims"), 64);
            }
            assert!(remapped
                .contains_key(&format!("text_model.encoder.layers.{layer}.mlp.fc1.weight")));
            assert!(remapped
                .contains_key(&format!("text_model.encoder.layers.{layer}.layer_norm2.bias")));
        }
    }

    #[test]
    fn test_remap_rejects_malformed_fused_tensor() {
        let device = Device::Cpu;
        let mut sd = synthetic_secondary_tower(&device, 64, 1);
        sd.insert(
            "transformer.resblocks.0.attn.in_proj_weight".to_string(),
            t(&device, (100, 64), 0.0),
        );
        let spec = infer_text_tower_spec(&sd).expect("infer spec");
        assert!(remap_secondary_tower(&sd, &spec).is_err());
    }

    #[test]
    fn test_partition_merged_requires_every_shard() {
        let device = Device::Cpu;
        let mut merged = HashMap::new();
        merged.insert(
            format!("{DIFFUSION_PREFIX}input_blocks.0.weight"),
            t(&device, (2, 2), 0.0),
        );
        let err = partition_merged(&merged).expect_err("incomplete checkpoint should error");
        assert!(err.to_string().contains("control backbone"));
    }

    #[test]
    fn test_partition_merged_routes_prefixes() {
        let device = Device::Cpu;
        let mut merged = HashMap::new();
        merged.insert(
            format!("{DIFFUSION_PREFIX}input_blocks.0.weight"),
            t(&device, (2, 2), 0.0),
        );
        merged.insert(
            format!("{CONTROL_PREFIX}zero_convs.0.weight"),
            t(&device, (2, 2), 0.0),
        );
        merged.insert(
            format!("{FIRST_STAGE_PREFIX}encoder.conv_in.weight"),
            t(&device, (2, 2), 0.0),
        );
        merged.insert(
            format!("{CLIP_PRIMARY_PREFIX}text_model.embeddings.token_embedding.weight"),
            t(&device, (10, 4), 0.0),
        );
        merged.insert(
            format!("{CLIP_SECONDARY_PREFIX}token_embedding.weight"),
            t(&device, (10, 4), 0.0),
        );

        let shards = partition_merged(&merged).expect("partition");
        assert!(shards.diffusion.contains_key("input_blocks.0.weight"));
        assert!(shards.control.contains_key("zero_convs.0.weight"));
        assert!(shards.first_stage.contains_key("encoder.conv_in.weight"));
        assert!(shards
            .clip_primary
            .contains_key("text_model.embeddings.token_embedding.weight"));
        assert!(shards.clip_secondary_raw.contains_key("token_embedding.weight"));
    }

    #[test]
    fn test_cast_state_dict_skips_integer_tensors() {
        let device = Device::Cpu;
        let mut map = HashMap::new();
        map.insert("w".to_string(), t(&device, (2, 2), 1.0));
        map.insert(
            "ids".to_string(),
            Tensor::from_vec(vec![0u32, 1, 2], 3, &device).expect("tensor should build"),
        );

        let cast = cast_state_dict(map, DType::F16).expect("cast");
        assert_eq!(cast["w"].dtype(), DType::F16);
        assert_eq!(cast["ids"].dtype(), DType::U32);
    }

    #[test]
    fn test_weight_store_quantizes_eligible_matrices_only() {
        let device = Device::Cpu;
        let mut map = HashMap::new();
        map.insert("attn.weight".to_string(), t(&device, (8, 64), 0.5));
        map.insert("norm.weight".to_string(), vec1(&device, 8, 1.0));
        map.insert("odd.weight".to_string(), t(&device, (8, 30), 0.5));

        let store = WeightStore::quantized(map).expect("quantize");
        assert_eq!(store.len(), 3);
        assert_eq!(store.quantized_count(), 1);
    }

    #[test]
    fn test_weight_store_materialize_roundtrip() {
        let device = Device::Cpu;
        let data: Vec<f32> = (0..(4 * 64)).map(|v| (v as f32 / 256.0) - 0.5).collect();
        let original = Tensor::from_vec(data.clone(), (4, 64), &device).expect("tensor");
        let mut map = HashMap::new();
        map.insert("w".to_string(), original);

        let store = WeightStore::quantized(map).expect("quantize");
        let materialized = store.materialize(DType::F32, &device).expect("materialize");
        let round = materialized["w"]
            .flatten_all()
            .expect("flatten")
            .to_vec1::<f32>()
            .expect("vec");

        let max_err = data
            .iter()
            .zip(round.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0f32, f32::max);
        assert!(max_err < 0.02, "quantization error too large: {max_err}");
    }

    #[test]
    fn test_weight_store_plain_keeps_everything() {
        let device = Device::Cpu;
        let mut map = HashMap::new();
        map.insert("w".to_string(), t(&device, (8, 64), 0.5));
        let store = WeightStore::plain(map);
        assert_eq!(store.quantized_count(), 0);
        let materialized = store
            .materialize(DType::F32, &device)
            .expect("materialize");
        assert_eq!(materialized["w"].dims2().expect("dims"), (8, 64));
    }
}
