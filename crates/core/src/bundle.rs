//! The model bundle: merged checkpoint shards plus everything needed to
//! materialize pipeline stages on the compute device.
//!
//! Shards live on the host. Each stage (denoiser backbones, text towers,
//! first-stage codec) is constructed on the device on demand and freed by
//! dropping it, which is what keeps at most one stage's working set
//! resident at peak.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::stable_diffusion::clip::ClipTextTransformer;
use candle_transformers::models::stable_diffusion::unet_2d::UNet2DConditionModel;
use candle_transformers::models::stable_diffusion::vae::AutoEncoderKL;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::arch::{ArchitectureSpec, ScheduleSpec};
use crate::checkpoint::{
    cast_state_dict, infer_text_tower_spec, load_checkpoint, merge_state_dicts, partition_merged,
    remap_secondary_tower, TextTowerSpec, WeightStore,
};
use crate::codec::{FirstStageHandle, KlCodec, LatentCodec};
use crate::conditioning::{ClipConditioner, Conditioning};
use crate::device::DtypeChoice;
use crate::sampling::{training_sigmas, Denoiser};

/// The loader's cache key. Any field change forces a full rebuild; an
/// unchanged tuple reuses the cached bundle identity.
#[derive(Debug, Clone, PartialEq)]
pub struct LoaderConfig {
    pub restoration_checkpoint: PathBuf,
    pub base_checkpoint: PathBuf,
    pub dtype: DtypeChoice,
    pub quantize_diffusion: bool,
}

pub struct RestorationModel {
    arch: ArchitectureSpec,
    secondary_spec: TextTowerSpec,
    dtype: DType,
    device: Device,
    diffusion: WeightStore,
    control: HashMap<String, Tensor>,
    first_stage: HashMap<String, Tensor>,
    clip_primary: HashMap<String, Tensor>,
    clip_secondary: HashMap<String, Tensor>,
    tokenizer: Tokenizer,
}

fn shard_on_device(
    shard: &HashMap<String, Tensor>,
    dtype: DType,
    device: &Device,
) -> Result<HashMap<String, Tensor>> {
    let mut out = HashMap::with_capacity(shard.len());
    for (key, tensor) in shard {
        out.insert(key.clone(), tensor.to_device(device)?.to_dtype(dtype)?);
    }
    Ok(out)
}

/// Swap the standard encoder weights of a first-stage shard for its
/// degradation-removal encoder, when the checkpoint carries one. The
/// decoder and quantization convolutions are shared between both variants.
pub fn denoise_encoder_shard(
    first_stage: &HashMap<String, Tensor>,
) -> Option<HashMap<String, Tensor>> {
    const DENOISE_PREFIX: &str = "denoise_encoder.";
    if !first_stage.keys().any(|k| k.starts_with(DENOISE_PREFIX)) {
        return None;
    }

    let mut out = HashMap::with_capacity(first_stage.len());
    for (key, tensor) in first_stage {
        if let Some(rest) = key.strip_prefix(DENOISE_PREFIX) {
            out.insert(format!("encoder.{rest}"), tensor.clone());
        } else if !key.starts_with("encoder.") {
            out.insert(key.clone(), tensor.clone());
        }
    }
    Some(out)
}

impl RestorationModel {
    /// Load, merge, partition, remap, and cast both checkpoints into a
    /// host-resident bundle.
    pub fn build(
        config: &LoaderConfig,
        arch: ArchitectureSpec,
        tokenizer_file: &Path,
        device: Device,
    ) -> Result<Arc<Self>> {
        let dtype = config.dtype.resolve(&device)?;
        info!(
            restoration = %config.restoration_checkpoint.display(),
            base = %config.base_checkpoint.display(),
            ?dtype,
            quantize_diffusion = config.quantize_diffusion,
            "building model bundle"
        );

        let restoration = load_checkpoint(&config.restoration_checkpoint)?;
        let base = load_checkpoint(&config.base_checkpoint)?;
        // The base checkpoint loads second, so its matching keys win.
        let merged = merge_state_dicts(restoration, base);
        let shards = partition_merged(&merged)?;
        drop(merged);

        let secondary_spec = infer_text_tower_spec(&shards.clip_secondary_raw)
            .context("failed to reconstruct the secondary text tower from checkpoint shapes")?;
        // Surface an unsupported tower at load time, not at first sampling.
        secondary_spec.clip_config()?;
        debug!(?secondary_spec, "inferred secondary text tower");
        let clip_secondary = remap_secondary_tower(&shards.clip_secondary_raw, &secondary_spec)?;

        let diffusion = cast_state_dict(shards.diffusion, dtype)?;
        let diffusion = if config.quantize_diffusion {
            WeightStore::quantized(diffusion)?
        } else {
            WeightStore::plain(diffusion)
        };

        let tokenizer = Tokenizer::from_file(tokenizer_file)
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("failed to load tokenizer: {}", tokenizer_file.display()))?;

        Ok(Arc::new(Self {
            secondary_spec,
            dtype,
            control: cast_state_dict(shards.control, dtype)?,
            first_stage: cast_state_dict(shards.first_stage, dtype)?,
            clip_primary: cast_state_dict(shards.clip_primary, dtype)?,
            clip_secondary: cast_state_dict(clip_secondary, dtype)?,
            diffusion,
            tokenizer,
            arch,
            device,
        }))
    }

    pub fn arch(&self) -> &ArchitectureSpec {
        &self.arch
    }

    pub fn schedule(&self) -> &ScheduleSpec {
        &self.arch.schedule
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Materialize the sampling backbones on the device.
    pub fn denoiser_stage(&self) -> Result<ControlledDenoiser> {
        let latent_channels = self.arch.latent_channels;

        let diffusion_weights = self.diffusion.materialize(self.dtype, &self.device)?;
        let vb = VarBuilder::from_tensors(diffusion_weights, self.dtype, &self.device);
        let unet = UNet2DConditionModel::new(
            vb,
            latent_channels,
            latent_channels,
            false,
            self.arch.unet_config(),
        )
        .context("failed to build the diffusion backbone")?;

        let control_weights = shard_on_device(&self.control, self.dtype, &self.device)?;
        let vb = VarBuilder::from_tensors(control_weights, self.dtype, &self.device);
        let control = UNet2DConditionModel::new(
            vb,
            self.arch.control_in_channels(),
            latent_channels,
            false,
            self.arch.unet_config(),
        )
        .context("failed to build the control backbone")?;

        Ok(ControlledDenoiser {
            unet,
            control,
            sigmas: training_sigmas(&self.arch.schedule),
            dtype: self.dtype,
        })
    }

    /// Materialize both text towers on the device. Drop the returned value
    /// as soon as conditioning is prepared; the towers should not coexist
    /// with the sampling backbones.
    pub fn conditioner(&self) -> Result<ClipConditioner> {
        let primary_cfg = self.arch.primary_clip_config();
        let secondary_cfg = self.secondary_spec.clip_config()?;

        let primary_weights = shard_on_device(&self.clip_primary, self.dtype, &self.device)?;
        let vb = VarBuilder::from_tensors(primary_weights, self.dtype, &self.device);
        let primary = ClipTextTransformer::new(vb, &primary_cfg)
            .context("failed to build the primary text tower")?;

        let secondary_weights = shard_on_device(&self.clip_secondary, self.dtype, &self.device)?;
        let vb = VarBuilder::from_tensors(secondary_weights, self.dtype, &self.device);
        let secondary = ClipTextTransformer::new(vb, &secondary_cfg)
            .context("failed to build the secondary text tower")?;

        ClipConditioner::new(
            self.tokenizer.clone(),
            primary,
            secondary,
            primary_cfg.pad_with.as_deref(),
            secondary_cfg.pad_with.as_deref(),
            primary_cfg.max_position_embeddings,
            secondary_cfg.max_position_embeddings,
            self.device.clone(),
            self.dtype,
        )
    }

    /// Materialize the first-stage codec on the device, including the
    /// degradation-removal encoder variant when present.
    pub fn first_stage(&self) -> Result<FirstStageHandle> {
        let vae_cfg = self.arch.vae_config();

        let weights = shard_on_device(&self.first_stage, self.dtype, &self.device)?;
        let vb = VarBuilder::from_tensors(weights, self.dtype, &self.device);
        let vae = AutoEncoderKL::new(vb, 3, 3, vae_cfg.clone())
            .context("failed to build the first-stage codec")?;

        let denoise_codec = match denoise_encoder_shard(&self.first_stage) {
            Some(shard) => {
                let weights = shard_on_device(&shard, self.dtype, &self.device)?;
                let vb = VarBuilder::from_tensors(weights, self.dtype, &self.device);
                let denoise_vae = AutoEncoderKL::new(vb, 3, 3, vae_cfg)
                    .context("failed to build the degradation-removal encoder")?;
                let codec: Arc<dyn LatentCodec> = Arc::new(KlCodec::new(denoise_vae));
                Some(codec)
            }
            None => None,
        };

        Ok(FirstStageHandle {
            codec: Arc::new(KlCodec::new(vae)),
            denoise_codec,
            scale_factor: self.arch.scale_factor,
            device: self.device.clone(),
            dtype: self.dtype,
        })
    }
}

/// Nearest training timestep for a continuous sigma, used to condition the
/// backbones which were trained on discrete steps.
pub fn nearest_timestep(sigmas: &[f64], sigma: f64) -> usize {
    let mut best = 0;
    let mut best_dist = f64::INFINITY;
    for (i, s) in sigmas.iter().enumerate() {
        let dist = (s - sigma).abs();
        if dist < best_dist {
            best_dist = dist;
            best = i;
        }
    }
    best
}

/// EDM-preconditioned denoiser over the diffusion backbone plus the control
/// backbone. The control residual is scaled by the step's control scale
/// before it joins the noise prediction.
pub struct ControlledDenoiser {
    unet: UNet2DConditionModel,
    control: UNet2DConditionModel,
    sigmas: Vec<f64>,
    dtype: DType,
}

impl Denoiser for ControlledDenoiser {
    fn denoise(
        &self,
        noisy: &Tensor,
        sigma: f64,
        cond: &Conditioning,
        control_scale: f64,
    ) -> Result<Tensor> {
        let c_in = 1.0 / (sigma * sigma + 1.0).sqrt();
        let scaled = noisy.affine(c_in, 0.0)?.to_dtype(self.dtype)?;
        let timestep = nearest_timestep(&self.sigmas, sigma) as f64;
        let crossattn = cond.crossattn.to_dtype(self.dtype)?;

        let mut eps = self.unet.forward(&scaled, timestep, &crossattn)?;
        if control_scale != 0.0 {
            let control_input =
                Tensor::cat(&[&scaled, &cond.control.to_dtype(self.dtype)?], 1)?;
            let residual = self.control.forward(&control_input, timestep, &crossattn)?;
            eps = (eps + (residual * control_scale)?)?;
        }

        let eps = eps.to_dtype(noisy.dtype())?;
        Ok((noisy - (eps * sigma)?)?)
    }
}
