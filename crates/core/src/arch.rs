//! Static architecture hyperparameters for the restoration pipeline.
//!
//! The spec document describes the diffusion backbone, the control backbone,
//! and the first-stage autoencoder. It is loaded once per bundle
//! construction from a JSON file, with a compiled-in default matching the
//! standard restoration architecture. The secondary text tower is not
//! described here; its shape is inferred from the checkpoint itself (see
//! [`crate::checkpoint::infer_text_tower_spec`]).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use candle_transformers::models::stable_diffusion::{clip, unet_2d, vae};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ArchitectureSpec {
    pub latent_channels: usize,
    /// Latent scaling applied after encode and inverted before decode.
    pub scale_factor: f64,
    pub unet: UnetSpec,
    pub control: ControlSpec,
    pub autoencoder: AutoencoderSpec,
    pub schedule: ScheduleSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UnetSpec {
    pub blocks: Vec<UnetBlockSpec>,
    pub layers_per_block: usize,
    pub cross_attention_dim: usize,
    pub use_linear_projection: bool,
    pub sliced_attention_size: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnetBlockSpec {
    pub out_channels: usize,
    /// Transformer depth for cross-attention blocks; `None` for plain
    /// residual blocks.
    pub transformer_depth: Option<usize>,
    pub attention_heads: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControlSpec {
    /// Latent channels of the control signal concatenated onto the noisy
    /// input before the control backbone sees it.
    pub extra_latent_channels: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AutoencoderSpec {
    pub block_out_channels: Vec<usize>,
    pub layers_per_block: usize,
    pub latent_channels: usize,
    pub norm_num_groups: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScheduleSpec {
    pub num_train_steps: usize,
    pub beta_start: f64,
    pub beta_end: f64,
}

impl Default for ArchitectureSpec {
    fn default() -> Self {
        Self::restoration_xl()
    }
}

impl Default for UnetSpec {
    fn default() -> Self {
        Self::restoration_xl()
    }
}

impl Default for ControlSpec {
    fn default() -> Self {
        Self {
            extra_latent_channels: 4,
        }
    }
}

impl Default for AutoencoderSpec {
    fn default() -> Self {
        Self {
            block_out_channels: vec![128, 256, 512, 512],
            layers_per_block: 2,
            latent_channels: 4,
            norm_num_groups: 32,
        }
    }
}

impl Default for ScheduleSpec {
    fn default() -> Self {
        Self {
            num_train_steps: 1000,
            beta_start: 0.000_85,
            beta_end: 0.012,
        }
    }
}

impl UnetSpec {
    fn restoration_xl() -> Self {
        Self {
            blocks: vec![
                UnetBlockSpec {
                    out_channels: 320,
                    transformer_depth: None,
                    attention_heads: 5,
                },
                UnetBlockSpec {
                    out_channels: 640,
                    transformer_depth: Some(2),
                    attention_heads: 10,
                },
                UnetBlockSpec {
                    out_channels: 1280,
                    transformer_depth: Some(10),
                    attention_heads: 20,
                },
            ],
            layers_per_block: 2,
            cross_attention_dim: 2048,
            use_linear_projection: true,
            sliced_attention_size: None,
        }
    }
}

impl ArchitectureSpec {
    /// Built-in spec for the XL-class restoration architecture.
    pub fn restoration_xl() -> Self {
        Self {
            latent_channels: 4,
            scale_factor: 0.13025,
            unet: UnetSpec::restoration_xl(),
            control: ControlSpec::default(),
            autoencoder: AutoencoderSpec::default(),
            schedule: ScheduleSpec::default(),
        }
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read architecture spec: {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse architecture spec: {}", path.display()))
    }

    /// In-channels of the control backbone: noisy latent plus control latent.
    pub fn control_in_channels(&self) -> usize {
        self.latent_channels + self.control.extra_latent_channels
    }

    pub fn unet_config(&self) -> unet_2d::UNet2DConditionModelConfig {
        unet_2d::UNet2DConditionModelConfig {
            blocks: self
                .unet
                .blocks
                .iter()
                .map(|b| unet_2d::BlockConfig {
                    out_channels: b.out_channels,
                    use_cross_attn: b.transformer_depth,
                    attention_head_dim: b.attention_heads,
                })
                .collect(),
            layers_per_block: self.unet.layers_per_block,
            cross_attention_dim: self.unet.cross_attention_dim,
            use_linear_projection: self.unet.use_linear_projection,
            sliced_attention_size: self.unet.sliced_attention_size,
            ..Default::default()
        }
    }

    pub fn vae_config(&self) -> vae::AutoEncoderKLConfig {
        vae::AutoEncoderKLConfig {
            block_out_channels: self.autoencoder.block_out_channels.clone(),
            layers_per_block: self.autoencoder.layers_per_block,
            latent_channels: self.autoencoder.latent_channels,
            norm_num_groups: self.autoencoder.norm_num_groups,
            ..Default::default()
        }
    }

    /// Config for the primary text tower. This one is fixed by the
    /// architecture family rather than inferred: it is the standard CLIP-L
    /// layout the base checkpoints all share.
    pub fn primary_clip_config(&self) -> clip::Config {
        clip::Config::sdxl()
    }
}
