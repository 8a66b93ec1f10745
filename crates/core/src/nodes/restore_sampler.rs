//! Sampler node: drives the progressive denoiser over a latent batch.

use std::collections::HashMap;

use anyhow::{bail, Result};
use tracing::{debug, info, warn};

use crate::codec::TileSetup;
use crate::bundle::ControlledDenoiser;
use crate::device::StageLease;
use crate::node::{
    require_bool, require_float, require_int, require_str, ExecutionContext, Node, PortDefinition,
};
use crate::sampling::{
    prepare_batch_conditioning, sample_batch, LinearSchedule, RestorationSampler, SamplerConfig,
    SamplerKind,
};
use crate::types::{LatentBatch, PortData, PortType};

/// Read the sampler configuration off the node's scalar ports.
pub fn sampler_config_from_inputs(inputs: &HashMap<String, PortData>) -> Result<SamplerConfig> {
    let kind = SamplerKind::parse(&require_str(inputs, "sampler", "euler")?)?;

    let tile = if kind.is_tiled() {
        let tile_size = require_int(inputs, "sampler_tile_size", 1024)? as usize;
        let tile_stride = require_int(inputs, "sampler_tile_stride", 512)? as usize;
        Some(TileSetup::new(tile_size, tile_stride)?)
    } else {
        None
    };

    let restore_cfg = require_float(inputs, "restore_cfg", -1.0)?;

    Ok(SamplerConfig {
        steps: require_int(inputs, "steps", 45)?.max(1) as usize,
        guidance: LinearSchedule {
            start: require_float(inputs, "cfg_scale_start", 4.0)?,
            end: require_float(inputs, "cfg_scale_end", 4.0)?,
        },
        control: LinearSchedule {
            start: require_float(inputs, "control_scale_start", 1.0)?,
            end: require_float(inputs, "control_scale_end", 1.0)?,
        },
        s_churn: require_float(inputs, "s_churn", 5.0)?,
        s_noise: require_float(inputs, "s_noise", 1.003)?,
        // Negative disables restoration anchoring.
        restore_strength: (restore_cfg >= 0.0).then_some(restore_cfg),
        kind,
        tile,
    })
}

/// One caption steers the whole batch; several lines map line-per-item.
pub fn expand_captions(raw: &str, batch: usize) -> Vec<String> {
    let lines: Vec<String> = raw
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    match lines.len() {
        0 => Vec::new(),
        1 => vec![lines[0].clone(); batch],
        _ => lines,
    }
}

pub struct RestoreSamplerNode {
    sampler: Option<RestorationSampler>,
    stage: Option<StageLease<ControlledDenoiser>>,
}

impl RestoreSamplerNode {
    pub fn new() -> Self {
        Self {
            sampler: None,
            stage: None,
        }
    }

    fn sampler_is_current(&self, config: &SamplerConfig) -> bool {
        matches!(&self.sampler, Some(existing) if existing.config() == config)
    }

    fn release_stage(&mut self) {
        self.stage = None;
    }

    #[cfg(test)]
    fn stage_is_resident(&self) -> bool {
        self.stage.as_ref().is_some_and(StageLease::is_resident)
    }
}

impl Default for RestoreSamplerNode {
    fn default() -> Self {
        Self::new()
    }
}

impl Node for RestoreSamplerNode {
    fn node_type(&self) -> &str {
        "RestorationSampler"
    }

    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![
            PortDefinition::required("model", PortType::Model),
            PortDefinition::required("latent", PortType::Latent),
            PortDefinition::optional("seed", PortType::Int, serde_json::json!(123))
                .with_range(0.0, u32::MAX as f64, 1.0),
            PortDefinition::optional("steps", PortType::Int, serde_json::json!(45))
                .with_range(3.0, 4096.0, 1.0),
            PortDefinition::optional("cfg_scale_start", PortType::Float, serde_json::json!(4.0))
                .with_range(0.0, 9.0, 0.05),
            PortDefinition::optional("cfg_scale_end", PortType::Float, serde_json::json!(4.0))
                .with_range(0.0, 20.0, 0.01),
            PortDefinition::optional(
                "a_prompt",
                PortType::Str,
                serde_json::json!("high quality, detailed"),
            ),
            PortDefinition::optional(
                "n_prompt",
                PortType::Str,
                serde_json::json!("bad quality, blurry, messy"),
            ),
            PortDefinition::optional("s_churn", PortType::Int, serde_json::json!(5))
                .with_range(0.0, 40.0, 1.0),
            PortDefinition::optional("s_noise", PortType::Float, serde_json::json!(1.003))
                .with_range(1.0, 1.1, 0.001),
            PortDefinition::optional(
                "control_scale_start",
                PortType::Float,
                serde_json::json!(1.0),
            )
            .with_range(0.0, 10.0, 0.05),
            PortDefinition::optional("control_scale_end", PortType::Float, serde_json::json!(1.0))
                .with_range(0.0, 10.0, 0.05),
            PortDefinition::optional("restore_cfg", PortType::Float, serde_json::json!(-1.0))
                .with_range(-1.0, 6.0, 1.0),
            PortDefinition::optional("keep_model_loaded", PortType::Bool, serde_json::json!(false)),
            PortDefinition::optional("sampler", PortType::Str, serde_json::json!("euler"))
                .with_choices(&["euler", "dpmpp_2m", "tiled_euler", "tiled_dpmpp_2m"]),
            PortDefinition::optional("captions", PortType::Str, serde_json::json!("")),
            PortDefinition::optional("sampler_tile_size", PortType::Int, serde_json::json!(1024))
                .with_range(64.0, 4096.0, 32.0),
            PortDefinition::optional(
                "sampler_tile_stride",
                PortType::Int,
                serde_json::json!(512),
            )
            .with_range(32.0, 2048.0, 32.0),
        ]
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::required("latent", PortType::Latent)]
    }

    fn execute(
        &mut self,
        inputs: &HashMap<String, PortData>,
        ctx: &ExecutionContext,
    ) -> Result<HashMap<String, PortData>> {
        let Some(PortData::Model(model)) = inputs.get("model") else {
            bail!("model input is required");
        };
        let Some(PortData::Latent(latent)) = inputs.get("latent") else {
            bail!("latent input is required");
        };

        let config = sampler_config_from_inputs(inputs)?;
        if !self.sampler_is_current(&config) {
            debug!(?config, "sampler configuration changed, rebuilding");
            self.sampler = Some(RestorationSampler::new(config, model.schedule())?);
        }
        let Some(sampler) = self.sampler.as_ref() else {
            bail!("sampler cache is empty after construction");
        };

        let seed = require_int(inputs, "seed", 123)?;
        if let Err(err) = model.device().set_seed(seed as u64) {
            warn!(%err, "device does not support seeding, continuing unseeded");
        }

        let samples = latent
            .samples
            .to_device(model.device())?
            .contiguous()?;
        let batch = samples.dim(0)?;
        let captions = expand_captions(&require_str(inputs, "captions", "")?, batch);
        let positive = require_str(inputs, "a_prompt", "high quality, detailed")?;
        let negative = require_str(inputs, "n_prompt", "bad quality, blurry, messy")?;

        // Text towers go resident only for this block and are dropped
        // before the sampling backbones are built.
        let conditioning = {
            let conditioner = model.conditioner()?;
            prepare_batch_conditioning(&conditioner, &samples, &captions, &positive, &negative)?
        };

        if self.stage.is_none() {
            self.stage = Some(StageLease::new("denoiser", model.denoiser_stage()?));
        }
        let Some(denoiser) = self.stage.as_ref().and_then(StageLease::get) else {
            bail!("denoiser stage is not resident");
        };

        info!(batch, steps = sampler.config().steps, "sampling latent batch");
        let refined = match sample_batch(sampler, denoiser, &conditioning, &samples, &ctx.progress)
        {
            Ok(refined) => refined,
            Err(err) => {
                // Nothing stays resident after a failed batch. The advice
                // mirrors what actually helps when the device is out of
                // memory.
                self.release_stage();
                return Err(err.context(
                    "sampling aborted; reduce resolution or batch size, enable the tiled \
                     first stage, or switch to a tiled sampler",
                ));
            }
        };

        if !require_bool(inputs, "keep_model_loaded", false)? {
            self.release_stage();
        }

        let mut out = LatentBatch::new(refined);
        out.original_extent = latent.original_extent;

        let mut outputs = HashMap::new();
        outputs.insert("latent".to_string(), PortData::Latent(out));
        Ok(outputs)
    }
}
