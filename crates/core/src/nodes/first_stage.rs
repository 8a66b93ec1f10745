//! First-stage node: a degradation-removal pass through the codec before
//! sampling. The image goes through the denoise-encoder variant, the
//! posterior sample is decoded straight back, and the result is resized to
//! the input extent. The latent scale factor is not applied on this path.

use std::collections::HashMap;

use anyhow::{bail, Result};
use candle_core::{DType, Device, Tensor};
use tracing::debug;

use crate::codec::TileSetup;
use crate::imaging::{from_codec_range, resize_image_batch, to_codec_range};
use crate::node::{require_bool, require_int, ExecutionContext, Node, PortDefinition};
use crate::types::{
    crop_to_multiple, to_channels_first, to_channels_last, ImageBatch, PortData, PortType,
    SPATIAL_ALIGN,
};

pub struct FirstStageNode;

impl FirstStageNode {
    pub fn new() -> Self {
        Self
    }
}

impl Default for FirstStageNode {
    fn default() -> Self {
        Self::new()
    }
}

impl Node for FirstStageNode {
    fn node_type(&self) -> &str {
        "FirstStage"
    }

    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![
            PortDefinition::required("vae", PortType::Vae),
            PortDefinition::required("image", PortType::Image),
            PortDefinition::optional("use_tiled_vae", PortType::Bool, serde_json::json!(true)),
            PortDefinition::optional(
                "encoder_tile_size",
                PortType::Int,
                serde_json::json!(512),
            )
            .with_range(64.0, 8192.0, 64.0),
            PortDefinition::optional(
                "decoder_tile_size",
                PortType::Int,
                serde_json::json!(512),
            )
            .with_range(64.0, 8192.0, 64.0),
        ]
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![
            PortDefinition::required("vae", PortType::Vae),
            PortDefinition::required("image", PortType::Image),
        ]
    }

    fn execute(
        &mut self,
        inputs: &HashMap<String, PortData>,
        ctx: &ExecutionContext,
    ) -> Result<HashMap<String, PortData>> {
        let Some(PortData::Vae(handle)) = inputs.get("vae") else {
            bail!("vae input is required");
        };
        let Some(PortData::Image(image)) = inputs.get("image") else {
            bail!("image input is required");
        };
        let use_tiled = require_bool(inputs, "use_tiled_vae", true)?;
        let encoder_tile = require_int(inputs, "encoder_tile_size", 512)? as usize;
        let decoder_tile = require_int(inputs, "decoder_tile_size", 512)? as usize;

        let (encoder_tiling, decoder_tiling) = if use_tiled {
            (
                Some(TileSetup::with_default_stride(encoder_tile)?),
                Some(TileSetup::with_default_stride(decoder_tile)?),
            )
        } else {
            (None, None)
        };

        let Some(encoder) = handle.effective_denoise_codec(encoder_tiling) else {
            bail!("this checkpoint carries no degradation-removal encoder");
        };
        let decoder = handle.effective_codec(decoder_tiling);

        let (orig_h, orig_w) = image.extent()?;
        let cropped = crop_to_multiple(&image.data, SPATIAL_ALIGN)?;
        let pixels = to_codec_range(&to_channels_first(&cropped)?)?
            .to_device(&handle.device)?
            .to_dtype(handle.dtype)?;

        let batch = pixels.dim(0)?;
        ctx.progress.start(batch as u64);
        debug!(batch, ?encoder_tiling, ?decoder_tiling, "first-stage pass");

        let mut cleaned = Vec::with_capacity(batch);
        for item in 0..batch {
            let pixels_item = pixels.narrow(0, item, 1)?.contiguous()?;
            let z = encoder.encode(&pixels_item)?;
            cleaned.push(decoder.decode(&z)?);
            ctx.progress.advance();
        }

        let stacked = Tensor::cat(&cleaned, 0)?
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F32)?;
        let mut out = to_channels_last(&from_codec_range(&stacked)?)?;
        let (_b, h, w, _c) = out.dims4()?;
        if (h, w) != (orig_h, orig_w) {
            out = resize_image_batch(&out, orig_h, orig_w)?;
        }

        let mut outputs = HashMap::new();
        outputs.insert("vae".to_string(), PortData::Vae(handle.clone()));
        outputs.insert("image".to_string(), PortData::Image(ImageBatch::new(out)?));
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::test_support::PoolCodec;
    use crate::codec::FirstStageHandle;
    use std::sync::Arc;

    fn handle(with_denoise: bool) -> FirstStageHandle {
        FirstStageHandle {
            codec: Arc::new(PoolCodec),
            denoise_codec: with_denoise.then(|| {
                let codec: Arc<dyn crate::codec::LatentCodec> = Arc::new(PoolCodec);
                codec
            }),
            scale_factor: 0.13025,
            device: Device::Cpu,
            dtype: DType::F32,
        }
    }

    fn image_input(h: usize, w: usize) -> PortData {
        let device = Device::Cpu;
        let data = Tensor::full(0.5f32, (1, h, w, 3), &device).expect("tensor");
        PortData::Image(ImageBatch::new(data).expect("image"))
    }

    #[test]
    fn test_first_stage_roundtrips_to_original_extent() {
        let mut inputs = HashMap::new();
        inputs.insert("vae".to_string(), PortData::Vae(handle(true)));
        inputs.insert("image".to_string(), image_input(70, 130));
        inputs.insert("use_tiled_vae".to_string(), PortData::Bool(false));

        let mut node = FirstStageNode::new();
        let ctx = ExecutionContext::default();
        let outputs = node.execute(&inputs, &ctx).expect("first stage");

        let Some(PortData::Image(image)) = outputs.get("image") else {
            panic!("image output missing");
        };
        assert_eq!(image.data.dims4().expect("dims"), (1, 70, 130, 3));
        assert!(matches!(outputs.get("vae"), Some(PortData::Vae(_))));
        assert_eq!(ctx.progress.fraction(), Some(1.0));
    }

    #[test]
    fn test_first_stage_preserves_constant_images() {
        let mut inputs = HashMap::new();
        inputs.insert("vae".to_string(), PortData::Vae(handle(true)));
        inputs.insert("image".to_string(), image_input(64, 64));
        inputs.insert("use_tiled_vae".to_string(), PortData::Bool(false));

        let mut node = FirstStageNode::new();
        let outputs = node
            .execute(&inputs, &ExecutionContext::default())
            .expect("first stage");
        let Some(PortData::Image(image)) = outputs.get("image") else {
            panic!("image output missing");
        };

        // Pooling and nearest upsampling keep a constant image constant.
        let mean = image
            .data
            .flatten_all()
            .expect("flatten")
            .mean(0)
            .expect("mean")
            .to_scalar::<f32>()
            .expect("scalar");
        assert!((mean - 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_first_stage_requires_denoise_encoder() {
        let mut inputs = HashMap::new();
        inputs.insert("vae".to_string(), PortData::Vae(handle(false)));
        inputs.insert("image".to_string(), image_input(64, 64));

        let mut node = FirstStageNode::new();
        let err = node
            .execute(&inputs, &ExecutionContext::default())
            .expect_err("no denoise encoder");
        assert!(err.to_string().contains("degradation-removal encoder"));
    }
}
