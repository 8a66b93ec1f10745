//! Encode node: boundary image batch → scaled latent batch.

use std::collections::HashMap;

use anyhow::{bail, Result};
use candle_core::Tensor;
use tracing::debug;

use crate::codec::TileSetup;
use crate::imaging::to_codec_range;
use crate::node::{require_bool, require_int, ExecutionContext, Node, PortDefinition};
use crate::types::{
    crop_to_multiple, to_channels_first, LatentBatch, PortData, PortType, SPATIAL_ALIGN,
};

pub struct VaeEncodeNode;

impl VaeEncodeNode {
    pub fn new() -> Self {
        Self
    }
}

impl Default for VaeEncodeNode {
    fn default() -> Self {
        Self::new()
    }
}

impl Node for VaeEncodeNode {
    fn node_type(&self) -> &str {
        "VaeEncode"
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
        let Some(PortData::Vae(handle)) = inputs.get("vae") else {
            bail!("vae input is required");
        };
        let Some(PortData::Image(image)) = inputs.get("image") else {
            bail!("image input is required");
        };
        let use_tiled = require_bool(inputs, "use_tiled_vae", true)?;
        let tile_size = require_int(inputs, "encoder_tile_size", 512)? as usize;

        let (orig_h, orig_w) = image.extent()?;
        let cropped = crop_to_multiple(&image.data, SPATIAL_ALIGN)?;
        let pixels = to_codec_range(&to_channels_first(&cropped)?)?
            .to_device(&handle.device)?
            .to_dtype(handle.dtype)?;

        let tiling = if use_tiled {
            Some(TileSetup::with_default_stride(tile_size)?)
        } else {
            None
        };
        debug!(?tiling, orig_h, orig_w, "encoding image batch");
        let codec = handle.effective_codec(tiling);

        let batch = pixels.dim(0)?;
        ctx.progress.start(batch as u64);

        let mut latents = Vec::with_capacity(batch);
        for item in 0..batch {
            let pixels_item = pixels.narrow(0, item, 1)?.contiguous()?;
            let z = codec.encode(&pixels_item)?;
            latents.push((z * handle.scale_factor)?);
            ctx.progress.advance();
        }

        let stacked = Tensor::cat(&latents, 0)?;
        let mut outputs = HashMap::new();
        outputs.insert(
            "latent".to_string(),
            PortData::Latent(LatentBatch::with_original_extent(stacked, orig_h, orig_w)),
        );
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::test_support::PoolCodec;
    use crate::codec::FirstStageHandle;
    use crate::types::ImageBatch;
    use candle_core::{DType, Device};
    use std::sync::Arc;

    fn pool_handle(scale_factor: f64) -> FirstStageHandle {
        FirstStageHandle {
            codec: Arc::new(PoolCodec),
            denoise_codec: None,
            scale_factor,
            device: Device::Cpu,
            dtype: DType::F32,
        }
    }

    fn image_input(h: usize, w: usize) -> PortData {
        let device = Device::Cpu;
        let data = Tensor::full(0.75f32, (1, h, w, 3), &device).expect("tensor");
        PortData::Image(ImageBatch::new(data).expect("image"))
    }

    #[test]
    fn test_encode_crops_to_multiple_of_64_and_tracks_extent() {
        let mut node = VaeEncodeNode::new();
        let mut inputs = HashMap::new();
        inputs.insert("vae".to_string(), PortData::Vae(pool_handle(1.0)));
        inputs.insert("image".to_string(), image_input(70, 130));
        inputs.insert("use_tiled_vae".to_string(), PortData::Bool(false));

        let ctx = ExecutionContext::default();
        let outputs = node.execute(&inputs, &ctx).expect("encode");

        let Some(PortData::Latent(latent)) = outputs.get("latent") else {
            panic!("latent output missing");
        };
        // 70x130 crops to 64x128, then the codec divides by 8.
        assert_eq!(latent.samples.dims4().expect("dims"), (1, 3, 8, 16));
        assert_eq!(latent.original_extent, Some((70, 130)));
        assert_eq!(ctx.progress.fraction(), Some(1.0));
    }

    #[test]
    fn test_encode_applies_latent_scale_factor() {
        let mut node = VaeEncodeNode::new();
        let mut inputs = HashMap::new();
        inputs.insert("vae".to_string(), PortData::Vae(pool_handle(2.0)));
        inputs.insert("image".to_string(), image_input(64, 64));
        inputs.insert("use_tiled_vae".to_string(), PortData::Bool(false));

        let outputs = node
            .execute(&inputs, &ExecutionContext::default())
            .expect("encode");
        let Some(PortData::Latent(latent)) = outputs.get("latent") else {
            panic!("latent output missing");
        };
        // Constant 0.75 maps to 0.5 in codec range, then ×2 scale factor.
        let mean = latent
            .samples
            .flatten_all()
            .expect("flatten")
            .mean(0)
            .expect("mean")
            .to_scalar::<f32>()
            .expect("scalar");
        assert!((mean - 1.0).abs() < 1e-5, "unexpected latent mean {mean}");
    }

    #[test]
    fn test_encode_tiled_matches_untiled() {
        let device = Device::Cpu;
        let data = Tensor::rand(0f32, 1f32, (1, 128, 128, 3), &device).expect("rand");
        let image = ImageBatch::new(data.clone()).expect("image");

        let mut inputs = HashMap::new();
        inputs.insert("vae".to_string(), PortData::Vae(pool_handle(1.0)));
        inputs.insert("image".to_string(), PortData::Image(image));
        inputs.insert("use_tiled_vae".to_string(), PortData::Bool(true));
        inputs.insert("encoder_tile_size".to_string(), PortData::Int(64));

        let mut node = VaeEncodeNode::new();
        let tiled = node
            .execute(&inputs, &ExecutionContext::default())
            .expect("tiled encode");

        inputs.insert("use_tiled_vae".to_string(), PortData::Bool(false));
        inputs.insert(
            "image".to_string(),
            PortData::Image(ImageBatch::new(data).expect("image")),
        );
        let direct = node
            .execute(&inputs, &ExecutionContext::default())
            .expect("direct encode");

        let (Some(PortData::Latent(a)), Some(PortData::Latent(b))) =
            (tiled.get("latent"), direct.get("latent"))
        else {
            panic!("latent outputs missing");
        };
        let diff = (&a.samples - &b.samples)
            .expect("sub")
            .abs()
            .expect("abs")
            .flatten_all()
            .expect("flatten")
            .max(0)
            .expect("max")
            .to_scalar::<f32>()
            .expect("scalar");
        assert!(diff < 1e-5, "tiled/untiled encode diverged: {diff}");
    }

    #[test]
    fn test_encode_requires_vae_and_image() {
        let mut node = VaeEncodeNode::new();
        let err = node
            .execute(&HashMap::new(), &ExecutionContext::default())
            .expect_err("missing inputs");
        assert!(err.to_string().contains("vae input"));
    }
}
