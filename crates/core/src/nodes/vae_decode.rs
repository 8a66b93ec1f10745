//! Decode node: latent batch → boundary image batch, resized back to the
//! pre-crop extent when the latent remembers one.

use std::collections::HashMap;

use anyhow::{bail, Result};
use candle_core::{DType, Device, Tensor};
use tracing::debug;

use crate::codec::TileSetup;
use crate::imaging::{from_codec_range, resize_image_batch};
use crate::node::{require_bool, require_int, ExecutionContext, Node, PortDefinition};
use crate::types::{to_channels_last, ImageBatch, PortData, PortType};

pub struct VaeDecodeNode;

impl VaeDecodeNode {
    pub fn new() -> Self {
        Self
    }
}

impl Default for VaeDecodeNode {
    fn default() -> Self {
        Self::new()
    }
}

impl Node for VaeDecodeNode {
    fn node_type(&self) -> &str {
        "VaeDecode"
    }

    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![
            PortDefinition::required("vae", PortType::Vae),
            PortDefinition::required("latent", PortType::Latent),
            PortDefinition::optional("use_tiled_vae", PortType::Bool, serde_json::json!(true)),
            PortDefinition::optional(
                "decoder_tile_size",
                PortType::Int,
                serde_json::json!(512),
            )
            .with_range(64.0, 8192.0, 64.0),
        ]
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![PortDefinition::required("image", PortType::Image)]
    }

    fn execute(
        &mut self,
        inputs: &HashMap<String, PortData>,
        ctx: &ExecutionContext,
    ) -> Result<HashMap<String, PortData>> {
        let Some(PortData::Vae(handle)) = inputs.get("vae") else {
            bail!("vae input is required");
        };
        let Some(PortData::Latent(latent)) = inputs.get("latent") else {
            bail!("latent input is required");
        };
        let use_tiled = require_bool(inputs, "use_tiled_vae", true)?;
        let tile_size = require_int(inputs, "decoder_tile_size", 512)? as usize;

        // Undo the encode-side latent scaling.
        let samples = latent
            .samples
            .to_device(&handle.device)?
            .to_dtype(handle.dtype)?
            .affine(1.0 / handle.scale_factor, 0.0)?;

        let tiling = if use_tiled {
            // The wrapper divides the pixel tile edge by the latent factor
            // on its decode path.
            Some(TileSetup::with_default_stride(tile_size)?)
        } else {
            None
        };
        debug!(?tiling, "decoding latent batch");
        let codec = handle.effective_codec(tiling);

        let batch = samples.dim(0)?;
        ctx.progress.start(batch as u64);

        let mut images = Vec::with_capacity(batch);
        for item in 0..batch {
            let z = samples.narrow(0, item, 1)?.contiguous()?;
            images.push(codec.decode(&z)?);
            ctx.progress.advance();
        }

        let stacked = Tensor::cat(&images, 0)?
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F32)?;
        let mut pixels = to_channels_last(&from_codec_range(&stacked)?)?;

        if let Some((orig_h, orig_w)) = latent.original_extent {
            let (_b, h, w, _c) = pixels.dims4()?;
            if (h, w) != (orig_h, orig_w) {
                pixels = resize_image_batch(&pixels, orig_h, orig_w)?;
            }
        }

        let mut outputs = HashMap::new();
        outputs.insert(
            "image".to_string(),
            PortData::Image(ImageBatch::new(pixels)?),
        );
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::test_support::PoolCodec;
    use crate::codec::FirstStageHandle;
    use crate::types::LatentBatch;
    use std::sync::Arc;

    fn pool_handle() -> FirstStageHandle {
        FirstStageHandle {
            codec: Arc::new(PoolCodec),
            denoise_codec: None,
            scale_factor: 1.0,
            device: Device::Cpu,
            dtype: DType::F32,
        }
    }

    #[test]
    fn test_decode_restores_original_extent() {
        let device = Device::Cpu;
        let samples = Tensor::rand(0f32, 1f32, (1, 3, 8, 16), &device).expect("rand");

        let mut inputs = HashMap::new();
        inputs.insert("vae".to_string(), PortData::Vae(pool_handle()));
        inputs.insert(
            "latent".to_string(),
            PortData::Latent(LatentBatch::with_original_extent(samples, 70, 130)),
        );
        inputs.insert("use_tiled_vae".to_string(), PortData::Bool(false));

        let mut node = VaeDecodeNode::new();
        let outputs = node
            .execute(&inputs, &ExecutionContext::default())
            .expect("decode");

        let Some(PortData::Image(image)) = outputs.get("image") else {
            panic!("image output missing");
        };
        // Decoded 64x128 is resized back to the pre-crop 70x130 extent.
        assert_eq!(image.data.dims4().expect("dims"), (1, 70, 130, 3));
    }

    #[test]
    fn test_decode_without_recorded_extent_keeps_decoded_size() {
        let device = Device::Cpu;
        let samples = Tensor::rand(0f32, 1f32, (2, 3, 8, 8), &device).expect("rand");

        let mut inputs = HashMap::new();
        inputs.insert("vae".to_string(), PortData::Vae(pool_handle()));
        inputs.insert(
            "latent".to_string(),
            PortData::Latent(LatentBatch::new(samples)),
        );
        inputs.insert("use_tiled_vae".to_string(), PortData::Bool(false));

        let mut node = VaeDecodeNode::new();
        let ctx = ExecutionContext::default();
        let outputs = node.execute(&inputs, &ctx).expect("decode");

        let Some(PortData::Image(image)) = outputs.get("image") else {
            panic!("image output missing");
        };
        assert_eq!(image.data.dims4().expect("dims"), (2, 64, 64, 3));
        assert_eq!(ctx.progress.fraction(), Some(1.0));
    }

    #[test]
    fn test_decode_output_stays_in_unit_range() {
        let device = Device::Cpu;
        let samples = Tensor::randn(0f32, 3f32, (1, 3, 8, 8), &device).expect("randn");

        let mut inputs = HashMap::new();
        inputs.insert("vae".to_string(), PortData::Vae(pool_handle()));
        inputs.insert(
            "latent".to_string(),
            PortData::Latent(LatentBatch::new(samples)),
        );
        inputs.insert("use_tiled_vae".to_string(), PortData::Bool(false));

        let mut node = VaeDecodeNode::new();
        let outputs = node
            .execute(&inputs, &ExecutionContext::default())
            .expect("decode");
        let Some(PortData::Image(image)) = outputs.get("image") else {
            panic!("image output missing");
        };

        let max = image
            .data
            .flatten_all()
            .expect("flatten")
            .max(0)
            .expect("max")
            .to_scalar::<f32>()
            .expect("scalar");
        let min = image
            .data
            .flatten_all()
            .expect("flatten")
            .min(0)
            .expect("min")
            .to_scalar::<f32>()
            .expect("scalar");
        assert!(max <= 1.0 && min >= 0.0);
    }

    #[test]
    fn test_decode_requires_latent() {
        let mut inputs = HashMap::new();
        inputs.insert("vae".to_string(), PortData::Vae(pool_handle()));
        let mut node = VaeDecodeNode::new();
        let err = node
            .execute(&inputs, &ExecutionContext::default())
            .expect_err("missing latent");
        assert!(err.to_string().contains("latent input"));
    }
}
