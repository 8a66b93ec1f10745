//! Pixel-space helpers at the node boundary.
//!
//! Resizing happens in f32 so decoded output keeps its dynamic range when
//! it is scaled back to the pre-crop extent.

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use image::imageops::FilterType;
use image::{ImageBuffer, Rgb};

/// Resize a `B×H×W×C` f32 image batch to the target extent with a Lanczos
/// filter, clamping back into `[0,1]`.
pub fn resize_image_batch(bhwc: &Tensor, target_h: usize, target_w: usize) -> Result<Tensor> {
    let (batch, height, width, channels) = bhwc.dims4()?;
    if channels != 3 {
        bail!("resize expects 3-channel images, got {channels}");
    }
    if target_h == 0 || target_w == 0 {
        bail!("target extent must be positive, got {target_h}x{target_w}");
    }
    if height == target_h && width == target_w {
        return Ok(bhwc.clone());
    }

    let device = bhwc.device().clone();
    let host = bhwc.to_device(&Device::Cpu)?.to_dtype(DType::F32)?;

    let mut resized = Vec::with_capacity(batch);
    for b in 0..batch {
        let raw = host.i(b)?.contiguous()?.flatten_all()?.to_vec1::<f32>()?;
        let buffer: ImageBuffer<Rgb<f32>, Vec<f32>> =
            ImageBuffer::from_raw(width as u32, height as u32, raw)
                .context("image buffer construction failed")?;
        let scaled = image::imageops::resize(
            &buffer,
            target_w as u32,
            target_h as u32,
            FilterType::Lanczos3,
        );
        let tensor = Tensor::from_vec(scaled.into_raw(), (target_h, target_w, 3), &Device::Cpu)?;
        resized.push(tensor);
    }

    let stacked = Tensor::stack(&resized, 0)?.clamp(0f32, 1f32)?;
    Ok(stacked.to_device(&device)?)
}

/// Map boundary pixels in `[0,1]` to the codec's `[-1,1]` range.
pub fn to_codec_range(pixels: &Tensor) -> Result<Tensor> {
    Ok(pixels.affine(2.0, -1.0)?)
}

/// Map codec output in `[-1,1]` back to boundary pixels in `[0,1]`.
pub fn from_codec_range(pixels: &Tensor) -> Result<Tensor> {
    Ok(pixels.affine(0.5, 0.5)?.clamp(0f32, 1f32)?)
}
