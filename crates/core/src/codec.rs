//! First-stage codec seam and the tiled execution wrapper.
//!
//! [`TiledCodec`] bounds peak memory for large images by running the inner
//! codec on overlapping spatial tiles and linearly blending tile outputs
//! across the overlaps, so tiling changes the memory profile but not the
//! result beyond a small numerical tolerance. Encode tiles in pixel space
//! and blends in latent space; decode tiles in latent space (at one-eighth
//! of the configured tile edge) and blends in pixel space.

use std::sync::Arc;

use anyhow::{bail, Result};
use candle_core::{DType, Tensor};
use candle_transformers::models::stable_diffusion::vae::AutoEncoderKL;
use tracing::debug;

use crate::types::LATENT_FACTOR;

/// Encode/decode seam between the node adapters and the autoencoder.
///
/// `encode` maps `B×3×H×W` pixels in `[-1,1]` to `B×C×(H/8)×(W/8)` latents
/// (unscaled); `decode` is the inverse. Latent scale-factor handling belongs
/// to the callers.
pub trait LatentCodec: Send + Sync {
    fn encode(&self, pixels: &Tensor) -> Result<Tensor>;
    fn decode(&self, latents: &Tensor) -> Result<Tensor>;

    fn factor(&self) -> usize {
        LATENT_FACTOR
    }
}

/// The pretrained KL autoencoder behind the [`LatentCodec`] seam.
pub struct KlCodec {
    vae: AutoEncoderKL,
}

impl KlCodec {
    pub fn new(vae: AutoEncoderKL) -> Self {
        Self { vae }
    }
}

impl LatentCodec for KlCodec {
    fn encode(&self, pixels: &Tensor) -> Result<Tensor> {
        let posterior = self.vae.encode(pixels)?;
        Ok(posterior.sample()?)
    }

    fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        Ok(self.vae.decode(latents)?)
    }
}

/// Tile geometry in pixel units. Both edges must be multiples of the latent
/// factor so the latent-space arithmetic stays exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileSetup {
    pub tile_size: usize,
    pub tile_stride: usize,
}

impl TileSetup {
    pub fn new(tile_size: usize, tile_stride: usize) -> Result<Self> {
        if tile_size == 0 || tile_stride == 0 {
            bail!("tile size and stride must be positive");
        }
        if tile_stride > tile_size {
            bail!("tile stride ({tile_stride}) must not exceed tile size ({tile_size})");
        }
        if tile_size % LATENT_FACTOR != 0 || tile_stride % LATENT_FACTOR != 0 {
            bail!(
                "tile size and stride must be multiples of {LATENT_FACTOR}, \
                 got {tile_size}/{tile_stride}"
            );
        }
        Ok(Self {
            tile_size,
            tile_stride,
        })
    }

    /// Overlap between neighboring tiles, in pixel units.
    pub fn blend_extent(&self) -> usize {
        self.tile_size - self.tile_stride
    }

    /// Tile geometry from an edge length alone, striding at three quarters
    /// of the edge. This is the default the codec nodes expose.
    pub fn with_default_stride(tile_size: usize) -> Result<Self> {
        let stride = (tile_size / 4 * 3).max(LATENT_FACTOR);
        Self::new(tile_size, stride)
    }
}

/// Tiling wrapper around a shared codec.
///
/// Built per call when tiling is requested; the wrapped codec is never
/// mutated, so disabling tiling is just not wrapping.
pub struct TiledCodec {
    inner: Arc<dyn LatentCodec>,
    tiles: TileSetup,
}

impl TiledCodec {
    pub fn new(inner: Arc<dyn LatentCodec>, tiles: TileSetup) -> Self {
        Self { inner, tiles }
    }
}

/// Linear crossfade of `b`'s leading columns with `a`'s trailing columns.
fn blend_h(a: &Tensor, b: &Tensor, extent: usize) -> Result<Tensor> {
    let blend = extent.min(a.dim(3)?).min(b.dim(3)?);
    if blend == 0 {
        return Ok(b.clone());
    }
    let ramp = Tensor::arange(0u32, blend as u32, b.device())?
        .to_dtype(DType::F32)?
        .affine(1.0 / blend as f64, 0.0)?
        .reshape((1, 1, 1, blend))?
        .to_dtype(b.dtype())?;

    let a_tail = a.narrow(3, a.dim(3)? - blend, blend)?;
    let b_head = b.narrow(3, 0, blend)?;
    let mixed = (a_tail.broadcast_mul(&ramp.affine(-1.0, 1.0)?)?
        + b_head.broadcast_mul(&ramp)?)?;

    if blend == b.dim(3)? {
        return Ok(mixed);
    }
    let b_rest = b.narrow(3, blend, b.dim(3)? - blend)?;
    Ok(Tensor::cat(&[&mixed, &b_rest], 3)?)
}

/// Linear crossfade of `b`'s leading rows with `a`'s trailing rows.
fn blend_v(a: &Tensor, b: &Tensor, extent: usize) -> Result<Tensor> {
    let blend = extent.min(a.dim(2)?).min(b.dim(2)?);
    if blend == 0 {
        return Ok(b.clone());
    }
    let ramp = Tensor::arange(0u32, blend as u32, b.device())?
        .to_dtype(DType::F32)?
        .affine(1.0 / blend as f64, 0.0)?
        .reshape((1, 1, blend, 1))?
        .to_dtype(b.dtype())?;

    let a_tail = a.narrow(2, a.dim(2)? - blend, blend)?;
    let b_head = b.narrow(2, 0, blend)?;
    let mixed = (a_tail.broadcast_mul(&ramp.affine(-1.0, 1.0)?)?
        + b_head.broadcast_mul(&ramp)?)?;

    if blend == b.dim(2)? {
        return Ok(mixed);
    }
    let b_rest = b.narrow(2, blend, b.dim(2)? - blend)?;
    Ok(Tensor::cat(&[&mixed, &b_rest], 2)?)
}

/// Run `op` over overlapping tiles of `input` and stitch the outputs.
///
/// `in_tile`/`in_stride` are tile geometry in the input's coordinate space;
/// `ratio` maps input coordinates to output coordinates (latent factor for
/// encode, its inverse expressed as a multiplier for decode).
fn run_tiled(
    input: &Tensor,
    in_tile: usize,
    in_stride: usize,
    out_per_in: f64,
    op: &dyn Fn(&Tensor) -> Result<Tensor>,
) -> Result<Tensor> {
    let (_b, _c, height, width) = input.dims4()?;
    let to_out = |v: usize| (v as f64 * out_per_in) as usize;

    let out_stride_h = to_out(in_stride);
    let out_stride_w = to_out(in_stride);
    let blend_extent = to_out(in_tile - in_stride);

    let mut rows: Vec<Vec<Tensor>> = Vec::new();
    let mut i = 0;
    while i < height {
        let mut row = Vec::new();
        let mut j = 0;
        while j < width {
            let h_end = (i + in_tile).min(height);
            let w_end = (j + in_tile).min(width);
            let tile = input
                .narrow(2, i, h_end - i)?
                .narrow(3, j, w_end - j)?
                .contiguous()?;
            row.push(op(&tile)?);
            j += in_stride;
        }
        rows.push(row);
        i += in_stride;
    }

    debug!(
        rows = rows.len(),
        cols = rows.first().map(Vec::len).unwrap_or(0),
        tile = in_tile,
        stride = in_stride,
        "stitched tiled codec pass"
    );

    let mut prev_row_blended: Vec<Tensor> = Vec::new();
    let mut result_rows: Vec<Tensor> = Vec::with_capacity(rows.len());
    for (ri, row) in rows.iter().enumerate() {
        let mut curr_row_blended: Vec<Tensor> = Vec::with_capacity(row.len());
        let mut result_row: Vec<Tensor> = Vec::with_capacity(row.len());
        for (cj, tile) in row.iter().enumerate() {
            let mut tile = tile.clone();
            if ri > 0 {
                tile = blend_v(&prev_row_blended[cj], &tile, blend_extent)?;
            }
            if cj > 0 {
                tile = blend_h(&curr_row_blended[cj - 1], &tile, blend_extent)?;
            }
            curr_row_blended.push(tile.clone());

            let keep_h = out_stride_h.min(tile.dim(2)?);
            let keep_w = out_stride_w.min(tile.dim(3)?);
            result_row.push(tile.narrow(2, 0, keep_h)?.narrow(3, 0, keep_w)?);
        }
        result_rows.push(Tensor::cat(&result_row, 3)?);
        prev_row_blended = curr_row_blended;
    }

    let stitched = Tensor::cat(&result_rows, 2)?;
    let out_h = to_out(height);
    let out_w = to_out(width);
    Ok(stitched.narrow(2, 0, out_h)?.narrow(3, 0, out_w)?.contiguous()?)
}

impl LatentCodec for TiledCodec {
    fn encode(&self, pixels: &Tensor) -> Result<Tensor> {
        let (_b, _c, height, width) = pixels.dims4()?;
        if height <= self.tiles.tile_size && width <= self.tiles.tile_size {
            return self.inner.encode(pixels);
        }
        let inner = self.inner.clone();
        run_tiled(
            pixels,
            self.tiles.tile_size,
            self.tiles.tile_stride,
            1.0 / self.factor() as f64,
            &move |tile| inner.encode(tile),
        )
    }

    fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        let factor = self.factor();
        let latent_tile = self.tiles.tile_size / factor;
        let latent_stride = self.tiles.tile_stride / factor;
        let (_b, _c, height, width) = latents.dims4()?;
        if height <= latent_tile && width <= latent_tile {
            return self.inner.decode(latents);
        }
        let inner = self.inner.clone();
        run_tiled(
            latents,
            latent_tile,
            latent_stride,
            factor as f64,
            &move |tile| inner.decode(tile),
        )
    }
}

/// Shared handle to the first-stage codec, passed between nodes over a
/// `Vae` port.
#[derive(Clone)]
pub struct FirstStageHandle {
    pub codec: Arc<dyn LatentCodec>,
    /// Degradation-removal encoder variant used by the first-stage node;
    /// absent when the checkpoint does not carry one.
    pub denoise_codec: Option<Arc<dyn LatentCodec>>,
    /// Latent scaling applied after encode and inverted before decode.
    pub scale_factor: f64,
    /// Device and dtype the codec's weights live on; adapters marshal
    /// boundary tensors to match.
    pub device: candle_core::Device,
    pub dtype: DType,
}

impl FirstStageHandle {
    /// The codec to run with for one call: the tiling wrapper when enabled,
    /// the bare codec otherwise. Never mutates the shared codec, which makes
    /// switching tiling off trivially reversible.
    pub fn effective_codec(&self, tiling: Option<TileSetup>) -> Arc<dyn LatentCodec> {
        match tiling {
            Some(tiles) => Arc::new(TiledCodec::new(self.codec.clone(), tiles)),
            None => self.codec.clone(),
        }
    }

    pub fn effective_denoise_codec(
        &self,
        tiling: Option<TileSetup>,
    ) -> Option<Arc<dyn LatentCodec>> {
        let denoise = self.denoise_codec.clone()?;
        Some(match tiling {
            Some(tiles) => Arc::new(TiledCodec::new(denoise, tiles)),
            None => denoise,
        })
    }
}
