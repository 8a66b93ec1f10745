use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::bundle::RestorationModel;
use crate::codec::FirstStageHandle;

/// Spatial alignment required by the latent pipeline: the autoencoder
/// downsamples by 8 and the backbone by another 8.
pub const SPATIAL_ALIGN: usize = 64;

/// Downsampling factor between pixel space and latent space.
pub const LATENT_FACTOR: usize = 8;

/// Image batch at the node boundary: `B×H×W×C`, f32 in `[0,1]`.
pub struct ImageBatch {
    pub data: Tensor,
}

impl ImageBatch {
    pub fn new(data: Tensor) -> Result<Self> {
        let (_b, _h, _w, c) = data.dims4()?;
        if c != 3 {
            bail!("image batch must have 3 channels, got {c}");
        }
        Ok(Self { data })
    }

    pub fn batch_size(&self) -> Result<usize> {
        Ok(self.data.dims4()?.0)
    }

    /// Height and width in pixels.
    pub fn extent(&self) -> Result<(usize, usize)> {
        let (_b, h, w, _c) = self.data.dims4()?;
        Ok((h, w))
    }
}

/// Latent batch owned by the pipeline between encode and decode:
/// `B×C×(H/8)×(W/8)`, channels-first.
///
/// `original_extent` remembers the pixel size of the source image before the
/// multiple-of-64 crop so decode can restore it.
pub struct LatentBatch {
    pub samples: Tensor,
    pub original_extent: Option<(usize, usize)>,
}

impl LatentBatch {
    pub fn new(samples: Tensor) -> Self {
        Self {
            samples,
            original_extent: None,
        }
    }

    pub fn with_original_extent(samples: Tensor, height: usize, width: usize) -> Self {
        Self {
            samples,
            original_extent: Some((height, width)),
        }
    }

    pub fn batch_size(&self) -> Result<usize> {
        Ok(self.samples.dims4()?.0)
    }
}

/// Convert a boundary image batch (`B×H×W×C`) to the pipeline layout
/// (`B×C×H×W`). The result is contiguous.
pub fn to_channels_first(bhwc: &Tensor) -> Result<Tensor> {
    Ok(bhwc.permute((0, 3, 1, 2))?.contiguous()?)
}

/// Convert a pipeline tensor (`B×C×H×W`) back to the boundary layout
/// (`B×H×W×C`). The result is contiguous.
pub fn to_channels_last(bchw: &Tensor) -> Result<Tensor> {
    Ok(bchw.permute((0, 2, 3, 1))?.contiguous()?)
}

/// Largest multiple of `align` that is `<= dim`. Integer division, so
/// non-aligned sizes are silently truncated rather than rejected.
pub fn aligned_down(dim: usize, align: usize) -> usize {
    dim / align * align
}

/// Crop a `B×H×W×C` tensor down to the nearest lower multiples of `align`
/// along H and W. Returns the input untouched when already aligned.
pub fn crop_to_multiple(bhwc: &Tensor, align: usize) -> Result<Tensor> {
    let (_b, h, w, _c) = bhwc.dims4()?;
    let new_h = aligned_down(h, align);
    let new_w = aligned_down(w, align);
    if new_h == 0 || new_w == 0 {
        bail!("image {h}x{w} is smaller than the required alignment {align}");
    }
    if new_h == h && new_w == w {
        return Ok(bhwc.clone());
    }
    Ok(bhwc.narrow(1, 0, new_h)?.narrow(2, 0, new_w)?)
}

/// Port type identifier for connection validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortType {
    Image,
    Latent,
    Model,
    Vae,
    Int,
    Float,
    Str,
    Bool,
    Path,
}

impl PortType {
    pub fn is_compatible(&self, other: &PortType) -> bool {
        self == other
    }
}

/// Data that flows between node ports.
pub enum PortData {
    Image(ImageBatch),
    Latent(LatentBatch),
    Model(Arc<RestorationModel>),
    Vae(FirstStageHandle),
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Path(PathBuf),
}

impl PortData {
    pub fn port_type(&self) -> PortType {
        match self {
            Self::Image(_) => PortType::Image,
            Self::Latent(_) => PortType::Latent,
            Self::Model(_) => PortType::Model,
            Self::Vae(_) => PortType::Vae,
            Self::Int(_) => PortType::Int,
            Self::Float(_) => PortType::Float,
            Self::Str(_) => PortType::Str,
            Self::Bool(_) => PortType::Bool,
            Self::Path(_) => PortType::Path,
        }
    }
}
