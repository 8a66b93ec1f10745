//! Conditioning assembly for guided denoising.
//!
//! One sampling call gets a conditional and an unconditional bundle: text
//! embeddings from both towers concatenated along the feature axis, plus the
//! control latent (the encoded low-quality input) the control backbone is
//! steered by.

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor, D};
use candle_core::Module;
use candle_transformers::models::stable_diffusion::clip::ClipTextTransformer;
use tokenizers::Tokenizer;
use tracing::debug;

/// Conditioning for one denoiser evaluation. Scoped to a single sampling
/// call; never cached.
pub struct Conditioning {
    /// Cross-attention context, `1×T×D`.
    pub crossattn: Tensor,
    /// Control latent, `1×C×h×w`, aligned with the latent being denoised.
    pub control: Tensor,
}

/// Builder seam between the sampler node and the text towers.
pub trait PromptConditioner {
    /// Produce the (conditional, unconditional) pair for one batch item.
    fn prepare(
        &self,
        control_latent: &Tensor,
        caption: &str,
        positive: &str,
        negative: &str,
    ) -> Result<(Conditioning, Conditioning)>;
}

/// Join a per-item caption with the shared positive prompt.
pub fn combine_caption(caption: &str, positive: &str) -> String {
    let caption = caption.trim();
    if caption.is_empty() {
        positive.to_string()
    } else if positive.trim().is_empty() {
        caption.to_string()
    } else {
        format!("{caption}, {positive}")
    }
}

/// Pad a token sequence to the tower's context length, erroring when the
/// prompt does not fit.
pub fn pad_tokens(mut tokens: Vec<u32>, pad_id: u32, max_len: usize) -> Result<Vec<u32>> {
    if tokens.len() > max_len {
        bail!(
            "prompt is too long: {} tokens exceed the context length {}",
            tokens.len(),
            max_len
        );
    }
    while tokens.len() < max_len {
        tokens.push(pad_id);
    }
    Ok(tokens)
}

/// Dual-tower text conditioner.
///
/// The towers live on the compute device for exactly as long as this value
/// does; the sampler node constructs it right before conditioning and drops
/// it before the denoising loop starts, so the towers and the backbones are
/// never resident together.
pub struct ClipConditioner {
    tokenizer: Tokenizer,
    primary: ClipTextTransformer,
    secondary: ClipTextTransformer,
    primary_pad: u32,
    secondary_pad: u32,
    primary_context: usize,
    secondary_context: usize,
    device: Device,
    dtype: DType,
}

impl ClipConditioner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tokenizer: Tokenizer,
        primary: ClipTextTransformer,
        secondary: ClipTextTransformer,
        primary_pad_token: Option<&str>,
        secondary_pad_token: Option<&str>,
        primary_context: usize,
        secondary_context: usize,
        device: Device,
        dtype: DType,
    ) -> Result<Self> {
        let primary_pad = Self::pad_id(&tokenizer, primary_pad_token)?;
        let secondary_pad = Self::pad_id(&tokenizer, secondary_pad_token)?;
        Ok(Self {
            tokenizer,
            primary,
            secondary,
            primary_pad,
            secondary_pad,
            primary_context,
            secondary_context,
            device,
            dtype,
        })
    }

    fn pad_id(tokenizer: &Tokenizer, pad_token: Option<&str>) -> Result<u32> {
        let token = pad_token.unwrap_or("<|endoftext|>");
        tokenizer
            .get_vocab(true)
            .get(token)
            .copied()
            .with_context(|| format!("tokenizer has no '{token}' padding token"))
    }

    fn embed(&self, text: &str) -> Result<Tensor> {
        let ids = self
            .tokenizer
            .encode(text, true)
            .map_err(anyhow::Error::msg)?
            .get_ids()
            .to_vec();

        let primary_ids = pad_tokens(ids.clone(), self.primary_pad, self.primary_context)?;
        let primary_ids = Tensor::new(primary_ids.as_slice(), &self.device)?.unsqueeze(0)?;
        let primary = self.primary.forward(&primary_ids)?;

        let secondary_ids = pad_tokens(ids, self.secondary_pad, self.secondary_context)?;
        let secondary_ids = Tensor::new(secondary_ids.as_slice(), &self.device)?.unsqueeze(0)?;
        let secondary = self.secondary.forward(&secondary_ids)?;

        Ok(Tensor::cat(&[primary, secondary], D::Minus1)?.to_dtype(self.dtype)?)
    }
}

impl PromptConditioner for ClipConditioner {
    fn prepare(
        &self,
        control_latent: &Tensor,
        caption: &str,
        positive: &str,
        negative: &str,
    ) -> Result<(Conditioning, Conditioning)> {
        let positive_text = combine_caption(caption, positive);
        debug!(positive = %positive_text, negative, "encoding prompts");

        let crossattn = self.embed(&positive_text)?;
        let uncond_crossattn = self.embed(negative)?;
        let control = control_latent.to_dtype(self.dtype)?;

        Ok((
            Conditioning {
                crossattn,
                control: control.clone(),
            },
            Conditioning {
                crossattn: uncond_crossattn,
                control,
            },
        ))
    }
}
