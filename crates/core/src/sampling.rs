//! The progressive denoising sampler.
//!
//! Noise levels come from the legacy DDPM discretization of a scaled-linear
//! beta schedule. Each step runs the denoiser twice (conditional and
//! unconditional), blends the predictions with the step's guidance scale,
//! optionally re-biases toward the un-noised control latent, and advances
//! the latent with either an Euler update or the DPM++(2M) multistep
//! recurrence. Guidance and control scales interpolate linearly across the
//! run when their endpoints differ.

use anyhow::{bail, Result};
use candle_core::Tensor;
use tracing::{debug, trace};

use crate::arch::ScheduleSpec;
use crate::codec::TileSetup;
use crate::conditioning::{Conditioning, PromptConditioner};
use crate::node::Progress;
use crate::types::LATENT_FACTOR;

/// Denoising seam: given a noisy latent and a noise level, predict the
/// clean latent under the given conditioning with the control residual
/// weighted by `control_scale`.
pub trait Denoiser {
    fn denoise(
        &self,
        noisy: &Tensor,
        sigma: f64,
        cond: &Conditioning,
        control_scale: f64,
    ) -> Result<Tensor>;
}

/// A scale that may interpolate linearly across the run.
///
/// Interpolation is active iff `start != end`; zero is an ordinary scale
/// value, not a disable sentinel. Endpoints are exact: step 0 evaluates to
/// `start` and step N-1 to `end`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearSchedule {
    pub start: f64,
    pub end: f64,
}

impl LinearSchedule {
    pub fn constant(value: f64) -> Self {
        Self {
            start: value,
            end: value,
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.start != self.end
    }

    pub fn at(&self, step: usize, total: usize) -> f64 {
        if !self.is_scheduled() || total <= 1 {
            return self.end;
        }
        let t = step as f64 / (total - 1) as f64;
        self.start + (self.end - self.start) * t
    }
}

/// Per-training-step sigmas of the legacy DDPM discretization, ascending.
pub fn training_sigmas(spec: &ScheduleSpec) -> Vec<f64> {
    let n = spec.num_train_steps;
    let sqrt_start = spec.beta_start.sqrt();
    let sqrt_end = spec.beta_end.sqrt();

    let mut cumprod = 1.0f64;
    let mut sigmas = Vec::with_capacity(n);
    for i in 0..n {
        let t = if n > 1 { i as f64 / (n - 1) as f64 } else { 0.0 };
        let beta = (sqrt_start + t * (sqrt_end - sqrt_start)).powi(2);
        cumprod *= 1.0 - beta;
        sigmas.push(((1.0 - cumprod) / cumprod).sqrt());
    }
    sigmas
}

/// Select `steps` sigmas for one sampling run: evenly spaced over the
/// training range, descending, with a trailing zero.
pub fn sampling_sigmas(full: &[f64], steps: usize) -> Result<Vec<f64>> {
    if steps == 0 {
        bail!("sampler needs at least one step");
    }
    if full.is_empty() {
        bail!("empty training sigma table");
    }
    let n = full.len();
    let mut selected: Vec<f64> = (0..steps)
        .map(|i| {
            let t = if steps > 1 {
                (i as f64 * (n - 1) as f64 / (steps - 1) as f64).round() as usize
            } else {
                n - 1
            };
            full[t]
        })
        .collect();
    selected.reverse();
    selected.push(0.0);
    Ok(selected)
}

/// Sampler variants exposed on the sampler node's choice port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerKind {
    Euler,
    Dpmpp2m,
    TiledEuler,
    TiledDpmpp2m,
}

impl SamplerKind {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "euler" => Ok(Self::Euler),
            "dpmpp_2m" => Ok(Self::Dpmpp2m),
            "tiled_euler" => Ok(Self::TiledEuler),
            "tiled_dpmpp_2m" => Ok(Self::TiledDpmpp2m),
            other => bail!(
                "unknown sampler '{other}', expected one of \
                 euler|dpmpp_2m|tiled_euler|tiled_dpmpp_2m"
            ),
        }
    }

    pub fn is_tiled(&self) -> bool {
        matches!(self, Self::TiledEuler | Self::TiledDpmpp2m)
    }

    fn uses_churn(&self) -> bool {
        matches!(self, Self::Euler | Self::TiledEuler)
    }
}

/// Immutable sampler configuration, compared by value to decide when a node
/// must rebuild its cached sampler instance.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerConfig {
    pub steps: usize,
    pub guidance: LinearSchedule,
    pub control: LinearSchedule,
    pub s_churn: f64,
    pub s_noise: f64,
    /// Restoration anchoring strength; `None` disables anchoring.
    pub restore_strength: Option<f64>,
    pub kind: SamplerKind,
    /// Tile geometry in pixel units for the tiled variants.
    pub tile: Option<TileSetup>,
}

pub struct RestorationSampler {
    config: SamplerConfig,
    sigmas: Vec<f64>,
}

impl RestorationSampler {
    pub fn new(config: SamplerConfig, schedule: &ScheduleSpec) -> Result<Self> {
        if config.kind.is_tiled() && config.tile.is_none() {
            bail!("tiled sampler variants need tile geometry");
        }
        if let Some(tile) = &config.tile {
            if tile.tile_size / LATENT_FACTOR == 0 {
                bail!("sampler tile size {} is below one latent cell", tile.tile_size);
            }
        }
        let sigmas = sampling_sigmas(&training_sigmas(schedule), config.steps)?;
        debug!(
            steps = config.steps,
            sigma_max = sigmas[0],
            kind = ?config.kind,
            "built sampler"
        );
        Ok(Self { config, sigmas })
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    pub fn sigma_max(&self) -> f64 {
        self.sigmas[0]
    }

    /// One denoiser application with CFG, dispatching to the tiled path for
    /// the tiled variants. The control latent is sliced per tile; the text
    /// context is global.
    pub fn denoise_step(
        &self,
        denoiser: &dyn Denoiser,
        x: &Tensor,
        sigma: f64,
        cond: &Conditioning,
        uncond: &Conditioning,
        guidance: f64,
        control_scale: f64,
    ) -> Result<Tensor> {
        match (self.config.kind.is_tiled(), &self.config.tile) {
            (true, Some(tile)) => guided_denoise_tiled(
                denoiser,
                x,
                sigma,
                cond,
                uncond,
                guidance,
                control_scale,
                tile,
            ),
            _ => guided_denoise(denoiser, x, sigma, cond, uncond, guidance, control_scale),
        }
    }

    /// Denoise a single batch item. `anchor` is the un-noised control latent
    /// the restoration guidance re-biases toward.
    pub fn sample_one(
        &self,
        denoiser: &dyn Denoiser,
        cond: &Conditioning,
        uncond: &Conditioning,
        anchor: &Tensor,
    ) -> Result<Tensor> {
        let steps = self.config.steps;
        let sigma_max = self.sigma_max();
        let mut x = (anchor.randn_like(0.0, 1.0)? * sigma_max)?;

        let mut old_denoised: Option<Tensor> = None;
        let mut last_h = 0.0f64;

        for i in 0..steps {
            let sigma = self.sigmas[i];
            let sigma_next = self.sigmas[i + 1];

            // Churn only applies to the Euler variants.
            let gamma = if self.config.kind.uses_churn() && self.config.s_churn > 0.0 {
                (self.config.s_churn / steps as f64).min(2f64.sqrt() - 1.0)
            } else {
                0.0
            };
            let sigma_hat = sigma * (1.0 + gamma);
            if gamma > 0.0 {
                let bump = (sigma_hat * sigma_hat - sigma * sigma).sqrt();
                let eps = (x.randn_like(0.0, 1.0)? * (self.config.s_noise * bump))?;
                x = (x + eps)?;
            }

            let guidance = self.config.guidance.at(i, steps);
            let control_scale = self.config.control.at(i, steps);
            trace!(step = i, sigma_hat, guidance, control_scale, "sampler step");

            let mut denoised =
                self.denoise_step(denoiser, &x, sigma_hat, cond, uncond, guidance, control_scale)?;

            if let Some(strength) = self.config.restore_strength {
                let weight = (sigma_hat / sigma_max).clamp(0.0, 1.0).powf(strength);
                denoised =
                    (denoised.affine(1.0 - weight, 0.0)? + anchor.affine(weight, 0.0)?)?;
            }

            match self.config.kind {
                SamplerKind::Euler | SamplerKind::TiledEuler => {
                    let derivative = ((&x - &denoised)? / sigma_hat)?;
                    x = (x + (derivative * (sigma_next - sigma_hat))?)?;
                }
                SamplerKind::Dpmpp2m | SamplerKind::TiledDpmpp2m => {
                    if sigma_next == 0.0 {
                        x = denoised.clone();
                    } else {
                        let t = -sigma.ln();
                        let t_next = -sigma_next.ln();
                        let h = t_next - t;
                        let coeff = (-h).exp_m1();

                        let update_target = match &old_denoised {
                            Some(old) if last_h > 0.0 => {
                                let r = last_h / h;
                                let c_new = 1.0 + 1.0 / (2.0 * r);
                                let c_old = 1.0 / (2.0 * r);
                                (denoised.affine(c_new, 0.0)? - old.affine(c_old, 0.0)?)?
                            }
                            _ => denoised.clone(),
                        };

                        x = ((x * (sigma_next / sigma))? - (update_target * coeff)?)?;
                        last_h = h;
                    }
                    old_denoised = Some(denoised);
                }
            }
        }

        Ok(x)
    }
}

fn guided_denoise(
    denoiser: &dyn Denoiser,
    x: &Tensor,
    sigma: f64,
    cond: &Conditioning,
    uncond: &Conditioning,
    guidance: f64,
    control_scale: f64,
) -> Result<Tensor> {
    let pred_cond = denoiser.denoise(x, sigma, cond, control_scale)?;
    let pred_uncond = denoiser.denoise(x, sigma, uncond, control_scale)?;
    Ok((&pred_uncond + ((&pred_cond - &pred_uncond)? * guidance)?)?)
}

fn tile_conditioning(cond: &Conditioning, i: usize, h: usize, j: usize, w: usize) -> Result<Conditioning> {
    Ok(Conditioning {
        crossattn: cond.crossattn.clone(),
        control: cond.control.narrow(2, i, h)?.narrow(3, j, w)?.contiguous()?,
    })
}

/// Tiled CFG pass: the model runs per overlapping latent tile and the
/// overlaps are averaged. The integration itself stays global.
#[allow(clippy::too_many_arguments)]
fn guided_denoise_tiled(
    denoiser: &dyn Denoiser,
    x: &Tensor,
    sigma: f64,
    cond: &Conditioning,
    uncond: &Conditioning,
    guidance: f64,
    control_scale: f64,
    tile: &TileSetup,
) -> Result<Tensor> {
    let (b, c, height, width) = x.dims4()?;
    let tile_edge = tile.tile_size / LATENT_FACTOR;
    let stride = (tile.tile_stride / LATENT_FACTOR).max(1);

    if height <= tile_edge && width <= tile_edge {
        return guided_denoise(denoiser, x, sigma, cond, uncond, guidance, control_scale);
    }

    let mut value = x.zeros_like()?;
    let mut weight = Tensor::zeros((b, c, height, width), x.dtype(), x.device())?;

    let mut i = 0;
    while i < height {
        let h_end = (i + tile_edge).min(height);
        let mut j = 0;
        while j < width {
            let w_end = (j + tile_edge).min(width);

            let x_tile = x
                .narrow(2, i, h_end - i)?
                .narrow(3, j, w_end - j)?
                .contiguous()?;
            let cond_tile = tile_conditioning(cond, i, h_end - i, j, w_end - j)?;
            let uncond_tile = tile_conditioning(uncond, i, h_end - i, j, w_end - j)?;

            let denoised_tile = guided_denoise(
                denoiser,
                &x_tile,
                sigma,
                &cond_tile,
                &uncond_tile,
                guidance,
                control_scale,
            )?;

            let ranges = [0..b, 0..c, i..h_end, j..w_end];
            let value_patch = (value.narrow(2, i, h_end - i)?.narrow(3, j, w_end - j)?
                + &denoised_tile)?;
            value = value.slice_assign(&ranges, &value_patch)?;

            let weight_patch = weight
                .narrow(2, i, h_end - i)?
                .narrow(3, j, w_end - j)?
                .affine(1.0, 1.0)?;
            weight = weight.slice_assign(&ranges, &weight_patch)?;

            j += stride;
        }
        i += stride;
    }

    Ok((value / weight)?)
}

/// Prepare per-item conditioning for a whole batch up front, so the text
/// towers can be dropped before the denoising backbones go resident.
pub fn prepare_batch_conditioning(
    conditioner: &dyn PromptConditioner,
    latents: &Tensor,
    captions: &[String],
    positive: &str,
    negative: &str,
) -> Result<Vec<(Conditioning, Conditioning)>> {
    let batch = latents.dims4()?.0;
    let mut pairs = Vec::with_capacity(batch);
    for item in 0..batch {
        let anchor = latents.narrow(0, item, 1)?.contiguous()?;
        let caption = captions.get(item).map(String::as_str).unwrap_or("");
        pairs.push(conditioner.prepare(&anchor, caption, positive, negative)?);
    }
    Ok(pairs)
}

/// Run the sampler once per batch item, stacking the refined latents along
/// the batch dimension. Any failure aborts the whole batch with no partial
/// results.
pub fn sample_batch(
    sampler: &RestorationSampler,
    denoiser: &dyn Denoiser,
    conditioning: &[(Conditioning, Conditioning)],
    latents: &Tensor,
    progress: &Progress,
) -> Result<Tensor> {
    let batch = latents.dims4()?.0;
    if conditioning.len() != batch {
        bail!(
            "conditioning count {} does not match batch size {batch}",
            conditioning.len()
        );
    }
    progress.start(batch as u64);

    let mut refined = Vec::with_capacity(batch);
    for item in 0..batch {
        let anchor = latents.narrow(0, item, 1)?.contiguous()?;
        let (cond, uncond) = &conditioning[item];

        let sample = sampler.sample_one(denoiser, cond, uncond, &anchor)?;
        refined.push(sample);
        progress.advance();
    }

    Ok(Tensor::cat(&refined, 0)?)
}
