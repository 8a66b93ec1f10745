//! Compute-device selection and the stage-residency discipline.
//!
//! Device memory is a process-wide singleton resource. Every heavy stage
//! (first-stage codec, text towers, sampler backbones) is materialized on the
//! device through a [`StageLease`] and dropped when its phase of the pipeline
//! is done, so at most one stage's working set is resident at peak.

use anyhow::{bail, Result};
use candle_core::{DType, Device};
use tracing::{debug, warn};

/// Working-precision choice exposed on loader/encoder ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtypeChoice {
    Auto,
    Fp16,
    Bf16,
    Fp32,
}

impl DtypeChoice {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "fp16" => Ok(Self::Fp16),
            "bf16" => Ok(Self::Bf16),
            "fp32" => Ok(Self::Fp32),
            other => bail!("unknown dtype '{other}', expected one of auto|fp16|bf16|fp32"),
        }
    }

    /// Resolve to a concrete dtype for the given device.
    ///
    /// `Auto` picks bf16 on CUDA and f32 on CPU. On any other device the
    /// capability cannot be probed here, so resolution fails and the caller
    /// must set the dtype manually.
    pub fn resolve(self, device: &Device) -> Result<DType> {
        match self {
            Self::Fp16 => Ok(DType::F16),
            Self::Bf16 => Ok(DType::BF16),
            Self::Fp32 => Ok(DType::F32),
            Self::Auto => {
                if device.is_cuda() {
                    Ok(DType::BF16)
                } else if matches!(device, Device::Cpu) {
                    Ok(DType::F32)
                } else {
                    bail!(
                        "cannot autodetect a working dtype for this device; \
                         set the dtype port manually"
                    )
                }
            }
        }
    }
}

impl std::fmt::Display for DtypeChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Fp16 => write!(f, "fp16"),
            Self::Bf16 => write!(f, "bf16"),
            Self::Fp32 => write!(f, "fp32"),
        }
    }
}

/// Pick the compute device from a preference string ("cuda"/"cpu").
/// Falls back to CPU with a warning when CUDA is requested but unavailable.
pub fn select_device(prefer: &str, cuda_ordinal: usize) -> Result<Device> {
    match prefer.to_ascii_lowercase().as_str() {
        "cpu" => Ok(Device::Cpu),
        _ => {
            if candle_core::utils::cuda_is_available() {
                Ok(Device::new_cuda(cuda_ordinal)?)
            } else {
                warn!("CUDA is not available, falling back to CPU");
                Ok(Device::Cpu)
            }
        }
    }
}

/// Holds a device-resident stage for the duration of one pipeline phase.
///
/// Dropping the lease (or calling [`StageLease::release`]) frees the stage's
/// tensors; on CUDA that returns the memory to the allocator immediately.
pub struct StageLease<T> {
    name: &'static str,
    inner: Option<T>,
}

impl<T> StageLease<T> {
    pub fn new(name: &'static str, inner: T) -> Self {
        debug!(stage = name, "stage resident on device");
        Self {
            name,
            inner: Some(inner),
        }
    }

    pub fn get(&self) -> Option<&T> {
        self.inner.as_ref()
    }

    pub fn is_resident(&self) -> bool {
        self.inner.is_some()
    }

    /// Drop the stage now instead of at end of scope.
    pub fn release(&mut self) {
        if self.inner.take().is_some() {
            debug!(stage = self.name, "stage released from device");
        }
    }
}

impl<T> Drop for StageLease<T> {
    fn drop(&mut self) {
        self.release();
    }
}
