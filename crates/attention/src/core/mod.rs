//! Core traits and types shared by volumetric mixing units.
//!
//! Mixers consume `(batch, in_planes, depth, height, width)` volumes and
//! produce `(batch, out_planes, depth, ceil(height / s), ceil(width / s))`
//! for an in-plane stride `s`.

pub mod config;
pub mod errors;

use candle_core::{Result, Tensor};
use layers::{Parameterized, Profiled, Trace};

pub use config::AcmixConfig;
pub use errors::AttentionError;

/// Unified interface for token mixers placed inside a bottleneck.
pub trait VolumetricMixer: Parameterized + Profiled + Send + Sync {
    fn config(&self) -> &AcmixConfig;

    /// Mixes `x`, recording child layers into `trace` under the caller's scope.
    fn forward(&self, x: &Tensor, trace: &mut Trace) -> Result<Tensor>;
}
