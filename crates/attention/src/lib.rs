//! Hybrid self-attention / convolution mixing for volumetric feature maps.
//!
//! Tensors use the layout `(batch, channels, depth, height, width)`. An
//! [`Acmix`] unit projects its input once into query, key and value volumes
//! and feeds them to two paths:
//!
//! * a local window self-attention over the in-plane axes with a relative
//!   coordinate term, reflection padded at the borders;
//! * a shift convolution that regroups the projections and applies a grouped
//!   convolution initialised to in-plane shifts.
//!
//! The paths are blended by two learnable scalars initialised to `0.5`.
//! Both honour the same in-plane stride, so outputs have extent
//! `ceil(n / stride)` in height and width and keep their depth.

pub mod core;
pub mod mixing;

pub use crate::core::{AcmixConfig, AttentionError, VolumetricMixer};
pub use crate::mixing::Acmix;
