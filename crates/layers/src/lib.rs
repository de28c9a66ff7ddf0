//! Volumetric building blocks assembled from Candle primitives.
//!
//! Candle covers dense math, 2D convolution and elementwise kernels; the
//! volumetric pieces a 3D residual network needs (convolution, batch norm,
//! pooling, reflection padding, window unfolding) are composed here from
//! those primitives. All layers consume `(batch, channels, depth, height,
//! width)` tensors unless documented otherwise, hold learnable state as
//! [`candle_core::Var`]s, and report their cost through [`trace::Profiled`].

pub mod checks;
pub mod conv;
pub mod geometry;
pub mod linear;
pub mod norm;
pub mod padding;
pub mod params;
pub mod pool;
pub mod trace;

pub use conv::{Conv3d, Conv3dConfig, ConvInit};
pub use linear::{Linear, LinearConfig};
pub use norm::{BatchNorm3d, BatchNormConfig};
pub use params::{NamedParameter, ParameterCount, Parameterized};
pub use pool::{AdaptiveAvgPool3d, MaxPool3d};
pub use trace::{LayerRecord, Profiled, Trace};
