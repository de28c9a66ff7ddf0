//! ACmix-3D: a residual bottleneck network for volumetric classification
//! whose middle convolutions are hybrid attention/convolution mixers.

pub mod block;
pub mod config;
pub mod errors;
pub mod model;
pub mod summary;

pub use block::{Bottleneck, BottleneckConfig, Downsample, EXPANSION};
pub use config::{NetworkConfig, Precision};
pub use errors::ModelError;
pub use model::Acmix3d;
pub use summary::{format_thousands, ProfileReport};
