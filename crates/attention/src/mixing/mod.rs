//! The ACmix mixing unit and its two paths.

pub mod acmix;
pub mod shift;
pub mod window;

pub use acmix::Acmix;
pub use shift::ShiftConvolution;
pub use window::WindowAttention;
