//! Hyperparameters of an ACmix unit.
//!
//! The attention path looks at a `kernel_att x kernel_att` in-plane window
//! around every voxel; the convolution path mixes `kernel_conv^2` shifted
//! copies of the projected features. Depth is never strided or windowed by
//! the attention path.

use super::AttentionError;

/// Configuration for [`Acmix`](crate::mixing::Acmix).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcmixConfig {
    pub in_planes: usize,
    pub out_planes: usize,
    /// Side of the in-plane attention window. Must be odd.
    pub kernel_att: usize,
    /// Number of attention heads; `out_planes` must divide evenly.
    pub head: usize,
    /// Side of the shift-convolution kernel. Must be odd.
    pub kernel_conv: usize,
    /// In-plane stride shared by both paths.
    pub stride: usize,
    /// Dilation of the attention window.
    pub dilation: usize,
}

impl AcmixConfig {
    pub fn new(in_planes: usize, out_planes: usize) -> Self {
        Self {
            in_planes,
            out_planes,
            kernel_att: 7,
            head: 4,
            kernel_conv: 3,
            stride: 1,
            dilation: 1,
        }
    }

    pub fn with_kernels(mut self, kernel_att: usize, kernel_conv: usize) -> Self {
        self.kernel_att = kernel_att;
        self.kernel_conv = kernel_conv;
        self
    }

    pub fn with_head(mut self, head: usize) -> Self {
        self.head = head;
        self
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    pub fn with_dilation(mut self, dilation: usize) -> Self {
        self.dilation = dilation;
        self
    }

    /// Channels per head.
    pub fn head_dim(&self) -> usize {
        self.out_planes / self.head
    }

    /// Reflection padding that keeps the attention window centred.
    pub fn padding_att(&self) -> usize {
        (self.dilation * (self.kernel_att - 1) + 1) / 2
    }

    /// In-plane output extent for a `height x width` input.
    pub fn output_plane(&self, height: usize, width: usize) -> (usize, usize) {
        (height.div_ceil(self.stride), width.div_ceil(self.stride))
    }

    pub fn validate(&self) -> Result<(), AttentionError> {
        let invalid = |msg: String| Err(AttentionError::InvalidConfig(msg));
        if self.in_planes == 0 || self.out_planes == 0 {
            return invalid(format!(
                "planes must be non-zero (in={}, out={})",
                self.in_planes, self.out_planes
            ));
        }
        if self.head == 0 {
            return invalid("head must be non-zero".into());
        }
        if self.out_planes % self.head != 0 {
            return invalid(format!(
                "out_planes {} must be divisible by head {}",
                self.out_planes, self.head
            ));
        }
        if self.kernel_att % 2 == 0 {
            return invalid(format!("kernel_att must be odd, got {}", self.kernel_att));
        }
        if self.kernel_conv % 2 == 0 {
            return invalid(format!("kernel_conv must be odd, got {}", self.kernel_conv));
        }
        if self.stride == 0 || self.dilation == 0 {
            return invalid(format!(
                "stride ({}) and dilation ({}) must be non-zero",
                self.stride, self.dilation
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_derived_sizes() {
        let config = AcmixConfig::new(64, 64);
        assert_eq!(config.head_dim(), 16);
        assert_eq!(config.padding_att(), 3);
        assert_eq!(config.with_dilation(2).padding_att(), 6);
        assert!(AcmixConfig::new(64, 64).validate().is_ok());
    }

    #[test]
    fn output_plane_rounds_up() {
        let config = AcmixConfig::new(8, 8).with_stride(2);
        assert_eq!(config.output_plane(5, 8), (3, 4));
        assert_eq!(AcmixConfig::new(8, 8).output_plane(5, 7), (5, 7));
    }

    #[test]
    fn validate_rejects_bad_hyperparameters() {
        let bad = [
            AcmixConfig::new(8, 10),
            AcmixConfig::new(8, 8).with_kernels(6, 3),
            AcmixConfig::new(8, 8).with_kernels(7, 2),
            AcmixConfig::new(8, 8).with_head(0),
            AcmixConfig::new(8, 8).with_stride(0),
            AcmixConfig::new(0, 8),
        ];
        for config in bad {
            let err = config.validate().unwrap_err();
            assert!(matches!(err, AttentionError::InvalidConfig(_)), "{config:?}");
        }
    }
}
