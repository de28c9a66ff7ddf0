//! Volumetric pooling.
//!
//! Both pools are separable: a box maximum (or mean over a rectangular bin)
//! equals the reduction applied one axis at a time, so each axis is handled
//! with a 1D window gather followed by a reduction.

use candle_core::{bail, Result, Tensor};

use crate::{
    checks,
    padding::{pad_constant, windows},
    trace::{elems, Profiled},
};

/// Cubic max pooling over depth, height and width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxPool3d {
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
}

impl MaxPool3d {
    pub fn new(kernel: usize, stride: usize, padding: usize) -> Result<Self> {
        if kernel == 0 || stride == 0 {
            bail!("max_pool kernel ({kernel}) and stride ({stride}) must be non-zero");
        }
        if padding > kernel / 2 {
            bail!("max_pool padding {padding} must be at most half the kernel ({kernel})");
        }
        Ok(Self {
            kernel,
            stride,
            padding,
        })
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        checks::expect_rank("max_pool.input", input, 5)?;
        let mut out = input.clone();
        for dim in 2..5 {
            let padded = pad_constant(&out, dim, self.padding, f64::NEG_INFINITY)?;
            let (gathered, _) = windows(&padded, dim, self.kernel, self.stride, 1)?;
            out = gathered.max(dim + 1)?;
        }
        Ok(out)
    }
}

impl Profiled for MaxPool3d {
    fn kind(&self) -> &'static str {
        "MaxPool3d"
    }

    fn own_parameters(&self) -> usize {
        0
    }

    fn macs(&self, _input: &[usize], _output: &[usize]) -> u64 {
        0
    }
}

/// Average pooling to a fixed `[depth, height, width]` output size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptiveAvgPool3d {
    pub output: [usize; 3],
}

impl AdaptiveAvgPool3d {
    pub fn new(output: [usize; 3]) -> Result<Self> {
        if output.contains(&0) {
            bail!("adaptive pooling output {output:?} must be non-zero");
        }
        Ok(Self { output })
    }

    /// Pools every spatial axis down to a single cell.
    pub fn global() -> Self {
        Self { output: [1; 3] }
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        checks::expect_rank("adaptive_avg_pool.input", input, 5)?;
        let mut out = input.clone();
        for (axis, &target) in self.output.iter().enumerate() {
            let dim = axis + 2;
            let size = out.dim(dim)?;
            if size == target {
                continue;
            }
            let mut bins = Vec::with_capacity(target);
            for i in 0..target {
                let start = i * size / target;
                let end = ((i + 1) * size).div_ceil(target);
                bins.push(out.narrow(dim, start, end - start)?.mean_keepdim(dim)?);
            }
            out = Tensor::cat(&bins, dim)?;
        }
        Ok(out)
    }
}

impl Profiled for AdaptiveAvgPool3d {
    fn kind(&self) -> &'static str {
        "AdaptiveAvgPool3d"
    }

    fn own_parameters(&self) -> usize {
        0
    }

    fn macs(&self, input: &[usize], output: &[usize]) -> u64 {
        let kernel: u64 = input
            .iter()
            .skip(2)
            .zip(output.iter().skip(2))
            .map(|(&i, &o)| (i / o.max(1)) as u64)
            .product();
        (kernel + 1) * elems(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn max_pool_halves_with_padding() -> Result<()> {
        let device = Device::Cpu;
        let pool = MaxPool3d::new(3, 2, 1)?;
        let input = Tensor::randn(0f32, 1.0, (2, 3, 32, 8, 8), &device)?;
        assert_eq!(pool.forward(&input)?.dims(), &[2, 3, 16, 4, 4]);

        let odd = Tensor::randn(0f32, 1.0, (1, 1, 5, 5, 5), &device)?;
        assert_eq!(pool.forward(&odd)?.dims(), &[1, 1, 3, 3, 3]);
        Ok(())
    }

    #[test]
    fn max_pool_matches_brute_force() -> Result<()> {
        let device = Device::Cpu;
        let pool = MaxPool3d::new(3, 2, 1)?;
        let input = Tensor::randn(0f32, 1.0, (1, 1, 4, 4, 4), &device)?;
        let values = input.flatten_all()?.to_vec1::<f32>()?;
        let output = pool.forward(&input)?.flatten_all()?.to_vec1::<f32>()?;

        let mut expected = Vec::new();
        for od in 0..2usize {
            for oh in 0..2usize {
                for ow in 0..2usize {
                    let mut best = f32::NEG_INFINITY;
                    for d in (2 * od).saturating_sub(1)..(2 * od + 2).min(4) {
                        for h in (2 * oh).saturating_sub(1)..(2 * oh + 2).min(4) {
                            for w in (2 * ow).saturating_sub(1)..(2 * ow + 2).min(4) {
                                best = best.max(values[(d * 4 + h) * 4 + w]);
                            }
                        }
                    }
                    expected.push(best);
                }
            }
        }
        assert_eq!(output, expected);
        Ok(())
    }

    #[test]
    fn max_pool_rejects_oversized_padding() {
        assert!(MaxPool3d::new(3, 2, 2).is_err());
        assert!(MaxPool3d::new(0, 1, 0).is_err());
    }

    #[test]
    fn global_average_equals_mean() -> Result<()> {
        let device = Device::Cpu;
        let input = Tensor::randn(0f32, 1.0, (2, 4, 3, 5, 2), &device)?;
        let pooled = AdaptiveAvgPool3d::global().forward(&input)?;
        assert_eq!(pooled.dims(), &[2, 4, 1, 1, 1]);
        let expected = input.flatten_from(2)?.mean_keepdim(2)?.flatten_all()?;
        let diff = pooled
            .flatten_all()?
            .sub(&expected)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()?;
        assert!(diff < 1e-5);
        Ok(())
    }

    #[test]
    fn adaptive_bins_overlap_for_uneven_sizes() -> Result<()> {
        let device = Device::Cpu;
        let input = Tensor::arange(0f32, 5., &device)?.reshape((1, 1, 1, 1, 5))?;
        let pool = AdaptiveAvgPool3d::new([1, 1, 3])?;
        let pooled = pool.forward(&input)?.flatten_all()?.to_vec1::<f32>()?;
        // bins [0, 2), [1, 4), [3, 5)
        assert_eq!(pooled, vec![0.5, 2.0, 3.5]);
        Ok(())
    }

    #[test]
    fn pooling_cost_model() -> Result<()> {
        let pool = AdaptiveAvgPool3d::global();
        assert_eq!(pool.macs(&[2, 8, 4, 2, 2], &[2, 8, 1, 1, 1]), 17 * 16);
        let max_pool = MaxPool3d::new(3, 2, 1)?;
        assert_eq!(max_pool.macs(&[1], &[1]), 0);
        Ok(())
    }
}
