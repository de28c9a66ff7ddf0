//! Volumetric convolution built from grouped 2D convolutions.
//!
//! Candle ships 1D and 2D kernels only, so a `(kd, kh, kw)` convolution is
//! evaluated as `kd` in-plane convolutions over depth-shifted slices whose
//! outputs are summed. Inputs are `(batch, channels, depth, height, width)`
//! and outputs follow the usual arithmetic per axis:
//! `out = (n + 2 * pad - dilation * (kernel - 1) - 1) / stride + 1`.
//!
//! In-plane stride and dilation must be isotropic because the underlying 2D
//! kernel takes a single value for both axes. Padding is applied up front and
//! may differ per axis.

use candle_core::{bail, DType, Device, Error, Result, Tensor, Var};

use crate::{
    checks,
    params::{join, NamedParameter, Parameterized},
    padding::window_count,
    trace::{elems, Profiled},
};

/// Static description of a 3D convolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conv3dConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    /// `[depth, height, width]` kernel extents.
    pub kernel: [usize; 3],
    pub stride: [usize; 3],
    pub padding: [usize; 3],
    pub dilation: [usize; 3],
    pub groups: usize,
    pub bias: bool,
}

impl Conv3dConfig {
    /// A `1x1x1` projection with bias.
    pub fn pointwise(in_channels: usize, out_channels: usize) -> Self {
        Self {
            in_channels,
            out_channels,
            kernel: [1; 3],
            stride: [1; 3],
            padding: [0; 3],
            dilation: [1; 3],
            groups: 1,
            bias: true,
        }
    }

    /// A cubic kernel with "same" padding for odd sizes.
    pub fn cube(in_channels: usize, out_channels: usize, kernel: usize) -> Self {
        Self {
            kernel: [kernel; 3],
            padding: [kernel / 2; 3],
            ..Self::pointwise(in_channels, out_channels)
        }
    }

    pub fn with_stride(mut self, stride: [usize; 3]) -> Self {
        self.stride = stride;
        self
    }

    pub fn with_padding(mut self, padding: [usize; 3]) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }

    pub fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }

    /// Number of taps in one kernel.
    pub fn kernel_volume(&self) -> usize {
        self.kernel.iter().product()
    }

    /// Input channels seen by each output channel.
    pub fn channels_per_group(&self) -> usize {
        self.in_channels / self.groups
    }

    /// Checks channel/group divisibility and the isotropy constraints.
    pub fn validate(&self) -> Result<()> {
        if self.in_channels == 0 || self.out_channels == 0 {
            bail!(
                "conv3d channels must be non-zero (in={}, out={})",
                self.in_channels,
                self.out_channels
            );
        }
        if self.groups == 0 {
            bail!("conv3d groups must be non-zero");
        }
        if self.in_channels % self.groups != 0 || self.out_channels % self.groups != 0 {
            bail!(
                "conv3d channels (in={}, out={}) must be divisible by groups ({})",
                self.in_channels,
                self.out_channels,
                self.groups
            );
        }
        if self.kernel.contains(&0) || self.stride.contains(&0) || self.dilation.contains(&0) {
            bail!(
                "conv3d kernel {:?}, stride {:?} and dilation {:?} must be non-zero",
                self.kernel,
                self.stride,
                self.dilation
            );
        }
        if self.stride[1] != self.stride[2] || self.dilation[1] != self.dilation[2] {
            bail!(
                "conv3d in-plane stride {:?} and dilation {:?} must match across height and width",
                &self.stride[1..],
                &self.dilation[1..]
            );
        }
        Ok(())
    }

    /// Output `[depth, height, width]` for an input volume.
    pub fn output_dims(&self, input: [usize; 3]) -> Result<[usize; 3]> {
        let mut out = [0; 3];
        for axis in 0..3 {
            out[axis] = window_count(
                input[axis] + 2 * self.padding[axis],
                self.kernel[axis],
                self.stride[axis],
                self.dilation[axis],
            )
            .map_err(|err| {
                Error::Msg(format!(
                    "conv3d axis {axis} of input {input:?} too small for kernel {:?}: {err}",
                    self.kernel
                ))
            })?;
        }
        Ok(out)
    }

    fn weight_shape(&self) -> [usize; 5] {
        let [kd, kh, kw] = self.kernel;
        [self.out_channels, self.channels_per_group(), kd, kh, kw]
    }

    fn fan_in(&self) -> f64 {
        (self.channels_per_group() * self.kernel_volume()) as f64
    }

    fn fan_out(&self) -> f64 {
        (self.out_channels * self.kernel_volume()) as f64
    }
}

/// Weight initialisation policies for volumetric convolutions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConvInit {
    /// He normal with fan-out scaling and ReLU gain, `std = sqrt(2 / fan_out)`.
    KaimingNormalFanOut,
    /// Uniform in `±1/sqrt(fan_in)`, the usual framework default.
    DefaultUniform,
    /// One-hot in-plane shift kernels at the central depth tap; bias zeroed.
    ///
    /// Input channel `i` of each group routes to offset `(i / kw, i % kw)`,
    /// so `channels_per_group` must equal `kh * kw`.
    Shift,
    /// All zeros, mainly for tests.
    Zeros,
}

impl ConvInit {
    fn sample_weight(&self, config: &Conv3dConfig, device: &Device, dtype: DType) -> Result<Tensor> {
        let shape = config.weight_shape();
        let weight = match self {
            ConvInit::KaimingNormalFanOut => {
                let std = (2.0 / config.fan_out()).sqrt();
                Tensor::randn(0f32, std as f32, shape.to_vec(), device)?
            }
            ConvInit::DefaultUniform => {
                let bound = 1.0 / config.fan_in().sqrt();
                Tensor::rand(-bound as f32, bound as f32, shape.to_vec(), device)?
            }
            ConvInit::Shift => shift_kernel(config, device)?,
            ConvInit::Zeros => Tensor::zeros(shape.to_vec(), DType::F32, device)?,
        };
        weight.to_dtype(dtype)
    }

    fn sample_bias(&self, config: &Conv3dConfig, device: &Device, dtype: DType) -> Result<Tensor> {
        match self {
            ConvInit::Shift | ConvInit::Zeros => Tensor::zeros(config.out_channels, dtype, device),
            ConvInit::KaimingNormalFanOut | ConvInit::DefaultUniform => {
                let bound = 1.0 / config.fan_in().sqrt();
                Tensor::rand(-bound as f32, bound as f32, config.out_channels, device)?
                    .to_dtype(dtype)
            }
        }
    }
}

fn shift_kernel(config: &Conv3dConfig, device: &Device) -> Result<Tensor> {
    let [out, per_group, kd, kh, kw] = config.weight_shape();
    if per_group != kh * kw {
        bail!(
            "shift init needs {} input channels per group for a {kh}x{kw} plane, got {per_group}",
            kh * kw
        );
    }
    let centre = kd / 2;
    let tap_stride = kd * kh * kw;
    let mut data = vec![0f32; out * per_group * tap_stride];
    for o in 0..out {
        for i in 0..per_group {
            let offset = (o * per_group + i) * tap_stride + centre * kh * kw + i;
            // i == (i / kw) * kw + i % kw, so `i` is already the in-plane tap
            data[offset] = 1.0;
        }
    }
    Tensor::from_vec(data, vec![out, per_group, kd, kh, kw], device)
}

/// 3D convolution with optional bias and grouped channels.
#[derive(Debug, Clone)]
pub struct Conv3d {
    config: Conv3dConfig,
    weight: Var,
    bias: Option<Var>,
}

impl Conv3d {
    /// Constructs a convolution from pre-existing parameters.
    pub fn new(config: Conv3dConfig, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        config.validate()?;
        checks::expect_shape("conv3d.weight", &weight, &config.weight_shape())?;
        checks::expect_dtype_in("conv3d.weight", &weight, &checks::FLOAT_DTYPES)?;
        match (&bias, config.bias) {
            (Some(tensor), true) => {
                checks::expect_shape("conv3d.bias", tensor, &[config.out_channels])?;
                if tensor.dtype() != weight.dtype() {
                    bail!(
                        "conv3d.bias dtype {:?} differs from weight dtype {:?}",
                        tensor.dtype(),
                        weight.dtype()
                    );
                }
            }
            (None, false) => {}
            (Some(_), false) => bail!("bias provided but config disables bias"),
            (None, true) => bail!("config expects bias but none supplied"),
        }
        Ok(Self {
            config,
            weight: Var::from_tensor(&weight)?,
            bias: bias.map(|b| Var::from_tensor(&b)).transpose()?,
        })
    }

    /// Builds a convolution with weights drawn from `init`.
    pub fn with_init(
        config: Conv3dConfig,
        init: ConvInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        config.validate()?;
        let weight = init.sample_weight(&config, device, dtype)?;
        let bias = if config.bias {
            Some(init.sample_bias(&config, device, dtype)?)
        } else {
            None
        };
        Self::new(config, weight, bias)
    }

    pub fn config(&self) -> &Conv3dConfig {
        &self.config
    }

    pub fn weight(&self) -> &Tensor {
        self.weight.as_tensor()
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref().map(Var::as_tensor)
    }

    /// Applies the convolution to a `(batch, channels, depth, height, width)` volume.
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let cfg = &self.config;
        checks::expect_volume("conv3d.input", input, cfg.in_channels)?;
        let (batch, channels, depth, height, width) = input.dims5()?;
        let [out_d, out_h, out_w] = cfg.output_dims([depth, height, width])?;
        let [kd, _, _] = cfg.kernel;
        let [stride_d, stride_hw, _] = cfg.stride;
        let [dilation_d, dilation_hw, _] = cfg.dilation;
        let [pad_d, pad_h, pad_w] = cfg.padding;

        let padded = input
            .pad_with_zeros(2, pad_d, pad_d)?
            .pad_with_zeros(3, pad_h, pad_h)?
            .pad_with_zeros(4, pad_w, pad_w)?;
        let (_, _, _, padded_h, padded_w) = padded.dims5()?;

        let mut acc: Option<Tensor> = None;
        for tap in 0..kd {
            let depths: Vec<u32> = (0..out_d)
                .map(|o| (o * stride_d + tap * dilation_d) as u32)
                .collect();
            let index = Tensor::from_vec(depths, out_d, input.device())?;
            let planes = padded
                .contiguous()?
                .index_select(&index, 2)?
                .permute((0, 2, 1, 3, 4))?
                .reshape((batch * out_d, channels, padded_h, padded_w))?;
            let kernel = self.weight.narrow(2, tap, 1)?.squeeze(2)?.contiguous()?;
            let partial = planes.conv2d(&kernel, 0, stride_hw, dilation_hw, cfg.groups)?;
            acc = Some(match acc {
                Some(sum) => (sum + partial)?,
                None => partial,
            });
        }
        let summed = acc.ok_or_else(|| Error::Msg("conv3d kernel has no depth taps".into()))?;

        let mut output = summed
            .reshape((batch, out_d, cfg.out_channels, out_h, out_w))?
            .permute((0, 2, 1, 3, 4))?;
        if let Some(bias) = &self.bias {
            let bias = bias.reshape((1, cfg.out_channels, 1, 1, 1))?;
            output = output.broadcast_add(&bias)?;
        }
        output.contiguous()
    }
}

impl Parameterized for Conv3d {
    fn collect_parameters(&self, prefix: &str, out: &mut Vec<NamedParameter>) {
        out.push(NamedParameter::new(join(prefix, "weight"), self.weight.clone()));
        if let Some(bias) = &self.bias {
            out.push(NamedParameter::new(join(prefix, "bias"), bias.clone()));
        }
    }
}

impl Profiled for Conv3d {
    fn kind(&self) -> &'static str {
        "Conv3d"
    }

    fn own_parameters(&self) -> usize {
        self.weight.elem_count() + self.bias.as_ref().map_or(0, |b| b.elem_count())
    }

    fn macs(&self, _input: &[usize], output: &[usize]) -> u64 {
        let per_output =
            (self.config.channels_per_group() * self.config.kernel_volume()) as u64
                + u64::from(self.config.bias);
        elems(output) * per_output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Direct loop-nest convolution used as ground truth.
    fn reference_conv3d(input: &Tensor, conv: &Conv3d) -> Result<Tensor> {
        let cfg = conv.config();
        let (batch, _, depth, height, width) = input.dims5()?;
        let [od, oh, ow] = cfg.output_dims([depth, height, width])?;
        let x = input.flatten_all()?.to_vec1::<f32>()?;
        let w = conv.weight().flatten_all()?.to_vec1::<f32>()?;
        let b = match conv.bias() {
            Some(bias) => bias.to_vec1::<f32>()?,
            None => vec![0.0; cfg.out_channels],
        };
        let [kd, kh, kw] = cfg.kernel;
        let per_group = cfg.channels_per_group();
        let out_per_group = cfg.out_channels / cfg.groups;
        let at = |n: usize, c: usize, d: isize, h: isize, w_: isize| -> f32 {
            if d < 0 || h < 0 || w_ < 0 {
                return 0.0;
            }
            let (d, h, w_) = (d as usize, h as usize, w_ as usize);
            if d >= depth || h >= height || w_ >= width {
                return 0.0;
            }
            x[(((n * cfg.in_channels + c) * depth + d) * height + h) * width + w_]
        };

        let mut out = Vec::with_capacity(batch * cfg.out_channels * od * oh * ow);
        for n in 0..batch {
            for o in 0..cfg.out_channels {
                let group = o / out_per_group;
                for zd in 0..od {
                    for zh in 0..oh {
                        for zw in 0..ow {
                            let mut acc = b[o];
                            for ci in 0..per_group {
                                let c = group * per_group + ci;
                                for a in 0..kd {
                                    for p in 0..kh {
                                        for q in 0..kw {
                                            let d = (zd * cfg.stride[0] + a * cfg.dilation[0])
                                                as isize
                                                - cfg.padding[0] as isize;
                                            let h = (zh * cfg.stride[1] + p * cfg.dilation[1])
                                                as isize
                                                - cfg.padding[1] as isize;
                                            let ww = (zw * cfg.stride[2] + q * cfg.dilation[2])
                                                as isize
                                                - cfg.padding[2] as isize;
                                            let widx =
                                                (((o * per_group + ci) * kd + a) * kh + p) * kw + q;
                                            acc += w[widx] * at(n, c, d, h, ww);
                                        }
                                    }
                                }
                            }
                            out.push(acc);
                        }
                    }
                }
            }
        }
        Tensor::from_vec(out, (batch, cfg.out_channels, od, oh, ow), input.device())
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        a.sub(b)?.abs()?.max_all()?.to_vec0::<f32>()
    }

    #[test]
    fn forward_matches_reference_loop_nest() -> Result<()> {
        let device = Device::Cpu;
        let configs = [
            Conv3dConfig::cube(2, 4, 3),
            Conv3dConfig::cube(4, 4, 3).with_groups(2).with_bias(false),
            Conv3dConfig::cube(3, 2, 3).with_stride([2, 2, 2]),
            Conv3dConfig::cube(2, 3, 3).with_stride([1, 2, 2]).with_padding([1, 0, 2]),
            Conv3dConfig {
                dilation: [2, 1, 1],
                padding: [2, 1, 1],
                ..Conv3dConfig::cube(1, 2, 3)
            },
            Conv3dConfig::pointwise(3, 5),
        ];
        for config in configs {
            let conv = Conv3d::with_init(config.clone(), ConvInit::DefaultUniform, &device, DType::F32)?;
            let input = Tensor::randn(0f32, 1.0, (2, config.in_channels, 5, 6, 4), &device)?;
            let output = conv.forward(&input)?;
            let reference = reference_conv3d(&input, &conv)?;
            assert_eq!(output.dims(), reference.dims(), "{config:?}");
            let diff = max_diff(&output, &reference)?;
            assert!(diff < 1e-4, "max diff {diff} for {config:?}");
        }
        Ok(())
    }

    #[test]
    fn output_dims_follow_conv_arithmetic() -> Result<()> {
        let stem = Conv3dConfig::cube(1, 64, 7);
        assert_eq!(stem.output_dims([32, 8, 8])?, [32, 8, 8]);

        let strided = Conv3dConfig::cube(8, 8, 3).with_stride([1, 2, 2]);
        assert_eq!(strided.output_dims([16, 5, 4])?, [16, 3, 2]);

        let tiny = Conv3dConfig::cube(1, 1, 3).with_padding([0; 3]);
        assert!(tiny.output_dims([2, 4, 4]).is_err());
        Ok(())
    }

    #[test]
    fn validate_rejects_bad_groups_and_anisotropic_stride() {
        assert!(Conv3dConfig::pointwise(6, 4).with_groups(4).validate().is_err());
        assert!(Conv3dConfig::pointwise(4, 4).with_stride([1, 2, 1]).validate().is_err());
        assert!(Conv3dConfig::pointwise(4, 4).with_stride([2, 1, 1]).validate().is_ok());
    }

    #[test]
    fn shift_init_routes_channels_to_plane_offsets() -> Result<()> {
        let device = Device::Cpu;
        // one group of 9 shift channels, one output per group
        let config = Conv3dConfig::cube(9, 1, 3);
        let conv = Conv3d::with_init(config, ConvInit::Shift, &device, DType::F32)?;
        assert_eq!(conv.bias().map(|b| b.to_vec1::<f32>()).transpose()?, Some(vec![0.0]));

        // Feed a single impulse in channel 4 (the centre tap): the output is
        // the input itself.
        let mut data = vec![0f32; 9 * 3 * 3 * 3];
        let centre = 4 * 27 + 27 / 2;
        data[centre] = 1.0;
        let input = Tensor::from_vec(data, (1, 9, 3, 3, 3), &device)?;
        let out = conv.forward(&input)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(out[13], 1.0);
        assert_eq!(out.iter().sum::<f32>(), 1.0);

        // Channel 0 reads the top-left neighbour, so an impulse at (1, 1)
        // lands on the bottom-right output position (2, 2).
        let mut data = vec![0f32; 9 * 27];
        data[13] = 1.0;
        let input = Tensor::from_vec(data, (1, 9, 3, 3, 3), &device)?;
        let out = conv.forward(&input)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(out[9 + 2 * 3 + 2], 1.0);
        Ok(())
    }

    #[test]
    fn kaiming_fan_out_scale() -> Result<()> {
        let device = Device::Cpu;
        let config = Conv3dConfig::cube(16, 32, 3);
        let conv = Conv3d::with_init(config, ConvInit::KaimingNormalFanOut, &device, DType::F32)?;
        let values = conv.weight().flatten_all()?.to_vec1::<f32>()?;
        let mean = values.iter().map(|&v| f64::from(v)).sum::<f64>() / values.len() as f64;
        let var = values
            .iter()
            .map(|&v| (f64::from(v) - mean).powi(2))
            .sum::<f64>()
            / values.len() as f64;
        let expected = (2.0f64 / (32.0 * 27.0)).sqrt();
        assert!((var.sqrt() - expected).abs() < expected * 0.1);
        Ok(())
    }

    #[test]
    fn macs_and_parameters() -> Result<()> {
        let device = Device::Cpu;
        let conv = Conv3d::with_init(Conv3dConfig::cube(4, 8, 3), ConvInit::Zeros, &device, DType::F32)?;
        assert_eq!(conv.num_parameters(), 8 * 4 * 27 + 8);
        assert_eq!(conv.own_parameters(), conv.num_parameters());
        assert_eq!(conv.macs(&[1, 4, 2, 2, 2], &[1, 8, 2, 2, 2]), 64 * (4 * 27 + 1));
        let names: Vec<_> = conv.parameters().into_iter().map(|p| p.name).collect();
        assert_eq!(names, ["weight", "bias"]);
        Ok(())
    }
}
