//! The ACmix unit: shared `1x1x1` projections feeding a window-attention
//! path and a shift-convolution path, blended by two learnable scalars.

use candle_core::{DType, Device, Result, Tensor, Var};
use layers::{
    checks,
    geometry::{init_rate_half, position_3d},
    params::join,
    trace::elems,
    Conv3d, Conv3dConfig, ConvInit, NamedParameter, Parameterized, Profiled, Trace,
};

use super::{shift::ShiftConvolution, window::WindowAttention};
use crate::core::{AcmixConfig, AttentionError, VolumetricMixer};

/// Hybrid self-attention / convolution mixer.
#[derive(Debug, Clone)]
pub struct Acmix {
    config: AcmixConfig,
    rate1: Var,
    rate2: Var,
    conv1: Conv3d,
    conv2: Conv3d,
    conv3: Conv3d,
    conv_p: Conv3d,
    window: WindowAttention,
    shift: ShiftConvolution,
}

impl Acmix {
    pub fn new(
        config: AcmixConfig,
        device: &Device,
        dtype: DType,
    ) -> std::result::Result<Self, AttentionError> {
        config.validate()?;
        if !checks::FLOAT_DTYPES.contains(&dtype) {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("{dtype:?}"),
            });
        }
        let projection = |in_planes, out_planes| {
            Conv3d::with_init(
                Conv3dConfig::pointwise(in_planes, out_planes),
                ConvInit::KaimingNormalFanOut,
                device,
                dtype,
            )
        };
        let conv1 = projection(config.in_planes, config.out_planes)?;
        let conv2 = projection(config.in_planes, config.out_planes)?;
        let conv3 = projection(config.in_planes, config.out_planes)?;
        let conv_p = projection(2, config.head_dim())?;
        let shift = ShiftConvolution::new(&config, device, dtype)?;

        let rate1 = Var::zeros(1, dtype, device)?;
        let rate2 = Var::zeros(1, dtype, device)?;
        init_rate_half(Some(&rate1))?;
        init_rate_half(Some(&rate2))?;

        log::debug!(
            "acmix {}->{} head={} kernel_att={} kernel_conv={} stride={} dilation={}",
            config.in_planes,
            config.out_planes,
            config.head,
            config.kernel_att,
            config.kernel_conv,
            config.stride,
            config.dilation
        );
        Ok(Self {
            window: WindowAttention::new(&config),
            config,
            rate1,
            rate2,
            conv1,
            conv2,
            conv3,
            conv_p,
            shift,
        })
    }

    /// Weight of the attention path.
    pub fn rate1(&self) -> &Tensor {
        self.rate1.as_tensor()
    }

    /// Weight of the convolution path.
    pub fn rate2(&self) -> &Tensor {
        self.rate2.as_tensor()
    }

    pub fn shift(&self) -> &ShiftConvolution {
        &self.shift
    }
}

impl VolumetricMixer for Acmix {
    fn config(&self) -> &AcmixConfig {
        &self.config
    }

    fn forward(&self, x: &Tensor, trace: &mut Trace) -> Result<Tensor> {
        checks::expect_volume("acmix.input", x, self.config.in_planes)?;
        let (_, _, depth, height, width) = x.dims5()?;

        let q = self.conv1.forward(x)?;
        trace.record("conv1", &self.conv1, x, &q);
        let k = self.conv2.forward(x)?;
        trace.record("conv2", &self.conv2, x, &k);
        let v = self.conv3.forward(x)?;
        trace.record("conv3", &self.conv3, x, &v);

        let grid = position_3d(depth, height, width, x.device())?.to_dtype(x.dtype())?;
        let pe = self.conv_p.forward(&grid)?;
        trace.record("conv_p", &self.conv_p, &grid, &pe);

        let out_att = self.window.attend(&q, &k, &v, &pe)?;
        let out_conv = self.shift.forward(&q, &k, &v, trace)?;
        log::debug!(
            "acmix: x {:?} -> qkv {:?} -> att {:?} conv {:?}",
            x.dims(),
            q.dims(),
            out_att.dims(),
            out_conv.dims()
        );

        let mixed = (out_att.broadcast_mul(self.rate1.as_tensor())?
            + out_conv.broadcast_mul(self.rate2.as_tensor())?)?;
        trace.record("", self, x, &mixed);
        Ok(mixed)
    }
}

impl Parameterized for Acmix {
    fn collect_parameters(&self, prefix: &str, out: &mut Vec<NamedParameter>) {
        out.push(NamedParameter::new(join(prefix, "rate1"), self.rate1.clone()));
        out.push(NamedParameter::new(join(prefix, "rate2"), self.rate2.clone()));
        self.conv1.collect_parameters(&join(prefix, "conv1"), out);
        self.conv2.collect_parameters(&join(prefix, "conv2"), out);
        self.conv3.collect_parameters(&join(prefix, "conv3"), out);
        self.conv_p.collect_parameters(&join(prefix, "conv_p"), out);
        self.shift.collect_parameters(prefix, out);
    }
}

impl Profiled for Acmix {
    fn kind(&self) -> &'static str {
        "ACmix"
    }

    /// The two mixing rates; projections record their own rows.
    fn own_parameters(&self) -> usize {
        2
    }

    /// Window attention: one product for the logits and one for the
    /// weighted values per tap.
    fn macs(&self, _input: &[usize], output: &[usize]) -> u64 {
        let taps = (self.config.kernel_att * self.config.kernel_att) as u64;
        2 * taps * elems(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small(in_planes: usize, out_planes: usize) -> AcmixConfig {
        AcmixConfig::new(in_planes, out_planes).with_kernels(3, 3)
    }

    fn build(config: AcmixConfig) -> Result<Acmix> {
        Acmix::new(config, &Device::Cpu, DType::F32)
            .map_err(|e| candle_core::Error::Msg(e.to_string()))
    }

    #[test]
    fn preserves_shape_at_unit_stride() -> Result<()> {
        let device = Device::Cpu;
        let acmix = build(AcmixConfig::new(4, 8))?;
        let x = Tensor::randn(0f32, 1.0, (2, 4, 3, 8, 8), &device)?;
        let out = acmix.forward(&x, &mut Trace::disabled())?;
        assert_eq!(out.dims(), &[2, 8, 3, 8, 8]);
        Ok(())
    }

    #[test]
    fn stride_halves_plane_rounding_up() -> Result<()> {
        let device = Device::Cpu;
        let acmix = build(small(8, 8).with_stride(2))?;
        let x = Tensor::randn(0f32, 1.0, (1, 8, 2, 5, 7), &device)?;
        let out = acmix.forward(&x, &mut Trace::disabled())?;
        assert_eq!(out.dims(), &[1, 8, 2, 3, 4]);
        Ok(())
    }

    #[test]
    fn rates_start_at_one_half() -> Result<()> {
        let acmix = build(small(4, 4))?;
        assert_eq!(acmix.rate1().to_vec1::<f32>()?, vec![0.5]);
        assert_eq!(acmix.rate2().to_vec1::<f32>()?, vec![0.5]);
        Ok(())
    }

    #[test]
    fn parameter_names_and_trace_rows_agree() -> Result<()> {
        let device = Device::Cpu;
        let acmix = build(small(4, 8))?;
        let names: Vec<_> = acmix.parameters().into_iter().map(|p| p.name).collect();
        assert_eq!(
            names,
            [
                "rate1",
                "rate2",
                "conv1.weight",
                "conv1.bias",
                "conv2.weight",
                "conv2.bias",
                "conv3.weight",
                "conv3.bias",
                "conv_p.weight",
                "conv_p.bias",
                "fc.weight",
                "dep_conv.weight",
                "dep_conv.bias",
            ]
        );

        let mut trace = Trace::recording();
        trace.push("conv2");
        let x = Tensor::randn(0f32, 1.0, (1, 4, 2, 4, 4), &device)?;
        acmix.forward(&x, &mut trace)?;
        trace.pop();
        let records = trace.into_records();
        let paths: Vec<_> = records.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(
            paths,
            [
                "conv2.conv1",
                "conv2.conv2",
                "conv2.conv3",
                "conv2.conv_p",
                "conv2.fc",
                "conv2.dep_conv",
                "conv2"
            ]
        );
        let traced: usize = records.iter().map(|r| r.parameters).sum();
        assert_eq!(traced, acmix.num_parameters());
        let own = records.last().map(|r| r.macs);
        assert_eq!(own, Some(2 * 9 * 8 * 2 * 4 * 4));
        Ok(())
    }

    #[test]
    fn rejects_bad_config_and_dtype() {
        let device = Device::Cpu;
        assert!(matches!(
            Acmix::new(AcmixConfig::new(4, 6), &device, DType::F32),
            Err(AttentionError::InvalidConfig(_))
        ));
        assert!(matches!(
            Acmix::new(small(4, 4), &device, DType::U32),
            Err(AttentionError::UnsupportedDType { .. })
        ));
    }

    #[test]
    fn rejects_wrong_channels_and_tiny_planes() -> Result<()> {
        let device = Device::Cpu;
        let acmix = build(AcmixConfig::new(4, 4))?;
        let wrong = Tensor::zeros((1, 3, 2, 8, 8), DType::F32, &device)?;
        assert!(acmix.forward(&wrong, &mut Trace::disabled()).is_err());
        // kernel_att 7 pads by 3, which a 3x3 plane cannot reflect
        let tiny = Tensor::zeros((1, 4, 2, 3, 3), DType::F32, &device)?;
        assert!(acmix.forward(&tiny, &mut Trace::disabled()).is_err());
        Ok(())
    }
}
