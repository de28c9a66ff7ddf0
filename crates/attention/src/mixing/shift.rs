//! Convolution path: a light projection of the query/key/value heads into
//! `kernel^2` feature groups, followed by a grouped convolution initialised
//! as a bank of in-plane shifts.

use candle_core::{DType, Device, Result, Tensor};
use layers::{
    params::join, Conv3d, Conv3dConfig, ConvInit, NamedParameter, Parameterized, Trace,
};

use crate::core::AcmixConfig;

#[derive(Debug, Clone)]
pub struct ShiftConvolution {
    head: usize,
    head_dim: usize,
    kernel: usize,
    fc: Conv3d,
    dep_conv: Conv3d,
}

impl ShiftConvolution {
    pub fn new(config: &AcmixConfig, device: &Device, dtype: DType) -> Result<Self> {
        let head_dim = config.head_dim();
        let taps = config.kernel_conv * config.kernel_conv;
        let fc = Conv3d::with_init(
            Conv3dConfig::pointwise(3 * config.head, taps).with_bias(false),
            ConvInit::KaimingNormalFanOut,
            device,
            dtype,
        )?;
        let dep_conv = Conv3d::with_init(
            Conv3dConfig::cube(taps * head_dim, config.out_planes, config.kernel_conv)
                .with_groups(head_dim)
                .with_stride([1, config.stride, config.stride]),
            ConvInit::Shift,
            device,
            dtype,
        )?;
        Ok(Self {
            head: config.head,
            head_dim,
            kernel: config.kernel_conv,
            fc,
            dep_conv,
        })
    }

    pub fn fc(&self) -> &Conv3d {
        &self.fc
    }

    pub fn dep_conv(&self) -> &Conv3d {
        &self.dep_conv
    }

    /// Mixes `(B, head * head_dim, D, H, W)` projections into
    /// `(B, out_planes, D, Ho, Wo)`.
    pub fn forward(&self, q: &Tensor, k: &Tensor, v: &Tensor, trace: &mut Trace) -> Result<Tensor> {
        let (batch, _, depth, height, width) = q.dims5()?;
        let heads = (batch, self.head, self.head_dim, depth, height * width);
        let stacked = Tensor::cat(&[q.reshape(heads)?, k.reshape(heads)?, v.reshape(heads)?], 1)?;

        // fc treats (head_dim, D, H*W) as its three spatial axes
        let f_all = self.fc.forward(&stacked)?;
        trace.record("fc", &self.fc, &stacked, &f_all);

        let taps = self.kernel * self.kernel;
        let f_conv = f_all
            .permute((0, 2, 1, 3, 4))?
            .reshape((batch, self.head_dim * taps, depth, height, width))?;
        let out = self.dep_conv.forward(&f_conv)?;
        trace.record("dep_conv", &self.dep_conv, &f_conv, &out);
        log::debug!("shift convolution: {:?} -> {:?} -> {:?}", stacked.dims(), f_conv.dims(), out.dims());
        Ok(out)
    }
}

impl Parameterized for ShiftConvolution {
    fn collect_parameters(&self, prefix: &str, out: &mut Vec<NamedParameter>) {
        self.fc.collect_parameters(&join(prefix, "fc"), out);
        self.dep_conv.collect_parameters(&join(prefix, "dep_conv"), out);
    }
}
