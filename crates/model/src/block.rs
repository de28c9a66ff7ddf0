use attention::{Acmix, AcmixConfig, VolumetricMixer};
use candle_core::{DType, Device, Result, Tensor};
use layers::{
    params::join, BatchNorm3d, BatchNormConfig, Conv3d, Conv3dConfig, ConvInit, NamedParameter,
    Parameterized, Trace,
};

use crate::errors::ModelError;

/// Channel multiplier between a bottleneck's inner width and its output.
pub const EXPANSION: usize = 4;

/// Shape of a single bottleneck.
#[derive(Debug, Clone, PartialEq)]
pub struct BottleneckConfig {
    pub inplanes: usize,
    pub planes: usize,
    /// In-plane stride applied by the mixing unit.
    pub stride: usize,
    pub dilation: usize,
    pub groups: usize,
    pub base_width: usize,
    pub kernel_att: usize,
    pub head: usize,
    pub kernel_conv: usize,
    pub norm: BatchNormConfig,
}

impl BottleneckConfig {
    /// Inner width, `floor(planes * base_width / 64) * groups`.
    pub fn width(&self) -> usize {
        self.planes * self.base_width / 64 * self.groups
    }

    pub fn out_planes(&self) -> usize {
        self.planes * EXPANSION
    }

    /// Whether the residual branch must be projected to match the output.
    pub fn needs_downsample(&self) -> bool {
        self.stride != 1 || self.inplanes != self.out_planes()
    }

    fn mixer(&self) -> AcmixConfig {
        let width = self.width();
        AcmixConfig::new(width, width)
            .with_kernels(self.kernel_att, self.kernel_conv)
            .with_head(self.head)
            .with_stride(self.stride)
            .with_dilation(self.dilation)
    }
}

/// Pointwise strided projection of the residual branch followed by batch norm.
#[derive(Debug)]
pub struct Downsample {
    conv: Conv3d,
    bn: BatchNorm3d,
}

impl Downsample {
    pub fn new(
        inplanes: usize,
        outplanes: usize,
        stride: usize,
        norm: &BatchNormConfig,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let conv = Conv3d::with_init(
            Conv3dConfig::pointwise(inplanes, outplanes).with_stride([1, stride, stride]),
            ConvInit::KaimingNormalFanOut,
            device,
            dtype,
        )?;
        let bn = BatchNorm3d::new(BatchNormConfig::like(norm, outplanes), device, dtype)?;
        Ok(Self { conv, bn })
    }

    pub fn forward(&self, x: &Tensor, trace: &mut Trace) -> Result<Tensor> {
        let projected = self.conv.forward(x)?;
        trace.record("0", &self.conv, x, &projected);
        let out = self.bn.forward(&projected)?;
        trace.record("1", &self.bn, &projected, &out);
        Ok(out)
    }

    pub fn set_training(&self, training: bool) {
        self.bn.set_training(training);
    }
}

impl Parameterized for Downsample {
    fn collect_parameters(&self, prefix: &str, out: &mut Vec<NamedParameter>) {
        self.conv.collect_parameters(&join(prefix, "0"), out);
        self.bn.collect_parameters(&join(prefix, "1"), out);
    }

    fn collect_buffers(&self, prefix: &str, out: &mut Vec<(String, Tensor)>) {
        self.bn.collect_buffers(&join(prefix, "1"), out);
    }
}

/// Residual bottleneck whose middle convolution is a volumetric mixer.
///
/// `x -> conv1 -> bn1 -> relu -> mixer -> bn2 -> relu -> conv3 -> bn3`, added
/// to the (optionally downsampled) input and passed through a final ReLU.
pub struct Bottleneck {
    config: BottleneckConfig,
    conv1: Conv3d,
    bn1: BatchNorm3d,
    conv2: Box<dyn VolumetricMixer>,
    bn2: BatchNorm3d,
    conv3: Conv3d,
    bn3: BatchNorm3d,
    downsample: Option<Downsample>,
}

impl std::fmt::Debug for Bottleneck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bottleneck")
            .field("inplanes", &self.config.inplanes)
            .field("width", &self.config.width())
            .field("out_planes", &self.config.out_planes())
            .field("stride", &self.config.stride)
            .field("dilation", &self.config.dilation)
            .field("downsample", &self.downsample.is_some())
            .finish()
    }
}

impl Bottleneck {
    pub fn new(
        config: BottleneckConfig,
        downsample: Option<Downsample>,
        device: &Device,
        dtype: DType,
    ) -> std::result::Result<Self, ModelError> {
        let width = config.width();
        if width == 0 {
            return Err(ModelError::InvalidConfig(format!(
                "bottleneck width is zero for planes={} base_width={} groups={}",
                config.planes, config.base_width, config.groups
            )));
        }
        let out_planes = config.out_planes();
        let pointwise = |inp, out| {
            Conv3d::with_init(
                Conv3dConfig::pointwise(inp, out),
                ConvInit::KaimingNormalFanOut,
                device,
                dtype,
            )
        };
        let norm = |channels| {
            BatchNorm3d::new(BatchNormConfig::like(&config.norm, channels), device, dtype)
        };

        let conv1 = pointwise(config.inplanes, width)?;
        let bn1 = norm(width)?;
        let conv2: Box<dyn VolumetricMixer> =
            Box::new(Acmix::new(config.mixer(), device, dtype)?);
        let bn2 = norm(width)?;
        let conv3 = pointwise(width, out_planes)?;
        let bn3 = norm(out_planes)?;
        Ok(Self {
            config,
            conv1,
            bn1,
            conv2,
            bn2,
            conv3,
            bn3,
            downsample,
        })
    }

    pub fn config(&self) -> &BottleneckConfig {
        &self.config
    }

    pub fn mixer(&self) -> &dyn VolumetricMixer {
        self.conv2.as_ref()
    }

    pub fn forward(&self, x: &Tensor, trace: &mut Trace) -> Result<Tensor> {
        let out = self.conv1.forward(x)?;
        trace.record("conv1", &self.conv1, x, &out);
        let normed = self.bn1.forward(&out)?;
        trace.record("bn1", &self.bn1, &out, &normed);
        let out = normed.relu()?;

        trace.push("conv2");
        let mixed = self.conv2.forward(&out, trace);
        trace.pop();
        let mixed = mixed?;
        let normed = self.bn2.forward(&mixed)?;
        trace.record("bn2", &self.bn2, &mixed, &normed);
        let out = normed.relu()?;

        let expanded = self.conv3.forward(&out)?;
        trace.record("conv3", &self.conv3, &out, &expanded);
        let out = self.bn3.forward(&expanded)?;
        trace.record("bn3", &self.bn3, &expanded, &out);

        let identity = match &self.downsample {
            Some(downsample) => {
                trace.push("downsample");
                let projected = downsample.forward(x, trace);
                trace.pop();
                projected?
            }
            None => x.clone(),
        };
        log::debug!(
            "bottleneck: in {:?} -> residual {:?} + identity {:?}",
            x.dims(),
            out.dims(),
            identity.dims()
        );
        (out + identity)?.relu()
    }

    pub fn set_training(&self, training: bool) {
        for bn in [&self.bn1, &self.bn2, &self.bn3] {
            bn.set_training(training);
        }
        if let Some(downsample) = &self.downsample {
            downsample.set_training(training);
        }
    }
}

impl Parameterized for Bottleneck {
    fn collect_parameters(&self, prefix: &str, out: &mut Vec<NamedParameter>) {
        self.conv1.collect_parameters(&join(prefix, "conv1"), out);
        self.bn1.collect_parameters(&join(prefix, "bn1"), out);
        self.conv2.collect_parameters(&join(prefix, "conv2"), out);
        self.bn2.collect_parameters(&join(prefix, "bn2"), out);
        self.conv3.collect_parameters(&join(prefix, "conv3"), out);
        self.bn3.collect_parameters(&join(prefix, "bn3"), out);
        if let Some(downsample) = &self.downsample {
            downsample.collect_parameters(&join(prefix, "downsample"), out);
        }
    }

    fn collect_buffers(&self, prefix: &str, out: &mut Vec<(String, Tensor)>) {
        self.bn1.collect_buffers(&join(prefix, "bn1"), out);
        self.bn2.collect_buffers(&join(prefix, "bn2"), out);
        self.bn3.collect_buffers(&join(prefix, "bn3"), out);
        if let Some(downsample) = &self.downsample {
            downsample.collect_buffers(&join(prefix, "downsample"), out);
        }
    }
}
