use candle_core::{bail, Result, Tensor};
use layers::{
    checks, params::join, AdaptiveAvgPool3d, BatchNorm3d, BatchNormConfig, Conv3d, Conv3dConfig,
    ConvInit, Linear, LinearConfig, MaxPool3d, NamedParameter, Parameterized, Trace,
};

use crate::{
    block::{Bottleneck, BottleneckConfig, Downsample, EXPANSION},
    config::{NetworkConfig, BASE_PLANES},
    errors::ModelError,
};

/// Tracks channel count and dilation while stages are appended.
struct StageBuilder<'a> {
    config: &'a NetworkConfig,
    norm: BatchNormConfig,
    inplanes: usize,
    dilation: usize,
}

impl StageBuilder<'_> {
    fn build(
        &mut self,
        planes: usize,
        blocks: usize,
        stride: usize,
        dilate: bool,
    ) -> std::result::Result<Vec<Bottleneck>, ModelError> {
        let cfg = self.config;
        let norm = self.norm.clone();
        let (device, dtype) = (&cfg.device, cfg.dtype());
        let previous_dilation = self.dilation;
        let mut stride = stride;
        if dilate {
            self.dilation *= stride;
            stride = 1;
        }
        let block = |inplanes, stride, dilation| BottleneckConfig {
            inplanes,
            planes,
            stride,
            dilation,
            groups: cfg.groups,
            base_width: cfg.width_per_group,
            kernel_att: cfg.kernel_att,
            head: cfg.head,
            kernel_conv: cfg.kernel_conv,
            norm: norm.clone(),
        };

        let first = block(self.inplanes, stride, previous_dilation);
        let downsample = if first.needs_downsample() {
            Some(Downsample::new(
                self.inplanes,
                first.out_planes(),
                stride,
                &norm,
                device,
                dtype,
            )?)
        } else {
            None
        };
        let mut stage = Vec::with_capacity(blocks);
        stage.push(Bottleneck::new(first, downsample, device, dtype)?);
        self.inplanes = planes * EXPANSION;
        for _ in 1..blocks {
            let config = block(self.inplanes, 1, self.dilation);
            stage.push(Bottleneck::new(config, None, device, dtype)?);
        }
        Ok(stage)
    }
}

/// Volumetric classifier: a 3D stem, up to four stages of ACmix bottlenecks,
/// global average pooling and a linear head.
#[derive(Debug)]
pub struct Acmix3d {
    config: NetworkConfig,
    conv1: Conv3d,
    bn1: BatchNorm3d,
    maxpool: MaxPool3d,
    stages: Vec<Vec<Bottleneck>>,
    avgpool: AdaptiveAvgPool3d,
    fc: Linear,
}

impl Acmix3d {
    pub fn new(config: NetworkConfig) -> std::result::Result<Self, ModelError> {
        config.validate()?;
        let dilate = config.dilation_flags()?;
        let (device, dtype) = (&config.device, config.dtype());
        let norm = BatchNormConfig {
            num_features: BASE_PLANES,
            epsilon: config.bn_epsilon,
            momentum: config.bn_momentum,
        };

        let conv1 = Conv3d::with_init(
            Conv3dConfig::cube(config.input_channels, BASE_PLANES, 7),
            ConvInit::KaimingNormalFanOut,
            device,
            dtype,
        )?;
        let bn1 = BatchNorm3d::new(norm.clone(), device, dtype)?;
        let maxpool = MaxPool3d::new(3, 2, 1)?;

        let mut builder = StageBuilder {
            config: &config,
            norm,
            inplanes: BASE_PLANES,
            dilation: 1,
        };
        let mut stages = Vec::with_capacity(config.layers.len());
        for (index, &blocks) in config.layers.iter().enumerate() {
            let planes = BASE_PLANES << index;
            let (stride, dilate) = match index {
                0 => (1, false),
                _ => (2, dilate[index - 1]),
            };
            stages.push(builder.build(planes, blocks, stride, dilate)?);
        }

        let fc = Linear::with_default_init(
            LinearConfig::new(config.feature_dim(), config.num_classes),
            device,
            dtype,
        )?;

        let network = Self {
            conv1,
            bn1,
            maxpool,
            stages,
            avgpool: AdaptiveAvgPool3d::global(),
            fc,
            config,
        };
        log::info!(
            "acmix3d built: stages={:?} kernel_att={} head={} kernel_conv={} classes={} precision={:?} ({})",
            network.config.layers,
            network.config.kernel_att,
            network.config.head,
            network.config.kernel_conv,
            network.config.num_classes,
            network.config.precision,
            network.parameter_count()
        );
        Ok(network)
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn stages(&self) -> &[Vec<Bottleneck>] {
        &self.stages
    }

    /// Switches every batch norm between batch and running statistics.
    pub fn set_training(&self, training: bool) {
        self.bn1.set_training(training);
        for block in self.stages.iter().flatten() {
            block.set_training(training);
        }
    }

    pub fn is_training(&self) -> bool {
        self.bn1.is_training()
    }

    /// Logits `(batch, num_classes)` for a `(batch, input_channels, D, H, W)` volume.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.forward_traced(x, &mut Trace::disabled())
    }

    /// Forward pass that also records every leaf layer into `trace`.
    pub fn forward_traced(&self, x: &Tensor, trace: &mut Trace) -> Result<Tensor> {
        if x.rank() != 5 {
            bail!(
                "acmix3d expects input shaped [batch, {}, depth, height, width], got {:?}",
                self.config.input_channels,
                x.dims()
            );
        }
        checks::expect_volume("acmix3d.input", x, self.config.input_channels)?;
        log::debug!("acmix3d input {:?}", x.dims());

        let stem = self.conv1.forward(x)?;
        trace.record("conv1", &self.conv1, x, &stem);
        let normed = self.bn1.forward(&stem)?;
        trace.record("bn1", &self.bn1, &stem, &normed);
        let activated = normed.relu()?;
        let mut hidden = self.maxpool.forward(&activated)?;
        trace.record("maxpool", &self.maxpool, &activated, &hidden);
        log::debug!("acmix3d stem -> {:?}", hidden.dims());

        for (index, stage) in self.stages.iter().enumerate() {
            for (position, block) in stage.iter().enumerate() {
                trace.push(format!("layer{}", index + 1));
                trace.push(position.to_string());
                let out = block.forward(&hidden, trace);
                trace.pop();
                trace.pop();
                hidden = out?;
            }
            log::debug!("acmix3d layer{} -> {:?}", index + 1, hidden.dims());
        }

        let pooled = self.avgpool.forward(&hidden)?;
        trace.record("avgpool", &self.avgpool, &hidden, &pooled);
        let features = pooled.flatten_from(1)?;
        let logits = self.fc.forward(&features)?;
        trace.record("fc", &self.fc, &features, &logits);
        log::debug!("acmix3d logits {:?}", logits.dims());
        Ok(logits)
    }
}

impl Parameterized for Acmix3d {
    fn collect_parameters(&self, prefix: &str, out: &mut Vec<NamedParameter>) {
        self.conv1.collect_parameters(&join(prefix, "conv1"), out);
        self.bn1.collect_parameters(&join(prefix, "bn1"), out);
        for (index, stage) in self.stages.iter().enumerate() {
            for (position, block) in stage.iter().enumerate() {
                let name = format!("layer{}.{position}", index + 1);
                block.collect_parameters(&join(prefix, &name), out);
            }
        }
        self.fc.collect_parameters(&join(prefix, "fc"), out);
    }

    fn collect_buffers(&self, prefix: &str, out: &mut Vec<(String, Tensor)>) {
        self.bn1.collect_buffers(&join(prefix, "bn1"), out);
        for (index, stage) in self.stages.iter().enumerate() {
            for (position, block) in stage.iter().enumerate() {
                let name = format!("layer{}.{position}", index + 1);
                block.collect_buffers(&join(prefix, &name), out);
            }
        }
    }
}
