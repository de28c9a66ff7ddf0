use std::{fs, path::Path};

use candle_core::{DType, Device};
use serde::Deserialize;

use crate::{block::EXPANSION, errors::ModelError};

/// Channel count of the stem and the first stage's bottleneck planes.
pub const BASE_PLANES: usize = 64;

/// At most four stages follow the stem.
pub const MAX_STAGES: usize = 4;

/// Parameter dtype of the assembled network.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    F32,
    F16,
    Bf16,
    F64,
}

impl Precision {
    pub fn dtype(self) -> DType {
        match self {
            Precision::F32 => DType::F32,
            Precision::F16 => DType::F16,
            Precision::Bf16 => DType::BF16,
            Precision::F64 => DType::F64,
        }
    }
}

/// Hyperparameters for [`Acmix3d`](crate::Acmix3d).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Channels of the input volume.
    pub input_channels: usize,
    /// Attention window side of every ACmix unit.
    pub kernel_att: usize,
    pub head: usize,
    /// Shift-convolution kernel side of every ACmix unit.
    pub kernel_conv: usize,
    /// Bottleneck count per stage; stage `i` has `64 * 2^i` planes.
    pub layers: Vec<usize>,
    pub num_classes: usize,
    pub groups: usize,
    pub width_per_group: usize,
    /// Per stage after the first, swap the in-plane stride for dilation.
    pub replace_stride_with_dilation: Option<Vec<bool>>,
    pub bn_epsilon: f64,
    pub bn_momentum: f64,
    pub precision: Precision,
    #[serde(skip, default = "default_device")]
    pub device: Device,
}

fn default_device() -> Device {
    Device::Cpu
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            input_channels: 1,
            kernel_att: 7,
            head: 4,
            kernel_conv: 3,
            layers: vec![1, 1],
            num_classes: 1000,
            groups: 1,
            width_per_group: 64,
            replace_stride_with_dilation: None,
            bn_epsilon: 1e-5,
            bn_momentum: 0.1,
            precision: Precision::F32,
            device: default_device(),
        }
    }
}

impl NetworkConfig {
    /// Reads a TOML or JSON configuration, chosen by file extension.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: NetworkConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(ModelError::ConfigFormat(format!(
                    "unsupported configuration extension '{other}'"
                )));
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn dtype(&self) -> DType {
        self.precision.dtype()
    }

    /// Stride-to-dilation flags, one per stage after the first.
    pub fn dilation_flags(&self) -> Result<[bool; 3], ModelError> {
        match &self.replace_stride_with_dilation {
            None => Ok([false; 3]),
            Some(flags) => <[bool; 3]>::try_from(flags.as_slice()).map_err(|_| {
                ModelError::ReplaceStrideWithDilation {
                    got: flags.clone(),
                }
            }),
        }
    }

    /// Bottleneck inner width for a stage with `planes` planes.
    pub fn stage_width(&self, planes: usize) -> usize {
        planes * self.width_per_group / BASE_PLANES * self.groups
    }

    /// Channels leaving the last stage, which is the classifier width.
    ///
    /// Every configured stage feeds the head, so the default `[1, 1]` yields
    /// `512` rather than the first stage's `256`.
    pub fn feature_dim(&self) -> usize {
        let stages = self.layers.len().max(1);
        (BASE_PLANES << (stages - 1)) * EXPANSION
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        self.dilation_flags()?;

        let mut errors = Vec::new();
        if self.input_channels == 0 {
            errors.push("input_channels must be greater than 0".to_string());
        }
        if self.num_classes == 0 {
            errors.push("num_classes must be greater than 0".to_string());
        }
        if self.layers.is_empty() || self.layers.len() > MAX_STAGES {
            errors.push(format!(
                "layers must list between 1 and {MAX_STAGES} stages, got {}",
                self.layers.len()
            ));
        }
        if self.layers.contains(&0) {
            errors.push(format!("every stage needs at least one block, got {:?}", self.layers));
        }
        if self.head == 0 {
            errors.push("head must be greater than 0".to_string());
        }
        if self.kernel_att % 2 == 0 {
            errors.push(format!("kernel_att must be odd, got {}", self.kernel_att));
        }
        if self.kernel_conv % 2 == 0 {
            errors.push(format!("kernel_conv must be odd, got {}", self.kernel_conv));
        }
        if self.groups == 0 || self.width_per_group == 0 {
            errors.push("groups and width_per_group must be greater than 0".to_string());
        }
        if self.head > 0 && self.groups > 0 {
            for stage in 0..self.layers.len().min(MAX_STAGES) {
                let width = self.stage_width(BASE_PLANES << stage);
                if width == 0 || width % self.head != 0 {
                    errors.push(format!(
                        "stage {} width {width} must be a non-zero multiple of head {}",
                        stage + 1,
                        self.head
                    ));
                }
            }
        }
        if self.bn_epsilon <= 0.0 {
            errors.push("bn_epsilon must be greater than 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.bn_momentum) {
            errors.push("bn_momentum must be in [0, 1]".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ModelError::invalid_config(&errors))
        }
    }
}
