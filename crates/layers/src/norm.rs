//! Batch normalisation over volumetric feature maps.
//!
//! Inputs follow the `(batch, channels, depth, height, width)` convention.
//! Statistics are taken per channel over every other axis and always
//! computed in `f32` before the result is cast back to the input dtype.
//! Running estimates are updated with exponential averaging while training
//! and used in place of batch statistics in evaluation mode.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Mutex,
};

use candle_core::{bail, DType, Device, Error, Result, Tensor, Var};

use crate::{
    checks,
    params::{join, NamedParameter, Parameterized},
    trace::{elems, Profiled},
};

/// Configuration for [`BatchNorm3d`].
#[derive(Debug, Clone, PartialEq)]
pub struct BatchNormConfig {
    /// Number of channels being normalised.
    pub num_features: usize,
    /// Numeric stabiliser added to the variance.
    pub epsilon: f64,
    /// Weight of the current batch in the running averages.
    pub momentum: f64,
}

impl BatchNormConfig {
    pub fn new(num_features: usize) -> Self {
        Self {
            num_features,
            epsilon: 1e-5,
            momentum: 0.1,
        }
    }

    /// Copies epsilon and momentum from `template` for a new channel count.
    pub fn like(template: &BatchNormConfig, num_features: usize) -> Self {
        Self {
            num_features,
            ..template.clone()
        }
    }
}

/// Per-channel batch normalisation with learnable affine parameters.
#[derive(Debug)]
pub struct BatchNorm3d {
    config: BatchNormConfig,
    weight: Var,
    bias: Var,
    running_mean: Mutex<Tensor>,
    running_var: Mutex<Tensor>,
    batches_tracked: AtomicU64,
    training: AtomicBool,
}

impl BatchNorm3d {
    /// Unit scale, zero shift, running mean 0 and variance 1.
    pub fn new(config: BatchNormConfig, device: &Device, dtype: DType) -> Result<Self> {
        if config.num_features == 0 {
            bail!("batch_norm needs at least one channel");
        }
        if !(0.0..=1.0).contains(&config.momentum) {
            bail!("batch_norm momentum must be in [0, 1], got {}", config.momentum);
        }
        if config.epsilon <= 0.0 {
            bail!("batch_norm epsilon must be positive, got {}", config.epsilon);
        }
        let channels = config.num_features;
        Ok(Self {
            weight: Var::ones(channels, dtype, device)?,
            bias: Var::zeros(channels, dtype, device)?,
            running_mean: Mutex::new(Tensor::zeros(channels, DType::F32, device)?),
            running_var: Mutex::new(Tensor::ones(channels, DType::F32, device)?),
            batches_tracked: AtomicU64::new(0),
            training: AtomicBool::new(true),
            config,
        })
    }

    pub fn config(&self) -> &BatchNormConfig {
        &self.config
    }

    pub fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::Relaxed);
    }

    pub fn is_training(&self) -> bool {
        self.training.load(Ordering::Relaxed)
    }

    pub fn weight(&self) -> &Tensor {
        self.weight.as_tensor()
    }

    pub fn bias(&self) -> &Tensor {
        self.bias.as_tensor()
    }

    pub fn running_mean(&self) -> Result<Tensor> {
        read(&self.running_mean)
    }

    pub fn running_var(&self) -> Result<Tensor> {
        read(&self.running_var)
    }

    /// Number of training batches folded into the running statistics.
    pub fn batches_tracked(&self) -> u64 {
        self.batches_tracked.load(Ordering::Relaxed)
    }

    /// Normalises a `(batch, channels, depth, height, width)` volume.
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let channels = self.config.num_features;
        checks::expect_volume("batch_norm.input", input, channels)?;
        let stats_shape = (1, channels, 1, 1, 1);
        let x = input.to_dtype(DType::F32)?;

        let (mean, var) = if self.is_training() {
            let count = input.elem_count() / channels;
            if count < 2 {
                bail!(
                    "batch_norm needs more than one value per channel when training, got input {:?}",
                    input.dims()
                );
            }
            let per_channel = x.transpose(0, 1)?.reshape((channels, count))?;
            let mean = per_channel.mean_keepdim(1)?;
            let var = per_channel.broadcast_sub(&mean)?.sqr()?.mean_keepdim(1)?;
            let (mean, var) = (mean.flatten_all()?, var.flatten_all()?);
            self.update_running(&mean, &var, count)?;
            (mean, var)
        } else {
            (self.running_mean()?, self.running_var()?)
        };

        let denom = (var.reshape(stats_shape)? + self.config.epsilon)?.sqrt()?;
        let weight = self.weight.to_dtype(DType::F32)?.reshape(stats_shape)?;
        let bias = self.bias.to_dtype(DType::F32)?.reshape(stats_shape)?;
        let normalized = x
            .broadcast_sub(&mean.reshape(stats_shape)?)?
            .broadcast_div(&denom)?
            .broadcast_mul(&weight)?
            .broadcast_add(&bias)?;
        normalized.to_dtype(input.dtype())
    }

    fn update_running(&self, mean: &Tensor, var: &Tensor, count: usize) -> Result<()> {
        let momentum = self.config.momentum;
        let unbiased = (var * (count as f64 / (count - 1) as f64))?;
        {
            let mut running = lock(&self.running_mean)?;
            *running = ((&*running * (1.0 - momentum))? + (mean * momentum)?)?.detach();
        }
        {
            let mut running = lock(&self.running_var)?;
            *running = ((&*running * (1.0 - momentum))? + (unbiased * momentum)?)?.detach();
        }
        self.batches_tracked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

fn lock(slot: &Mutex<Tensor>) -> Result<std::sync::MutexGuard<'_, Tensor>> {
    slot.lock()
        .map_err(|_| Error::Msg("batch_norm running statistics mutex poisoned".into()))
}

fn read(slot: &Mutex<Tensor>) -> Result<Tensor> {
    Ok(lock(slot)?.clone())
}

impl Parameterized for BatchNorm3d {
    fn collect_parameters(&self, prefix: &str, out: &mut Vec<NamedParameter>) {
        out.push(NamedParameter::new(join(prefix, "weight"), self.weight.clone()));
        out.push(NamedParameter::new(join(prefix, "bias"), self.bias.clone()));
    }

    fn collect_buffers(&self, prefix: &str, out: &mut Vec<(String, Tensor)>) {
        match (self.running_mean(), self.running_var()) {
            (Ok(mean), Ok(var)) => {
                out.push((join(prefix, "running_mean"), mean));
                out.push((join(prefix, "running_var"), var));
            }
            (Err(err), _) | (_, Err(err)) => {
                log::warn!("{prefix}: running statistics left out of buffers: {err}");
            }
        }
        let device = self.weight.device();
        if let Ok(tracked) = Tensor::new(&[self.batches_tracked() as i64], device) {
            out.push((join(prefix, "num_batches_tracked"), tracked));
        }
    }
}

impl Profiled for BatchNorm3d {
    fn kind(&self) -> &'static str {
        "BatchNorm3d"
    }

    fn own_parameters(&self) -> usize {
        2 * self.config.num_features
    }

    fn macs(&self, _input: &[usize], output: &[usize]) -> u64 {
        2 * elems(output)
    }
}
