//! Dense classification head.
//!
//! Linear layers expect inputs shaped `(batch, in_dim)` and return
//! `(batch, out_dim)`. Weights and bias follow the framework default of a
//! uniform draw in `±1/sqrt(in_dim)`.

use candle_core::{bail, DType, Device, Result, Tensor, Var};

use crate::{
    checks,
    params::{join, NamedParameter, Parameterized},
    trace::{elems, Profiled},
};

/// Configuration for a dense projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearConfig {
    /// Incoming feature dimension.
    pub input_dim: usize,
    /// Output feature dimension.
    pub output_dim: usize,
    /// Whether a learnable bias vector should be applied.
    pub bias: bool,
}

impl LinearConfig {
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: true,
        }
    }
}

/// Dense affine projection with optional bias.
#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    weight: Var,
    bias: Option<Var>,
}

impl Linear {
    /// Constructs a linear layer from pre-existing parameters.
    pub fn new(config: LinearConfig, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        checks::expect_shape("linear.weight", &weight, &[config.output_dim, config.input_dim])?;
        checks::expect_dtype_in("linear.weight", &weight, &checks::FLOAT_DTYPES)?;
        match (&bias, config.bias) {
            (Some(tensor), true) => checks::expect_shape("linear.bias", tensor, &[config.output_dim])?,
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

    /// Builds a layer with the default uniform initialisation.
    pub fn with_default_init(config: LinearConfig, device: &Device, dtype: DType) -> Result<Self> {
        if config.input_dim == 0 || config.output_dim == 0 {
            bail!(
                "linear dimensions must be non-zero (in={}, out={})",
                config.input_dim,
                config.output_dim
            );
        }
        let bound = (1.0 / (config.input_dim as f64).sqrt()) as f32;
        let weight = Tensor::rand(-bound, bound, (config.output_dim, config.input_dim), device)?
            .to_dtype(dtype)?;
        let bias = if config.bias {
            Some(Tensor::rand(-bound, bound, config.output_dim, device)?.to_dtype(dtype)?)
        } else {
            None
        };
        Self::new(config, weight, bias)
    }

    pub fn config(&self) -> &LinearConfig {
        &self.config
    }

    pub fn weight(&self) -> &Tensor {
        self.weight.as_tensor()
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref().map(Var::as_tensor)
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let dims = input.dims();
        match dims {
            [_, features] if *features == self.config.input_dim => {}
            _ => bail!(
                "linear expects input shaped [batch, {}], got {:?}",
                self.config.input_dim,
                dims
            ),
        }
        let compute = matmul_dtype(input.dtype());
        let weight = self.weight.to_dtype(compute)?;
        let mut output = input.to_dtype(compute)?.matmul(&weight.t()?)?;
        if let Some(bias) = &self.bias {
            output = output.broadcast_add(&bias.to_dtype(compute)?)?;
        }
        output.to_dtype(input.dtype())
    }
}

/// Half-precision products are promoted to `f32`; the CPU gemm has no bf16 kernel.
fn matmul_dtype(dtype: DType) -> DType {
    match dtype {
        DType::F16 | DType::BF16 => DType::F32,
        other => other,
    }
}

impl Parameterized for Linear {
    fn collect_parameters(&self, prefix: &str, out: &mut Vec<NamedParameter>) {
        out.push(NamedParameter::new(join(prefix, "weight"), self.weight.clone()));
        if let Some(bias) = &self.bias {
            out.push(NamedParameter::new(join(prefix, "bias"), bias.clone()));
        }
    }
}

impl Profiled for Linear {
    fn kind(&self) -> &'static str {
        "Linear"
    }

    fn own_parameters(&self) -> usize {
        self.weight.elem_count() + self.bias.as_ref().map_or(0, |b| b.elem_count())
    }

    fn macs(&self, _input: &[usize], output: &[usize]) -> u64 {
        self.config.input_dim as u64 * elems(output)
    }
}
