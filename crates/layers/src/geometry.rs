//! Normalised coordinate grids, in-plane subsampling and scalar rate init.
//!
//! Grids carry two channels: channel 0 walks the width axis from -1 to 1,
//! channel 1 walks the height axis. Volumetric grids repeat the plane along
//! depth, so positional terms only ever encode in-plane offsets.

use candle_core::{bail, Device, Result, Tensor, Var};

/// `steps` evenly spaced values from `start` to `end` inclusive.
pub fn linspace(start: f64, end: f64, steps: usize, device: &Device) -> Result<Tensor> {
    if steps == 0 {
        bail!("linspace needs at least one step");
    }
    if steps == 1 {
        return Tensor::from_vec(vec![start as f32], 1, device);
    }
    let step = (end - start) / (steps - 1) as f64;
    let values: Vec<f32> = (0..steps)
        .map(|i| {
            if i == steps - 1 {
                end as f32
            } else {
                (start + step * i as f64) as f32
            }
        })
        .collect();
    Tensor::from_vec(values, steps, device)
}

/// Coordinate grid shaped `(1, 2, height, width)`.
pub fn position_2d(height: usize, width: usize, device: &Device) -> Result<Tensor> {
    let loc_w = linspace(-1.0, 1.0, width, device)?
        .reshape((1, width))?
        .broadcast_as((height, width))?
        .contiguous()?;
    let loc_h = linspace(-1.0, 1.0, height, device)?
        .reshape((height, 1))?
        .broadcast_as((height, width))?
        .contiguous()?;
    Tensor::stack(&[&loc_w, &loc_h], 0)?.unsqueeze(0)
}

/// Coordinate grid shaped `(1, 2, depth, height, width)`.
pub fn position_3d(depth: usize, height: usize, width: usize, device: &Device) -> Result<Tensor> {
    position_2d(height, width, device)?
        .unsqueeze(2)?
        .broadcast_as((1, 2, depth, height, width))?
        .contiguous()
}

/// Keeps every `stride`-th element of the two trailing axes of a rank-4 or
/// rank-5 tensor. Output extents are `ceil(n / stride)`.
pub fn stride_subsample(x: &Tensor, stride: usize) -> Result<Tensor> {
    if stride == 0 {
        bail!("subsampling stride must be non-zero");
    }
    let rank = x.rank();
    if rank != 4 && rank != 5 {
        bail!("subsampling expects a rank 4 or 5 tensor, got {:?}", x.dims());
    }
    if stride == 1 {
        return Ok(x.clone());
    }
    let mut out = x.clone();
    for dim in [rank - 2, rank - 1] {
        let size = out.dim(dim)?;
        let kept: Vec<u32> = (0..size).step_by(stride).map(|i| i as u32).collect();
        let len = kept.len();
        let index = Tensor::from_vec(kept, len, x.device())?;
        out = out.contiguous()?.index_select(&index, dim)?;
    }
    Ok(out)
}

fn fill_rate(rate: Option<&Var>, value: f64) -> Result<()> {
    if let Some(var) = rate {
        let filled = Tensor::full(value as f32, var.dims(), var.device())?.to_dtype(var.dtype())?;
        var.set(&filled)?;
    }
    Ok(())
}

/// Sets a learnable mixing rate to 0.5.
pub fn init_rate_half(rate: Option<&Var>) -> Result<()> {
    fill_rate(rate, 0.5)
}

/// Sets a learnable mixing rate to 0.
pub fn init_rate_zero(rate: Option<&Var>) -> Result<()> {
    fill_rate(rate, 0.0)
}
