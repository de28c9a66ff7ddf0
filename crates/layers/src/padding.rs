//! Padding and sliding-window gathers expressed as index selects.
//!
//! Candle has zero padding but no reflection padding or `unfold`; both are
//! built here from `index_select` so they work on any backend and keep
//! gradients flowing. Window gathers replace one axis of size `n` with a pair
//! `(out, kernel)` where `out = (n - dilation * (kernel - 1) - 1) / stride + 1`.

use candle_core::{bail, Result, Tensor};

/// Source indices for reflection padding of an axis of length `size`.
///
/// The edge element is not repeated, so `pad` must be smaller than `size`.
pub fn reflect_indices(size: usize, pad: usize) -> Result<Vec<u32>> {
    if size == 0 {
        bail!("reflection padding needs a non-empty axis");
    }
    if pad >= size && pad > 0 {
        bail!("reflection padding {pad} must be smaller than the padded axis ({size})");
    }
    let last = size as isize - 1;
    Ok((-(pad as isize)..(size + pad) as isize)
        .map(|i| {
            let mirrored = if i < 0 {
                -i
            } else if i > last {
                2 * last - i
            } else {
                i
            };
            mirrored as u32
        })
        .collect())
}

/// Reflection-pads `dim` by `pad` on both sides.
pub fn reflect_pad(x: &Tensor, dim: usize, pad: usize) -> Result<Tensor> {
    if pad == 0 {
        return Ok(x.clone());
    }
    let size = x.dim(dim)?;
    let indices = reflect_indices(size, pad)?;
    let len = indices.len();
    let index = Tensor::from_vec(indices, len, x.device())?;
    x.contiguous()?.index_select(&index, dim)
}

/// Reflection-pads the two trailing (in-plane) axes.
pub fn reflect_pad_plane(x: &Tensor, pad: usize) -> Result<Tensor> {
    let rank = x.rank();
    if rank < 2 {
        bail!("plane padding needs at least two axes, got {:?}", x.dims());
    }
    let rows = reflect_pad(x, rank - 2, pad)?;
    reflect_pad(&rows, rank - 1, pad)
}

/// Pads `dim` with a constant on both sides.
pub fn pad_constant(x: &Tensor, dim: usize, pad: usize, value: f64) -> Result<Tensor> {
    if pad == 0 {
        return Ok(x.clone());
    }
    let mut shape = x.dims().to_vec();
    if dim >= shape.len() {
        bail!("padding axis {dim} out of range for shape {shape:?}");
    }
    shape[dim] = pad;
    let fill = Tensor::full(value as f32, shape, x.device())?.to_dtype(x.dtype())?;
    Tensor::cat(&[&fill, x, &fill], dim)
}

/// Output length of a sliding window over an axis of length `size`.
pub fn window_count(size: usize, kernel: usize, stride: usize, dilation: usize) -> Result<usize> {
    if kernel == 0 || stride == 0 || dilation == 0 {
        bail!("window kernel ({kernel}), stride ({stride}) and dilation ({dilation}) must be non-zero");
    }
    let span = dilation * (kernel - 1) + 1;
    if size < span {
        bail!("window span {span} exceeds axis length {size}");
    }
    Ok((size - span) / stride + 1)
}

/// Gathers sliding windows along `dim`, replacing it with `(out, kernel)`.
pub fn windows(
    x: &Tensor,
    dim: usize,
    kernel: usize,
    stride: usize,
    dilation: usize,
) -> Result<(Tensor, usize)> {
    let dims = x.dims().to_vec();
    if dim >= dims.len() {
        bail!("window axis {dim} out of range for shape {dims:?}");
    }
    let out = window_count(dims[dim], kernel, stride, dilation)?;
    let indices: Vec<u32> = (0..out)
        .flat_map(|o| (0..kernel).map(move |j| (o * stride + j * dilation) as u32))
        .collect();
    let index = Tensor::from_vec(indices, out * kernel, x.device())?;
    let gathered = x.contiguous()?.index_select(&index, dim)?;

    let mut shape = dims[..dim].to_vec();
    shape.push(out);
    shape.push(kernel);
    shape.extend_from_slice(&dims[dim + 1..]);
    Ok((gathered.reshape(shape)?, out))
}

/// In-plane unfold of a volume: `(N, C, D, Hp, Wp)` -> `(N, C, k*k, D, Ho, Wo)`.
///
/// The window axis is ordered row-major, `ki * kernel + kj`.
pub fn unfold_plane(x: &Tensor, kernel: usize, stride: usize, dilation: usize) -> Result<Tensor> {
    let (n, c, d, _, _) = x.dims5()?;
    let (rows, out_h) = windows(x, 3, kernel, stride, dilation)?;
    let (cells, out_w) = windows(&rows, 5, kernel, stride, dilation)?;
    // (N, C, D, Ho, ki, Wo, kj) -> (N, C, ki, kj, D, Ho, Wo)
    cells
        .permute(vec![0, 1, 4, 6, 2, 3, 5])?
        .reshape(vec![n, c, kernel * kernel, d, out_h, out_w])
}
