//! Local window self-attention over the in-plane axes.
//!
//! Every query voxel attends to the `kernel x kernel` neighbourhood around
//! it on its own depth slice. Keys carry a relative positional term: the
//! query's coordinate embedding minus the neighbour's. Borders are
//! reflection padded so each window is fully populated.

use candle_core::{bail, DType, Result, Tensor};
use candle_nn::ops::softmax;
use layers::{
    geometry::stride_subsample,
    padding::{reflect_pad_plane, unfold_plane},
};

use crate::core::AcmixConfig;

/// Windowed attention applied head by head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowAttention {
    head: usize,
    head_dim: usize,
    kernel: usize,
    stride: usize,
    dilation: usize,
    padding: usize,
}

impl WindowAttention {
    pub fn new(config: &AcmixConfig) -> Self {
        Self {
            head: config.head,
            head_dim: config.head_dim(),
            kernel: config.kernel_att,
            stride: config.stride,
            dilation: config.dilation,
            padding: config.padding_att(),
        }
    }

    fn unfold(&self, x: &Tensor) -> Result<Tensor> {
        let padded = reflect_pad_plane(x, self.padding)?;
        unfold_plane(&padded, self.kernel, self.stride, self.dilation)
    }

    /// Attends `q` over windows of `k` and `v`.
    ///
    /// `q`, `k` and `v` are `(B, head * head_dim, D, H, W)`; `pe` is the
    /// projected coordinate grid `(1, head_dim, D, H, W)`. Returns
    /// `(B, head * head_dim, D, Ho, Wo)`.
    pub fn attend(&self, q: &Tensor, k: &Tensor, v: &Tensor, pe: &Tensor) -> Result<Tensor> {
        let (batch, channels, depth, height, width) = q.dims5()?;
        if channels != self.head * self.head_dim {
            bail!(
                "window attention expects {} channels ({} heads x {}), got {channels}",
                self.head * self.head_dim,
                self.head,
                self.head_dim
            );
        }
        for (name, t) in [("k", k), ("v", v)] {
            if t.dims() != q.dims() {
                bail!("window attention {name} shape {:?} differs from q {:?}", t.dims(), q.dims());
            }
        }
        if pe.dims() != [1, self.head_dim, depth, height, width] {
            bail!(
                "positional encoding must be [1, {}, {depth}, {height}, {width}], got {:?}",
                self.head_dim,
                pe.dims()
            );
        }
        if self.padding >= height || self.padding >= width {
            bail!(
                "attention window {k}x{k} (dilation {d}) needs reflection padding {p}, which must be smaller than the input plane {height}x{width}",
                k = self.kernel,
                d = self.dilation,
                p = self.padding
            );
        }

        let merged = batch * self.head;
        let per_head = (merged, self.head_dim, depth, height, width);
        let scaling = (self.head_dim as f64).powf(-0.5);
        let q_att = (q.reshape(per_head)? * scaling)?;
        let k_att = k.reshape(per_head)?;
        let v_att = v.reshape(per_head)?;

        let (q_att, q_pe) = if self.stride > 1 {
            (
                stride_subsample(&q_att, self.stride)?,
                stride_subsample(pe, self.stride)?,
            )
        } else {
            (q_att, pe.clone())
        };

        // (M, head_dim, k*k, D, Ho, Wo)
        let unfold_k = self.unfold(&k_att)?;
        let unfold_rpe = self.unfold(pe)?;
        let unfold_v = self.unfold(&v_att)?;

        let keys = unfold_k
            .broadcast_add(&q_pe.unsqueeze(2)?)?
            .broadcast_sub(&unfold_rpe)?;
        let logits = q_att.unsqueeze(2)?.broadcast_mul(&keys)?.sum(1)?;
        let weights = softmax(&logits.to_dtype(DType::F32)?, 1)?.to_dtype(q.dtype())?;
        let out = weights.unsqueeze(1)?.broadcast_mul(&unfold_v)?.sum(2)?;

        let (_, _, _, out_h, out_w) = out.dims5()?;
        log::debug!(
            "window attention: q {:?} -> logits {:?} -> out [{batch}, {channels}, {depth}, {out_h}, {out_w}]",
            q.dims(),
            logits.dims()
        );
        out.reshape((batch, channels, depth, out_h, out_w))
    }
}
