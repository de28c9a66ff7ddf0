//! Lightweight validation helpers shared across layer components.
//!
//! These routines provide concise shape and dtype assertions that can be wired
//! into constructors or forward paths. They return `candle_core::Result<()>`
//! so call sites can propagate errors without panicking. Every helper takes a
//! `name` so messages point at the offending tensor.

use candle_core::{DType, Error, Result, Tensor};

/// Ensures a tensor has exactly `rank` dimensions.
pub fn expect_rank(name: &str, tensor: &Tensor, rank: usize) -> Result<()> {
    let dims = tensor.dims();
    if dims.len() == rank {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name}: expected rank {rank}, got shape {dims:?}"
        )))
    }
}

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(name: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    let actual = tensor.dims();
    if actual == expected {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name}: expected shape {expected:?}, got {actual:?}"
        )))
    }
}

/// Validates the `(batch, channels, depth, height, width)` convention with a
/// known channel count and non-empty extents.
pub fn expect_volume(name: &str, tensor: &Tensor, channels: usize) -> Result<()> {
    let dims = tensor.dims();
    match dims {
        [batch, actual, depth, height, width] if *actual == channels => {
            if [*batch, *depth, *height, *width].contains(&0) {
                Err(Error::Msg(format!(
                    "{name}: volume extents must be non-zero, got {dims:?}"
                )))
            } else {
                Ok(())
            }
        }
        _ => Err(Error::Msg(format!(
            "{name}: expected (batch, {channels}, depth, height, width), got {dims:?}"
        ))),
    }
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(name: &str, tensor: &Tensor, allowed: &[DType]) -> Result<()> {
    let dtype = tensor.dtype();
    if allowed.contains(&dtype) {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name}: expected dtype in {allowed:?}, got {dtype:?}"
        )))
    }
}

/// Floating point dtypes accepted for layer parameters.
pub const FLOAT_DTYPES: [DType; 4] = [DType::F16, DType::BF16, DType::F32, DType::F64];

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn volume_check_reports_layout() -> Result<()> {
        let device = Device::Cpu;
        let ok = Tensor::zeros((1, 3, 2, 2, 2), DType::F32, &device)?;
        expect_volume("input", &ok, 3)?;

        let wrong_channels = expect_volume("input", &ok, 4).unwrap_err();
        assert!(wrong_channels.to_string().contains("expected (batch, 4"));

        let flat = Tensor::zeros((3, 2), DType::F32, &device)?;
        assert!(expect_volume("input", &flat, 3).is_err());
        assert!(expect_rank("input", &flat, 2).is_ok());
        Ok(())
    }

    #[test]
    fn dtype_check_lists_allowed_values() -> Result<()> {
        let tensor = Tensor::zeros(4, DType::U32, &Device::Cpu)?;
        let err = expect_dtype_in("weight", &tensor, &FLOAT_DTYPES).unwrap_err();
        assert!(err.to_string().starts_with("weight: expected dtype"));
        Ok(())
    }
}
