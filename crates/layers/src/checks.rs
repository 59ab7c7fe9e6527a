//! Lightweight validation helpers shared across layer components.
//!
//! These routines provide concise shape and dtype assertions that can be wired
//! into constructors or forward paths. They return [`crate::Result`] so call
//! sites can propagate errors without panicking.

use candle_core::{DType, Tensor};

use crate::{quant::SIMD_VSIZE, LayerError, Result};

/// Ensures a tensor is a `(rows, cols)` matrix and returns its dimensions.
pub fn expect_matrix(context: &'static str, tensor: &Tensor) -> Result<(usize, usize)> {
    match tensor.dims() {
        [rows, cols] => Ok((*rows, *cols)),
        other => Err(LayerError::Shape {
            context,
            details: format!("expected a rank-2 matrix, got {:?}", other),
        }),
    }
}

/// Ensures a tensor is a vector of exactly `len` elements.
pub fn expect_vector(context: &'static str, tensor: &Tensor, len: usize) -> Result<()> {
    match tensor.dims() {
        [actual] if *actual == len => Ok(()),
        // Serialized biases are sometimes stored as `(len, 1)` columns.
        [actual, 1] if *actual == len => Ok(()),
        other => Err(LayerError::Shape {
            context,
            details: format!("expected a vector of {} elements, got {:?}", len, other),
        }),
    }
}

/// Ensures a row width can be split into whole SIMD lanes.
pub fn expect_lane_multiple(context: &'static str, width: usize) -> Result<()> {
    if width % SIMD_VSIZE == 0 {
        Ok(())
    } else {
        Err(LayerError::UnalignedWidth {
            context,
            width,
            lanes: SIMD_VSIZE,
        })
    }
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(context: &'static str, tensor: &Tensor, allowed: &[DType]) -> Result<()> {
    let dtype = tensor.dtype();
    if allowed.iter().copied().any(|allowed| allowed == dtype) {
        Ok(())
    } else {
        Err(LayerError::Shape {
            context,
            details: format!("expected dtype in {:?}, got {:?}", allowed, dtype),
        })
    }
}

/// Flattens a floating point tensor into a row-major `f32` vector.
pub fn to_f32_vec(context: &'static str, tensor: &Tensor) -> Result<Vec<f32>> {
    expect_dtype_in(
        context,
        tensor,
        &[DType::F16, DType::BF16, DType::F32, DType::F64],
    )?;
    Ok(tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn matrix_dims_are_returned() -> anyhow::Result<()> {
        let tensor = Tensor::zeros((3, 16), DType::F32, &Device::Cpu)?;
        assert_eq!(expect_matrix("test", &tensor)?, (3, 16));

        let vector = Tensor::zeros(16, DType::F32, &Device::Cpu)?;
        assert!(expect_matrix("test", &vector).is_err());
        Ok(())
    }

    #[test]
    fn column_biases_are_accepted() -> anyhow::Result<()> {
        let column = Tensor::zeros((4, 1), DType::F32, &Device::Cpu)?;
        expect_vector("bias", &column, 4)?;
        assert!(expect_vector("bias", &column, 5).is_err());
        Ok(())
    }

    #[test]
    fn lane_multiple_is_enforced() {
        assert!(expect_lane_multiple("weight", SIMD_VSIZE * 3).is_ok());
        let err = expect_lane_multiple("weight", SIMD_VSIZE + 1).unwrap_err();
        assert!(matches!(err, LayerError::UnalignedWidth { .. }));
    }

    #[test]
    fn integer_tensors_are_not_float_data() -> anyhow::Result<()> {
        let ids = Tensor::new(&[1u32, 2, 3], &Device::Cpu)?;
        assert!(to_f32_vec("ids", &ids).is_err());
        Ok(())
    }
}
