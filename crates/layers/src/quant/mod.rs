//! Fixed-point quantization kernel.
//!
//! Floating point matrices are scaled by [`QUANT_MULT`], rounded and saturated
//! into `i16` samples packed [`SIMD_VSIZE`] at a time into 16-byte aligned
//! [`Lane`]s. Dot products accumulate in `i32` and are de-quantized by
//! `1 / QUANT_MULT²`. Row widths must be whole multiples of the lane size; the
//! kernel itself trusts its callers on shapes.

mod buffer;
mod kernel;
mod lut;

pub use buffer::LaneBuffer;
pub use kernel::{dot, matmul, quantize};
pub use lut::{lookup_table, ActivationTable};

/// Number of `i16` samples processed per vector operation.
pub const SIMD_VSIZE: usize = 8;

/// Global fixed-point scale factor.
pub const QUANT_MULT: f32 = 1000.0;

/// Largest magnitude stored after quantization. `i16::MIN` is excluded so the
/// pairwise multiply-add can never overflow.
pub const QUANT_MAX: f32 = i16::MAX as f32;

/// One vector register worth of quantized samples.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Lane(pub [i16; SIMD_VSIZE]);

/// Number of lanes needed to hold a `rows x cols` matrix.
pub fn lanes_for(rows: usize, cols: usize) -> usize {
    rows * cols / SIMD_VSIZE
}

/// Quantizes a single value.
#[inline]
pub fn quantize_value(value: f32) -> i16 {
    (value * QUANT_MULT).round().clamp(-QUANT_MAX, QUANT_MAX) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lanes_are_vector_aligned() {
        assert_eq!(std::mem::align_of::<Lane>(), 16);
        assert_eq!(std::mem::size_of::<Lane>(), 16);
    }

    #[test]
    fn quantize_value_rounds_and_saturates() {
        assert_eq!(quantize_value(0.0016), 2);
        assert_eq!(quantize_value(-0.25), -250);
        assert_eq!(quantize_value(1e6), i16::MAX);
        assert_eq!(quantize_value(-1e6), -i16::MAX);
    }
}
