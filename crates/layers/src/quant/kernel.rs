#[cfg(all(target_arch = "x86_64", target_feature = "sse2"))]
use std::arch::x86_64::*;

use super::{quantize_value, Lane, QUANT_MULT, SIMD_VSIZE};

/// Quantizes a row-major `rows x cols` matrix into `output`.
///
/// `cols` must be a multiple of [`SIMD_VSIZE`] and `output` must hold at least
/// `rows * cols / SIMD_VSIZE` lanes.
pub fn quantize(input: &[f32], output: &mut [Lane], rows: usize, cols: usize) {
    let samples = rows * cols;
    debug_assert!(input.len() >= samples);
    debug_assert!(output.len() * SIMD_VSIZE >= samples);

    for (lane, chunk) in output
        .iter_mut()
        .zip(input[..samples].chunks_exact(SIMD_VSIZE))
    {
        for (slot, &value) in lane.0.iter_mut().zip(chunk) {
            *slot = quantize_value(value);
        }
    }
}

/// Integer dot product of two equally long lane runs.
#[cfg(all(target_arch = "x86_64", target_feature = "sse2"))]
#[inline]
pub fn dot(a: &[Lane], b: &[Lane]) -> i32 {
    debug_assert_eq!(a.len(), b.len());
    // SAFETY: SSE2 is enabled for this build and `Lane` is 16-byte aligned,
    // so the aligned loads stay within each lane.
    unsafe {
        let mut acc = _mm_setzero_si128();
        for (x, y) in a.iter().zip(b) {
            let xv = _mm_load_si128(x.0.as_ptr() as *const __m128i);
            let yv = _mm_load_si128(y.0.as_ptr() as *const __m128i);
            acc = _mm_add_epi32(acc, _mm_madd_epi16(xv, yv));
        }
        let mut sums = [0i32; 4];
        _mm_storeu_si128(sums.as_mut_ptr() as *mut __m128i, acc);
        sums.iter().fold(0i32, |total, &s| total.wrapping_add(s))
    }
}

/// Integer dot product of two equally long lane runs.
#[cfg(not(all(target_arch = "x86_64", target_feature = "sse2")))]
#[inline]
pub fn dot(a: &[Lane], b: &[Lane]) -> i32 {
    debug_assert_eq!(a.len(), b.len());
    // Wraps like the vector accumulator so every target agrees on overflow.
    a.iter()
        .zip(b)
        .flat_map(|(x, y)| x.0.iter().zip(y.0.iter()))
        .fold(0i32, |total, (&p, &q)| {
            total.wrapping_add((p as i32).wrapping_mul(q as i32))
        })
}

/// Quantized product `output = input * weight^T`, de-quantized into `f32`.
///
/// `input` holds `rows_in` quantized rows and `weight` the quantized weight
/// rows, both `cols` wide. `output` receives `rows_in x rows_out` values. When
/// `projection` is given, output column `j` uses weight row `projection[j]`
/// and `rows_out` must equal the projection length.
pub fn matmul(
    input: &[Lane],
    weight: &[Lane],
    output: &mut [f32],
    rows_in: usize,
    rows_out: usize,
    cols: usize,
    projection: Option<&[usize]>,
) {
    let lanes_per_row = cols / SIMD_VSIZE;
    let unquant = 1.0 / (QUANT_MULT * QUANT_MULT);
    debug_assert!(output.len() >= rows_in * rows_out);
    debug_assert!(projection.map_or(true, |p| p.len() == rows_out));
    if rows_out == 0 {
        return;
    }

    for (row, out_row) in output.chunks_exact_mut(rows_out).take(rows_in).enumerate() {
        let x = &input[row * lanes_per_row..(row + 1) * lanes_per_row];
        for (col, out) in out_row.iter_mut().enumerate() {
            let w_row = projection.map_or(col, |p| p[col]);
            let w = &weight[w_row * lanes_per_row..(w_row + 1) * lanes_per_row];
            *out = dot(x, w) as f32 * unquant;
        }
    }
}
