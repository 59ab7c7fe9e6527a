use super::QUANT_MULT;

/// A function sampled at kernel resolution over `[-range, range]` quantized steps.
#[derive(Debug, Clone)]
pub struct ActivationTable {
    range: i32,
    values: Vec<f32>,
}

impl ActivationTable {
    /// Samples `f` at every quantized step between `-range` and `range`.
    pub fn tabulate(range: i32, f: impl Fn(f32) -> f32) -> Self {
        let values = (0..=2 * range)
            .map(|i| f((i - range) as f32 / QUANT_MULT))
            .collect();
        Self { range, values }
    }

    pub fn range(&self) -> i32 {
        self.range
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }
}

/// Applies a precomputed table elementwise: each input is scaled, rounded and
/// clamped to `[-range, range]` before indexing.
///
/// `table` must hold `2 * range + 1` entries.
pub fn lookup_table(input: &[f32], output: &mut [f32], table: &[f32], range: i32) {
    debug_assert_eq!(table.len(), (2 * range + 1) as usize);
    let limit = range as f32;
    for (out, &value) in output.iter_mut().zip(input) {
        let step = (value * QUANT_MULT).round().clamp(-limit, limit) as i32;
        *out = table[(step + range) as usize];
    }
}
