//! Sigmoid evaluated through a table precomputed at kernel resolution.

use candle_core::Tensor;

use crate::{
    checks,
    module::Module,
    quant::{lookup_table, ActivationTable, QUANT_MULT},
    Result, TaggedBatch,
};

/// Inputs beyond `±SATURATION` map to the table ends.
const SATURATION: f32 = 10.0;

/// Quantized logistic activation. Cache tags pass through untouched.
#[derive(Debug, Clone)]
pub struct QuantSigmoid {
    table: ActivationTable,
}

impl QuantSigmoid {
    pub fn new() -> Self {
        let range = (SATURATION * QUANT_MULT) as i32;
        let table = ActivationTable::tabulate(range, |x| 1.0 / (1.0 + (-x).exp()));
        Self { table }
    }

    /// Applies the activation to a `(rows, cols)` tensor.
    pub fn forward_tensor(&self, input: &Tensor) -> Result<Tensor> {
        let (rows, cols) = checks::expect_matrix("qsigmoid.input", input)?;
        let values = checks::to_f32_vec("qsigmoid.input", input)?;
        let mut output = vec![0f32; values.len()];
        lookup_table(&values, &mut output, self.table.values(), self.table.range());
        Ok(Tensor::from_vec(output, (rows, cols), input.device())?)
    }
}

impl Default for QuantSigmoid {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for QuantSigmoid {
    fn name(&self) -> &'static str {
        "qsigmoid"
    }

    fn forward(&mut self, batch: TaggedBatch) -> Result<TaggedBatch> {
        batch.map_data(|data| self.forward_tensor(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CacheTag;
    use candle_core::Device;

    #[test]
    fn matches_exact_sigmoid_within_table_resolution() -> anyhow::Result<()> {
        let sigmoid = QuantSigmoid::new();
        let values = [-12.0f32, -2.5, -0.3, 0.0, 0.7, 4.2, 30.0, 1.2345];
        let input = Tensor::from_slice(&values, (1, 8), &Device::Cpu)?;
        let output = sigmoid.forward_tensor(&input)?.to_vec2::<f32>()?;

        for (x, y) in values.iter().zip(&output[0]) {
            let exact = 1.0 / (1.0 + (-x.clamp(-SATURATION, SATURATION)).exp());
            assert!((y - exact).abs() < 1e-3, "sigmoid({x}) = {y}, expected {exact}");
        }
        Ok(())
    }

    #[test]
    fn tags_survive_the_activation() -> anyhow::Result<()> {
        let mut sigmoid = QuantSigmoid::new();
        let data = Tensor::zeros((2, 8), candle_core::DType::F32, &Device::Cpu)?;
        let tags = vec![CacheTag {
            row: 1,
            vocab_id: 3,
            already_cached: false,
        }];
        let output = sigmoid.forward(TaggedBatch::with_tags(data, tags.clone())?)?;
        assert_eq!(output.tags(), Some(tags.as_slice()));
        assert_eq!(output.data().to_vec2::<f32>()?[0][0], 0.5);
        Ok(())
    }
}
