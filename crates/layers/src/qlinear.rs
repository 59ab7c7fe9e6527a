//! Quantized linear projection with decode-step output caching.
//!
//! The layer expects inputs shaped `(rows, input_dim)` and returns
//! `(rows, output_dim)`, or `(rows, k)` while a subdictionary of `k` output
//! rows is active. Weights are quantized once at construction; inputs are
//! quantized per call into a reusable aligned buffer.
//!
//! When the incoming [`TaggedBatch`] carries cache tags, every tagged row is
//! resolved before any arithmetic happens:
//!
//! * ids already present in the cache table are copied from the cache output
//!   matrix,
//! * ids repeated within the batch are copied from their first occurrence,
//! * everything else is gathered into a compact block, run through the
//!   kernel, and (for tagged rows) written back into the cache.
//!
//! The output is then assembled in original row order from an explicit
//! per-row [`RowSource`] mapping. The caller's tensor is never modified.

use std::collections::{hash_map::Entry, HashMap};

use candle_core::Tensor;

use crate::{
    cache::{CacheHandle, CacheStats, CacheTable},
    checks, inband,
    module::Module,
    quant::{lanes_for, matmul, quantize, LaneBuffer},
    LayerError, Result, TaggedBatch,
};

/// Static shape of a quantized projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuantLinearConfig {
    /// Incoming feature dimension, a multiple of the SIMD lane count.
    pub input_dim: usize,
    /// Full output vocabulary size.
    pub output_dim: usize,
    /// Whether a bias vector is applied.
    pub bias: bool,
}

impl QuantLinearConfig {
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: true,
        }
    }
}

/// Where a row of the final output comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowSource {
    /// Slot in the compact block of freshly computed rows.
    Computed(usize),
    /// Row of the cache output matrix for this vocab id.
    Cached(usize),
    /// Final output of an earlier row of the same batch.
    Repeat(usize),
}

#[derive(Debug, Clone, Copy)]
struct PlannedRow {
    source: RowSource,
    vocab_id: Option<usize>,
}

#[derive(Debug, Clone)]
struct Subdictionary {
    indices: Vec<usize>,
    bias: Option<Vec<f32>>,
}

/// Cache output matrix, allocated on first write.
#[derive(Debug, Default)]
struct CachedOutputs {
    width: usize,
    values: Vec<f32>,
}

impl CachedOutputs {
    fn clear(&mut self) {
        self.width = 0;
        self.values = Vec::new();
    }

    fn store(&mut self, capacity: usize, vocab_id: usize, row: &[f32]) -> Result<()> {
        if self.values.is_empty() {
            let elements = capacity * row.len();
            self.values
                .try_reserve_exact(elements)
                .map_err(|_| LayerError::Allocation {
                    context: "cache output matrix",
                    elements,
                })?;
            self.values.resize(elements, 0.0);
            self.width = row.len();
        }
        let start = vocab_id * self.width;
        self.values[start..start + self.width].copy_from_slice(row);
        Ok(())
    }

    fn row(&self, vocab_id: usize) -> Option<&[f32]> {
        let start = vocab_id * self.width;
        self.values.get(start..start + self.width)
    }
}

/// Linear projection computed through the fixed-point kernel.
#[derive(Debug)]
pub struct QuantLinear {
    config: QuantLinearConfig,
    weight: Tensor,
    quant_weight: LaneBuffer,
    bias: Option<Vec<f32>>,
    subdict: Option<Subdictionary>,
    quant_input: LaneBuffer,
    cache: CacheHandle,
    cached: CacheTable,
    cache_output: CachedOutputs,
    stats: CacheStats,
}

impl QuantLinear {
    /// Builds the layer from `(output_dim, input_dim)` weights and an optional bias.
    ///
    /// Fails when `input_dim` is not a multiple of the SIMD lane count.
    pub fn new(
        config: QuantLinearConfig,
        weight: Tensor,
        bias: Option<Tensor>,
        cache: CacheHandle,
    ) -> Result<Self> {
        Self::validate_weight(&config, &weight)?;
        let bias = Self::validate_bias(&config, bias.as_ref())?;

        let values = checks::to_f32_vec("qlinear.weight", &weight)?;
        let mut quant_weight =
            LaneBuffer::with_lanes(lanes_for(config.output_dim, config.input_dim))?;
        quantize(
            &values,
            quant_weight.as_mut_slice(),
            config.output_dim,
            config.input_dim,
        );

        log::info!(
            "qlinear init: input_dim={} output_dim={} bias={} cache_capacity={}",
            config.input_dim,
            config.output_dim,
            config.bias,
            cache.capacity()
        );

        Ok(Self {
            config,
            weight,
            quant_weight,
            bias,
            subdict: None,
            quant_input: LaneBuffer::default(),
            cache,
            cached: CacheTable::default(),
            cache_output: CachedOutputs::default(),
            stats: CacheStats::default(),
        })
    }

    /// Builds the layer taking its shape from the weight tensor.
    pub fn from_parameters(weight: Tensor, bias: Option<Tensor>, cache: CacheHandle) -> Result<Self> {
        let (output_dim, input_dim) = checks::expect_matrix("qlinear.weight", &weight)?;
        let config = QuantLinearConfig {
            input_dim,
            output_dim,
            bias: bias.is_some(),
        };
        Self::new(config, weight, bias, cache)
    }

    pub fn config(&self) -> &QuantLinearConfig {
        &self.config
    }

    /// The unquantized weight the layer was built from.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> Option<&[f32]> {
        self.bias.as_deref()
    }

    pub fn cache(&self) -> &CacheHandle {
        &self.cache
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Active subdictionary, if any.
    pub fn subdictionary(&self) -> Option<&[usize]> {
        self.subdict.as_ref().map(|s| s.indices.as_slice())
    }

    /// Number of output columns produced by the next forward call.
    pub fn output_width(&self) -> usize {
        self.subdict
            .as_ref()
            .map_or(self.config.output_dim, |s| s.indices.len())
    }

    /// Restricts the projection to the given output rows, in order.
    ///
    /// An empty list lifts the restriction. Cached outputs are keyed by vocab
    /// id but hold restricted columns, so changing the restriction invalidates
    /// the shared cache.
    pub fn apply_subdictionary(&mut self, indices: &[usize]) -> Result<()> {
        if indices.is_empty() {
            self.clear_subdictionary();
            return Ok(());
        }
        if let Some(&index) = indices.iter().find(|&&i| i >= self.config.output_dim) {
            return Err(LayerError::InvalidSubdictionary {
                index,
                output_dim: self.config.output_dim,
            });
        }
        if self.subdictionary() == Some(indices) {
            return Ok(());
        }

        let bias = self
            .bias
            .as_ref()
            .map(|bias| indices.iter().map(|&i| bias[i]).collect());
        self.subdict = Some(Subdictionary {
            indices: indices.to_vec(),
            bias,
        });
        self.cache.invalidate();
        log::debug!("qlinear subdictionary applied: {} rows", indices.len());
        Ok(())
    }

    /// Restores the full output vocabulary.
    pub fn clear_subdictionary(&mut self) {
        if self.subdict.take().is_some() {
            self.cache.invalidate();
            log::debug!("qlinear subdictionary cleared");
        }
    }

    /// Sets the cache capacity of the whole chain sharing this layer's handle.
    pub fn set_cache_capacity(&mut self, capacity: usize) {
        self.cache.reconfigure(capacity);
    }

    /// Projects an untagged `(rows, input_dim)` tensor.
    pub fn forward_tensor(&mut self, input: &Tensor) -> Result<Tensor> {
        self.forward_batch(&TaggedBatch::new(input.clone()))
    }

    /// Projects a tensor whose cache tags are encoded in column 0.
    pub fn forward_inband(&mut self, input: &Tensor) -> Result<Tensor> {
        let batch = inband::decode(input, self.cache.capacity())?;
        self.forward_batch(&batch)
    }

    /// Projects a batch, serving tagged rows from the cache where possible.
    pub fn forward_batch(&mut self, batch: &TaggedBatch) -> Result<Tensor> {
        let input = batch.data();
        let (rows, cols) = checks::expect_matrix("qlinear.input", input)?;
        if cols != self.config.input_dim {
            return Err(LayerError::Shape {
                context: "qlinear.input",
                details: format!(
                    "expected last dim {} but received {}",
                    self.config.input_dim, cols
                ),
            });
        }
        if self.cached.sync(&self.cache) {
            self.cache_output.clear();
        }

        let values = checks::to_f32_vec("qlinear.input", input)?;
        let plan = self.plan_rows(batch)?;

        let compute_rows: Vec<usize> = plan
            .iter()
            .enumerate()
            .filter(|(_, planned)| matches!(planned.source, RowSource::Computed(_)))
            .map(|(row, _)| row)
            .collect();
        let computed = if compute_rows.len() == rows {
            self.project(&values, rows)?
        } else {
            let mut compact = Vec::with_capacity(compute_rows.len() * cols);
            for &row in &compute_rows {
                compact.extend_from_slice(&values[row * cols..(row + 1) * cols]);
            }
            self.project(&compact, compute_rows.len())?
        };

        let width = self.output_width();
        let capacity = self.cached.capacity();
        let mut output = vec![0f32; rows * width];
        for (row, planned) in plan.iter().enumerate() {
            let (done, rest) = output.split_at_mut(row * width);
            let target = &mut rest[..width];
            match planned.source {
                RowSource::Computed(slot) => {
                    let fresh = &computed[slot * width..(slot + 1) * width];
                    target.copy_from_slice(fresh);
                    if let Some(vocab_id) = planned.vocab_id {
                        self.cache_output.store(capacity, vocab_id, fresh)?;
                    }
                }
                RowSource::Cached(vocab_id) => {
                    let cached = self
                        .cache_output
                        .row(vocab_id)
                        .ok_or(LayerError::CacheDesync { row, vocab_id })?;
                    target.copy_from_slice(cached);
                }
                RowSource::Repeat(first) => {
                    target.copy_from_slice(&done[first * width..(first + 1) * width]);
                }
            }
        }

        for vocab_id in plan.iter().filter_map(|planned| planned.vocab_id) {
            self.cached.mark(vocab_id);
        }
        self.record(&plan);

        Ok(Tensor::from_vec(output, (rows, width), input.device())?)
    }

    fn plan_rows(&mut self, batch: &TaggedBatch) -> Result<Vec<PlannedRow>> {
        let rows = batch.rows();
        let capacity = self.cached.capacity();
        if capacity == 0 || !batch.is_tagged() {
            return Ok((0..rows)
                .map(|row| PlannedRow {
                    source: RowSource::Computed(row),
                    vocab_id: None,
                })
                .collect());
        }

        let mut plan = Vec::with_capacity(rows);
        let mut first_seen: HashMap<usize, usize> = HashMap::new();
        let mut next_slot = 0;
        for (row, tag) in batch.tag_per_row().into_iter().enumerate() {
            let vocab_id = match tag {
                Some(tag) if tag.vocab_id < capacity => Some(tag.vocab_id),
                Some(tag) => {
                    log::warn!(
                        "qlinear: row {} tagged with vocab id {} beyond cache capacity {}",
                        row,
                        tag.vocab_id,
                        capacity
                    );
                    None
                }
                None => None,
            };

            let source = match vocab_id {
                Some(id) if self.cached.contains(id) => RowSource::Cached(id),
                Some(id) => match first_seen.entry(id) {
                    Entry::Occupied(first) => RowSource::Repeat(*first.get()),
                    Entry::Vacant(slot) => {
                        slot.insert(row);
                        next_slot += 1;
                        RowSource::Computed(next_slot - 1)
                    }
                },
                None => {
                    next_slot += 1;
                    RowSource::Computed(next_slot - 1)
                }
            };

            if let (Some(tag), RowSource::Computed(_)) = (tag, source) {
                if tag.already_cached {
                    // The upstream layer skipped this row's data; computing it
                    // would produce garbage. Reset both sides of the protocol.
                    log::warn!(
                        "qlinear: cache desync on row {} (vocab id {}), invalidating",
                        row,
                        tag.vocab_id
                    );
                    self.cache.invalidate();
                    return Err(LayerError::CacheDesync {
                        row,
                        vocab_id: tag.vocab_id,
                    });
                }
            }
            plan.push(PlannedRow { source, vocab_id });
        }
        Ok(plan)
    }

    /// Runs `rows` contiguous input rows through the kernel and adds the bias.
    fn project(&mut self, values: &[f32], rows: usize) -> Result<Vec<f32>> {
        let cols = self.config.input_dim;
        let width = self.output_width();
        let mut output = vec![0f32; rows * width];
        if rows == 0 {
            return Ok(output);
        }

        self.quant_input.resize(lanes_for(rows, cols))?;
        quantize(values, self.quant_input.as_mut_slice(), rows, cols);
        matmul(
            self.quant_input.as_slice(),
            self.quant_weight.as_slice(),
            &mut output,
            rows,
            width,
            cols,
            self.subdictionary(),
        );

        let bias = match &self.subdict {
            Some(subdict) => subdict.bias.as_deref(),
            None => self.bias.as_deref(),
        };
        if let Some(bias) = bias {
            for row in output.chunks_exact_mut(width) {
                for (out, b) in row.iter_mut().zip(bias) {
                    *out += b;
                }
            }
        }
        Ok(output)
    }

    fn record(&mut self, plan: &[PlannedRow]) {
        let mut call = CacheStats::default();
        for planned in plan {
            match planned.source {
                RowSource::Computed(_) => {
                    call.computed += 1;
                    if planned.vocab_id.is_some() {
                        call.misses += 1;
                    }
                }
                RowSource::Cached(_) => call.hits += 1,
                RowSource::Repeat(_) => call.repeats += 1,
            }
        }
        if call.hits + call.repeats + call.misses > 0 {
            log::debug!(
                "qlinear cache: hits={} repeats={} misses={} computed={}",
                call.hits,
                call.repeats,
                call.misses,
                call.computed
            );
        }
        self.stats.hits += call.hits;
        self.stats.repeats += call.repeats;
        self.stats.misses += call.misses;
        self.stats.computed += call.computed;
    }

    fn validate_weight(config: &QuantLinearConfig, weight: &Tensor) -> Result<()> {
        let dims = checks::expect_matrix("qlinear.weight", weight)?;
        if dims != (config.output_dim, config.input_dim) {
            return Err(LayerError::Shape {
                context: "qlinear.weight",
                details: format!(
                    "expected ({}, {}), got {:?}",
                    config.output_dim, config.input_dim, dims
                ),
            });
        }
        if config.output_dim == 0 || config.input_dim == 0 {
            return Err(LayerError::Shape {
                context: "qlinear.weight",
                details: "dimensions must be non-zero".into(),
            });
        }
        checks::expect_lane_multiple("qlinear.weight", config.input_dim)
    }

    fn validate_bias(config: &QuantLinearConfig, bias: Option<&Tensor>) -> Result<Option<Vec<f32>>> {
        match (config.bias, bias) {
            (true, Some(tensor)) => {
                checks::expect_vector("qlinear.bias", tensor, config.output_dim)?;
                Ok(Some(checks::to_f32_vec("qlinear.bias", tensor)?))
            }
            (false, Some(_)) => Err(LayerError::Shape {
                context: "qlinear.bias",
                details: "bias provided but config disables bias".into(),
            }),
            (true, None) => Err(LayerError::Shape {
                context: "qlinear.bias",
                details: "config expects bias but none supplied".into(),
            }),
            (false, None) => Ok(None),
        }
    }
}

impl Module for QuantLinear {
    fn name(&self) -> &'static str {
        "qlinear"
    }

    fn forward(&mut self, batch: TaggedBatch) -> Result<TaggedBatch> {
        Ok(TaggedBatch::new(self.forward_batch(&batch)?))
    }

    fn apply_subdictionary(&mut self, indices: &[usize]) -> Result<()> {
        QuantLinear::apply_subdictionary(self, indices)
    }

    fn set_cache_capacity(&mut self, capacity: usize) {
        QuantLinear::set_cache_capacity(self, capacity)
    }

    fn cache_handle(&self) -> Option<&CacheHandle> {
        Some(&self.cache)
    }
}
