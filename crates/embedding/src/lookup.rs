//! Embedding lookup layer that tags decode-cache candidates.

use std::collections::HashSet;

use candle_core::{DType, Tensor};
use layers::{checks, CacheHandle, CacheTable, CacheTag, LayerError, Module, Result, TaggedBatch};

/// Maps vocabulary ids to embedding rows.
///
/// Ids below the shared cache capacity are cache candidates. The first time a
/// candidate id is seen its row is copied and tagged; every later occurrence
/// (in the same batch or a later call) is tagged `already_cached` and its row
/// is left zeroed, since the downstream projection serves it from its cache.
#[derive(Debug, Clone)]
pub struct LookupTable {
    weight: Tensor,
    vocab_size: usize,
    hidden_dim: usize,
    cache: CacheHandle,
    emitted: CacheTable,
}

impl LookupTable {
    /// Builds the layer from a `(vocab_size, hidden_dim)` weight table.
    pub fn new(weight: Tensor, cache: CacheHandle) -> Result<Self> {
        let (vocab_size, hidden_dim) = checks::expect_matrix("lookup.weight", &weight)?;
        if vocab_size == 0 || hidden_dim == 0 {
            return Err(LayerError::Shape {
                context: "lookup.weight",
                details: format!("table must be non-empty, got ({vocab_size}, {hidden_dim})"),
            });
        }
        checks::expect_dtype_in(
            "lookup.weight",
            &weight,
            &[DType::F16, DType::BF16, DType::F32, DType::F64],
        )?;
        let weight = weight.to_dtype(DType::F32)?;

        log::info!(
            "lookup table init: vocab_size={} hidden_dim={} cache_capacity={}",
            vocab_size,
            hidden_dim,
            cache.capacity()
        );
        Ok(Self {
            weight,
            vocab_size,
            hidden_dim,
            cache,
            emitted: CacheTable::default(),
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn cache(&self) -> &CacheHandle {
        &self.cache
    }

    /// Sets the cache capacity of the whole chain sharing this layer's handle.
    pub fn set_cache_capacity(&mut self, capacity: usize) {
        self.cache.reconfigure(capacity);
    }

    /// Looks up embeddings for `ids`.
    ///
    /// `ids` is either a rank-1 tensor or a matrix whose column 0 holds the
    /// id (float ids must be whole numbers). The output is `(rows, hidden_dim)`.
    pub fn forward_ids(&mut self, ids: &Tensor) -> Result<TaggedBatch> {
        let ids = self.read_ids(ids)?;
        let rows = ids.len();
        self.emitted.sync(&self.cache);
        let capacity = self.emitted.capacity();

        let mut tags = Vec::new();
        let mut keep = Vec::with_capacity(rows);
        let mut first_emitted = HashSet::new();
        for (row, &vocab_id) in ids.iter().enumerate() {
            if vocab_id >= capacity {
                keep.push(1f32);
                continue;
            }
            let already_cached =
                self.emitted.contains(vocab_id) || !first_emitted.insert(vocab_id);
            keep.push(if already_cached { 0.0 } else { 1.0 });
            tags.push(CacheTag {
                row,
                vocab_id,
                already_cached,
            });
        }

        let device = self.weight.device();
        let index: Vec<u32> = ids.iter().map(|&id| id as u32).collect();
        let index = Tensor::from_vec(index, rows, device)?;
        let mut gathered = self.weight.index_select(&index, 0)?;
        if keep.iter().any(|&k| k == 0.0) {
            let mask = Tensor::from_vec(keep, (rows, 1), device)?;
            gathered = gathered.broadcast_mul(&mask)?;
        }

        for vocab_id in first_emitted {
            self.emitted.mark(vocab_id);
        }
        TaggedBatch::with_tags(gathered, tags)
    }

    fn read_ids(&self, ids: &Tensor) -> Result<Vec<usize>> {
        let column = match ids.dims() {
            [rows] if *rows > 0 => ids.clone(),
            [rows, cols] if *rows > 0 && *cols > 0 => ids.narrow(1, 0, 1)?.flatten_all()?,
            other => {
                return Err(LayerError::Shape {
                    context: "lookup.ids",
                    details: format!("expected non-empty [rows] or [rows, cols], got {:?}", other),
                })
            }
        };

        let raw: Vec<i64> = if column.dtype().is_int() {
            column.to_dtype(DType::I64)?.to_vec1::<i64>()?
        } else {
            column
                .to_dtype(DType::F64)?
                .to_vec1::<f64>()?
                .into_iter()
                .map(|value| {
                    if value.is_finite() && value.fract() == 0.0 {
                        Ok(value as i64)
                    } else {
                        Err(LayerError::NonIntegerId { value })
                    }
                })
                .collect::<Result<_>>()?
        };

        raw.into_iter()
            .map(|id| {
                if id < 0 || id as usize >= self.vocab_size {
                    Err(LayerError::InvalidId {
                        id,
                        vocab_size: self.vocab_size,
                    })
                } else {
                    Ok(id as usize)
                }
            })
            .collect()
    }
}

impl Module for LookupTable {
    fn name(&self) -> &'static str {
        "lookup_table"
    }

    fn forward(&mut self, batch: TaggedBatch) -> Result<TaggedBatch> {
        self.forward_ids(batch.data())
    }

    fn set_cache_capacity(&mut self, capacity: usize) {
        LookupTable::set_cache_capacity(self, capacity)
    }

    fn cache_handle(&self) -> Option<&CacheHandle> {
        Some(&self.cache)
    }
}
