//! The value passed between layers: a row-major batch plus optional cache tags.

use candle_core::Tensor;

use crate::{checks, LayerError, Result};

/// Marks one batch row as a cache candidate for vocab id `vocab_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTag {
    /// Row of the batch the tag applies to.
    pub row: usize,
    /// Vocabulary id the row was looked up from.
    pub vocab_id: usize,
    /// Set when the emitting layer skipped the row's data because the id was
    /// already emitted once; downstream must serve the row from its cache.
    pub already_cached: bool,
}

/// A batch travelling through a layer chain.
///
/// `tags` is `None` unless at least one row is a cache candidate, which plays
/// the role of the batch-level "carries tags" sentinel. Tags are ordered by
/// row and reference each row at most once.
#[derive(Debug, Clone)]
pub struct TaggedBatch {
    data: Tensor,
    tags: Option<Vec<CacheTag>>,
}

impl TaggedBatch {
    /// Wraps an untagged batch.
    pub fn new(data: Tensor) -> Self {
        Self { data, tags: None }
    }

    /// Wraps a batch together with its cache tags.
    pub fn with_tags(data: Tensor, tags: Vec<CacheTag>) -> Result<Self> {
        let rows = data.dims().first().copied().unwrap_or(0);
        let mut previous = None;
        for tag in &tags {
            if tag.row >= rows || previous.is_some_and(|prev| tag.row <= prev) {
                return Err(LayerError::Shape {
                    context: "cache tags",
                    details: format!(
                        "tag for row {} is out of order or outside {} rows",
                        tag.row, rows
                    ),
                });
            }
            previous = Some(tag.row);
        }
        let tags = if tags.is_empty() { None } else { Some(tags) };
        Ok(Self { data, tags })
    }

    pub fn data(&self) -> &Tensor {
        &self.data
    }

    pub fn tags(&self) -> Option<&[CacheTag]> {
        self.tags.as_deref()
    }

    pub fn is_tagged(&self) -> bool {
        self.tags.is_some()
    }

    /// Number of rows in the batch.
    pub fn rows(&self) -> usize {
        self.data.dims().first().copied().unwrap_or(0)
    }

    /// Per-row view of the tags, `None` for untagged rows.
    pub fn tag_per_row(&self) -> Vec<Option<CacheTag>> {
        let mut per_row = vec![None; self.rows()];
        for tag in self.tags.iter().flatten() {
            per_row[tag.row] = Some(*tag);
        }
        per_row
    }

    /// Replaces the data while carrying the tags over. Row count must not change.
    pub fn map_data(self, f: impl FnOnce(&Tensor) -> Result<Tensor>) -> Result<Self> {
        let rows = self.rows();
        let data = f(&self.data)?;
        let (new_rows, _) = checks::expect_matrix("mapped batch", &data)?;
        if new_rows != rows {
            return Err(LayerError::Shape {
                context: "mapped batch",
                details: format!("row count changed from {} to {}", rows, new_rows),
            });
        }
        Ok(Self {
            data,
            tags: self.tags,
        })
    }

    pub fn into_parts(self) -> (Tensor, Option<Vec<CacheTag>>) {
        (self.data, self.tags)
    }

    pub fn into_data(self) -> Tensor {
        self.data
    }
}

impl From<Tensor> for TaggedBatch {
    fn from(data: Tensor) -> Self {
        Self::new(data)
    }
}
