//! In-band encoding of cache tags inside column 0 of a float batch.
//!
//! Chains that can only pass a bare tensor between layers use this form: a
//! candidate row gets `100 + (vocab_id << 3)` added to column 0 (or written
//! over it when the row's data was skipped), and row 0 gets an extra `100`
//! when any row carries a tag. Decoding tolerates embedding values in
//! `[-6, 2)` on top of the tag. [`decode`] always returns a fresh batch with
//! tags moved to the side channel; the caller's tensor is left as is.

use candle_core::{Device, Tensor};

use crate::{batch::CacheTag, checks, Result, TaggedBatch};

/// Offset added by every tag, and by the batch sentinel on row 0.
pub const TAG_BASE: f32 = 100.0;
/// Column-0 values at or above this are treated as tagged.
pub const TAG_THRESHOLD: f32 = 95.0;
/// Slack added before truncation when recovering the vocab id.
pub const TAG_ROUNDING: f32 = 6.0;
/// Bits reserved below the vocab id.
pub const TAG_SHIFT: u32 = 3;

/// Column-0 payload carried by a row tagged with `vocab_id`.
pub fn tag_value(vocab_id: usize) -> f32 {
    TAG_BASE + (vocab_id << TAG_SHIFT) as f32
}

/// Recovers the vocab id from a tagged column-0 value (sentinel already removed).
pub fn decode_vocab_id(value: f32) -> usize {
    let shifted = (value + TAG_ROUNDING) as i64 - TAG_BASE as i64;
    (shifted.max(0) >> TAG_SHIFT) as usize
}

/// Folds the side-channel tags of `batch` into column 0 of a new tensor.
pub fn encode(batch: &TaggedBatch) -> Result<Tensor> {
    let (rows, cols) = checks::expect_matrix("in-band encode", batch.data())?;
    let mut values = checks::to_f32_vec("in-band encode", batch.data())?;

    if let Some(tags) = batch.tags() {
        for tag in tags {
            let slot = &mut values[tag.row * cols];
            if tag.already_cached {
                *slot = tag_value(tag.vocab_id);
            } else {
                *slot += tag_value(tag.vocab_id);
            }
        }
        if rows > 0 {
            values[0] += TAG_BASE;
        }
    }

    Ok(Tensor::from_vec(values, (rows, cols), batch.data().device())?)
}

/// Strips in-band tags from `tensor` into a side-channel batch.
///
/// Decoded ids at or beyond `capacity` cannot be looked up in any cache; their
/// tag is still stripped but the row is passed on untagged.
pub fn decode(tensor: &Tensor, capacity: usize) -> Result<TaggedBatch> {
    let (rows, cols) = checks::expect_matrix("in-band decode", tensor)?;
    let mut values = checks::to_f32_vec("in-band decode", tensor)?;
    if rows == 0 || values[0] < TAG_THRESHOLD {
        return Ok(TaggedBatch::new(to_device(values, rows, cols, tensor.device())?));
    }

    let mut tags = Vec::new();
    for row in 0..rows {
        let slot = &mut values[row * cols];
        if row == 0 {
            *slot -= TAG_BASE;
        }
        if *slot < TAG_THRESHOLD {
            continue;
        }
        let vocab_id = decode_vocab_id(*slot);
        *slot -= tag_value(vocab_id);
        if vocab_id < capacity {
            tags.push(CacheTag {
                row,
                vocab_id,
                already_cached: false,
            });
        } else {
            log::warn!(
                "in-band tag on row {} decodes to vocab id {} outside cache capacity {}",
                row,
                vocab_id,
                capacity
            );
        }
    }

    TaggedBatch::with_tags(to_device(values, rows, cols, tensor.device())?, tags)
}

fn to_device(values: Vec<f32>, rows: usize, cols: usize, device: &Device) -> Result<Tensor> {
    Ok(Tensor::from_vec(values, (rows, cols), device)?)
}
