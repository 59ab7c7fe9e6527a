//! Common interface for layers that can be chained into a pipeline.

use crate::{CacheHandle, Result, TaggedBatch};

/// A forward-only layer operating on [`TaggedBatch`]es.
///
/// Forward calls take `&mut self`: cache-capable layers keep mutable state
/// across calls and must not be driven by two callers at once.
pub trait Module: Send {
    /// Short identifier used in logs and error messages.
    fn name(&self) -> &'static str;

    /// Runs the layer. Implementations must preserve the row count and order.
    fn forward(&mut self, batch: TaggedBatch) -> Result<TaggedBatch>;

    /// Restricts the output vocabulary to `indices`. Layers without a
    /// vocabulary-sized output ignore it.
    fn apply_subdictionary(&mut self, _indices: &[usize]) -> Result<()> {
        Ok(())
    }

    /// Changes the decode cache capacity shared with the rest of the chain.
    fn set_cache_capacity(&mut self, _capacity: usize) {}

    /// The shared cache handle this layer takes part in, if any.
    fn cache_handle(&self) -> Option<&CacheHandle> {
        None
    }
}
