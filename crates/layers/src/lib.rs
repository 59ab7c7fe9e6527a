//! Building blocks for quantized decode-time inference.
//!
//! This crate hosts the fixed-point kernel, the quantized projection and
//! activation layers, and the cache-tag protocol that lets an upstream lookup
//! layer tell the projection which rows it may serve from its output cache.

use thiserror::Error;

pub mod batch;
pub mod cache;
pub mod checks;
pub mod inband;
pub mod module;
pub mod qlinear;
pub mod qsigmoid;
pub mod quant;

pub use batch::{CacheTag, TaggedBatch};
pub use cache::{CacheHandle, CacheStats, CacheTable};
pub use module::Module;
pub use qlinear::{QuantLinear, QuantLinearConfig};
pub use qsigmoid::QuantSigmoid;

/// Errors raised while constructing layers or running forward passes.
#[derive(Debug, Error)]
pub enum LayerError {
    /// Weight width is not a multiple of the SIMD lane count.
    #[error("{context}: width {width} is not a multiple of the vector width {lanes}")]
    UnalignedWidth {
        context: &'static str,
        width: usize,
        lanes: usize,
    },
    /// A layer-owned buffer could not be grown.
    #[error("cannot allocate {elements} elements for {context}")]
    Allocation {
        context: &'static str,
        elements: usize,
    },
    /// Tensor layout does not match what the layer expects.
    #[error("invalid shape for {context}: {details}")]
    Shape {
        context: &'static str,
        details: String,
    },
    /// A vocabulary id fell outside the embedding table.
    #[error("token id {id} outside vocabulary of size {vocab_size}")]
    InvalidId { id: i64, vocab_size: usize },
    /// A floating-point id that does not name a whole vocabulary row.
    #[error("token id {value} is not a whole number")]
    NonIntegerId { value: f64 },
    /// A subdictionary referenced an output row that does not exist.
    #[error("subdictionary index {index} exceeds output dimension {output_dim}")]
    InvalidSubdictionary { index: usize, output_dim: usize },
    /// An upstream layer claimed a row was cached but the projection has no entry.
    #[error("row {row} tagged as cached for vocab id {vocab_id} but no cached output exists")]
    CacheDesync { row: usize, vocab_id: usize },
    /// Failure bubbled up from the tensor backend.
    #[error(transparent)]
    Backend(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, LayerError>;
