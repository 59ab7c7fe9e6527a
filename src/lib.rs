//! Quantized decode-time inference layers with output caching.
//!
//! The workspace crates are re-exported here so downstream code can depend on
//! a single package.

pub use embedding;
pub use layers;
pub use model;

pub use embedding::LookupTable;
pub use layers::{
    CacheHandle, CacheStats, CacheTag, LayerError, Module, QuantLinear, QuantLinearConfig,
    QuantSigmoid, TaggedBatch,
};
pub use model::{LayerSpec, ModelError, ModuleFactory, Pipeline, PipelineConfig, TensorStore};

use std::path::Path;

use anyhow::{Context, Result};

/// Reads a pipeline description and builds it, weights included.
pub fn load_pipeline(path: impl AsRef<Path>) -> Result<Pipeline> {
    let path = path.as_ref();
    let config = PipelineConfig::from_path(path)
        .with_context(|| format!("loading pipeline config {}", path.display()))?;
    Pipeline::from_config(&config)
        .with_context(|| format!("building pipeline from {}", config.weights.display()))
}
