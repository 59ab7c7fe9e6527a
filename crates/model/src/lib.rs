//! Assembles quantized layers into decode pipelines.
//!
//! A pipeline is described by a [`PipelineConfig`] (TOML or JSON), its
//! parameters come from a safetensors file wrapped in a [`TensorStore`], and
//! the [`ModuleFactory`] wires every cache-capable layer to one shared
//! [`layers::CacheHandle`].

pub mod config;
pub mod error;
pub mod factory;
pub mod pipeline;
pub mod store;

pub use config::{LayerSpec, PipelineConfig};
pub use error::{ModelError, Result};
pub use factory::ModuleFactory;
pub use pipeline::Pipeline;
pub use store::TensorStore;
