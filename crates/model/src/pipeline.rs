use candle_core::Tensor;
use layers::{CacheHandle, Module, TaggedBatch};

use crate::{
    config::PipelineConfig,
    error::{ModelError, Result},
    factory::ModuleFactory,
    store::TensorStore,
};

/// An ordered chain of layers sharing one decode cache.
pub struct Pipeline {
    modules: Vec<Box<dyn Module>>,
    cache: CacheHandle,
}

impl Pipeline {
    /// Wraps already built layers. Every cache-capable layer must share `cache`.
    pub fn new(modules: Vec<Box<dyn Module>>, cache: CacheHandle) -> Result<Self> {
        for module in &modules {
            if let Some(handle) = module.cache_handle() {
                if !handle.same_as(&cache) {
                    return Err(ModelError::ForeignCache(module.name()));
                }
            }
        }
        Ok(Self { modules, cache })
    }

    /// Loads the weights named by `config` and builds its layer chain.
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        config.validate()?;
        let store = TensorStore::load(&config.weights)?;
        Self::from_store(config, &store)
    }

    /// Builds the chain described by `config` from an in-memory store.
    pub fn from_store(config: &PipelineConfig, store: &TensorStore) -> Result<Self> {
        config.validate()?;
        let factory = ModuleFactory::new(CacheHandle::new(config.cache_capacity));
        let modules = factory.build_all(&config.layers, store)?;
        log::info!(
            "pipeline ready: {} layers, cache_capacity={}",
            modules.len(),
            config.cache_capacity
        );
        Self::new(modules, factory.cache().clone())
    }

    pub fn cache(&self) -> &CacheHandle {
        &self.cache
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn layer_names(&self) -> Vec<&'static str> {
        self.modules.iter().map(|module| module.name()).collect()
    }

    /// Runs one decode step for `ids` and returns one output row per id.
    ///
    /// A failing layer leaves the chain's caches invalidated, so the next call
    /// starts from a clean state.
    pub fn forward(&mut self, ids: &Tensor) -> Result<Tensor> {
        let rows = ids.dims().first().copied().unwrap_or(0);
        let result = self.run(TaggedBatch::new(ids.clone()), rows);
        if let Err(err) = &result {
            log::warn!("pipeline step failed, invalidating decode cache: {}", err);
            self.cache.invalidate();
        }
        result.map(TaggedBatch::into_data)
    }

    fn run(&mut self, mut batch: TaggedBatch, rows: usize) -> Result<TaggedBatch> {
        for module in self.modules.iter_mut() {
            batch = module.forward(batch)?;
            if batch.rows() != rows {
                return Err(ModelError::RowCount {
                    module: module.name(),
                    expected: rows,
                    actual: batch.rows(),
                });
            }
        }
        // Rows flagged as cached carry no data; only a projection can fill them.
        if let Some(tags) = batch.tags() {
            return Err(ModelError::UnservedTags { rows: tags.len() });
        }
        Ok(batch)
    }

    /// Restricts every vocabulary-sized output to `indices`; empty clears the restriction.
    pub fn apply_subdictionary(&mut self, indices: &[usize]) -> Result<()> {
        for module in self.modules.iter_mut() {
            module.apply_subdictionary(indices)?;
        }
        Ok(())
    }

    pub fn set_cache_capacity(&mut self, capacity: usize) {
        self.cache.reconfigure(capacity);
    }
}
