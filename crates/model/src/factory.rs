//! Instantiates layers from [`LayerSpec`] entries.

use embedding::LookupTable;
use layers::{CacheHandle, Module, QuantLinear, QuantSigmoid};

use crate::{config::LayerSpec, error::Result, store::TensorStore};

/// Builds layers that all share one cache handle.
#[derive(Debug, Clone)]
pub struct ModuleFactory {
    cache: CacheHandle,
}

impl ModuleFactory {
    pub fn new(cache: CacheHandle) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &CacheHandle {
        &self.cache
    }

    pub fn build(&self, layer: &LayerSpec, store: &TensorStore) -> Result<Box<dyn Module>> {
        let module: Box<dyn Module> = match layer {
            LayerSpec::LookupTable { prefix } => {
                let weight = store.get(&format!("{}.weight", prefix))?.clone();
                Box::new(LookupTable::new(weight, self.cache.clone())?)
            }
            LayerSpec::QuantLinear { prefix } => {
                let weight = store.get(&format!("{}.weight", prefix))?.clone();
                let bias = store.optional(&format!("{}.bias", prefix)).cloned();
                Box::new(QuantLinear::from_parameters(
                    weight,
                    bias,
                    self.cache.clone(),
                )?)
            }
            LayerSpec::QuantSigmoid => Box::new(QuantSigmoid::new()),
        };
        log::debug!("built {} layer", module.name());
        Ok(module)
    }

    pub fn build_all(&self, entries: &[LayerSpec], store: &TensorStore) -> Result<Vec<Box<dyn Module>>> {
        entries.iter().map(|layer| self.build(layer, store)).collect()
    }
}
