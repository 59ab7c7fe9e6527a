use std::{collections::HashMap, path::Path};

use candle_core::{safetensors::load as load_safetensors, Device, Tensor};

use crate::error::{ModelError, Result};

/// Named parameters a pipeline is built from.
#[derive(Debug, Default, Clone)]
pub struct TensorStore {
    tensors: HashMap<String, Tensor>,
}

impl TensorStore {
    /// Loads every tensor of a safetensors file onto the CPU.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ModelError::Io {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "weights file not found"),
            });
        }
        let tensors = load_safetensors(path, &Device::Cpu)?;
        log::info!(
            "loaded {} tensors from {}",
            tensors.len(),
            path.display()
        );
        Ok(Self { tensors })
    }

    pub fn from_tensors(tensors: HashMap<String, Tensor>) -> Self {
        Self { tensors }
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn get(&self, name: &str) -> Result<&Tensor> {
        self.tensors
            .get(name)
            .ok_or_else(|| ModelError::MissingTensor(name.to_string()))
    }

    pub fn optional(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    /// Writes the store back out; used to produce fixtures.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        candle_core::safetensors::save(&self.tensors, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_names_are_reported() {
        let store = TensorStore::default();
        let err = store.get("generator.weight").unwrap_err();
        assert!(matches!(err, ModelError::MissingTensor(name) if name == "generator.weight"));
        assert!(store.optional("generator.bias").is_none());
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = TensorStore::load("/nonexistent/weights.safetensors").unwrap_err();
        assert!(matches!(err, ModelError::Io { .. }));
    }
}
