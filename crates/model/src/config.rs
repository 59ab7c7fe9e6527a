use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;

use crate::error::{ModelError, Result};

/// One entry of a layer chain description.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerSpec {
    /// Embedding table read from `<prefix>.weight`.
    LookupTable { prefix: String },
    /// Quantized projection read from `<prefix>.weight` and optional `<prefix>.bias`.
    QuantLinear { prefix: String },
    /// Table-driven sigmoid, no parameters.
    QuantSigmoid,
}

/// Declarative description of a decode pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Safetensors file holding every layer's parameters.
    pub weights: PathBuf,
    /// Vocab ids below this value are cached between decode steps; `0` disables caching.
    #[serde(default)]
    pub cache_capacity: usize,
    /// Layers in execution order.
    pub layers: Vec<LayerSpec>,
}

impl PipelineConfig {
    /// Reads a TOML or JSON description, resolving `weights` relative to the file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ModelError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: PipelineConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | None => toml::from_str(&contents)?,
            Some(other) => return Err(ModelError::ConfigFormat(other.to_string())),
        };

        if config.weights.is_relative() {
            let base = path.parent().unwrap_or_else(|| Path::new("."));
            config.weights = base.join(&config.weights);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.layers.is_empty() {
            errors.push("layers must not be empty".to_string());
        }
        if !matches!(self.layers.first(), Some(LayerSpec::LookupTable { .. })) {
            errors.push("the first layer must be a lookup_table".to_string());
        }
        for (index, layer) in self.layers.iter().enumerate() {
            match layer {
                LayerSpec::LookupTable { prefix } | LayerSpec::QuantLinear { prefix }
                    if prefix.is_empty() =>
                {
                    errors.push(format!("layers[{}].prefix must not be empty", index));
                }
                LayerSpec::LookupTable { .. } if index > 0 => {
                    errors.push(format!(
                        "layers[{}]: lookup_table is only valid as the first layer",
                        index
                    ));
                }
                _ => {}
            }
        }
        let has_projection = self
            .layers
            .iter()
            .skip(1)
            .any(|layer| matches!(layer, LayerSpec::QuantLinear { .. }));
        if self.cache_capacity > 0 && !has_projection {
            errors.push(format!(
                "cache_capacity {} needs a quant_linear layer after the lookup_table",
                self.cache_capacity
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ModelError::Validation(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_layers_use_tagged_entries() -> anyhow::Result<()> {
        let config: PipelineConfig = toml::from_str(
            r#"
            weights = "model.safetensors"
            cache_capacity = 32

            [[layers]]
            type = "lookup_table"
            prefix = "encoder.embeddings"

            [[layers]]
            type = "quant_sigmoid"

            [[layers]]
            type = "quant_linear"
            prefix = "generator"
            "#,
        )?;
        assert_eq!(config.cache_capacity, 32);
        assert_eq!(config.layers[1], LayerSpec::QuantSigmoid);
        assert_eq!(
            config.layers[2],
            LayerSpec::QuantLinear {
                prefix: "generator".into()
            }
        );
        config.validate()?;
        Ok(())
    }

    #[test]
    fn validation_collects_every_problem() -> anyhow::Result<()> {
        let config: PipelineConfig = serde_json::from_str(
            r#"{
                "weights": "w.safetensors",
                "layers": [
                    {"type": "quant_linear", "prefix": ""},
                    {"type": "lookup_table", "prefix": "emb"}
                ]
            }"#,
        )?;
        assert_eq!(config.cache_capacity, 0);
        match config.validate() {
            Err(ModelError::Validation(errors)) => assert_eq!(errors.len(), 3),
            other => panic!("expected validation errors, got {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn caching_requires_a_projection_after_the_lookup() -> anyhow::Result<()> {
        let mut config: PipelineConfig = toml::from_str(
            r#"
            weights = "w.safetensors"
            cache_capacity = 4

            [[layers]]
            type = "lookup_table"
            prefix = "emb"

            [[layers]]
            type = "quant_sigmoid"
            "#,
        )?;
        match config.validate() {
            Err(ModelError::Validation(errors)) => {
                assert_eq!(errors.len(), 1);
                assert!(errors[0].contains("quant_linear"));
            }
            other => panic!("expected validation errors, got {:?}", other),
        }

        config.cache_capacity = 0;
        config.validate()?;
        Ok(())
    }
}
