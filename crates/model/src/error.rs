use std::path::PathBuf;

use layers::LayerError;
use thiserror::Error;

/// Failures while loading a pipeline description or running the chain.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported configuration extension '{0}'")]
    ConfigFormat(String),
    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("weight store has no tensor named '{0}'")]
    MissingTensor(String),
    #[error("{module} changed the row count from {expected} to {actual}")]
    RowCount {
        module: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("{0} was built with a different cache handle than the pipeline")]
    ForeignCache(&'static str),
    #[error("{rows} tagged rows reached the end of the chain without a layer serving them")]
    UnservedTags { rows: usize },
    #[error(transparent)]
    Layer(#[from] LayerError),
    #[error(transparent)]
    Backend(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, ModelError>;
