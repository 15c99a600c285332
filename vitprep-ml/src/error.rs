//! Error types for the vitprep-ml crate.

use std::path::PathBuf;
use thiserror::Error;

/// Error returned by a stage or one of its building blocks.
///
/// Everything except [`PrepError::Image`] aborts the stage that raised it.
/// Image errors are sample-local: the calibration stage records them in its
/// report and moves on to the next file.
#[derive(Debug, Error)]
pub enum PrepError {
    #[error("Model load failed: {0}")]
    ModelLoad(String),

    #[error("Tracing failed: {0}")]
    Trace(String),

    #[error("ONNX export failed: {0}")]
    Export(String),

    #[error("Bundling failed: {0}")]
    Bundle(String),

    #[error("No .{extension} files found under {}", root.display())]
    NoImages { root: PathBuf, extension: String },

    #[error("Failed to process {}: {message}", path.display())]
    Image { path: PathBuf, message: String },

    #[error("Invalid model: {0}")]
    InvalidModel(String),

    #[error("Python runtime error: {0}")]
    Python(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(#[from] vitprep_core::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),
}

impl PrepError {
    pub fn model_load(msg: impl Into<String>) -> Self {
        Self::ModelLoad(msg.into())
    }

    pub fn trace(msg: impl Into<String>) -> Self {
        Self::Trace(msg.into())
    }

    pub fn export(msg: impl Into<String>) -> Self {
        Self::Export(msg.into())
    }

    pub fn bundle(msg: impl Into<String>) -> Self {
        Self::Bundle(msg.into())
    }

    pub fn invalid_model(msg: impl Into<String>) -> Self {
        Self::InvalidModel(msg.into())
    }

    pub fn image(path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        Self::Image {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Whether this error ends the stage (as opposed to skipping one sample).
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Image { .. })
    }
}
