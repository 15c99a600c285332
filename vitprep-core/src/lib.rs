//! # vitprep-core
//!
//! Shared foundation for the vitprep tool chain: layered configuration,
//! tensor/image shape types and the atomic-write helpers every stage uses
//! to publish its artifacts.

pub mod config;
pub mod error;
pub mod persistence;
pub mod shape;

// Re-export commonly used types at the crate root.
pub use config::{
    CalibrationConfig, DiscoveryOrder, ExportConfig, ModelConfig, PrepConfig, PythonConfig,
    TraceConfig, load_config,
};
pub use error::ConfigError;
pub use shape::{ImageSize, InputShape};
