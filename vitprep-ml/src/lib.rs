//! # vitprep-ml
//!
//! The three preparation stages for deploying a vision transformer on a
//! fixed-point accelerator:
//!
//! 1. **Trace** (`trace`): load the pretrained model with eager attention
//!    and save a TorchScript trace.
//! 2. **Export** (`export`, `onnx`): export ONNX in a scratch directory and
//!    rebundle it into one structural file plus one external data file.
//! 3. **Calibrate** (`calibration`): turn dataset images into normalized raw
//!    tensors and the input list naming them.
//!
//! Tracing and export run PyTorch through a managed Python subprocess;
//! bundling, inspection and calibration are native.

// Foundation
pub mod artifact;
pub mod error;
pub mod runtime;

// Model formats
pub mod onnx;

// Stages
pub mod calibration;
pub mod export;
pub mod pipeline;
pub mod trace;

// Re-exports
pub use artifact::{ArtifactInfo, StagedFile};
pub use calibration::{CalibrationReport, CalibrationRunner, CalibrationSample, SkippedImage};
pub use error::PrepError;
pub use export::{ExportReport, OnnxExporter, ScratchDir};
pub use onnx::{ExternalDataBundler, ModelSummary, inspect_model};
pub use pipeline::{Pipeline, PipelineReport, Stage};
pub use runtime::PythonRuntime;
pub use trace::{TraceExporter, TraceReport};
