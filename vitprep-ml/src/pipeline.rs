//! Runs the stages in order.

use crate::calibration::{CalibrationReport, CalibrationRunner};
use crate::error::PrepError;
use crate::export::{ExportReport, OnnxExporter};
use crate::runtime::PythonRuntime;
use crate::trace::{TraceExporter, TraceReport};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::info;
use vitprep_core::PrepConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Trace,
    Export,
    Calibrate,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Trace, Stage::Export, Stage::Calibrate];
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Trace => write!(f, "trace"),
            Stage::Export => write!(f, "export"),
            Stage::Calibrate => write!(f, "calibrate"),
        }
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" | "a" => Ok(Stage::Trace),
            "export" | "b" => Ok(Stage::Export),
            "calibrate" | "c" => Ok(Stage::Calibrate),
            other => Err(format!(
                "unknown stage '{other}' (expected trace, export or calibrate)"
            )),
        }
    }
}

/// Reports of the stages that ran.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineReport {
    pub trace: Option<TraceReport>,
    pub export: Option<ExportReport>,
    pub calibration: Option<CalibrationReport>,
}

pub struct Pipeline {
    config: PrepConfig,
    runtime: PythonRuntime,
}

impl Pipeline {
    pub fn new(config: PrepConfig, runtime: PythonRuntime) -> Self {
        Self { config, runtime }
    }

    /// Run `stages` in trace, export, calibrate order, stopping at the first
    /// error. Duplicates are ignored.
    pub async fn run(&self, stages: &[Stage]) -> Result<PipelineReport, PrepError> {
        let mut ordered = stages.to_vec();
        ordered.sort();
        ordered.dedup();

        let mut report = PipelineReport::default();
        for stage in ordered {
            info!(%stage, "Starting stage");
            match stage {
                Stage::Trace => report.trace = Some(self.trace().await?),
                Stage::Export => report.export = Some(self.export().await?),
                Stage::Calibrate => report.calibration = Some(self.calibrate().await?),
            }
        }
        Ok(report)
    }

    pub async fn trace(&self) -> Result<TraceReport, PrepError> {
        TraceExporter::new(
            self.runtime.clone(),
            self.config.model.clone(),
            self.config.trace.clone(),
        )
        .export()
        .await
    }

    pub async fn export(&self) -> Result<ExportReport, PrepError> {
        OnnxExporter::new(
            self.runtime.clone(),
            self.config.model.clone(),
            self.config.export.clone(),
        )
        .export()
        .await
    }

    /// Stage C is CPU bound and runs on the blocking pool.
    pub async fn calibrate(&self) -> Result<CalibrationReport, PrepError> {
        let runner = CalibrationRunner::new(
            self.config.calibration.clone(),
            self.config.model.input_name.clone(),
        );
        tokio::task::spawn_blocking(move || runner.run())
            .await
            .map_err(|e| PrepError::Io(std::io::Error::other(e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    #[test]
    fn test_stage_parse_and_order() {
        assert_eq!("A".parse::<Stage>().unwrap(), Stage::Trace);
        assert_eq!("calibrate".parse::<Stage>().unwrap(), Stage::Calibrate);
        assert!("quantize".parse::<Stage>().is_err());
        let mut stages = vec![Stage::Calibrate, Stage::Trace, Stage::Export];
        stages.sort();
        assert_eq!(stages, Stage::ALL.to_vec());
    }

    #[tokio::test]
    async fn test_calibrate_only() {
        let dir = TempDir::new().unwrap();
        let mut config = PrepConfig::default();
        config.calibration.dataset_root = dir.path().join("dataset");
        config.calibration.output_dir = dir.path().join("calibration_data");
        config.calibration.manifest_path = dir.path().join("input_list.txt");
        config.calibration.input_size = "16".parse().unwrap();
        std::fs::create_dir_all(&config.calibration.dataset_root).unwrap();
        RgbImage::from_pixel(20, 10, Rgb([200, 100, 0]))
            .save(config.calibration.dataset_root.join("frame.jpg"))
            .unwrap();

        let runtime = PythonRuntime::from_config(&config.python, dir.path().to_path_buf());
        let report = Pipeline::new(config, runtime)
            .run(&[Stage::Calibrate, Stage::Calibrate])
            .await
            .unwrap();

        assert!(report.trace.is_none());
        assert!(report.export.is_none());
        assert_eq!(report.calibration.unwrap().written(), 1);
    }
}
