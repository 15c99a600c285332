//! Stage C: calibration set preparation.
//!
//! Discovers dataset images, converts the first `num_samples` of them into
//! normalized NCHW float tensors stored as raw files, and writes the input
//! list that names each raw file for the quantizer. A file that fails to
//! decode or write is skipped and reported; its index stays unused, so
//! `calib_<i>.raw` always corresponds to the i-th selected image.

pub mod discover;
pub mod manifest;
pub mod preprocess;

pub use discover::discover_images;
pub use manifest::{render_manifest, write_manifest};
pub use preprocess::{Normalization, preprocess_image, preprocess_rgb, write_raw_tensor};

use crate::error::PrepError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use vitprep_core::CalibrationConfig;
use vitprep_core::persistence::{atomic_write_json, remove_if_exists};

/// File name of the raw tensor for the `index`-th selected image.
pub fn raw_file_name(index: usize) -> String {
    format!("calib_{index}.raw")
}

/// A sample written to disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationSample {
    pub index: usize,
    pub source: PathBuf,
    pub raw_path: PathBuf,
}

/// A selected image that could not be converted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedImage {
    pub index: usize,
    pub source: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationReport {
    pub dataset_root: PathBuf,
    /// Images matching the extension under the root.
    pub discovered: usize,
    /// Images taken from the discovered list.
    pub selected: usize,
    pub samples: Vec<CalibrationSample>,
    pub skipped: Vec<SkippedImage>,
    pub manifest_path: PathBuf,
    pub finished_at: DateTime<Utc>,
}

impl CalibrationReport {
    pub fn written(&self) -> usize {
        self.samples.len()
    }

    pub fn skipped(&self) -> usize {
        self.skipped.len()
    }
}

/// Runs stage C with a fixed configuration.
#[derive(Debug, Clone)]
pub struct CalibrationRunner {
    config: CalibrationConfig,
    input_name: String,
}

impl CalibrationRunner {
    /// `input_name` prefixes every manifest line and must match the graph
    /// input of the exported model.
    pub fn new(config: CalibrationConfig, input_name: impl Into<String>) -> Self {
        Self {
            config,
            input_name: input_name.into(),
        }
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    pub fn run(&self) -> Result<CalibrationReport, PrepError> {
        let config = &self.config;
        info!(root = %config.dataset_root.display(), "Searching for images");
        let images = discover_images(&config.dataset_root, &config.extension, config.order)?;
        let selected = &images[..images.len().min(config.num_samples)];
        info!(
            discovered = images.len(),
            selected = selected.len(),
            "Selected images for calibration"
        );

        std::fs::create_dir_all(&config.output_dir)?;
        let norm = Normalization::from_config(config);
        let mut samples = Vec::with_capacity(selected.len());
        let mut skipped = Vec::new();

        for (index, source) in selected.iter().enumerate() {
            let raw_path = config.output_dir.join(raw_file_name(index));
            match convert(source, &raw_path, config, &norm) {
                Ok(()) => {
                    debug!(index, source = %source.display(), "Wrote calibration sample");
                    samples.push(CalibrationSample {
                        index,
                        source: source.clone(),
                        raw_path,
                    });
                }
                Err(e) => {
                    warn!(index, source = %source.display(), error = %e, "Skipping image");
                    let mut reason = e.to_string();
                    // A file left by an earlier run would not be listed.
                    if let Err(rm) = remove_if_exists(&raw_path) {
                        warn!(
                            path = %raw_path.display(),
                            error = %rm,
                            "Failed to remove stale calibration file"
                        );
                        reason = format!("{reason}; stale {} not removed: {rm}", raw_path.display());
                    }
                    skipped.push(SkippedImage {
                        index,
                        source: source.clone(),
                        reason,
                    });
                }
            }
        }

        let raw_paths: Vec<PathBuf> = samples.iter().map(|s| s.raw_path.clone()).collect();
        write_manifest(&config.manifest_path, &self.input_name, &raw_paths)?;

        let report = CalibrationReport {
            dataset_root: config.dataset_root.clone(),
            discovered: images.len(),
            selected: selected.len(),
            samples,
            skipped,
            manifest_path: config.manifest_path.clone(),
            finished_at: Utc::now(),
        };
        if let Some(path) = &config.report_path {
            atomic_write_json(path, &report)?;
        }

        info!(
            written = report.written(),
            skipped = report.skipped(),
            manifest = %config.manifest_path.display(),
            "Generated calibration files"
        );
        Ok(report)
    }
}

fn convert(
    source: &Path,
    raw_path: &Path,
    config: &CalibrationConfig,
    norm: &Normalization,
) -> Result<(), PrepError> {
    let tensor = preprocess_image(source, config.input_size, norm)?;
    write_raw_tensor(&tensor, raw_path)
}
