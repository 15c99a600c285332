//! Image to NCHW tensor conversion and raw tensor files.

use crate::artifact::StagedFile;
use crate::error::PrepError;
use image::RgbImage;
use image::imageops::{self, FilterType};
use ndarray::Array4;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use vitprep_core::{CalibrationConfig, ImageSize};

/// Per-channel normalization applied after scaling to `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Normalization {
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Normalization {
    pub const IMAGENET: Self = Self {
        mean: [0.485, 0.456, 0.406],
        std: [0.229, 0.224, 0.225],
    };

    pub fn from_config(config: &CalibrationConfig) -> Self {
        Self {
            mean: config.mean,
            std: config.std,
        }
    }

    #[inline]
    pub fn apply(&self, channel: usize, value: u8) -> f32 {
        (f32::from(value) / 255.0 - self.mean[channel]) / self.std[channel]
    }

    /// Smallest and largest value channel `c` can take.
    pub fn bounds(&self, channel: usize) -> (f32, f32) {
        (self.apply(channel, 0), self.apply(channel, 255))
    }
}

impl Default for Normalization {
    fn default() -> Self {
        Self::IMAGENET
    }
}

/// Decode `path`, convert to RGB and build a `(1, 3, H, W)` tensor.
pub fn preprocess_image(
    path: &Path,
    size: ImageSize,
    norm: &Normalization,
) -> Result<Array4<f32>, PrepError> {
    let img = image::open(path)
        .map_err(|e| PrepError::image(path, e.to_string()))?
        .to_rgb8();
    Ok(preprocess_rgb(&img, size, norm))
}

/// Bilinear-resize `img` to `size` and lay it out channel-first with a
/// leading batch axis.
pub fn preprocess_rgb(img: &RgbImage, size: ImageSize, norm: &Normalization) -> Array4<f32> {
    let resized = imageops::resize(img, size.width, size.height, FilterType::Triangle);
    Array4::from_shape_fn(
        (1, 3, size.height as usize, size.width as usize),
        |(_, c, y, x)| norm.apply(c, resized[(x as u32, y as u32)][c]),
    )
}

/// Write `tensor` as headerless little-endian f32 in row-major order.
///
/// The file appears under `path` only once fully written.
pub fn write_raw_tensor(tensor: &Array4<f32>, path: &Path) -> Result<(), PrepError> {
    let staged = StagedFile::new(path)?;
    let mut out = BufWriter::new(File::create(staged.path())?);
    for value in tensor.iter() {
        out.write_all(&value.to_le_bytes())?;
    }
    out.into_inner().map_err(|e| e.into_error())?.sync_all()?;
    staged.commit()?;
    Ok(())
}
