//! Repackaging of ONNX tensor payloads into a single external-data file.
//!
//! A large export arrives as a structural file plus one weight file per
//! tensor. The bundler resolves every external payload, then writes each
//! initializer of at least `size_threshold` bytes into one consolidated data
//! file, referenced from the structural file by a relative `location`.

use super::proto::{StringStringEntryProto, TensorProto, tensor_proto::DataLocation};
use super::{ModelProto, TensorRole, for_each_tensor_mut, load_model, save_model};
use crate::artifact::StagedFile;
use crate::error::PrepError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

/// Parsed `external_data` entries of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalDataInfo {
    /// Path relative to the directory of the structural file.
    pub location: String,
    pub offset: u64,
    /// Payload length; `None` means "to the end of the file".
    pub length: Option<u64>,
}

impl ExternalDataInfo {
    pub fn from_tensor(tensor: &TensorProto) -> Result<Self, PrepError> {
        let location = tensor.external_entry("location").ok_or_else(|| {
            PrepError::invalid_model(format!(
                "tensor '{}' is external but has no location",
                tensor.name()
            ))
        })?;
        let number = |key: &str| -> Result<Option<u64>, PrepError> {
            tensor
                .external_entry(key)
                .map(|v| {
                    v.trim().parse::<u64>().map_err(|e| {
                        PrepError::invalid_model(format!(
                            "tensor '{}' has invalid external {key} '{v}': {e}",
                            tensor.name()
                        ))
                    })
                })
                .transpose()
        };
        Ok(Self {
            location: location.to_string(),
            offset: number("offset")?.unwrap_or(0),
            length: number("length")?,
        })
    }

    /// Resolve `location` under `base`, refusing absolute paths and `..`.
    pub fn resolve(&self, base: &Path) -> Result<PathBuf, PrepError> {
        let relative = Path::new(&self.location);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes || self.location.is_empty() {
            return Err(PrepError::invalid_model(format!(
                "external data location '{}' must be a relative path inside the model directory",
                self.location
            )));
        }
        Ok(base.join(relative))
    }

    fn entries(&self) -> Vec<StringStringEntryProto> {
        let mut entries = vec![
            StringStringEntryProto::new("location", self.location.clone()),
            StringStringEntryProto::new("offset", self.offset.to_string()),
        ];
        if let Some(length) = self.length {
            entries.push(StringStringEntryProto::new("length", length.to_string()));
        }
        entries
    }
}

/// Counts from one bundling run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleStats {
    /// Tensors whose payload was read back from scattered external files.
    pub resolved: usize,
    /// Initializers written to the consolidated data file.
    pub externalized: usize,
    /// Tensors (initializers below the threshold and attribute tensors)
    /// stored inline in the structural file.
    pub inlined: usize,
    pub external_bytes: u64,
    pub inline_bytes: u64,
}

/// Open source files of a scattered export, keyed by location.
struct ExternalSources {
    base: PathBuf,
    files: HashMap<String, File>,
}

impl ExternalSources {
    fn new(base: PathBuf) -> Self {
        Self {
            base,
            files: HashMap::new(),
        }
    }

    fn read(&mut self, tensor: &TensorProto) -> Result<Vec<u8>, PrepError> {
        let info = ExternalDataInfo::from_tensor(tensor)?;
        if !self.files.contains_key(&info.location) {
            let path = info.resolve(&self.base)?;
            let file = File::open(&path).map_err(|e| {
                PrepError::invalid_model(format!(
                    "cannot open external data {} for tensor '{}': {e}",
                    path.display(),
                    tensor.name()
                ))
            })?;
            self.files.insert(info.location.clone(), file);
        }
        let file = self
            .files
            .get_mut(&info.location)
            .ok_or_else(|| PrepError::invalid_model(format!("lost handle for {}", info.location)))?;

        let file_len = file.metadata()?.len();
        let length = info
            .length
            .unwrap_or_else(|| file_len.saturating_sub(info.offset));
        if info.offset.checked_add(length).is_none_or(|end| end > file_len) {
            return Err(PrepError::invalid_model(format!(
                "tensor '{}' reads {}..+{} past the end of {} ({} bytes)",
                tensor.name(),
                info.offset,
                length,
                info.location,
                file_len
            )));
        }

        let mut buf = vec![0u8; usize::try_from(length).map_err(|_| {
            PrepError::invalid_model(format!("tensor '{}' is too large", tensor.name()))
        })?];
        file.seek(SeekFrom::Start(info.offset))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// Rewrites a model so its large initializers live in one external file.
#[derive(Debug, Clone)]
pub struct ExternalDataBundler {
    size_threshold: usize,
}

impl ExternalDataBundler {
    pub fn new(size_threshold: usize) -> Self {
        Self { size_threshold }
    }

    /// Bundle the model at `source` into `onnx_out` + `data_out`.
    ///
    /// Both outputs are staged and only renamed into place once both are
    /// complete; on error neither final path is created and earlier outputs
    /// are restored. The structural file is renamed last. The data file is
    /// always produced, empty when no initializer reaches the threshold.
    pub fn bundle(
        &self,
        source: &Path,
        onnx_out: &Path,
        data_out: &Path,
    ) -> Result<BundleStats, PrepError> {
        let mut model = load_model(source)?;
        let source_dir = source
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let location = relative_location(onnx_out, data_out)?;

        let onnx_stage = StagedFile::new(onnx_out)?;
        let data_stage = StagedFile::new(data_out)?;

        let stats = self.rewrite(
            &mut model,
            ExternalSources::new(source_dir),
            &location,
            data_stage.path(),
        )?;
        save_model(&model, onnx_stage.path())?;

        // The graph references the data file, so it goes last.
        StagedFile::commit_all([data_stage, onnx_stage])?;

        info!(
            externalized = stats.externalized,
            inlined = stats.inlined,
            external_bytes = stats.external_bytes,
            location = %location,
            "Bundled external tensor data"
        );
        Ok(stats)
    }

    /// Rewrite `model` in memory, streaming large payloads to `data_path`.
    fn rewrite(
        &self,
        model: &mut ModelProto,
        mut sources: ExternalSources,
        location: &str,
        data_path: &Path,
    ) -> Result<BundleStats, PrepError> {
        let mut data = BufWriter::new(File::create(data_path)?);
        let mut offset: u64 = 0;
        let mut stats = BundleStats::default();
        let threshold = self.size_threshold;

        for_each_tensor_mut(model, &mut |tensor, role| {
            if tensor.is_external() {
                let bytes = sources.read(tensor)?;
                debug!(tensor = tensor.name(), bytes = bytes.len(), "Resolved external payload");
                tensor.raw_data = Some(bytes);
                tensor.external_data.clear();
                tensor.data_location = None;
                stats.resolved += 1;
            }

            let Some(len) = tensor.raw_data.as_ref().map(Vec::len) else {
                // Typed payload fields (float_data, ...) stay inline.
                stats.inlined += 1;
                return Ok(());
            };

            if role == TensorRole::Initializer && len >= threshold {
                if let Some(bytes) = tensor.raw_data.take() {
                    data.write_all(&bytes)?;
                }
                let info = ExternalDataInfo {
                    location: location.to_string(),
                    offset,
                    length: Some(len as u64),
                };
                tensor.external_data = info.entries();
                tensor.data_location = Some(DataLocation::External as i32);
                offset += len as u64;
                stats.externalized += 1;
                stats.external_bytes += len as u64;
            } else {
                stats.inlined += 1;
                stats.inline_bytes += len as u64;
            }
            Ok(())
        })?;

        let file = data.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(stats)
    }
}

/// `data_out` relative to the directory of `onnx_out`, with `/` separators.
pub fn relative_location(onnx_out: &Path, data_out: &Path) -> Result<String, PrepError> {
    let onnx_dir = onnx_out.parent().unwrap_or(Path::new(""));
    let relative = data_out.strip_prefix(onnx_dir).map_err(|_| {
        PrepError::bundle(format!(
            "data file {} is not inside {}",
            data_out.display(),
            onnx_dir.display()
        ))
    })?;
    let parts = relative
        .components()
        .map(|c| match c {
            Component::Normal(part) => part.to_str().map(str::to_string),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()
        .filter(|parts| !parts.is_empty())
        .ok_or_else(|| {
            PrepError::bundle(format!(
                "data file {} has no usable relative location",
                data_out.display()
            ))
        })?;
    Ok(parts.join("/"))
}
