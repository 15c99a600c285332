//! Stage B: export the traced graph to ONNX and bundle its weights into a
//! single external data file.

use crate::artifact::ArtifactInfo;
use crate::error::PrepError;
use crate::onnx::{BundleStats, ExternalDataBundler, TensorSignature, inspect_model};
use crate::runtime::{PythonRuntime, ScriptReply};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use vitprep_core::persistence::remove_if_exists;
use vitprep_core::{ExportConfig, ModelConfig};

const EXPORT_SCRIPT: &str = include_str!("../scripts/export_onnx.py");

/// File name of the scattered export inside the scratch directory.
pub const SCATTERED_MODEL: &str = "model.onnx";

/// A freshly created directory that is removed when dropped.
///
/// Any pre-existing directory at the path is wiped first, so leftovers from
/// an interrupted run never leak into the bundle.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    pub fn create(path: &Path) -> io::Result<Self> {
        match std::fs::remove_dir_all(path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
            _ => {}
        }
        std::fs::create_dir_all(path)?;
        debug!(path = %path.display(), "Created scratch directory");
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => info!(path = %self.path.display(), "Removed scratch directory"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to remove scratch directory")
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct ExportRequest<'a> {
    traced_path: &'a Path,
    onnx_path: &'a Path,
    input_shape: [usize; 4],
    input_name: &'a str,
    output_name: &'a str,
    opset_version: i64,
    constant_folding: bool,
    seed: u64,
}

#[derive(Debug, Deserialize)]
struct ExportReply {
    #[serde(default)]
    torch_version: String,
}

/// Outcome of a successful export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportReport {
    pub traced_path: PathBuf,
    pub onnx: ArtifactInfo,
    pub data: ArtifactInfo,
    pub stats: BundleStats,
    pub inputs: Vec<TensorSignature>,
    pub outputs: Vec<TensorSignature>,
    pub opset_version: i64,
    pub torch_version: String,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct OnnxExporter {
    runtime: PythonRuntime,
    model: ModelConfig,
    config: ExportConfig,
}

impl OnnxExporter {
    pub fn new(runtime: PythonRuntime, model: ModelConfig, config: ExportConfig) -> Self {
        Self {
            runtime,
            model,
            config,
        }
    }

    /// Run the export. The scratch directory is gone when this returns,
    /// whatever the outcome.
    pub async fn export(&self) -> Result<ExportReport, PrepError> {
        let traced_path = &self.config.traced_path;
        if !traced_path.is_file() {
            return Err(PrepError::model_load(format!(
                "traced graph {} not found (run `vitprep trace` first)",
                traced_path.display()
            )));
        }

        let scratch = ScratchDir::create(&self.config.scratch_dir)?;
        let scattered = scratch.path().join(SCATTERED_MODEL);
        let torch_version = self.export_scattered(&scattered).await?;

        info!(
            source = %scattered.display(),
            onnx = %self.config.onnx_path.display(),
            data = %self.config.data_path.display(),
            threshold = self.config.size_threshold,
            "Bundling external data"
        );
        let bundler = ExternalDataBundler::new(self.config.size_threshold);
        let onnx_path = self.config.onnx_path.clone();
        let data_path = self.config.data_path.clone();
        let stats = tokio::task::spawn_blocking(move || {
            bundler.bundle(&scattered, &onnx_path, &data_path)
        })
        .await
        .map_err(|e| PrepError::bundle(format!("bundling task failed: {e}")))?
        .map_err(|e| match e {
            PrepError::Bundle(_) => e,
            other => PrepError::bundle(other.to_string()),
        })?;

        let summary = match inspect_model(&self.config.onnx_path).and_then(|summary| {
            summary.check_io(&self.model.input_name, &self.model.output_name)?;
            Ok(summary)
        }) {
            Ok(summary) => summary,
            Err(e) => {
                remove_if_exists(&self.config.onnx_path)?;
                remove_if_exists(&self.config.data_path)?;
                return Err(e);
            }
        };
        drop(scratch);

        Ok(ExportReport {
            traced_path: traced_path.clone(),
            onnx: ArtifactInfo::from_path(&self.config.onnx_path)?,
            data: ArtifactInfo::from_path(&self.config.data_path)?,
            stats,
            inputs: summary.inputs,
            outputs: summary.outputs,
            opset_version: self.config.opset_version,
            torch_version,
            finished_at: Utc::now(),
        })
    }

    async fn export_scattered(&self, scattered: &Path) -> Result<String, PrepError> {
        let request = ExportRequest {
            traced_path: &self.config.traced_path,
            onnx_path: scattered,
            input_shape: self.model.input_shape.dims(),
            input_name: &self.model.input_name,
            output_name: &self.model.output_name,
            opset_version: self.config.opset_version,
            constant_folding: self.config.constant_folding,
            seed: rand::random(),
        };

        info!(
            traced = %self.config.traced_path.display(),
            opset = self.config.opset_version,
            "Exporting scattered ONNX model"
        );
        let reply = self
            .runtime
            .run_stage::<ExportReply>(EXPORT_SCRIPT, &serde_json::to_value(&request)?)
            .await
            .map_err(|e| match e {
                PrepError::Python(msg) => PrepError::export(msg),
                other => other,
            })?;

        match reply {
            ScriptReply::Ok(reply) if scattered.is_file() => Ok(reply.torch_version),
            ScriptReply::Ok(_) => Err(PrepError::export(format!(
                "export reported success but {} was not written",
                scattered.display()
            ))),
            ScriptReply::Error(failure) if failure.phase == "load" => {
                Err(PrepError::model_load(failure.message))
            }
            ScriptReply::Error(failure) => Err(PrepError::export(failure.message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onnx::inspect::tests::value_info;
    use crate::onnx::proto::{GraphProto, ModelProto, TensorProto};
    use crate::onnx::{Dim, save_model};
    use tempfile::TempDir;
    use vitprep_core::PythonConfig;

    #[test]
    fn test_scratch_dir_is_fresh_and_removed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("onnx_temp_export");
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("stale.bin"), b"old").unwrap();

        let scratch = ScratchDir::create(&path).unwrap();
        assert!(path.is_dir());
        assert!(!path.join("stale.bin").exists());
        std::fs::write(scratch.path().join("model.onnx"), b"x").unwrap();

        drop(scratch);
        assert!(!path.exists());
    }

    fn fixture_model(input: &str, outputs: &[&str]) -> ModelProto {
        let fixed = |d: &[i64]| d.iter().map(|v| Dim::Fixed(*v)).collect::<Vec<_>>();
        let output = outputs
            .iter()
            .map(|name| value_info(name, &fixed(&[1, 201, 1280])))
            .collect();
        ModelProto {
            ir_version: Some(8),
            graph: Some(GraphProto {
                name: Some("main_graph".into()),
                input: vec![value_info(input, &fixed(&[1, 3, 224, 224]))],
                output,
                initializer: vec![
                    TensorProto {
                        name: Some("blocks.0.attn.qkv.weight".into()),
                        dims: vec![512],
                        raw_data: Some(vec![1; 2048]),
                        ..Default::default()
                    },
                    TensorProto {
                        name: Some("cls_token".into()),
                        dims: vec![4],
                        raw_data: Some(vec![2; 16]),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// A stand-in interpreter that copies a prepared model into the scratch
    /// directory and replies like the export script.
    #[cfg(unix)]
    fn fake_runtime(dir: &Path, body: &str) -> PythonRuntime {
        use std::os::unix::fs::PermissionsExt;

        let fake = dir.join("fake-python");
        std::fs::write(&fake, format!("#!/bin/sh\ncat > /dev/null\n{body}\n")).unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();
        PythonRuntime::from_config(
            &PythonConfig {
                python_path: Some(fake),
                venv_path: None,
                timeout_secs: 30,
            },
            dir.to_path_buf(),
        )
    }

    fn export_config(dir: &Path) -> ExportConfig {
        let traced_path = dir.join("model.pt");
        std::fs::write(&traced_path, b"torchscript").unwrap();
        ExportConfig {
            traced_path,
            onnx_path: dir.join("vit.onnx"),
            data_path: dir.join("vit.onnx_data"),
            scratch_dir: dir.join("onnx_temp_export"),
            ..Default::default()
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_export_bundles_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let fixture = dir.path().join("fixture.onnx");
        save_model(&fixture_model("pixel_values", &["last_hidden_state"]), &fixture).unwrap();
        let config = export_config(dir.path());
        let body = format!(
            "cp '{}' '{}'\necho '{{\"status\":\"ok\",\"torch_version\":\"2.4.0\"}}'",
            fixture.display(),
            config.scratch_dir.join(SCATTERED_MODEL).display()
        );

        let exporter = OnnxExporter::new(
            fake_runtime(dir.path(), &body),
            ModelConfig::default(),
            config.clone(),
        );
        let report = exporter.export().await.unwrap();

        assert!(!config.scratch_dir.exists());
        assert_eq!(report.stats.externalized, 1);
        assert_eq!(report.stats.inlined, 1);
        assert_eq!(report.data.size_bytes, 2048);
        assert_eq!(report.inputs[0].name, "pixel_values");
        assert_eq!(report.outputs[0].name, "last_hidden_state");
        assert_eq!(report.torch_version, "2.4.0");
    }

    /// The default model returns `(last_hidden_state, pooler_output)`; the
    /// exporter names only the first output.
    #[cfg(unix)]
    #[tokio::test]
    async fn test_export_accepts_pooled_second_output() {
        let dir = TempDir::new().unwrap();
        let fixture = dir.path().join("fixture.onnx");
        save_model(
            &fixture_model("pixel_values", &["last_hidden_state", "4321"]),
            &fixture,
        )
        .unwrap();
        let config = export_config(dir.path());
        let body = format!(
            "cp '{}' '{}'\necho '{{\"status\":\"ok\"}}'",
            fixture.display(),
            config.scratch_dir.join(SCATTERED_MODEL).display()
        );

        let exporter = OnnxExporter::new(
            fake_runtime(dir.path(), &body),
            ModelConfig::default(),
            config.clone(),
        );
        let report = exporter.export().await.unwrap();

        assert!(config.onnx_path.is_file());
        assert!(config.data_path.is_file());
        assert!(!config.scratch_dir.exists());
        let names: Vec<&str> = report.outputs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["last_hidden_state", "4321"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_export_failure_removes_scratch() {
        let dir = TempDir::new().unwrap();
        let config = export_config(dir.path());
        let body = "echo '{\"status\":\"error\",\"phase\":\"export\",\"message\":\"unsupported op\"}'";

        let exporter = OnnxExporter::new(
            fake_runtime(dir.path(), body),
            ModelConfig::default(),
            config.clone(),
        );
        let err = exporter.export().await.unwrap_err();

        assert!(matches!(err, PrepError::Export(m) if m == "unsupported op"));
        assert!(!config.scratch_dir.exists());
        assert!(!config.onnx_path.exists());
        assert!(!config.data_path.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_export_rejects_wrong_input_name() {
        let dir = TempDir::new().unwrap();
        let fixture = dir.path().join("fixture.onnx");
        save_model(&fixture_model("input.1", &["last_hidden_state"]), &fixture).unwrap();
        let config = export_config(dir.path());
        let body = format!(
            "cp '{}' '{}'\necho '{{\"status\":\"ok\"}}'",
            fixture.display(),
            config.scratch_dir.join(SCATTERED_MODEL).display()
        );

        let exporter = OnnxExporter::new(
            fake_runtime(dir.path(), &body),
            ModelConfig::default(),
            config.clone(),
        );
        let err = exporter.export().await.unwrap_err();

        assert!(matches!(err, PrepError::InvalidModel(_)));
        assert!(!config.scratch_dir.exists());
        assert!(!config.onnx_path.exists());
        assert!(!config.data_path.exists());
    }

    #[tokio::test]
    async fn test_missing_traced_graph() {
        let dir = TempDir::new().unwrap();
        let config = ExportConfig {
            traced_path: dir.path().join("absent.pt"),
            scratch_dir: dir.path().join("scratch"),
            ..Default::default()
        };
        let exporter = OnnxExporter::new(
            PythonRuntime::from_config(&PythonConfig::default(), dir.path().to_path_buf()),
            ModelConfig::default(),
            config.clone(),
        );
        assert!(matches!(
            exporter.export().await,
            Err(PrepError::ModelLoad(_))
        ));
        assert!(!config.scratch_dir.exists());
    }
}
