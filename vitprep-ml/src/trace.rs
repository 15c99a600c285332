//! Stage A: trace the pretrained model to a TorchScript archive.

use crate::artifact::{ArtifactInfo, StagedFile};
use crate::error::PrepError;
use crate::runtime::{PythonRuntime, ScriptFailure, ScriptReply};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use vitprep_core::{InputShape, ModelConfig, TraceConfig};

const TRACE_SCRIPT: &str = include_str!("../scripts/trace_model.py");

/// Attention implementation the model is loaded with. Fused kernels do not
/// survive tracing.
pub const ATTN_IMPLEMENTATION: &str = "eager";

#[derive(Debug, Serialize)]
struct TraceRequest<'a> {
    model_id: &'a str,
    trust_remote_code: bool,
    attn_implementation: &'static str,
    return_dict: bool,
    input_shape: [usize; 4],
    strict: bool,
    seed: u64,
    output_path: &'a Path,
}

#[derive(Debug, Deserialize)]
struct TraceReply {
    output_path: PathBuf,
    #[serde(default)]
    parameters: u64,
    #[serde(default)]
    torch_version: String,
}

/// Outcome of a successful trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceReport {
    pub model_id: String,
    pub input_shape: InputShape,
    /// Seed of the example input; pass it back through `trace.seed` to
    /// reproduce the trace.
    pub seed: u64,
    pub artifact: ArtifactInfo,
    pub parameters: u64,
    pub torch_version: String,
    pub finished_at: DateTime<Utc>,
}

/// Loads the model (eager attention, tuple outputs, eval mode), traces one
/// forward pass and saves the archive.
#[derive(Debug, Clone)]
pub struct TraceExporter {
    runtime: PythonRuntime,
    model: ModelConfig,
    config: TraceConfig,
}

impl TraceExporter {
    pub fn new(runtime: PythonRuntime, model: ModelConfig, config: TraceConfig) -> Self {
        Self {
            runtime,
            model,
            config,
        }
    }

    pub async fn export(&self) -> Result<TraceReport, PrepError> {
        let seed = self.config.seed.unwrap_or_else(rand::random);
        let staged = StagedFile::new(&self.config.output_path)?;
        let request = TraceRequest {
            model_id: &self.model.model_id,
            trust_remote_code: self.model.trust_remote_code,
            attn_implementation: ATTN_IMPLEMENTATION,
            return_dict: false,
            input_shape: self.model.input_shape.dims(),
            strict: self.config.strict,
            seed,
            output_path: staged.path(),
        };

        info!(
            model = %self.model.model_id,
            shape = %self.model.input_shape,
            seed,
            "Tracing model"
        );
        let reply: TraceReply = match self
            .runtime
            .run_stage::<TraceReply>(TRACE_SCRIPT, &serde_json::to_value(&request)?)
            .await?
        {
            ScriptReply::Ok(reply) => reply,
            ScriptReply::Error(failure) => {
                warn!(phase = %failure.phase, "Trace script failed");
                return Err(stage_error(failure));
            }
        };

        if reply.output_path != staged.path() || !staged.path().is_file() {
            return Err(PrepError::trace(format!(
                "trace reported success but {} was not written",
                staged.path().display()
            )));
        }
        let output = staged.commit()?;
        let artifact = ArtifactInfo::from_path(&output)?;
        info!(
            path = %artifact.path.display(),
            size_bytes = artifact.size_bytes,
            parameters = reply.parameters,
            "Traced model saved"
        );

        Ok(TraceReport {
            model_id: self.model.model_id.clone(),
            input_shape: self.model.input_shape,
            seed,
            artifact,
            parameters: reply.parameters,
            torch_version: reply.torch_version,
            finished_at: Utc::now(),
        })
    }
}

fn stage_error(failure: ScriptFailure) -> PrepError {
    match failure.phase.as_str() {
        "load" => PrepError::model_load(failure.message),
        _ => PrepError::trace(failure.message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use vitprep_core::PythonConfig;

    #[test]
    fn test_request_shape() {
        let model = ModelConfig::default();
        let request = TraceRequest {
            model_id: &model.model_id,
            trust_remote_code: true,
            attn_implementation: ATTN_IMPLEMENTATION,
            return_dict: false,
            input_shape: model.input_shape.dims(),
            strict: false,
            seed: 7,
            output_path: Path::new("out/model.pt.partial"),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["attn_implementation"], "eager");
        assert_eq!(value["return_dict"], false);
        assert_eq!(value["strict"], false);
        assert_eq!(value["input_shape"], serde_json::json!([1, 3, 224, 224]));
        assert_eq!(value["output_path"], "out/model.pt.partial");
    }

    #[test]
    fn test_failure_phase_mapping() {
        let load = stage_error(ScriptFailure {
            phase: "load".into(),
            message: "repo not found".into(),
        });
        assert!(matches!(load, PrepError::ModelLoad(m) if m == "repo not found"));

        let trace = stage_error(ScriptFailure {
            phase: "trace".into(),
            message: "data-dependent control flow".into(),
        });
        assert!(matches!(trace, PrepError::Trace(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_load_failure_leaves_no_artifact() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let fake = dir.path().join("fake-python");
        std::fs::write(
            &fake,
            "#!/bin/sh\ncat > /dev/null\necho '{\"status\":\"error\",\"phase\":\"load\",\"message\":\"offline\"}'\n",
        )
        .unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        let runtime = PythonRuntime::from_config(
            &PythonConfig {
                python_path: Some(fake),
                venv_path: None,
                timeout_secs: 30,
            },
            dir.path().to_path_buf(),
        );
        let output = dir.path().join("model.pt");
        let exporter = TraceExporter::new(
            runtime,
            ModelConfig::default(),
            TraceConfig {
                output_path: output.clone(),
                strict: false,
                seed: Some(1),
            },
        );

        let err = exporter.export().await.unwrap_err();
        assert!(matches!(err, PrepError::ModelLoad(m) if m == "offline"));
        assert!(!output.exists());
        assert!(!vitprep_core::persistence::staging_path(&output).exists());
    }
}
