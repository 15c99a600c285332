//! Python runtime manager for the tracing and export stages.
//!
//! Model loading, tracing and ONNX export live in PyTorch, so stages A and B
//! drive a managed Python subprocess. Each stage script reads one JSON
//! request on stdin and prints one JSON reply as its last stdout line.

use crate::error::PrepError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;
use vitprep_core::PythonConfig;

/// Information about the detected Python installation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PythonInfo {
    pub path: PathBuf,
    pub version: String,
    pub venv_path: Option<PathBuf>,
}

/// Reply printed by a stage script.
///
/// Scripts catch their own exceptions and report the phase that failed, so
/// a model that cannot be downloaded is told apart from one that cannot be
/// traced.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ScriptReply<T> {
    Ok(T),
    Error(ScriptFailure),
}

/// Failure details from a stage script.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScriptFailure {
    pub phase: String,
    pub message: String,
}

/// Managed Python subprocess runner.
#[derive(Debug, Clone)]
pub struct PythonRuntime {
    python_path: PathBuf,
    venv_path: Option<PathBuf>,
    workspace: PathBuf,
    timeout: Duration,
}

impl PythonRuntime {
    /// Create from the `[python]` configuration section.
    pub fn from_config(config: &PythonConfig, workspace: PathBuf) -> Self {
        Self {
            python_path: config
                .python_path
                .clone()
                .unwrap_or_else(|| PathBuf::from("python3")),
            venv_path: config.venv_path.clone(),
            workspace,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Detect available Python installation.
    pub async fn detect() -> Result<PythonInfo, PrepError> {
        for cmd in &["python3", "python"] {
            let output = Command::new(cmd).args(["--version"]).output().await;

            if let Ok(output) = output {
                if output.status.success() {
                    let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
                    let version = if version.is_empty() {
                        String::from_utf8_lossy(&output.stderr).trim().to_string()
                    } else {
                        version
                    };

                    return Ok(PythonInfo {
                        path: PathBuf::from(cmd),
                        version,
                        venv_path: detect_venv(),
                    });
                }
            }
        }

        Err(PrepError::Python(
            "Python not found. Install Python 3.9+ with torch and transformers.".to_string(),
        ))
    }

    /// Get the effective Python command (accounting for venv).
    pub fn python_cmd(&self) -> PathBuf {
        if let Some(venv) = &self.venv_path {
            let bin_dir = if cfg!(windows) { "Scripts" } else { "bin" };
            venv.join(bin_dir).join("python")
        } else {
            self.python_path.clone()
        }
    }

    /// Run a Python script with JSON input/output.
    ///
    /// `input` is written to the script's stdin; the last non-empty stdout
    /// line is parsed as the JSON result. A non-zero exit status is an error
    /// carrying the script's stderr.
    pub async fn run_script(
        &self,
        script: &str,
        input: &serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, PrepError> {
        let timeout = timeout.unwrap_or(self.timeout);
        let input_json = serde_json::to_vec(input)?;

        debug!(
            script_len = script.len(),
            python = %self.python_cmd().display(),
            "Running Python script"
        );

        let result = tokio::time::timeout(timeout, async {
            let mut child = Command::new(self.python_cmd())
                .args(["-c", script])
                .current_dir(&self.workspace)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| PrepError::Python(format!("Failed to spawn Python: {e}")))?;

            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(&input_json).await?;
                stdin.shutdown().await?;
            }

            let output = child.wait_with_output().await?;
            let stderr = String::from_utf8_lossy(&output.stderr);

            if !output.status.success() {
                return Err(PrepError::Python(format!(
                    "Python script failed (exit {}): {}",
                    output.status,
                    stderr.trim()
                )));
            }
            if !stderr.trim().is_empty() {
                debug!(stderr = %stderr.trim(), "Python script diagnostics");
            }

            parse_last_json_line(&String::from_utf8_lossy(&output.stdout))
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(PrepError::Timeout(format!(
                "Python script timed out after {}s",
                timeout.as_secs()
            ))),
        }
    }

    /// Run a stage script and decode its [`ScriptReply`].
    pub async fn run_stage<T: DeserializeOwned>(
        &self,
        script: &str,
        input: &serde_json::Value,
    ) -> Result<ScriptReply<T>, PrepError> {
        let value = self.run_script(script, input, None).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Check which packages are importable.
    pub async fn check_packages(&self, packages: &[&str]) -> BTreeMap<String, bool> {
        let mut results = BTreeMap::new();

        for pkg in packages {
            let script = format!("import importlib; importlib.import_module('{pkg}'); print('ok')");
            let available = Command::new(self.python_cmd())
                .args(["-c", &script])
                .output()
                .await
                .is_ok_and(|o| o.status.success());

            results.insert(pkg.to_string(), available);
        }

        results
    }
}

/// Parse the last non-empty line of `stdout` as JSON.
///
/// Libraries imported by the scripts occasionally print banners to stdout;
/// only the final line carries the reply.
pub fn parse_last_json_line(stdout: &str) -> Result<serde_json::Value, PrepError> {
    match stdout.lines().rev().map(str::trim).find(|l| !l.is_empty()) {
        None => Ok(serde_json::Value::Null),
        Some(line) => serde_json::from_str(line)
            .map_err(|e| PrepError::Python(format!("Invalid JSON output: {e}"))),
    }
}

/// Detect a virtual environment in common locations.
fn detect_venv() -> Option<PathBuf> {
    if let Ok(venv) = std::env::var("VIRTUAL_ENV") {
        let path = PathBuf::from(venv);
        if path.exists() {
            return Some(path);
        }
    }

    for name in &[".venv", "venv"] {
        let path = PathBuf::from(name);
        if path.exists() {
            return Some(path);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, PartialEq, Deserialize)]
    struct Saved {
        output_path: String,
    }

    #[tokio::test]
    async fn test_python_detect() {
        // Python may or may not be available in CI.
        let result = PythonRuntime::detect().await;
        if let Ok(info) = result {
            assert!(!info.version.is_empty());
        }
    }

    #[test]
    fn test_python_cmd_prefers_venv() {
        let config = PythonConfig {
            python_path: Some(PathBuf::from("/usr/bin/python3.11")),
            venv_path: Some(PathBuf::from("/opt/venv")),
            timeout_secs: 10,
        };
        let runtime = PythonRuntime::from_config(&config, PathBuf::from("."));
        let bin_dir = if cfg!(windows) { "Scripts" } else { "bin" };
        assert_eq!(
            runtime.python_cmd(),
            PathBuf::from("/opt/venv").join(bin_dir).join("python")
        );
        assert_eq!(runtime.timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_parse_last_json_line_skips_banners() {
        let stdout = "Loading checkpoint shards: 100%\n{\"status\":\"ok\",\"output_path\":\"m.pt\"}\n\n";
        let value = parse_last_json_line(stdout).unwrap();
        assert_eq!(value["output_path"], "m.pt");
        assert_eq!(parse_last_json_line("").unwrap(), serde_json::Value::Null);
        assert!(parse_last_json_line("not json").is_err());
    }

    #[test]
    fn test_script_reply_variants() {
        let ok: ScriptReply<Saved> =
            serde_json::from_value(json!({"status": "ok", "output_path": "m.pt"})).unwrap();
        assert_eq!(
            ok,
            ScriptReply::Ok(Saved {
                output_path: "m.pt".into()
            })
        );

        let err: ScriptReply<Saved> = serde_json::from_value(
            json!({"status": "error", "phase": "load", "message": "401 Unauthorized"}),
        )
        .unwrap();
        assert_eq!(
            err,
            ScriptReply::Error(ScriptFailure {
                phase: "load".into(),
                message: "401 Unauthorized".into()
            })
        );
    }

    #[tokio::test]
    async fn test_run_script_roundtrips_stdin() {
        let Ok(info) = PythonRuntime::detect().await else {
            return;
        };
        let config = PythonConfig {
            python_path: Some(info.path),
            venv_path: None,
            timeout_secs: 30,
        };
        let runtime = PythonRuntime::from_config(&config, std::env::temp_dir());
        let script = "import json, sys\nreq = json.load(sys.stdin)\nprint(json.dumps({'echo': req['value'] * 2}))";
        let value = runtime
            .run_script(script, &json!({"value": 21}), Some(Duration::from_secs(30)))
            .await
            .unwrap();
        assert_eq!(value["echo"], 42);
    }
}
