//! Configuration system for vitprep.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! workspace config file -> explicit config file -> environment -> CLI flags.
//! Every value the original tool chain hardcoded (model identifier, artifact
//! names, sample count, thresholds) lives here with its default.

use crate::error::ConfigError;
use crate::shape::{ImageSize, InputShape};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

/// Directory (relative to the workspace) holding the workspace config file.
pub const WORKSPACE_CONFIG_DIR: &str = ".vitprep";

/// Top-level configuration for all three stages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrepConfig {
    /// Model identity and I/O naming shared by every stage.
    #[serde(default)]
    pub model: ModelConfig,
    /// Python runtime used to drive tracing and export.
    #[serde(default)]
    pub python: PythonConfig,
    /// Stage A settings.
    #[serde(default)]
    pub trace: TraceConfig,
    /// Stage B settings.
    #[serde(default)]
    pub export: ExportConfig,
    /// Stage C settings.
    #[serde(default)]
    pub calibration: CalibrationConfig,
}

/// Model identity and the tensor names the downstream toolchain expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Registry identifier of the pretrained model.
    #[serde(default = "default_model_id")]
    pub model_id: String,
    /// Allow the registry to execute model-provided code.
    #[serde(default = "default_true")]
    pub trust_remote_code: bool,
    /// Name of the single graph input.
    #[serde(default = "default_input_name")]
    pub input_name: String,
    /// Name of the single graph output.
    #[serde(default = "default_output_name")]
    pub output_name: String,
    /// Shape of the synthetic input used for tracing and export.
    #[serde(default)]
    pub input_shape: InputShape,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_id: default_model_id(),
            trust_remote_code: true,
            input_name: default_input_name(),
            output_name: default_output_name(),
            input_shape: InputShape::default(),
        }
    }
}

fn default_model_id() -> String {
    "facebook/dinov3-vith16plus-pretrain-lvd1689m".to_string()
}

fn default_input_name() -> String {
    "pixel_values".to_string()
}

fn default_output_name() -> String {
    "last_hidden_state".to_string()
}

fn default_true() -> bool {
    true
}

/// Python runtime configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PythonConfig {
    /// Path to Python executable (defaults to `python3`).
    #[serde(default)]
    pub python_path: Option<PathBuf>,
    /// Path to a virtual environment; takes precedence over `python_path`.
    #[serde(default)]
    pub venv_path: Option<PathBuf>,
    /// Timeout for a single stage script (seconds).
    #[serde(default = "default_python_timeout")]
    pub timeout_secs: u64,
}

impl Default for PythonConfig {
    fn default() -> Self {
        Self {
            python_path: None,
            venv_path: None,
            timeout_secs: default_python_timeout(),
        }
    }
}

fn default_python_timeout() -> u64 {
    3600
}

/// Stage A: trace export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceConfig {
    /// Where the traced graph is written.
    #[serde(default = "default_traced_path")]
    pub output_path: PathBuf,
    /// Strict graph-consistency checking in the tracer. Off by default:
    /// the source model produces dynamic-shape artifacts strict mode rejects.
    #[serde(default)]
    pub strict: bool,
    /// Seed for the synthetic input. A random seed is drawn when unset.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            output_path: default_traced_path(),
            strict: false,
            seed: None,
        }
    }
}

fn default_traced_path() -> PathBuf {
    PathBuf::from("dinov3_vith16plus_eager.pt")
}

/// Stage B: interchange conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Traced graph produced by stage A.
    #[serde(default = "default_traced_path")]
    pub traced_path: PathBuf,
    /// Structural ONNX file.
    #[serde(default = "default_onnx_path")]
    pub onnx_path: PathBuf,
    /// Consolidated weight-data file. Must live in (or below) the directory
    /// of `onnx_path`; the structural file references it relatively.
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,
    /// Scratch directory for the scattered export. Wiped before use and
    /// removed afterwards.
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
    #[serde(default = "default_opset")]
    pub opset_version: i64,
    #[serde(default = "default_true")]
    pub constant_folding: bool,
    /// Initializers with at least this many payload bytes go to `data_path`.
    #[serde(default = "default_size_threshold")]
    pub size_threshold: usize,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            traced_path: default_traced_path(),
            onnx_path: default_onnx_path(),
            data_path: default_data_path(),
            scratch_dir: default_scratch_dir(),
            opset_version: default_opset(),
            constant_folding: true,
            size_threshold: default_size_threshold(),
        }
    }
}

fn default_onnx_path() -> PathBuf {
    PathBuf::from("dinov3_vith16plus_eager.onnx")
}

fn default_data_path() -> PathBuf {
    PathBuf::from("dinov3_vith16plus_eager.onnx_data")
}

fn default_scratch_dir() -> PathBuf {
    PathBuf::from("onnx_temp_export")
}

fn default_opset() -> i64 {
    18
}

fn default_size_threshold() -> usize {
    1024
}

/// Order in which discovered calibration images are considered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryOrder {
    /// Lexicographic path order, reproducible across platforms.
    #[default]
    Sorted,
    /// Whatever order the filesystem returns directory entries in.
    Filesystem,
}

impl FromStr for DiscoveryOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sorted" => Ok(Self::Sorted),
            "filesystem" | "fs" => Ok(Self::Filesystem),
            other => Err(format!(
                "unknown discovery order '{other}' (expected 'sorted' or 'filesystem')"
            )),
        }
    }
}

impl fmt::Display for DiscoveryOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sorted => write!(f, "sorted"),
            Self::Filesystem => write!(f, "filesystem"),
        }
    }
}

/// Stage C: calibration set preparation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Directory tree searched for images.
    #[serde(default = "default_dataset_root")]
    pub dataset_root: PathBuf,
    /// Directory receiving `calib_<i>.raw` files.
    #[serde(default = "default_calibration_dir")]
    pub output_dir: PathBuf,
    /// Manifest listing `<input_name>:=<absolute path>` per sample.
    #[serde(default = "default_manifest_path")]
    pub manifest_path: PathBuf,
    #[serde(default = "default_num_samples")]
    pub num_samples: usize,
    #[serde(default)]
    pub input_size: ImageSize,
    /// File extension matched case-sensitively, without the dot.
    #[serde(default = "default_extension")]
    pub extension: String,
    #[serde(default)]
    pub order: DiscoveryOrder,
    /// Per-channel RGB mean (ImageNet).
    #[serde(default = "default_mean")]
    pub mean: [f32; 3],
    /// Per-channel RGB standard deviation (ImageNet).
    #[serde(default = "default_std")]
    pub std: [f32; 3],
    /// Optional JSON report of written and skipped samples.
    #[serde(default)]
    pub report_path: Option<PathBuf>,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            dataset_root: default_dataset_root(),
            output_dir: default_calibration_dir(),
            manifest_path: default_manifest_path(),
            num_samples: default_num_samples(),
            input_size: ImageSize::default(),
            extension: default_extension(),
            order: DiscoveryOrder::default(),
            mean: default_mean(),
            std: default_std(),
            report_path: None,
        }
    }
}

fn default_dataset_root() -> PathBuf {
    PathBuf::from("42dot_dataset")
}

fn default_calibration_dir() -> PathBuf {
    PathBuf::from("calibration_data")
}

fn default_manifest_path() -> PathBuf {
    PathBuf::from("input_list.txt")
}

fn default_num_samples() -> usize {
    50
}

fn default_extension() -> String {
    "jpg".to_string()
}

fn default_mean() -> [f32; 3] {
    [0.485, 0.456, 0.406]
}

fn default_std() -> [f32; 3] {
    [0.229, 0.224, 0.225]
}

impl PrepConfig {
    /// Resolve every relative path against `workspace`.
    pub fn resolve_paths(&mut self, workspace: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = workspace.join(&*p);
            }
        };
        resolve(&mut self.trace.output_path);
        resolve(&mut self.export.traced_path);
        resolve(&mut self.export.onnx_path);
        resolve(&mut self.export.data_path);
        resolve(&mut self.export.scratch_dir);
        resolve(&mut self.calibration.dataset_root);
        resolve(&mut self.calibration.output_dir);
        resolve(&mut self.calibration.manifest_path);
        if let Some(report) = self.calibration.report_path.as_mut() {
            resolve(report);
        }
    }

    /// Reject values no stage can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.model_id.trim().is_empty() {
            return Err(ConfigError::invalid("model.model_id", "must not be empty"));
        }
        if self.model.input_name.is_empty() || self.model.output_name.is_empty() {
            return Err(ConfigError::invalid(
                "model.input_name",
                "input and output names must not be empty",
            ));
        }
        if self.model.input_shape.is_degenerate() {
            return Err(ConfigError::invalid(
                "model.input_shape",
                format!("{} has a zero dimension", self.model.input_shape),
            ));
        }
        if self.model.input_shape.channels != 3 {
            return Err(ConfigError::invalid(
                "model.input_shape",
                format!("{} must have 3 (RGB) channels", self.model.input_shape),
            ));
        }
        if self.export.opset_version <= 0 {
            return Err(ConfigError::invalid(
                "export.opset_version",
                "must be positive",
            ));
        }
        if self.export.data_path.file_name().is_none() {
            return Err(ConfigError::invalid(
                "export.data_path",
                "must name a file",
            ));
        }
        let onnx_dir = self.export.onnx_path.parent().unwrap_or(Path::new(""));
        if self.export.data_path.strip_prefix(onnx_dir).is_err() {
            return Err(ConfigError::invalid(
                "export.data_path",
                format!(
                    "{} must live under the directory of {}",
                    self.export.data_path.display(),
                    self.export.onnx_path.display()
                ),
            ));
        }
        self.validate_scratch_dir()?;

        let cal = &self.calibration;
        if cal.num_samples == 0 {
            return Err(ConfigError::invalid(
                "calibration.num_samples",
                "must be at least 1",
            ));
        }
        if cal.input_size.width == 0 || cal.input_size.height == 0 {
            return Err(ConfigError::invalid(
                "calibration.input_size",
                format!("{} has a zero edge", cal.input_size),
            ));
        }
        let shape = &self.model.input_shape;
        if cal.input_size.width as usize != shape.width
            || cal.input_size.height as usize != shape.height
        {
            return Err(ConfigError::invalid(
                "calibration.input_size",
                format!(
                    "{} does not match the {}x{} spatial size of model.input_shape {}",
                    cal.input_size, shape.width, shape.height, shape
                ),
            ));
        }
        if cal.extension.is_empty() || cal.extension.starts_with('.') {
            return Err(ConfigError::invalid(
                "calibration.extension",
                "must be a bare extension such as 'jpg'",
            ));
        }
        if cal.std.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(ConfigError::invalid(
                "calibration.std",
                "every channel must be finite and positive",
            ));
        }
        if cal.mean.iter().any(|m| !m.is_finite()) {
            return Err(ConfigError::invalid(
                "calibration.mean",
                "every channel must be finite",
            ));
        }
        Ok(())
    }

    /// The scratch directory is wiped before and after export, so it must
    /// not be, or contain, any other configured path.
    fn validate_scratch_dir(&self) -> Result<(), ConfigError> {
        let scratch = lexical(&self.export.scratch_dir);
        if scratch.file_name().is_none() {
            return Err(ConfigError::invalid(
                "export.scratch_dir",
                format!(
                    "{} must name a dedicated directory",
                    self.export.scratch_dir.display()
                ),
            ));
        }
        let cal = &self.calibration;
        let configured = [
            &self.trace.output_path,
            &self.export.traced_path,
            &self.export.onnx_path,
            &self.export.data_path,
            &cal.dataset_root,
            &cal.output_dir,
            &cal.manifest_path,
        ];
        let clash = configured
            .into_iter()
            .chain(cal.report_path.as_ref())
            .find(|p| lexical(p).starts_with(&scratch));
        if let Some(path) = clash {
            return Err(ConfigError::invalid(
                "export.scratch_dir",
                format!(
                    "{} would be removed with the scratch directory {}",
                    path.display(),
                    self.export.scratch_dir.display()
                ),
            ));
        }
        Ok(())
    }
}

/// Fold `.` and `..` components without touching the filesystem.
fn lexical(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => out.push(component),
            },
            other => out.push(other),
        }
    }
    out
}

/// Path of the user-level config file, if a home directory is known.
pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "vitprep", "vitprep")
        .map(|d| d.config_dir().join("config.toml"))
}

/// Path of the workspace-level config file.
pub fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(WORKSPACE_CONFIG_DIR).join("config.toml")
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Environment variables (prefixed with `VITPREP_`, `__` between sections)
/// 2. Explicit config file (`--config`)
/// 3. Workspace-local config (`.vitprep/config.toml`)
/// 4. User config (`~/.config/vitprep/config.toml`)
/// 5. Built-in defaults
///
/// CLI flags are applied by the caller on the returned value.
pub fn load_config(
    workspace: Option<&Path>,
    config_file: Option<&Path>,
) -> Result<PrepConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(PrepConfig::default()));

    if let Some(user_config) = user_config_path() {
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = workspace_config_path(ws);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    if let Some(file) = config_file {
        figment = figment.merge(Toml::file(file));
    }

    // VITPREP_CALIBRATION__NUM_SAMPLES, VITPREP_EXPORT__SIZE_THRESHOLD, ...
    figment = figment.merge(Env::prefixed("VITPREP_").split("__"));

    let config: PrepConfig = figment.extract().map_err(Box::new)?;
    tracing::debug!(model = %config.model.model_id, "Configuration loaded");
    Ok(config)
}
