//! Subcommand handlers.

use crate::{CalibrateArgs, Commands, ConfigAction};
use anyhow::Context;
use std::path::Path;
use vitprep_core::PrepConfig;
use vitprep_core::config::{WORKSPACE_CONFIG_DIR, load_config, workspace_config_path};
use vitprep_ml::onnx::ModelSummary;
use vitprep_ml::{
    CalibrationReport, ExportReport, Pipeline, PythonRuntime, Stage, TraceReport, inspect_model,
};

pub async fn handle_command(
    command: Commands,
    workspace: &Path,
    config_file: Option<&Path>,
) -> anyhow::Result<()> {
    match command {
        Commands::Trace { seed, output } => {
            let mut config = load(workspace, config_file)?;
            if seed.is_some() {
                config.trace.seed = seed;
            }
            if let Some(output) = output {
                config.trace.output_path = output.clone();
                config.export.traced_path = output;
            }
            let config = finish(config, workspace)?;
            let report = pipeline(config, workspace).trace().await?;
            print_trace(&report);
            Ok(())
        }
        Commands::Export { threshold, opset } => {
            let mut config = load(workspace, config_file)?;
            if let Some(threshold) = threshold {
                config.export.size_threshold = threshold;
            }
            if let Some(opset) = opset {
                config.export.opset_version = opset;
            }
            let config = finish(config, workspace)?;
            let report = pipeline(config, workspace).export().await?;
            print_export(&report);
            Ok(())
        }
        Commands::Calibrate(args) => {
            let mut config = load(workspace, config_file)?;
            apply_calibrate_args(&mut config, args);
            let config = finish(config, workspace)?;
            let report = pipeline(config, workspace).calibrate().await?;
            print_calibration(&report);
            require_samples(&report)
        }
        Commands::Run { stages, calibrate } => {
            let mut config = load(workspace, config_file)?;
            apply_calibrate_args(&mut config, calibrate);
            let config = finish(config, workspace)?;
            let stages = if stages.is_empty() {
                Stage::ALL.to_vec()
            } else {
                stages
            };
            let report = pipeline(config, workspace).run(&stages).await?;
            if let Some(trace) = &report.trace {
                print_trace(trace);
            }
            if let Some(export) = &report.export {
                print_export(export);
            }
            if let Some(calibration) = &report.calibration {
                print_calibration(calibration);
                require_samples(calibration)?;
            }
            Ok(())
        }
        Commands::Inspect { path, json } => {
            let path = if path.is_relative() {
                workspace.join(path)
            } else {
                path
            };
            let summary = inspect_model(&path)
                .with_context(|| format!("Failed to inspect {}", path.display()))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&path, &summary);
            }
            Ok(())
        }
        Commands::Doctor => handle_doctor(workspace, config_file).await,
        Commands::Config { action } => handle_config(action, workspace, config_file),
    }
}

fn load(workspace: &Path, config_file: Option<&Path>) -> anyhow::Result<PrepConfig> {
    load_config(Some(workspace), config_file)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))
}

/// Resolve relative paths against the workspace and validate.
fn finish(mut config: PrepConfig, workspace: &Path) -> anyhow::Result<PrepConfig> {
    config.resolve_paths(workspace);
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    Ok(config)
}

fn pipeline(config: PrepConfig, workspace: &Path) -> Pipeline {
    let runtime = PythonRuntime::from_config(&config.python, workspace.to_path_buf());
    Pipeline::new(config, runtime)
}

fn apply_calibrate_args(config: &mut PrepConfig, args: CalibrateArgs) {
    if let Some(size) = args.size {
        config.model.input_shape.height = size.height as usize;
        config.model.input_shape.width = size.width as usize;
    }
    let cal = &mut config.calibration;
    if let Some(root) = args.dataset_root {
        cal.dataset_root = root;
    }
    if let Some(dir) = args.output_dir {
        cal.output_dir = dir;
    }
    if let Some(n) = args.num_samples {
        cal.num_samples = n;
    }
    if let Some(size) = args.size {
        cal.input_size = size;
    }
    if let Some(manifest) = args.manifest {
        cal.manifest_path = manifest;
    }
    if let Some(order) = args.order {
        cal.order = order;
    }
    if args.report.is_some() {
        cal.report_path = args.report;
    }
}

/// Skipped images alone are not a failure, an empty calibration set is.
fn require_samples(report: &CalibrationReport) -> anyhow::Result<()> {
    if report.written() == 0 {
        anyhow::bail!(
            "No calibration samples were written ({} of {} selected images failed)",
            report.skipped(),
            report.selected
        );
    }
    Ok(())
}

fn print_trace(report: &TraceReport) {
    println!("Traced {} (seed {})", report.model_id, report.seed);
    println!(
        "  {}  {} bytes  sha256 {}",
        report.artifact.path.display(),
        report.artifact.size_bytes,
        report.artifact.sha256
    );
    if report.parameters > 0 {
        println!("  parameters: {}", report.parameters);
    }
}

fn print_export(report: &ExportReport) {
    println!(
        "Exported ONNX (opset {}) from {}",
        report.opset_version,
        report.traced_path.display()
    );
    for artifact in [&report.onnx, &report.data] {
        println!(
            "  {}  {} bytes  sha256 {}",
            artifact.path.display(),
            artifact.size_bytes,
            artifact.sha256
        );
    }
    println!(
        "  {} tensors external, {} inline",
        report.stats.externalized, report.stats.inlined
    );
    for sig in report.inputs.iter().chain(report.outputs.iter()) {
        println!("  {sig}");
    }
}

fn print_calibration(report: &CalibrationReport) {
    println!(
        "Generated {} calibration files ({} selected, {} skipped)",
        report.written(),
        report.selected,
        report.skipped()
    );
    for skipped in &report.skipped {
        println!(
            "  skipped #{} {}: {}",
            skipped.index,
            skipped.source.display(),
            skipped.reason
        );
    }
    println!("Input list saved to {}", report.manifest_path.display());
}

fn print_summary(path: &Path, summary: &ModelSummary) {
    println!("{}", path.display());
    println!("  ir_version: {}", summary.ir_version);
    println!("  producer:   {}", summary.producer);
    let opsets: Vec<String> = summary
        .opsets
        .iter()
        .map(|o| {
            let domain = if o.domain.is_empty() {
                "ai.onnx"
            } else {
                o.domain.as_str()
            };
            format!("{domain}={}", o.version)
        })
        .collect();
    println!("  opsets:     {}", opsets.join(", "));
    println!("  nodes:      {}", summary.node_count);
    for input in &summary.inputs {
        println!("  input  {input}");
    }
    for output in &summary.outputs {
        println!("  output {output}");
    }
    println!(
        "  initializers: {} ({} external, {} inline tensors)",
        summary.initializer_count, summary.external_tensors, summary.inline_tensors
    );
    for file in &summary.external_files {
        let size = file
            .file_size
            .map(|s| format!("{s} bytes"))
            .unwrap_or_else(|| "missing".to_string());
        println!(
            "  data {}: {} tensors, {} bytes referenced, file {}{}",
            file.location,
            file.tensors,
            file.referenced_bytes,
            size,
            if file.in_bounds { "" } else { " (OUT OF BOUNDS)" }
        );
    }
}

async fn handle_doctor(workspace: &Path, config_file: Option<&Path>) -> anyhow::Result<()> {
    let config = finish(load(workspace, config_file)?, workspace)?;
    let runtime = PythonRuntime::from_config(&config.python, workspace.to_path_buf());

    match PythonRuntime::detect().await {
        Ok(info) => println!("python:       {} ({})", info.version, info.path.display()),
        Err(e) => println!("python:       not found ({e})"),
    }
    println!("interpreter:  {}", runtime.python_cmd().display());
    for (package, available) in runtime.check_packages(&["torch", "transformers"]).await {
        println!(
            "{:<13} {}",
            format!("{package}:"),
            if available { "ok" } else { "missing" }
        );
    }

    let check = |label: &str, path: &Path| {
        println!(
            "{:<13} {} ({})",
            format!("{label}:"),
            path.display(),
            if path.exists() { "present" } else { "absent" }
        );
    };
    check("traced", &config.trace.output_path);
    check("onnx", &config.export.onnx_path);
    check("onnx_data", &config.export.data_path);
    check("dataset", &config.calibration.dataset_root);
    check("manifest", &config.calibration.manifest_path);
    Ok(())
}

fn handle_config(
    action: ConfigAction,
    workspace: &Path,
    config_file: Option<&Path>,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(WORKSPACE_CONFIG_DIR);
            std::fs::create_dir_all(&config_dir)?;

            let config_path = workspace_config_path(workspace);
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&PrepConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = load(workspace, config_file)?;
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}
