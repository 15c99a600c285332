//! vitprep CLI: prepare a vision transformer for a fixed-point accelerator.
//!
//! Runs the trace, ONNX export and calibration stages individually or as a
//! pipeline.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};
use vitprep_core::{DiscoveryOrder, ImageSize};
use vitprep_ml::Stage;

/// vitprep: trace, export and calibrate vision transformers
#[derive(Parser, Debug)]
#[command(name = "vitprep", version, about, long_about = None)]
struct Cli {
    /// Workspace directory; relative paths in the configuration resolve here
    #[arg(short, long, default_value = ".", global = true)]
    workspace: PathBuf,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only print errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Stage A: trace the pretrained model to a TorchScript archive
    Trace {
        /// Seed for the example input (random when omitted)
        #[arg(long)]
        seed: Option<u64>,
        /// Output path of the traced graph
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Stage B: export ONNX and bundle weights into one data file
    Export {
        /// Minimum initializer size (bytes) stored in the data file
        #[arg(long)]
        threshold: Option<usize>,
        /// ONNX opset version
        #[arg(long)]
        opset: Option<i64>,
    },
    /// Stage C: build the calibration set and input list
    Calibrate(CalibrateArgs),
    /// Run stages in order (all of them by default)
    Run {
        /// Comma-separated subset: trace,export,calibrate
        #[arg(long, value_delimiter = ',')]
        stages: Vec<Stage>,
        #[command(flatten)]
        calibrate: CalibrateArgs,
    },
    /// Summarize an ONNX model and its external data
    Inspect {
        /// Structural ONNX file
        path: PathBuf,
        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check the Python environment and stage inputs
    Doctor,
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Args, Debug, Default)]
struct CalibrateArgs {
    /// Directory searched recursively for images
    #[arg(long)]
    dataset_root: Option<PathBuf>,
    /// Directory receiving calib_<i>.raw files
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// Number of images to convert
    #[arg(long, short = 'n')]
    num_samples: Option<usize>,
    /// Target size as WxH (or a single edge length); also sets the model
    /// input height and width
    #[arg(long)]
    size: Option<ImageSize>,
    /// Path of the input list
    #[arg(long)]
    manifest: Option<PathBuf>,
    /// Discovery order: sorted or filesystem
    #[arg(long)]
    order: Option<DiscoveryOrder>,
    /// Write a JSON report of written and skipped samples
    #[arg(long)]
    report: Option<PathBuf>,
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Create a default configuration file in the workspace
    Init,
    /// Show the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "vitprep", "vitprep")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "vitprep.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    commands::handle_command(cli.command, &workspace, cli.config.as_deref()).await
}
