//! Command-line surface and its merge into [`RunConfig`].

use clap::{Args, Parser, Subcommand, ValueEnum};
use offload_backends::DeviceClass;
use offload_core::{BackendType, PolicyKind, RunConfig, VerifyMode};
use std::path::PathBuf;

/// Mismatches logged by `--full-scan`.
pub const FULL_SCAN_LOG_LIMIT: usize = 10;

#[derive(Debug, Parser)]
#[command(name = "offload")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run integer kernels on a compute device and verify them on the host", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Element-wise C = A + B with A = B = [0, 1, .., N-1]
    VecAdd {
        /// Number of elements
        #[arg(long, value_name = "N")]
        elements: Option<usize>,

        /// Kernel source defining `vec_add`
        #[arg(long, value_name = "PATH", default_value = "kernels/vec_add.cl")]
        kernel: PathBuf,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Naive C = A·B with seeded random inputs in 0..10
    MatMul {
        /// Rows of A and C
        #[arg(long, value_name = "R")]
        rows: Option<usize>,

        /// Columns of B and C
        #[arg(long, value_name = "C")]
        cols: Option<usize>,

        /// Columns of A, rows of B (defaults to --cols)
        #[arg(long, value_name = "K")]
        inner: Option<usize>,

        /// Seed for the input generator
        #[arg(long)]
        seed: Option<u64>,

        /// Kernel source defining `mat_mul`
        #[arg(long, value_name = "PATH", default_value = "kernels/mat_mul.cl")]
        kernel: PathBuf,

        #[command(flatten)]
        run: RunArgs,
    },

    /// List every platform and device the backend exposes
    Devices {
        /// Runtime to query
        #[arg(long, value_name = "BACKEND", default_value_t = BackendType::Host)]
        backend: BackendType,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

/// Device class accepted by `--device`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DeviceArg {
    Gpu,
    Cpu,
    Accelerator,
}

impl From<DeviceArg> for DeviceClass {
    fn from(arg: DeviceArg) -> Self {
        match arg {
            DeviceArg::Gpu => DeviceClass::Gpu,
            DeviceArg::Cpu => DeviceClass::Cpu,
            DeviceArg::Accelerator => DeviceClass::Accelerator,
        }
    }
}

/// Flags shared by the run subcommands. Each one overrides the config file.
#[derive(Debug, Default, Args)]
pub struct RunArgs {
    /// TOML run configuration
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Runtime: host or opencl
    #[arg(long, value_name = "BACKEND")]
    pub backend: Option<BackendType>,

    /// Device class to select; there is no fallback
    #[arg(long, value_enum)]
    pub device: Option<DeviceArg>,

    /// Local-size policy: fixed, divisor or auto
    #[arg(long, value_name = "POLICY")]
    pub policy: Option<PolicyKind>,

    /// Tile edge for the fixed and auto policies
    #[arg(long, value_name = "EDGE")]
    pub tile: Option<usize>,

    /// Compare every element instead of stopping at the first mismatch
    #[arg(long)]
    pub full_scan: bool,

    /// Extra dispatches, each checked against the first
    #[arg(long, value_name = "N")]
    pub repeat: Option<usize>,

    /// Options passed to the kernel compiler
    #[arg(long, value_name = "OPTIONS", allow_hyphen_values = true)]
    pub build_options: Option<String>,

    /// Print the run report as JSON
    #[arg(long)]
    pub json: bool,
}

impl RunArgs {
    /// Load the config file (or defaults) and apply the flags on top.
    pub fn load(&self) -> offload_core::Result<RunConfig> {
        let base = match &self.config {
            Some(path) => RunConfig::from_file(path)?,
            None => RunConfig::default(),
        };
        self.apply(base)
    }

    fn apply(&self, mut config: RunConfig) -> offload_core::Result<RunConfig> {
        if let Some(backend) = self.backend {
            config.backend = backend;
        }
        if let Some(device) = self.device {
            config.device_class = device.into();
        }
        if let Some(policy) = self.policy {
            config.policy = policy;
        }
        if self.tile.is_some() {
            config.tile = self.tile;
        }
        if self.full_scan {
            config.verify = VerifyMode::FullScan {
                log_limit: FULL_SCAN_LOG_LIMIT,
            };
        }
        if let Some(repeat) = self.repeat {
            config.repeat = repeat;
        }
        if let Some(options) = &self.build_options {
            config.build_options = options.clone();
        }
        config.validate()?;
        Ok(config)
    }
}
