//! Subcommand implementations and exit-code mapping.

use crate::cli::RunArgs;
use anyhow::Context;
use offload_backends::{DeviceInfo, PlatformInfo};
use offload_core::{create_backend, probe_devices, BackendType, Error, Problem, RunConfig, RunReport};
use std::fmt::Write as _;
use std::path::Path;

/// Process exit status for each outcome class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Verified = 0,
    BuildFailed = 1,
    Mismatch = 2,
    Environment = 3,
    Other = 4,
}

impl Status {
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Classify an error that ended a command.
    pub fn of_error(err: &anyhow::Error) -> Self {
        match err.downcast_ref::<Error>() {
            Some(Error::Build { .. }) => Status::BuildFailed,
            Some(Error::VerificationMismatch { .. }) => Status::Mismatch,
            Some(e) if e.is_environment() => Status::Environment,
            _ => Status::Other,
        }
    }
}

/// Read a kernel source file in full.
pub fn read_kernel(path: &Path) -> offload_core::Result<String> {
    std::fs::read_to_string(path).map_err(|source| Error::KernelSource {
        path: path.to_path_buf(),
        source,
    })
}

/// Which problem a run subcommand asked for, with its own flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProblemArgs {
    VecAdd {
        elements: Option<usize>,
    },
    MatMul {
        rows: Option<usize>,
        cols: Option<usize>,
        inner: Option<usize>,
        seed: Option<u64>,
    },
}

impl ProblemArgs {
    /// Apply the problem flags to `config` and build the problem it describes.
    pub fn resolve(self, config: &mut RunConfig) -> offload_core::Result<Problem> {
        match self {
            ProblemArgs::VecAdd { elements } => {
                if let Some(n) = elements {
                    config.vec_add.elements = n;
                }
                config.validate()?;
                Ok(config.vector_add()?.into())
            }
            ProblemArgs::MatMul {
                rows,
                cols,
                inner,
                seed,
            } => {
                let m = &mut config.mat_mul;
                if let Some(rows) = rows {
                    m.rows = rows;
                }
                if let Some(cols) = cols {
                    m.cols = cols;
                }
                if inner.is_some() {
                    m.inner = inner;
                }
                if let Some(seed) = seed {
                    m.seed = seed;
                }
                config.validate()?;
                Ok(config.matrix_multiply()?.into())
            }
        }
    }
}

/// Run one problem and print its report to stdout.
///
/// A verification mismatch is returned as [`Status::Mismatch`] after the
/// report is printed, not as an error.
pub fn run_problem(problem: ProblemArgs, kernel: &Path, args: &RunArgs) -> anyhow::Result<Status> {
    let report = execute(problem, kernel, args)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", render_report(&report));
    }
    Ok(if report.passed() {
        Status::Verified
    } else {
        Status::Mismatch
    })
}

fn execute(problem: ProblemArgs, kernel: &Path, args: &RunArgs) -> anyhow::Result<RunReport> {
    let mut config = args.load()?;
    let problem = problem.resolve(&mut config)?;
    let source = read_kernel(kernel)?;
    tracing::info!(
        problem = problem.name(),
        kernel = %kernel.display(),
        backend = %config.backend,
        "run_started"
    );

    let backend = create_backend(config.backend)?;
    let report = offload_core::run(&backend, &config, &problem, &source)?;
    if !report.build_log.trim().is_empty() {
        eprintln!("{}", report.build_log.trim_end());
    }
    Ok(report)
}

/// List every platform and device of `backend`.
pub fn list_devices(backend: BackendType, json: bool) -> anyhow::Result<Status> {
    let shared = create_backend(backend)?;
    let probed = probe_devices(shared.read().as_ref())?;
    if json {
        let listing: Vec<_> = probed
            .iter()
            .map(|(platform, devices)| serde_json::json!({ "platform": platform, "devices": devices }))
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&listing).context("serializing device listing")?
        );
    } else {
        print!("{}", render_devices(&probed));
    }
    Ok(Status::Verified)
}

// ============================================================================
// Text rendering
// ============================================================================

pub fn render_report(report: &RunReport) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} on {} ({}) via {}",
        report.problem, report.device, report.platform, report.backend
    );
    let _ = writeln!(out, "  kernel    {}", report.kernel);
    if report.emulated {
        let _ = writeln!(
            out,
            "  emulated  kernel body not executed; only the host orchestration is verified"
        );
    }
    let _ = writeln!(out, "  work      {}", report.work);
    let _ = writeln!(out, "  build     {} us", report.timings.build_us);
    let _ = writeln!(out, "  dispatch  {} us", report.timings.dispatch_us);
    let _ = writeln!(out, "  reference {} us", report.timings.reference_us);
    if report.repeats > 0 {
        let _ = writeln!(out, "  repeats   {} identical", report.repeats);
    }

    let v = &report.verification;
    match v.first_mismatch {
        None => {
            let _ = writeln!(out, "PASSED: {} elements match the host reference", v.checked);
        }
        Some(m) => {
            let _ = writeln!(
                out,
                "FAILED: {} mismatch(es), first at index {} (expected {}, got {})",
                v.mismatches,
                m.index,
                show(m.expected),
                show(m.actual)
            );
        }
    }
    out
}

fn show(value: Option<i32>) -> String {
    value.map_or_else(|| "nothing".to_string(), |v| v.to_string())
}

pub fn render_devices(probed: &[(PlatformInfo, Vec<DeviceInfo>)]) -> String {
    let mut out = String::new();
    for (platform, devices) in probed {
        let _ = writeln!(out, "{} [{}] {}", platform.id, platform.version, platform.name);
        if devices.is_empty() {
            let _ = writeln!(out, "  (no devices)");
        }
        for device in devices {
            let _ = writeln!(
                out,
                "  {} {:<11} {}  group<={} items<={:?}  mem={} MiB",
                device.id,
                device.class.as_str(),
                device.name,
                device.limits.max_work_group_size,
                device.limits.max_work_item_sizes,
                device.global_mem_size / (1024 * 1024)
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use offload_backends::{HostBackend, WorkSpec};
    use offload_core::{share, verify, TilePolicy, Timings, VerifyMode};
    use std::io::Write;

    const VEC_ADD: &str = include_str!("../../../kernels/vec_add.cl");

    fn kernel_file(source: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(source.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_status_codes() {
        let build = anyhow::Error::from(Error::Build { log: "x".into() });
        assert_eq!(Status::of_error(&build).code(), 1);
        let mismatch = anyhow::Error::from(Error::VerificationMismatch {
            index: 0,
            expected: Some(1),
            actual: Some(2),
        });
        assert_eq!(Status::of_error(&mismatch).code(), 2);
        let env = anyhow::Error::from(Error::NoPlatformFound { backend: "host" });
        assert_eq!(Status::of_error(&env).code(), 3);
        let oom = anyhow::Error::from(Error::OutOfDeviceMemory {
            requested: 4096,
            available: 1024,
        });
        assert_eq!(Status::of_error(&oom), Status::Environment);
        let other = anyhow::Error::from(Error::shape("bad"));
        assert_eq!(Status::of_error(&other).code(), 4);
        assert_eq!(Status::of_error(&anyhow::anyhow!("plain")), Status::Other);
    }

    #[test]
    fn test_missing_kernel_file() {
        let err = read_kernel(Path::new("does/not/exist.cl")).unwrap_err();
        assert!(matches!(err, Error::KernelSource { .. }));
        assert_eq!(Status::of_error(&err.into()), Status::Other);
    }

    #[test]
    fn test_resolve_problem_flags() {
        let mut config = RunConfig::default();
        let problem = ProblemArgs::MatMul {
            rows: Some(8),
            cols: Some(4),
            inner: None,
            seed: Some(3),
        }
        .resolve(&mut config)
        .unwrap();
        assert_eq!(problem.output_len(), 32);
        assert_eq!(config.mat_mul.inner(), 4);

        let mut config = RunConfig::default();
        assert!(matches!(
            ProblemArgs::VecAdd { elements: Some(0) }.resolve(&mut config),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_execute_vec_add() {
        let file = kernel_file(VEC_ADD);
        let args = RunArgs::default();
        let report = execute(ProblemArgs::VecAdd { elements: Some(2048) }, file.path(), &args).unwrap();
        assert!(report.passed());
        let text = render_report(&report);
        assert!(text.contains("PASSED: 2048 elements"));
        assert!(text.contains("emulated  kernel body not executed"));
    }

    #[test]
    fn test_execute_build_failure() {
        let file = kernel_file(&VEC_ADD.replace("B[i];", "B[i]"));
        let err = execute(ProblemArgs::VecAdd { elements: None }, file.path(), &RunArgs::default()).unwrap_err();
        assert_eq!(Status::of_error(&err), Status::BuildFailed);
    }

    #[test]
    fn test_render_mismatch() {
        let report = RunReport {
            problem: "vec-add",
            backend: "host",
            platform: "Offload Host".into(),
            device: "gpu0".into(),
            kernel: "vec_add".into(),
            emulated: false,
            policy: TilePolicy::default(),
            work: WorkSpec::one_d(4, Some(4)),
            build_log: String::new(),
            repeats: 0,
            timings: Timings::default(),
            verification: verify(&[0, 2, 4, 6], &[0, 2, 5], VerifyMode::FullScan { log_limit: 0 }),
        };
        let text = render_report(&report);
        assert!(text.starts_with("vec-add on gpu0 (Offload Host) via host"));
        assert!(text.contains("FAILED: 2 mismatch(es), first at index 2 (expected 4, got 5)"));
        assert!(!text.contains("emulated"));
    }

    #[test]
    fn test_render_devices() {
        let backend = share(HostBackend::new());
        let probed = probe_devices(backend.read().as_ref()).unwrap();
        let text = render_devices(&probed);
        assert!(text.contains("gpu"));
        assert!(!text.is_empty());
    }
}
