//! End-to-end run of one problem
//!
//! ```text
//! enumerate ─► select ─► open session ─► stage inputs ─► build
//!     ─► kernel + bind ─► plan ─► dispatch ─► blocking read ─► close
//!     ─► verify against the host reference
//! ```
//!
//! Every resource acquired along the way is released on every exit path:
//! kernels and programs when they go out of scope, the session explicitly
//! (or by `Drop` on early return).

use crate::backend::SharedBackend;
use crate::config::RunConfig;
use crate::enumerator::DeviceEnumerator;
use crate::error::Result;
use crate::planner::{dispatch, plan, TilePolicy};
use crate::problem::{Problem, Staged};
use crate::program::{Kernel, Program};
use crate::session::Session;
use crate::verify::{verify, Verification, VerifyMode};
use offload_backends::{TransferMode, WorkSpec};
use serde::Serialize;

/// Wall-clock durations of the phases of a run, in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Timings {
    pub build_us: u64,
    /// First dispatch through the blocking read of its output.
    pub dispatch_us: u64,
    pub reference_us: u64,
    pub total_us: u64,
}

/// What happened during a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub problem: &'static str,
    pub backend: &'static str,
    pub platform: String,
    pub device: String,
    pub kernel: String,
    /// The backend ran built-in host code for the kernel, so `verification`
    /// covers the orchestration only, not the kernel source.
    pub emulated: bool,
    pub policy: TilePolicy,
    pub work: WorkSpec,
    /// Compiler warnings of a successful build.
    pub build_log: String,
    /// Extra dispatches that reproduced the first output.
    pub repeats: usize,
    pub timings: Timings,
    pub verification: Verification,
}

impl RunReport {
    pub fn passed(&self) -> bool {
        self.verification.matched
    }
}

struct DeviceRun {
    work: WorkSpec,
    build_log: String,
    output: Vec<i32>,
    build_us: u64,
    dispatch_us: u64,
}

/// Run `problem` with `kernel_source` on the configured device.
///
/// A verification mismatch is not an error here: it is reported in
/// [`RunReport::verification`]. Use [`Verification::into_result`] to make it
/// fatal.
///
/// # Errors
///
/// Any failure before the output is read back: discovery, allocation,
/// build, binding, planning, dispatch or transfer. A repeat dispatch that
/// disagrees with the first is a [`VerificationMismatch`](crate::Error::VerificationMismatch).
#[tracing::instrument(skip_all, fields(problem = problem.name()))]
pub fn run(backend: &SharedBackend, config: &RunConfig, problem: &Problem, kernel_source: &str) -> Result<RunReport> {
    let start = std::time::Instant::now();
    config.validate()?;

    let enumerator = DeviceEnumerator::new(backend.clone(), config.device_class);
    let device = enumerator.device()?.clone();
    let platform = enumerator.platform()?;
    let policy = config.tile_policy(problem.default_tile_edge());

    let mut session = Session::open(backend.clone(), &device)?;
    let outcome = run_on_device(&session, config, policy, problem, kernel_source);
    let closed = session.close();
    let device_run = outcome?;
    closed?;

    let (expected, reference_us) = offload_tracing::timed_block!("reference", { problem.reference() });
    let verification = verify(&expected, &device_run.output, config.verify);
    if !verification.matched {
        tracing::error!(
            mismatches = verification.mismatches,
            first = ?verification.first_mismatch,
            "results_differ"
        );
    } else {
        tracing::info!(elements = verification.checked, "results_verified");
    }

    Ok(RunReport {
        problem: problem.name(),
        backend: backend.read().name(),
        platform: platform.name,
        device: device.name,
        kernel: problem.kernel_name().to_string(),
        emulated: backend.read().emulates_kernels(),
        policy,
        work: device_run.work,
        build_log: device_run.build_log,
        repeats: config.repeat,
        timings: Timings {
            build_us: device_run.build_us,
            dispatch_us: device_run.dispatch_us,
            reference_us,
            total_us: start.elapsed().as_micros() as u64,
        },
        verification,
    })
}

fn run_on_device(
    session: &Session,
    config: &RunConfig,
    policy: TilePolicy,
    problem: &Problem,
    kernel_source: &str,
) -> Result<DeviceRun> {
    let staged = problem.stage(session)?;

    let (program, build_us) = offload_tracing::timed_block!("build_program", {
        Program::build_with_options(session, kernel_source, &config.build_options)
    });
    let program = program?;
    let mut kernel = program.kernel(problem.kernel_name())?;
    problem.bind(&mut kernel, &staged)?;

    let work = plan(problem.shape(), &session.device().limits, policy)?;
    tracing::info!(work = %work, "work_planned");

    let (output, dispatch_us) = offload_tracing::timed_block!("dispatch_and_read", {
        launch(session, &kernel, &work, &staged)
    });
    let output = output?;

    for repeat in 1..=config.repeat {
        let again = launch(session, &kernel, &work, &staged)?;
        verify(&output, &again, VerifyMode::FirstMismatch).into_result()?;
        tracing::debug!(repeat, "repeat_matched");
    }

    Ok(DeviceRun {
        work,
        build_log: program.build_log().to_string(),
        output,
        build_us,
        dispatch_us,
    })
}

fn launch(session: &Session, kernel: &Kernel<'_>, work: &WorkSpec, staged: &Staged) -> Result<Vec<i32>> {
    dispatch(session, kernel, work)?;
    session.read(&staged.c, TransferMode::Blocking)?.wait()
}
