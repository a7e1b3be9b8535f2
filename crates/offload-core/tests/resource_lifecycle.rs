//! Sessions must hand back every device resource, on success and on failure.

use offload_backends::{
    AccessMode, DeviceClass, HostBackend, HostBackendConfig, HostDeviceSpec, HostPlatformSpec, TransferMode,
};
use offload_core::{
    run, share, DeviceEnumerator, Error, MatMul, Problem, Program, Result, RunConfig, Session, SharedBackend,
    VectorAdd,
};

const VEC_ADD: &str = include_str!("../../../kernels/vec_add.cl");
const MAT_MUL: &str = include_str!("../../../kernels/mat_mul.cl");

fn with_host<R>(backend: &SharedBackend, f: impl FnOnce(&HostBackend) -> R) -> R {
    offload_tracing::init_test_tracing();
    let guard = backend.read();
    let host = guard
        .as_any()
        .downcast_ref::<HostBackend>()
        .expect("host backend");
    f(host)
}

fn assert_released(backend: &SharedBackend) {
    with_host(backend, |host| {
        assert_eq!(host.live_buffers(), 0, "buffers leaked");
        assert_eq!(host.live_queues(), 0, "queues leaked");
        assert_eq!(host.live_contexts(), 0, "contexts leaked");
    });
}

fn bounded(bytes: u64) -> SharedBackend {
    offload_tracing::init_test_tracing();
    share(HostBackend::with_config(HostBackendConfig::single_device(
        HostDeviceSpec::gpu("bounded").with_memory(bytes),
    )))
}

// ============================================================================
// Repeated runs
// ============================================================================

#[test]
fn test_repeated_runs_fit_bounded_memory() -> Result<()> {
    // One 64x64 run needs 3 * 16 KiB; a leak would exhaust this after two runs.
    let backend = bounded(3 * 64 * 64 * 4 + 1024);
    let problem = Problem::from(MatMul::random(64, 64, 64, 1)?);
    for _ in 0..8 {
        assert!(run(&backend, &RunConfig::default(), &problem, MAT_MUL)?.passed());
        assert_released(&backend);
    }
    Ok(())
}

#[test]
fn test_failed_runs_release_everything() {
    let backend = share(HostBackend::new());
    let problem = Problem::from(VectorAdd::iota(128).unwrap());

    let broken = VEC_ADD.replace("B[i];", "B[i]");
    assert!(matches!(
        run(&backend, &RunConfig::default(), &problem, &broken),
        Err(Error::Build { .. })
    ));
    assert_released(&backend);

    assert!(matches!(
        run(&backend, &RunConfig::default(), &problem, MAT_MUL),
        Err(Error::EntryPointNotFound(_))
    ));
    assert_released(&backend);
}

#[test]
fn test_allocation_failure_releases_earlier_buffers() {
    // Room for A and B of 1024 ints but not C.
    let backend = bounded(2 * 1024 * 4);
    let problem = Problem::from(VectorAdd::iota(1024).unwrap());
    let err = run(&backend, &RunConfig::default(), &problem, VEC_ADD).unwrap_err();
    assert!(matches!(err, Error::OutOfDeviceMemory { .. }));
    assert!(err.is_environment());
    assert_released(&backend);
}

#[test]
fn test_drop_closes_session() -> Result<()> {
    let backend = share(HostBackend::new());
    {
        let enumerator = DeviceEnumerator::new(backend.clone(), DeviceClass::Gpu);
        let session = Session::open(backend.clone(), enumerator.device()?)?;
        let buffer = session.alloc_buffer::<i32>(AccessMode::ReadWrite, 256)?;
        session.write(&buffer, &[7; 256], TransferMode::NonBlocking)?;
        let program = Program::build(&session, VEC_ADD)?;
        let _kernel = program.kernel("vec_add")?;
    }
    assert_released(&backend);
    Ok(())
}

// ============================================================================
// Closed sessions and foreign handles
// ============================================================================

#[test]
fn test_closed_session_rejects_handles() -> Result<()> {
    let backend = share(HostBackend::new());
    let enumerator = DeviceEnumerator::new(backend.clone(), DeviceClass::Gpu);
    let mut session = Session::open(backend.clone(), enumerator.device()?)?;
    let buffer = session.alloc_buffer::<i32>(AccessMode::ReadWrite, 4)?;
    let event = session.write(&buffer, &[1, 2, 3, 4], TransferMode::NonBlocking)?;
    session.close()?;
    session.close()?;

    let id = session.id();
    assert!(matches!(
        session.read(&buffer, TransferMode::Blocking).map(|_| ()),
        Err(Error::SessionClosed { session }) if session == id
    ));
    assert!(matches!(session.wait(&event), Err(Error::SessionClosed { .. })));
    assert!(matches!(
        session.alloc_buffer::<i32>(AccessMode::ReadOnly, 1),
        Err(Error::SessionClosed { .. })
    ));
    assert!(matches!(Program::build(&session, VEC_ADD), Err(Error::SessionClosed { .. })));
    assert_released(&backend);
    Ok(())
}

#[test]
fn test_buffer_from_other_session_rejected() -> Result<()> {
    let backend = share(HostBackend::new());
    let enumerator = DeviceEnumerator::new(backend.clone(), DeviceClass::Gpu);
    let first = Session::open(backend.clone(), enumerator.device()?)?;
    let second = Session::open(backend.clone(), enumerator.device()?)?;
    let buffer = first.alloc_buffer::<i32>(AccessMode::ReadWrite, 4)?;

    assert!(matches!(
        second.write(&buffer, &[0; 4], TransferMode::Blocking),
        Err(Error::ForeignBuffer { owner, session }) if owner == first.id() && session == second.id()
    ));

    let program = Program::build(&second, VEC_ADD)?;
    let mut kernel = program.kernel("vec_add")?;
    assert!(matches!(kernel.set_arg(0, &buffer), Err(Error::ForeignBuffer { .. })));
    Ok(())
}

#[test]
fn test_freed_buffer_rejected() -> Result<()> {
    let backend = share(HostBackend::new());
    let enumerator = DeviceEnumerator::new(backend.clone(), DeviceClass::Gpu);
    let session = Session::open(backend.clone(), enumerator.device()?)?;
    let buffer = session.alloc_buffer::<i32>(AccessMode::ReadWrite, 4)?;
    session.free(buffer)?;
    assert_eq!(session.live_buffers(), 0);
    assert!(matches!(
        session.write(&buffer, &[0; 4], TransferMode::Blocking),
        Err(Error::Backend(_))
    ));
    Ok(())
}

// ============================================================================
// Discovery failures
// ============================================================================

#[test]
fn test_empty_backend_has_no_platform() {
    let backend = share(HostBackend::with_config(HostBackendConfig::empty()));
    let problem = Problem::from(VectorAdd::iota(16).unwrap());
    let err = run(&backend, &RunConfig::default(), &problem, VEC_ADD).unwrap_err();
    assert!(matches!(err, Error::NoPlatformFound { .. }));
    assert!(err.is_environment());
}

#[test]
fn test_unavailable_device_rejects_session() {
    let backend = share(HostBackend::with_config(HostBackendConfig::single_device(
        HostDeviceSpec::gpu("offline").unavailable(),
    )));
    let problem = Problem::from(VectorAdd::iota(16).unwrap());
    assert!(matches!(
        run(&backend, &RunConfig::default(), &problem, VEC_ADD),
        Err(Error::DeviceUnavailable(_))
    ));
    assert_released(&backend);
}

#[test]
fn test_second_platform_supplies_gpu() -> Result<()> {
    let config = HostBackendConfig::empty()
        .with_platform(HostPlatformSpec::new("cpu-only").with_device(HostDeviceSpec::cpu("cpu0")))
        .with_platform(HostPlatformSpec::new("accelerators").with_device(HostDeviceSpec::gpu("gpu0")));
    let backend = share(HostBackend::with_config(config));
    let problem = Problem::from(VectorAdd::iota(64)?);
    let report = run(&backend, &RunConfig::default(), &problem, VEC_ADD)?;
    assert_eq!(report.platform, "accelerators");
    assert_eq!(report.device, "gpu0");
    Ok(())
}
