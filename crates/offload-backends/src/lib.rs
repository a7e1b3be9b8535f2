//! Device runtime seam for offload
//!
//! This crate provides:
//! - **Backend Trait**: platforms, devices, contexts, queues, buffers,
//!   programs, kernels and events behind opaque handles
//! - **Host Backend**: an emulated accelerator with finite memory, deferred
//!   in-order queues and a kernel source checker
//! - **OpenCL Backend**: the same contract over an installed OpenCL runtime
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    offload-core                          │
//! │      (session, program, planner, pipeline, verify)       │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │  dyn Backend
//!                       ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                    Backend trait                         │
//! │   handles: platform / device / ctx / queue / buf / ...   │
//! └─────────────────────┬───────────────────────────────────┘
//!              ┌────────┴────────┐
//!              ▼                 ▼
//!        ┌───────────┐     ┌───────────┐
//!        │   Host    │     │  OpenCL   │
//!        │  Backend  │     │  Backend  │
//!        └───────────┘     └───────────┘
//! ```
//!
//! # Usage
//!
//! ```rust
//! use offload_backends::{AccessMode, Backend, DeviceClass, HostBackend, TransferMode};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut backend = HostBackend::new();
//! let platform = backend.platforms()?[0].id;
//! let device = backend.devices(platform, DeviceClass::Gpu)?[0].id;
//! let ctx = backend.create_context(device)?;
//! let queue = backend.create_queue(ctx, device)?;
//!
//! let buffer = backend.create_buffer(ctx, AccessMode::ReadWrite, 8)?;
//! let data: Arc<[u8]> = Arc::from(bytemuck::cast_slice::<i32, u8>(&[7, 9]));
//! backend.enqueue_write(queue, buffer, data, TransferMode::Blocking)?;
//! let read = backend.enqueue_read(queue, buffer, TransferMode::Blocking)?;
//! let values: Vec<i32> = bytemuck::pod_collect_to_vec(&backend.take_read(read)?);
//! assert_eq!(values, vec![7, 9]);
//!
//! backend.release_context(ctx)?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod backends;
pub mod error;

// Re-export public API
pub use backend::{
    AccessMode, Backend, BufferHandle, ContextHandle, DeviceClass, DeviceId, DeviceInfo, DeviceLimits, EventHandle,
    KernelArg, KernelHandle, PlatformId, PlatformInfo, ProgramHandle, QueueHandle, ScalarArg, TransferMode, WorkSpec,
    WorkSpecViolation,
};
pub use backends::host::{
    AddressSpace, BuildOptions, HostBackendConfig, HostDeviceSpec, HostKernel, HostPlatformSpec, KernelArgs,
    KernelDecl, MatMul, ParamDecl, ParamKind, VecAdd, WorkItem,
};
pub use backends::{HostBackend, OpenClBackend};
pub use error::{BackendError, Result};
