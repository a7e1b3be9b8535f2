//! The device runtime seam.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       Backend Trait                       │
//! │  discovery: platforms / devices                           │
//! │  resources: context, queue, buffer, program, kernel       │
//! │  commands:  enqueue_write / enqueue_read / enqueue_kernel │
//! │  sync:      wait / finish                                 │
//! └───────────────────────┬──────────────────────────────────┘
//!                         │
//!              ┌──────────┴──────────┐
//!              ▼                     ▼
//!        ┌───────────┐        ┌────────────┐
//!        │   Host    │        │   OpenCL   │
//!        │  Backend  │        │  Backend   │
//!        └───────────┘        └────────────┘
//! ```

use super::types::{
    AccessMode, BufferHandle, ContextHandle, DeviceClass, DeviceId, DeviceInfo, EventHandle, KernelArg, KernelHandle,
    PlatformId, PlatformInfo, ProgramHandle, QueueHandle, TransferMode, WorkSpec,
};
use crate::error::Result;
use std::sync::Arc;

/// Operations a compute runtime provides to the orchestration layer.
///
/// Commands enqueued on a queue run in submission order. Nothing enqueued is
/// guaranteed complete until a blocking transfer returns, [`Backend::wait`]
/// returns for its event, or [`Backend::finish`] drains the queue.
///
/// # Example
///
/// ```rust
/// use offload_backends::{AccessMode, Backend, DeviceClass, HostBackend, TransferMode};
/// use std::sync::Arc;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut backend = HostBackend::new();
/// let platform = backend.platforms()?[0].id;
/// let device = backend.devices(platform, DeviceClass::Gpu)?[0].id;
/// let ctx = backend.create_context(device)?;
/// let queue = backend.create_queue(ctx, device)?;
///
/// let buf = backend.create_buffer(ctx, AccessMode::ReadWrite, 16)?;
/// backend.enqueue_write(queue, buf, Arc::from(vec![7u8; 16]), TransferMode::Blocking)?;
/// let event = backend.enqueue_read(queue, buf, TransferMode::Blocking)?;
/// assert_eq!(backend.take_read(event)?, vec![7u8; 16]);
///
/// backend.release_queue(queue)?;
/// backend.release_buffer(buf)?;
/// backend.release_context(ctx)?;
/// # Ok(())
/// # }
/// ```
pub trait Backend {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// True when kernels run as built-in host code instead of the compiled
    /// source. Such a backend checks the orchestration around a kernel, not
    /// the kernel body.
    fn emulates_kernels(&self) -> bool {
        false
    }

    // ============================================================================================
    // Discovery
    // ============================================================================================

    /// Every platform installed, in enumeration order.
    fn platforms(&self) -> Result<Vec<PlatformInfo>>;

    /// Devices of `class` on `platform`; empty when there are none.
    fn devices(&self, platform: PlatformId, class: DeviceClass) -> Result<Vec<DeviceInfo>>;

    // ============================================================================================
    // Context and queue
    // ============================================================================================

    /// # Errors
    ///
    /// [`BackendError::DeviceUnavailable`](crate::BackendError::DeviceUnavailable)
    /// when the device rejects the context.
    fn create_context(&mut self, device: DeviceId) -> Result<ContextHandle>;

    /// Release a context and any buffers still allocated in it.
    fn release_context(&mut self, ctx: ContextHandle) -> Result<()>;

    fn create_queue(&mut self, ctx: ContextHandle, device: DeviceId) -> Result<QueueHandle>;

    /// Drain the queue, then release it.
    fn release_queue(&mut self, queue: QueueHandle) -> Result<()>;

    // ============================================================================================
    // Buffers and transfers
    // ============================================================================================

    /// Allocate `size` bytes. Contents are undefined until written.
    ///
    /// # Errors
    ///
    /// [`BackendError::OutOfMemory`](crate::BackendError::OutOfMemory) when
    /// the device refuses the allocation.
    fn create_buffer(&mut self, ctx: ContextHandle, mode: AccessMode, size: usize) -> Result<BufferHandle>;

    fn release_buffer(&mut self, buffer: BufferHandle) -> Result<()>;

    fn buffer_size(&self, buffer: BufferHandle) -> Result<usize>;

    /// Copy `data` into the start of `buffer`.
    ///
    /// The backend keeps `data` alive until the copy completes, so the caller
    /// may drop its own reference immediately.
    fn enqueue_write(
        &mut self,
        queue: QueueHandle,
        buffer: BufferHandle,
        data: Arc<[u8]>,
        mode: TransferMode,
    ) -> Result<EventHandle>;

    /// Copy the whole of `buffer` back to the host. The bytes are collected
    /// with [`Backend::take_read`].
    fn enqueue_read(&mut self, queue: QueueHandle, buffer: BufferHandle, mode: TransferMode) -> Result<EventHandle>;

    /// Wait for a read and hand over its bytes. Each read can be taken once.
    fn take_read(&mut self, event: EventHandle) -> Result<Vec<u8>>;

    // ============================================================================================
    // Programs and kernels
    // ============================================================================================

    /// Compile `source` for `device`.
    ///
    /// # Errors
    ///
    /// [`BackendError::BuildFailed`](crate::BackendError::BuildFailed) with
    /// the compiler log when compilation fails.
    fn build_program(
        &mut self,
        ctx: ContextHandle,
        device: DeviceId,
        source: &str,
        options: &str,
    ) -> Result<ProgramHandle>;

    /// Compiler output of a built program (warnings, usually empty).
    fn build_log(&self, program: ProgramHandle) -> Result<String>;

    /// Entry point names, in source order.
    fn kernel_names(&self, program: ProgramHandle) -> Result<Vec<String>>;

    fn release_program(&mut self, program: ProgramHandle) -> Result<()>;

    /// # Errors
    ///
    /// [`BackendError::KernelNotFound`](crate::BackendError::KernelNotFound)
    /// when the program has no entry point called `name`.
    fn create_kernel(&mut self, program: ProgramHandle, name: &str) -> Result<KernelHandle>;

    /// Number of positional arguments the kernel declares.
    fn kernel_arg_count(&self, kernel: KernelHandle) -> Result<u32>;

    fn set_kernel_arg(&mut self, kernel: KernelHandle, index: u32, arg: KernelArg) -> Result<()>;

    fn release_kernel(&mut self, kernel: KernelHandle) -> Result<()>;

    // ============================================================================================
    // Execution and synchronization
    // ============================================================================================

    /// Enqueue one launch of `kernel` over `work`. Arguments are captured at
    /// this point; rebinding afterwards does not affect the launch.
    fn enqueue_kernel(&mut self, queue: QueueHandle, kernel: KernelHandle, work: &WorkSpec) -> Result<EventHandle>;

    /// Block until the command behind `event` has completed.
    fn wait(&mut self, event: EventHandle) -> Result<()>;

    /// Block until every command on `queue` has completed.
    fn finish(&mut self, queue: QueueHandle) -> Result<()>;

    // ============================================================================================
    // Type Introspection
    // ============================================================================================

    /// Downcast to the concrete backend, e.g. to inspect host-side state in tests.
    fn as_any(&self) -> &dyn std::any::Any;

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;
}
