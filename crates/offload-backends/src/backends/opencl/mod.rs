//! OpenCL backend
//!
//! Maps the [`Backend`](crate::Backend) contract onto an installed OpenCL
//! runtime through `opencl3`. Compiled only with the `opencl` feature; without
//! it [`OpenClBackend::new`] reports the backend as unsupported.
//!
//! Host data handed to a non-blocking write is kept alive next to its event
//! until the event is waited on or the queue is drained. Non-blocking reads
//! land in a backend-owned vector that [`Backend::take_read`](crate::Backend::take_read)
//! hands over once the read completes.

#[cfg(feature = "opencl")]
use crate::backend::{
    AccessMode, Backend, BufferHandle, ContextHandle, DeviceClass, DeviceId, DeviceInfo, DeviceLimits, EventHandle,
    KernelArg, KernelHandle, PlatformId, PlatformInfo, ProgramHandle, QueueHandle, ScalarArg, TransferMode, WorkSpec,
};
use crate::error::{BackendError, Result};
#[cfg(feature = "opencl")]
use offload_tracing::performance::{record_allocation, record_dispatch};
#[cfg(feature = "opencl")]
use opencl3::{
    command_queue::CommandQueue,
    context::Context,
    device::{Device, CL_DEVICE_TYPE_ACCELERATOR, CL_DEVICE_TYPE_ALL, CL_DEVICE_TYPE_CPU, CL_DEVICE_TYPE_GPU},
    error_codes::ClError,
    event::Event,
    kernel::{create_program_kernels, Kernel},
    memory::{Buffer, CL_MEM_READ_ONLY, CL_MEM_READ_WRITE, CL_MEM_WRITE_ONLY},
    platform::get_platforms,
    program::Program,
    types::{cl_device_id, cl_uint, CL_BLOCKING, CL_NON_BLOCKING},
};
#[cfg(feature = "opencl")]
use std::collections::HashMap;
#[cfg(feature = "opencl")]
use std::ptr;
#[cfg(feature = "opencl")]
use std::sync::Arc;
#[cfg(feature = "opencl")]
use std::time::Instant;

#[cfg(feature = "opencl")]
const CL_DEVICE_NOT_AVAILABLE: i32 = -2;
#[cfg(feature = "opencl")]
const CL_MEM_OBJECT_ALLOCATION_FAILURE: i32 = -4;
#[cfg(feature = "opencl")]
const CL_OUT_OF_RESOURCES: i32 = -5;
#[cfg(feature = "opencl")]
const CL_INVALID_KERNEL_NAME: i32 = -46;

#[cfg(feature = "opencl")]
fn runtime_error(operation: &'static str) -> impl Fn(ClError) -> BackendError {
    move |err: ClError| BackendError::Runtime {
        operation,
        code: err.0,
    }
}

#[cfg(feature = "opencl")]
struct ContextEntry {
    context: Context,
    device: DeviceId,
}

#[cfg(feature = "opencl")]
struct QueueEntry {
    queue: CommandQueue,
    context: ContextHandle,
}

#[cfg(feature = "opencl")]
struct BufferEntry {
    buffer: Buffer<u8>,
    context: ContextHandle,
    size: usize,
}

#[cfg(feature = "opencl")]
struct ProgramEntry {
    program: Program,
    context: ContextHandle,
    device: DeviceId,
}

#[cfg(feature = "opencl")]
struct KernelEntry {
    kernel: Kernel,
    name: String,
    context: ContextHandle,
    arity: u32,
}

#[cfg(feature = "opencl")]
enum Payload {
    None,
    /// Source of a write; must outlive the copy.
    Upload(Arc<[u8]>),
    /// Destination of a read, handed out by `take_read`.
    Download(Vec<u8>),
}

#[cfg(feature = "opencl")]
struct EventEntry {
    event: Event,
    queue: QueueHandle,
    payload: Payload,
}

/// Backend driving an installed OpenCL runtime.
#[cfg(feature = "opencl")]
pub struct OpenClBackend {
    platforms: Vec<PlatformInfo>,
    devices: Vec<(cl_device_id, DeviceInfo)>,
    contexts: HashMap<ContextHandle, ContextEntry>,
    queues: HashMap<QueueHandle, QueueEntry>,
    buffers: HashMap<BufferHandle, BufferEntry>,
    programs: HashMap<ProgramHandle, ProgramEntry>,
    kernels: HashMap<KernelHandle, KernelEntry>,
    events: HashMap<EventHandle, EventEntry>,
    next_handle: u64,
}

// SAFETY: the raw pointers inside opencl3 objects are opaque runtime handles.
// OpenCL API calls are thread-safe (except clSetKernelArg, which needs
// `&mut self` here), and every access goes through the owning backend.
#[cfg(feature = "opencl")]
unsafe impl Send for OpenClBackend {}
#[cfg(feature = "opencl")]
unsafe impl Sync for OpenClBackend {}

#[cfg(feature = "opencl")]
impl OpenClBackend {
    /// Snapshot every platform and device the runtime reports.
    ///
    /// # Errors
    ///
    /// Returns an error if the OpenCL ICD loader cannot be queried.
    pub fn new() -> Result<Self> {
        let mut platforms = Vec::new();
        let mut devices = Vec::new();
        for (p, platform) in get_platforms().map_err(runtime_error("clGetPlatformIDs"))?.into_iter().enumerate() {
            let platform_id = PlatformId::new(p as u64);
            platforms.push(PlatformInfo {
                id: platform_id,
                name: platform.name().unwrap_or_default().trim().to_string(),
                version: platform.version().unwrap_or_default().trim().to_string(),
            });
            // A platform without devices reports CL_DEVICE_NOT_FOUND.
            for raw in platform.get_devices(CL_DEVICE_TYPE_ALL).unwrap_or_default() {
                let device = Device::new(raw);
                let dev_type = device.dev_type().unwrap_or(0);
                let class = if dev_type & CL_DEVICE_TYPE_GPU != 0 {
                    DeviceClass::Gpu
                } else if dev_type & CL_DEVICE_TYPE_CPU != 0 {
                    DeviceClass::Cpu
                } else if dev_type & CL_DEVICE_TYPE_ACCELERATOR != 0 {
                    DeviceClass::Accelerator
                } else {
                    DeviceClass::Other
                };
                let info = DeviceInfo {
                    id: DeviceId::new(devices.len() as u64),
                    platform: platform_id,
                    name: device.name().unwrap_or_default().trim().to_string(),
                    class,
                    limits: DeviceLimits {
                        max_work_group_size: device.max_work_group_size().unwrap_or(1),
                        max_work_item_dimensions: device.max_work_item_dimensions().unwrap_or(1),
                        max_work_item_sizes: device.max_work_item_sizes().unwrap_or_else(|_| vec![1]),
                    },
                    global_mem_size: device.global_mem_size().unwrap_or(0),
                };
                devices.push((raw, info));
            }
        }
        tracing::debug!(platforms = platforms.len(), devices = devices.len(), "opencl_runtime_probed");

        Ok(Self {
            platforms,
            devices,
            contexts: HashMap::new(),
            queues: HashMap::new(),
            buffers: HashMap::new(),
            programs: HashMap::new(),
            kernels: HashMap::new(),
            events: HashMap::new(),
            next_handle: 1,
        })
    }

    /// True when at least one OpenCL platform is installed.
    pub fn is_available() -> bool {
        get_platforms().map(|p| !p.is_empty()).unwrap_or(false)
    }

    fn next(&mut self) -> u64 {
        let id = self.next_handle;
        self.next_handle += 1;
        id
    }

    fn raw_device(&self, device: DeviceId) -> Result<(cl_device_id, &DeviceInfo)> {
        self.devices
            .get(device.id() as usize)
            .map(|(raw, info)| (*raw, info))
            .ok_or_else(|| BackendError::invalid_handle("device", device.id()))
    }

    fn context_entry(&self, ctx: ContextHandle) -> Result<&ContextEntry> {
        self.contexts
            .get(&ctx)
            .ok_or_else(|| BackendError::invalid_handle("context", ctx.id()))
    }

    fn queue_entry(&self, queue: QueueHandle) -> Result<&QueueEntry> {
        self.queues
            .get(&queue)
            .ok_or_else(|| BackendError::invalid_handle("queue", queue.id()))
    }

    fn record_event(&mut self, queue: QueueHandle, event: Event, payload: Payload) -> EventHandle {
        let handle = EventHandle::new(self.next());
        self.events.insert(handle, EventEntry { event, queue, payload });
        handle
    }

    fn release_queue_events(&mut self, queue: QueueHandle) {
        self.events.retain(|_, e| e.queue != queue);
    }
}

#[cfg(feature = "opencl")]
impl Backend for OpenClBackend {
    fn name(&self) -> &'static str {
        "opencl"
    }

    fn platforms(&self) -> Result<Vec<PlatformInfo>> {
        Ok(self.platforms.clone())
    }

    fn devices(&self, platform: PlatformId, class: DeviceClass) -> Result<Vec<DeviceInfo>> {
        if platform.id() as usize >= self.platforms.len() {
            return Err(BackendError::invalid_handle("platform", platform.id()));
        }
        Ok(self
            .devices
            .iter()
            .map(|(_, info)| info)
            .filter(|info| info.platform == platform && info.class == class)
            .cloned()
            .collect())
    }

    fn create_context(&mut self, device: DeviceId) -> Result<ContextHandle> {
        let (raw, info) = self.raw_device(device)?;
        let name = info.name.clone();
        let context = Context::from_device(&Device::new(raw)).map_err(|err| match err.0 {
            CL_DEVICE_NOT_AVAILABLE => BackendError::DeviceUnavailable(name.clone()),
            code => BackendError::DeviceUnavailable(format!("{name} (status {code})")),
        })?;
        let ctx = ContextHandle::new(self.next());
        self.contexts.insert(ctx, ContextEntry { context, device });
        Ok(ctx)
    }

    fn release_context(&mut self, ctx: ContextHandle) -> Result<()> {
        if !self.contexts.contains_key(&ctx) {
            return Err(BackendError::invalid_handle("context", ctx.id()));
        }
        let queues: Vec<QueueHandle> = self
            .queues
            .iter()
            .filter(|(_, q)| q.context == ctx)
            .map(|(h, _)| *h)
            .collect();
        for queue in queues {
            if let Some(entry) = self.queues.remove(&queue) {
                let _ = entry.queue.finish();
            }
            self.release_queue_events(queue);
        }
        self.kernels.retain(|_, k| k.context != ctx);
        self.programs.retain(|_, p| p.context != ctx);
        let before = self.buffers.len();
        self.buffers.retain(|_, b| b.context != ctx);
        tracing::debug!(%ctx, freed_buffers = before - self.buffers.len(), "context_released");
        self.contexts.remove(&ctx);
        Ok(())
    }

    fn create_queue(&mut self, ctx: ContextHandle, device: DeviceId) -> Result<QueueHandle> {
        let entry = self.context_entry(ctx)?;
        if entry.device != device {
            return Err(BackendError::invalid_handle("device", device.id()));
        }
        #[allow(deprecated)]
        let queue = CommandQueue::create_default(&entry.context, 0).map_err(runtime_error("clCreateCommandQueue"))?;
        let handle = QueueHandle::new(self.next());
        self.queues.insert(handle, QueueEntry { queue, context: ctx });
        Ok(handle)
    }

    fn release_queue(&mut self, queue: QueueHandle) -> Result<()> {
        let entry = self
            .queues
            .remove(&queue)
            .ok_or_else(|| BackendError::invalid_handle("queue", queue.id()))?;
        let drained = entry.queue.finish().map_err(runtime_error("clFinish"));
        self.release_queue_events(queue);
        drained
    }

    fn create_buffer(&mut self, ctx: ContextHandle, mode: AccessMode, size: usize) -> Result<BufferHandle> {
        if size == 0 {
            return Err(BackendError::InvalidBufferSize(size));
        }
        let entry = self.context_entry(ctx)?;
        let flags = match mode {
            AccessMode::ReadOnly => CL_MEM_READ_ONLY,
            AccessMode::WriteOnly => CL_MEM_WRITE_ONLY,
            AccessMode::ReadWrite => CL_MEM_READ_WRITE,
        };
        let start = Instant::now();
        // SAFETY: no host pointer is supplied, so the runtime owns the storage.
        let buffer = unsafe { Buffer::<u8>::create(&entry.context, flags, size, ptr::null_mut()) }.map_err(|err| {
            match err.0 {
                CL_MEM_OBJECT_ALLOCATION_FAILURE | CL_OUT_OF_RESOURCES => BackendError::OutOfMemory {
                    requested: size as u64,
                    available: 0,
                },
                code => BackendError::Runtime {
                    operation: "clCreateBuffer",
                    code,
                },
            }
        })?;
        record_allocation(size, mode.as_str(), start.elapsed().as_micros() as u64);
        let handle = BufferHandle::new(self.next());
        self.buffers.insert(
            handle,
            BufferEntry {
                buffer,
                context: ctx,
                size,
            },
        );
        Ok(handle)
    }

    fn release_buffer(&mut self, buffer: BufferHandle) -> Result<()> {
        self.buffers
            .remove(&buffer)
            .map(|_| ())
            .ok_or_else(|| BackendError::invalid_handle("buffer", buffer.id()))
    }

    fn buffer_size(&self, buffer: BufferHandle) -> Result<usize> {
        self.buffers
            .get(&buffer)
            .map(|b| b.size)
            .ok_or_else(|| BackendError::invalid_handle("buffer", buffer.id()))
    }

    fn enqueue_write(
        &mut self,
        queue: QueueHandle,
        buffer: BufferHandle,
        data: Arc<[u8]>,
        mode: TransferMode,
    ) -> Result<EventHandle> {
        let context = self.queue_entry(queue)?.context;
        let target = self
            .buffers
            .get_mut(&buffer)
            .filter(|b| b.context == context)
            .ok_or_else(|| BackendError::invalid_handle("buffer", buffer.id()))?;
        if data.len() > target.size {
            return Err(BackendError::BufferOutOfBounds {
                offset: 0,
                size: data.len(),
                buffer_size: target.size,
            });
        }
        let blocking = if mode == TransferMode::Blocking { CL_BLOCKING } else { CL_NON_BLOCKING };
        let q = &self
            .queues
            .get(&queue)
            .ok_or_else(|| BackendError::invalid_handle("queue", queue.id()))?
            .queue;
        // SAFETY: `data` is kept alive in the event record until the copy completes.
        let event = unsafe { q.enqueue_write_buffer(&mut target.buffer, blocking, 0, &data, &[]) }
            .map_err(|err| BackendError::transfer(format!("clEnqueueWriteBuffer failed with status {}", err.0)))?;
        let payload = match mode {
            TransferMode::Blocking => Payload::None,
            TransferMode::NonBlocking => Payload::Upload(data),
        };
        Ok(self.record_event(queue, event, payload))
    }

    fn enqueue_read(&mut self, queue: QueueHandle, buffer: BufferHandle, mode: TransferMode) -> Result<EventHandle> {
        let entry = self.queue_entry(queue)?;
        let source = self
            .buffers
            .get(&buffer)
            .filter(|b| b.context == entry.context)
            .ok_or_else(|| BackendError::invalid_handle("buffer", buffer.id()))?;
        let mut destination = vec![0u8; source.size];
        let blocking = if mode == TransferMode::Blocking { CL_BLOCKING } else { CL_NON_BLOCKING };
        // SAFETY: the vector's heap storage does not move when the vector is
        // stored in the event record, and it is only handed out after the
        // read has completed.
        let event = unsafe { entry.queue.enqueue_read_buffer(&source.buffer, blocking, 0, &mut destination, &[]) }
            .map_err(|err| BackendError::transfer(format!("clEnqueueReadBuffer failed with status {}", err.0)))?;
        Ok(self.record_event(queue, event, Payload::Download(destination)))
    }

    fn take_read(&mut self, event: EventHandle) -> Result<Vec<u8>> {
        self.wait(event)?;
        let entry = self
            .events
            .get_mut(&event)
            .ok_or_else(|| BackendError::invalid_handle("event", event.id()))?;
        match std::mem::replace(&mut entry.payload, Payload::None) {
            Payload::Download(bytes) => {
                self.events.remove(&event);
                Ok(bytes)
            }
            other => {
                entry.payload = other;
                Err(BackendError::transfer(format!("{event} holds no unread data")))
            }
        }
    }

    fn build_program(
        &mut self,
        ctx: ContextHandle,
        device: DeviceId,
        source: &str,
        options: &str,
    ) -> Result<ProgramHandle> {
        let entry = self.context_entry(ctx)?;
        if entry.device != device {
            return Err(BackendError::invalid_handle("device", device.id()));
        }
        let program = Program::create_and_build_from_source(&entry.context, source, options)
            .map_err(|log| BackendError::BuildFailed { log })?;
        let handle = ProgramHandle::new(self.next());
        self.programs.insert(
            handle,
            ProgramEntry {
                program,
                context: ctx,
                device,
            },
        );
        Ok(handle)
    }

    fn build_log(&self, program: ProgramHandle) -> Result<String> {
        let entry = self
            .programs
            .get(&program)
            .ok_or_else(|| BackendError::invalid_handle("program", program.id()))?;
        let (raw, _) = self.raw_device(entry.device)?;
        entry.program.get_build_log(raw).map_err(runtime_error("clGetProgramBuildInfo"))
    }

    fn kernel_names(&self, program: ProgramHandle) -> Result<Vec<String>> {
        let entry = self
            .programs
            .get(&program)
            .ok_or_else(|| BackendError::invalid_handle("program", program.id()))?;
        create_program_kernels(&entry.program)
            .map_err(runtime_error("clCreateKernelsInProgram"))?
            .iter()
            .map(|k| k.function_name().map_err(runtime_error("clGetKernelInfo")))
            .collect()
    }

    fn release_program(&mut self, program: ProgramHandle) -> Result<()> {
        self.programs
            .remove(&program)
            .map(|_| ())
            .ok_or_else(|| BackendError::invalid_handle("program", program.id()))
    }

    fn create_kernel(&mut self, program: ProgramHandle, name: &str) -> Result<KernelHandle> {
        let entry = self
            .programs
            .get(&program)
            .ok_or_else(|| BackendError::invalid_handle("program", program.id()))?;
        let kernel = Kernel::create(&entry.program, name).map_err(|err| match err.0 {
            CL_INVALID_KERNEL_NAME => BackendError::KernelNotFound(name.to_string()),
            code => BackendError::Runtime {
                operation: "clCreateKernel",
                code,
            },
        })?;
        let arity = kernel.num_args().map_err(runtime_error("clGetKernelInfo"))?;
        let context = entry.context;
        let handle = KernelHandle::new(self.next());
        self.kernels.insert(
            handle,
            KernelEntry {
                kernel,
                name: name.to_string(),
                context,
                arity,
            },
        );
        Ok(handle)
    }

    fn kernel_arg_count(&self, kernel: KernelHandle) -> Result<u32> {
        self.kernels
            .get(&kernel)
            .map(|k| k.arity)
            .ok_or_else(|| BackendError::invalid_handle("kernel", kernel.id()))
    }

    fn set_kernel_arg(&mut self, kernel: KernelHandle, index: u32, arg: KernelArg) -> Result<()> {
        let entry = self
            .kernels
            .get(&kernel)
            .ok_or_else(|| BackendError::invalid_handle("kernel", kernel.id()))?;
        if index >= entry.arity {
            return Err(BackendError::ArgumentIndexOutOfRange {
                kernel: entry.name.clone(),
                index,
                arity: entry.arity,
            });
        }
        let invalid = |err: ClError| BackendError::InvalidArgument {
            kernel: entry.name.clone(),
            index,
            reason: format!("clSetKernelArg failed with status {}", err.0),
        };
        let index = index as cl_uint;
        // SAFETY: each value is a plain scalar or a cl_mem handle that stays
        // alive in `self.buffers` for as long as the kernel can be launched.
        unsafe {
            match arg {
                KernelArg::Buffer(handle) => {
                    let buffer = self
                        .buffers
                        .get(&handle)
                        .filter(|b| b.context == entry.context)
                        .ok_or_else(|| BackendError::invalid_handle("buffer", handle.id()))?;
                    entry.kernel.set_arg(index, &buffer.buffer.get())
                }
                KernelArg::Scalar(ScalarArg::I32(v)) => entry.kernel.set_arg(index, &v),
                KernelArg::Scalar(ScalarArg::U32(v)) => entry.kernel.set_arg(index, &v),
                KernelArg::Scalar(ScalarArg::I64(v)) => entry.kernel.set_arg(index, &v),
                KernelArg::Scalar(ScalarArg::U64(v)) => entry.kernel.set_arg(index, &v),
                KernelArg::Scalar(ScalarArg::F32(v)) => entry.kernel.set_arg(index, &v),
                KernelArg::Scalar(ScalarArg::F64(v)) => entry.kernel.set_arg(index, &v),
            }
        }
        .map_err(invalid)
    }

    fn release_kernel(&mut self, kernel: KernelHandle) -> Result<()> {
        self.kernels
            .remove(&kernel)
            .map(|_| ())
            .ok_or_else(|| BackendError::invalid_handle("kernel", kernel.id()))
    }

    fn enqueue_kernel(&mut self, queue: QueueHandle, kernel: KernelHandle, work: &WorkSpec) -> Result<EventHandle> {
        let q = self.queue_entry(queue)?;
        let entry = self
            .kernels
            .get(&kernel)
            .filter(|k| k.context == q.context)
            .ok_or_else(|| BackendError::invalid_handle("kernel", kernel.id()))?;
        let device = self.context_entry(q.context)?.device;
        let (_, info) = self.raw_device(device)?;
        work.validate(&info.limits)?;

        let global = work.global().to_vec();
        let local = work.local().map(|l| l.to_vec());
        let local_ptr = local.as_ref().map_or(ptr::null(), |l| l.as_ptr());
        let start = Instant::now();
        // SAFETY: `global` and `local` outlive the call; arguments were bound
        // through `set_kernel_arg`.
        let event = unsafe {
            q.queue.enqueue_nd_range_kernel(
                entry.kernel.get(),
                work.dimensions() as cl_uint,
                ptr::null(),
                global.as_ptr(),
                local_ptr,
                &[],
            )
        }
        .map_err(runtime_error("clEnqueueNDRangeKernel"))?;
        record_dispatch(&entry.name, work.total_work_items(), start.elapsed().as_micros() as u64);
        Ok(self.record_event(queue, event, Payload::None))
    }

    fn wait(&mut self, event: EventHandle) -> Result<()> {
        let entry = self
            .events
            .get_mut(&event)
            .ok_or_else(|| BackendError::invalid_handle("event", event.id()))?;
        entry.event.wait().map_err(|err| BackendError::CommandFailed {
            event: event.id(),
            reason: format!("runtime status {}", err.0),
        })?;
        if matches!(entry.payload, Payload::Upload(_)) {
            entry.payload = Payload::None;
        }
        Ok(())
    }

    fn finish(&mut self, queue: QueueHandle) -> Result<()> {
        self.queue_entry(queue)?.queue.finish().map_err(runtime_error("clFinish"))?;
        for entry in self.events.values_mut().filter(|e| e.queue == queue) {
            if matches!(entry.payload, Payload::Upload(_)) {
                entry.payload = Payload::None;
            }
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

// Stub implementation when the OpenCL feature is not enabled
#[cfg(not(feature = "opencl"))]
pub struct OpenClBackend;

#[cfg(not(feature = "opencl"))]
impl OpenClBackend {
    pub fn new() -> Result<Self> {
        Err(BackendError::UnsupportedOperation(
            "OpenCL backend requires the 'opencl' feature to be enabled".into(),
        ))
    }

    pub fn is_available() -> bool {
        false
    }
}
