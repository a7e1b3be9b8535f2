//! Host backend: an emulated accelerator that runs kernels on the CPU
//!
//! It follows the device runtime contract closely enough to exercise the
//! orchestration layer without a driver: commands are queued and only run at
//! a synchronization point, device memory is finite, buffers have access
//! modes, and kernel sources are checked before their entry points are bound
//! to host implementations.
//!
//! Kernel bodies are parsed but never executed. A bound entry point runs its
//! built-in Rust implementation, so a verified run on this backend says the
//! host side (staging, binding, planning, transfers, cleanup) is correct and
//! nothing about the kernel source. Every build log carries a note saying so.
//!
//! # Architecture
//!
//! ```text
//! HostBackend
//! ├── config     - platforms and devices to report
//! ├── memory     - per-device capacity, poisoned allocations
//! ├── queue      - FIFO command queues, event status
//! ├── compiler   - kernel source checking (logos lexer)
//! ├── kernels    - host implementations (vec_add, mat_mul)
//! └── executor   - rayon work-group execution
//! ```
//!
//! # Usage
//!
//! ```rust
//! use offload_backends::{Backend, DeviceClass, HostBackend, HostBackendConfig, HostDeviceSpec};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // A machine with a single CPU device and no GPU.
//! let backend = HostBackend::with_config(HostBackendConfig::single_device(HostDeviceSpec::cpu("cpu0")));
//! let platform = backend.platforms()?[0].id;
//! assert!(backend.devices(platform, DeviceClass::Gpu)?.is_empty());
//! # Ok(())
//! # }
//! ```

mod compiler;
mod config;
mod executor;
mod kernels;
mod memory;
mod queue;

pub use compiler::{AddressSpace, BuildOptions, KernelDecl, ParamDecl};
pub use config::{HostBackendConfig, HostDeviceSpec, HostPlatformSpec};
pub use kernels::{HostKernel, KernelArgs, MatMul, ParamKind, VecAdd, WorkItem};

use crate::backend::{
    AccessMode, Backend, BufferHandle, ContextHandle, DeviceClass, DeviceId, DeviceInfo, EventHandle, KernelArg,
    KernelHandle, PlatformId, PlatformInfo, ProgramHandle, QueueHandle, TransferMode, WorkSpec,
};
use crate::error::{BackendError, Result};
use executor::Launch;
use memory::MemoryManager;
use offload_tracing::performance::{record_allocation, record_dispatch, record_transfer, TransferDirection};
use queue::{Command, CommandQueue, EventRecord, EventStatus, Submitted};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Queue flushes at least this slow are logged.
const SLOW_FLUSH_US: u64 = 1_000;

struct HostDevice {
    info: DeviceInfo,
    available: bool,
}

struct ProgramRecord {
    context: ContextHandle,
    kernels: Vec<KernelDecl>,
    log: String,
}

struct KernelRecord {
    context: ContextHandle,
    name: String,
    params: Vec<ParamDecl>,
    args: Vec<Option<KernelArg>>,
    implementation: Option<Arc<dyn HostKernel>>,
}

/// Emulated accelerator executing kernels on the host.
pub struct HostBackend {
    platforms: Vec<PlatformInfo>,
    devices: Vec<HostDevice>,
    memory: MemoryManager,
    contexts: HashMap<ContextHandle, DeviceId>,
    queues: HashMap<QueueHandle, CommandQueue>,
    events: HashMap<EventHandle, EventRecord>,
    programs: HashMap<ProgramHandle, ProgramRecord>,
    kernels: HashMap<KernelHandle, KernelRecord>,
    registry: HashMap<String, Arc<dyn HostKernel>>,
    next_handle: u64,
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HostBackend {
    /// One platform with one GPU-class device.
    pub fn new() -> Self {
        Self::with_config(HostBackendConfig::default())
    }

    pub fn with_config(config: HostBackendConfig) -> Self {
        let mut platforms = Vec::with_capacity(config.platforms.len());
        let mut devices = Vec::new();
        for (p, platform) in config.platforms.into_iter().enumerate() {
            let platform_id = PlatformId::new(p as u64);
            platforms.push(PlatformInfo {
                id: platform_id,
                name: platform.name,
                version: platform.version,
            });
            for spec in platform.devices {
                let id = DeviceId::new(devices.len() as u64);
                devices.push(HostDevice {
                    info: DeviceInfo {
                        id,
                        platform: platform_id,
                        name: spec.name,
                        class: spec.class,
                        limits: spec.limits,
                        global_mem_size: spec.global_mem_size,
                    },
                    available: spec.available,
                });
            }
        }

        Self {
            platforms,
            devices,
            memory: MemoryManager::new(),
            contexts: HashMap::new(),
            queues: HashMap::new(),
            events: HashMap::new(),
            programs: HashMap::new(),
            kernels: HashMap::new(),
            registry: kernels::builtin_kernels(),
            next_handle: 1,
        }
    }

    /// Make `kernel` available to programs built after this call.
    pub fn register_kernel(&mut self, kernel: Arc<dyn HostKernel>) {
        self.registry.insert(kernel.name().to_string(), kernel);
    }

    pub fn live_buffers(&self) -> usize {
        self.memory.live_buffers()
    }

    pub fn live_contexts(&self) -> usize {
        self.contexts.len()
    }

    pub fn live_queues(&self) -> usize {
        self.queues.len()
    }

    pub fn used_bytes(&self, device: DeviceId) -> u64 {
        self.memory.used_bytes(device)
    }

    fn next(&mut self) -> u64 {
        let id = self.next_handle;
        self.next_handle += 1;
        id
    }

    fn device(&self, id: DeviceId) -> Result<&HostDevice> {
        self.devices
            .get(id.id() as usize)
            .ok_or_else(|| BackendError::invalid_handle("device", id.id()))
    }

    fn context_device(&self, ctx: ContextHandle) -> Result<DeviceId> {
        self.contexts
            .get(&ctx)
            .copied()
            .ok_or_else(|| BackendError::invalid_handle("context", ctx.id()))
    }

    fn queue(&self, queue: QueueHandle) -> Result<&CommandQueue> {
        self.queues
            .get(&queue)
            .ok_or_else(|| BackendError::invalid_handle("queue", queue.id()))
    }

    /// Size of `buffer`, which must live in `context`.
    fn buffer_in(&self, context: ContextHandle, buffer: BufferHandle) -> Result<usize> {
        let allocation = self.memory.get(buffer)?;
        if allocation.context != context {
            return Err(BackendError::invalid_handle("buffer", buffer.id()));
        }
        Ok(allocation.bytes.len())
    }

    fn submit(&mut self, queue: QueueHandle, command: Command) -> Result<EventHandle> {
        let event = EventHandle::new(self.next());
        let target = self
            .queues
            .get_mut(&queue)
            .ok_or_else(|| BackendError::invalid_handle("queue", queue.id()))?;
        tracing::trace!(%queue, %event, command = command.label(), "command_enqueued");
        target.push(event, command);
        self.events.insert(
            event,
            EventRecord {
                queue,
                status: EventStatus::Queued,
            },
        );
        Ok(event)
    }

    /// Run queued commands in order, up to and including `until` (or all of
    /// them). Returns the first command that failed.
    fn run_queue(&mut self, queue: QueueHandle, until: Option<EventHandle>) -> Result<Option<(EventHandle, String)>> {
        let _span = offload_tracing::perf_span_threshold!("run_queue", SLOW_FLUSH_US);
        let mut first_failure = None;
        loop {
            let next = self
                .queues
                .get_mut(&queue)
                .ok_or_else(|| BackendError::invalid_handle("queue", queue.id()))?
                .pop();
            let Some(Submitted { event, command }) = next else {
                break;
            };
            let label = command.label();
            let status = match self.run_command(command) {
                Ok(status) => status,
                Err(err) => {
                    tracing::warn!(%event, command = label, error = %err, "command_failed");
                    let reason = err.to_string();
                    first_failure.get_or_insert((event, reason.clone()));
                    EventStatus::Failed(reason)
                }
            };
            if let Some(record) = self.events.get_mut(&event) {
                record.status = status;
            }
            if until == Some(event) {
                break;
            }
        }
        Ok(first_failure)
    }

    fn run_command(&mut self, command: Command) -> Result<EventStatus> {
        let start = Instant::now();
        match command {
            Command::Write { buffer, data } => {
                self.memory.copy_to_buffer(buffer, &data)?;
                record_transfer(data.len(), TransferDirection::HostToDevice, elapsed_us(start));
                Ok(EventStatus::Complete)
            }
            Command::Read { buffer } => {
                let bytes = self.memory.copy_from_buffer(buffer)?;
                record_transfer(bytes.len(), TransferDirection::DeviceToHost, elapsed_us(start));
                Ok(EventStatus::ReadReady(bytes))
            }
            Command::Launch(launch) => {
                let items = executor::execute(&launch, &mut self.memory)?;
                record_dispatch(&launch.kernel, items, elapsed_us(start));
                Ok(EventStatus::Complete)
            }
        }
    }

    fn missing_implementation_warning(&self, decl: &KernelDecl) -> Option<String> {
        match self.registry.get(&decl.name) {
            Some(kernel) => kernels::signature_mismatch(decl, kernel.as_ref()),
            None => Some(format!(
                "kernel '{}' has no host implementation; dispatching it will fail",
                decl.name
            )),
        }
    }
}

fn elapsed_us(start: Instant) -> u64 {
    start.elapsed().as_micros() as u64
}

impl Backend for HostBackend {
    fn name(&self) -> &'static str {
        "host"
    }

    fn emulates_kernels(&self) -> bool {
        true
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
            .filter(|d| d.info.platform == platform && d.info.class == class)
            .map(|d| d.info.clone())
            .collect())
    }

    fn create_context(&mut self, device: DeviceId) -> Result<ContextHandle> {
        let entry = self.device(device)?;
        if !entry.available {
            return Err(BackendError::DeviceUnavailable(entry.info.name.clone()));
        }
        let ctx = ContextHandle::new(self.next());
        self.contexts.insert(ctx, device);
        tracing::debug!(%ctx, %device, "context_created");
        Ok(ctx)
    }

    fn release_context(&mut self, ctx: ContextHandle) -> Result<()> {
        self.contexts
            .remove(&ctx)
            .ok_or_else(|| BackendError::invalid_handle("context", ctx.id()))?;
        let freed = self.memory.free_context(ctx);
        self.kernels.retain(|_, k| k.context != ctx);
        self.programs.retain(|_, p| p.context != ctx);
        let orphaned: Vec<QueueHandle> = self
            .queues
            .iter()
            .filter(|(_, q)| q.context == ctx)
            .map(|(h, _)| *h)
            .collect();
        for queue in orphaned {
            self.queues.remove(&queue);
            self.events.retain(|_, e| e.queue != queue);
        }
        tracing::debug!(%ctx, freed_buffers = freed, "context_released");
        Ok(())
    }

    fn create_queue(&mut self, ctx: ContextHandle, device: DeviceId) -> Result<QueueHandle> {
        if self.context_device(ctx)? != device {
            return Err(BackendError::invalid_handle("device", device.id()));
        }
        let queue = QueueHandle::new(self.next());
        self.queues.insert(queue, CommandQueue::new(ctx, device));
        Ok(queue)
    }

    fn release_queue(&mut self, queue: QueueHandle) -> Result<()> {
        let drained = self.run_queue(queue, None)?;
        self.queues.remove(&queue);
        self.events.retain(|_, e| e.queue != queue);
        match drained {
            Some((event, reason)) => Err(BackendError::CommandFailed {
                event: event.id(),
                reason,
            }),
            None => Ok(()),
        }
    }

    fn create_buffer(&mut self, ctx: ContextHandle, mode: AccessMode, size: usize) -> Result<BufferHandle> {
        let device = self.context_device(ctx)?;
        let capacity = self.device(device)?.info.global_mem_size;
        let start = Instant::now();
        let buffer = self.memory.allocate(ctx, device, capacity, mode, size)?;
        record_allocation(size, mode.as_str(), elapsed_us(start));
        Ok(buffer)
    }

    fn release_buffer(&mut self, buffer: BufferHandle) -> Result<()> {
        self.memory.free(buffer)
    }

    fn buffer_size(&self, buffer: BufferHandle) -> Result<usize> {
        Ok(self.memory.get(buffer)?.bytes.len())
    }

    fn enqueue_write(
        &mut self,
        queue: QueueHandle,
        buffer: BufferHandle,
        data: Arc<[u8]>,
        mode: TransferMode,
    ) -> Result<EventHandle> {
        let context = self.queue(queue)?.context;
        let buffer_size = self.buffer_in(context, buffer)?;
        if data.len() > buffer_size {
            return Err(BackendError::BufferOutOfBounds {
                offset: 0,
                size: data.len(),
                buffer_size,
            });
        }
        let event = self.submit(queue, Command::Write { buffer, data })?;
        if mode == TransferMode::Blocking {
            self.wait(event)?;
        }
        Ok(event)
    }

    fn enqueue_read(&mut self, queue: QueueHandle, buffer: BufferHandle, mode: TransferMode) -> Result<EventHandle> {
        let context = self.queue(queue)?.context;
        self.buffer_in(context, buffer)?;
        let event = self.submit(queue, Command::Read { buffer })?;
        if mode == TransferMode::Blocking {
            self.wait(event)?;
        }
        Ok(event)
    }

    fn take_read(&mut self, event: EventHandle) -> Result<Vec<u8>> {
        self.wait(event)?;
        let record = self
            .events
            .remove(&event)
            .ok_or_else(|| BackendError::invalid_handle("event", event.id()))?;
        match record.status {
            EventStatus::ReadReady(bytes) => Ok(bytes),
            status => {
                self.events.insert(event, EventRecord { status, ..record });
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
        if self.context_device(ctx)? != device {
            return Err(BackendError::invalid_handle("device", device.id()));
        }
        let options = BuildOptions::parse(options).map_err(BackendError::InvalidBuildOptions)?;
        let mut compiled = compiler::compile(source, &options, |decl| self.missing_implementation_warning(decl))
            .map_err(|log| BackendError::BuildFailed { log })?;
        for decl in compiled.kernels.iter().filter(|k| self.registry.contains_key(&k.name)) {
            if !compiled.log.is_empty() {
                compiled.log.push('\n');
            }
            compiled.log.push_str(&format!(
                "note: host backend does not execute the body of '{}'; it runs the built-in implementation",
                decl.name
            ));
        }

        let program = ProgramHandle::new(self.next());
        tracing::debug!(%program, kernels = compiled.kernels.len(), "program_built");
        self.programs.insert(
            program,
            ProgramRecord {
                context: ctx,
                kernels: compiled.kernels,
                log: compiled.log,
            },
        );
        Ok(program)
    }

    fn build_log(&self, program: ProgramHandle) -> Result<String> {
        self.programs
            .get(&program)
            .map(|p| p.log.clone())
            .ok_or_else(|| BackendError::invalid_handle("program", program.id()))
    }

    fn kernel_names(&self, program: ProgramHandle) -> Result<Vec<String>> {
        self.programs
            .get(&program)
            .map(|p| p.kernels.iter().map(|k| k.name.clone()).collect())
            .ok_or_else(|| BackendError::invalid_handle("program", program.id()))
    }

    fn release_program(&mut self, program: ProgramHandle) -> Result<()> {
        self.programs
            .remove(&program)
            .map(|_| ())
            .ok_or_else(|| BackendError::invalid_handle("program", program.id()))
    }

    fn create_kernel(&mut self, program: ProgramHandle, name: &str) -> Result<KernelHandle> {
        let record = self
            .programs
            .get(&program)
            .ok_or_else(|| BackendError::invalid_handle("program", program.id()))?;
        let decl = record
            .kernels
            .iter()
            .find(|k| k.name == name)
            .ok_or_else(|| BackendError::KernelNotFound(name.to_string()))?;
        let implementation = self
            .registry
            .get(name)
            .filter(|k| kernels::signature_mismatch(decl, k.as_ref()).is_none())
            .cloned();
        let kernel_record = KernelRecord {
            context: record.context,
            name: decl.name.clone(),
            params: decl.params.clone(),
            args: vec![None; decl.params.len()],
            implementation,
        };
        let kernel = KernelHandle::new(self.next());
        self.kernels.insert(kernel, kernel_record);
        Ok(kernel)
    }

    fn kernel_arg_count(&self, kernel: KernelHandle) -> Result<u32> {
        self.kernels
            .get(&kernel)
            .map(|k| k.params.len() as u32)
            .ok_or_else(|| BackendError::invalid_handle("kernel", kernel.id()))
    }

    fn set_kernel_arg(&mut self, kernel: KernelHandle, index: u32, arg: KernelArg) -> Result<()> {
        let record = self
            .kernels
            .get(&kernel)
            .ok_or_else(|| BackendError::invalid_handle("kernel", kernel.id()))?;
        let param = record
            .params
            .get(index as usize)
            .ok_or_else(|| BackendError::ArgumentIndexOutOfRange {
                kernel: record.name.clone(),
                index,
                arity: record.params.len() as u32,
            })?;
        let reason = match arg {
            KernelArg::Buffer(_) if !param.pointer => Some(format!("'{}' is passed by value", param.name)),
            KernelArg::Scalar(value) if param.pointer => Some(format!(
                "'{}' is a pointer, got a {} value",
                param.name,
                value.type_name()
            )),
            _ => None,
        };
        if let Some(reason) = reason {
            return Err(BackendError::InvalidArgument {
                kernel: record.name.clone(),
                index,
                reason,
            });
        }
        if let KernelArg::Buffer(buffer) = arg {
            self.buffer_in(record.context, buffer)?;
        }
        if let Some(record) = self.kernels.get_mut(&kernel) {
            record.args[index as usize] = Some(arg);
        }
        Ok(())
    }

    fn release_kernel(&mut self, kernel: KernelHandle) -> Result<()> {
        self.kernels
            .remove(&kernel)
            .map(|_| ())
            .ok_or_else(|| BackendError::invalid_handle("kernel", kernel.id()))
    }

    fn enqueue_kernel(&mut self, queue: QueueHandle, kernel: KernelHandle, work: &WorkSpec) -> Result<EventHandle> {
        let (context, device) = {
            let q = self.queue(queue)?;
            (q.context, q.device)
        };
        let record = self
            .kernels
            .get(&kernel)
            .ok_or_else(|| BackendError::invalid_handle("kernel", kernel.id()))?;
        if record.context != context {
            return Err(BackendError::invalid_handle("kernel", kernel.id()));
        }
        work.validate(&self.device(device)?.info.limits)?;

        let mut args = Vec::with_capacity(record.args.len());
        for (index, arg) in record.args.iter().enumerate() {
            match arg {
                Some(arg) => args.push(*arg),
                None => {
                    return Err(BackendError::UnboundArgument {
                        kernel: record.name.clone(),
                        index: index as u32,
                    })
                }
            }
        }
        let Some(implementation) = record.implementation.clone() else {
            return Err(BackendError::unsupported(format!(
                "kernel `{}` has no host implementation",
                record.name
            )));
        };

        let launch = Launch {
            kernel: record.name.clone(),
            implementation: Some(implementation),
            args,
            work: *work,
        };
        self.submit(queue, Command::Launch(launch))
    }

    fn wait(&mut self, event: EventHandle) -> Result<()> {
        let Some(record) = self.events.get(&event) else {
            if self.queues.values().any(|q| q.has_retired(event)) {
                return Ok(());
            }
            return Err(BackendError::invalid_handle("event", event.id()));
        };
        if matches!(record.status, EventStatus::Queued) {
            let queue = record.queue;
            self.run_queue(queue, Some(event))?;
        }
        match self.events.get(&event).map(|r| &r.status) {
            Some(EventStatus::Failed(reason)) => Err(BackendError::CommandFailed {
                event: event.id(),
                reason: reason.clone(),
            }),
            _ => Ok(()),
        }
    }

    fn finish(&mut self, queue: QueueHandle) -> Result<()> {
        tracing::trace!(%queue, pending = self.queue(queue)?.len(), "queue_finish");
        let failed = self.run_queue(queue, None)?;

        // Completed writes and launches carry nothing left to collect.
        let retired: Vec<EventHandle> = self
            .events
            .iter()
            .filter(|(_, e)| e.queue == queue && matches!(e.status, EventStatus::Complete))
            .map(|(h, _)| *h)
            .collect();
        if let (Some(last), Some(target)) = (retired.iter().max().copied(), self.queues.get_mut(&queue)) {
            target.retire(last);
        }
        for event in &retired {
            self.events.remove(event);
        }

        match failed {
            Some((event, reason)) => Err(BackendError::CommandFailed {
                event: event.id(),
                reason,
            }),
            None => Ok(()),
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DeviceLimits, ScalarArg};

    const VEC_ADD: &str = "__kernel void vec_add(__global const int* A, __global const int* B, __global int* C) {\n\
                           int i = get_global_id(0);\n\
                           C[i] = A[i] + B[i];\n\
                           }\n";

    struct Fixture {
        backend: HostBackend,
        device: DeviceId,
        ctx: ContextHandle,
        queue: QueueHandle,
    }

    fn fixture(config: HostBackendConfig) -> Fixture {
        let mut backend = HostBackend::with_config(config);
        let device = DeviceId::new(0);
        let ctx = backend.create_context(device).unwrap();
        let queue = backend.create_queue(ctx, device).unwrap();
        Fixture {
            backend,
            device,
            ctx,
            queue,
        }
    }

    fn bytes(values: &[i32]) -> Arc<[u8]> {
        Arc::from(bytemuck::cast_slice::<i32, u8>(values))
    }

    #[test]
    fn test_default_discovery() {
        let backend = HostBackend::new();
        let platforms = backend.platforms().unwrap();
        assert_eq!(platforms.len(), 1);
        assert_eq!(platforms[0].name, "Offload Host Emulation");
        let gpus = backend.devices(platforms[0].id, DeviceClass::Gpu).unwrap();
        assert_eq!(gpus.len(), 1);
        assert_eq!(gpus[0].limits, DeviceLimits::default());
        assert!(backend.devices(platforms[0].id, DeviceClass::Cpu).unwrap().is_empty());
        assert!(backend.devices(PlatformId::new(9), DeviceClass::Gpu).is_err());
    }

    #[test]
    fn test_unavailable_device_rejects_context() {
        let mut backend = HostBackend::with_config(HostBackendConfig::single_device(
            HostDeviceSpec::gpu("busy").unavailable(),
        ));
        assert!(matches!(
            backend.create_context(DeviceId::new(0)),
            Err(BackendError::DeviceUnavailable(name)) if name == "busy"
        ));
    }

    #[test]
    fn test_non_blocking_write_runs_at_sync_point() {
        let mut f = fixture(HostBackendConfig::default());
        let buf = f.backend.create_buffer(f.ctx, AccessMode::ReadWrite, 8).unwrap();
        let write = f
            .backend
            .enqueue_write(f.queue, buf, bytes(&[1, 2]), TransferMode::NonBlocking)
            .unwrap();
        assert_eq!(f.backend.queue(f.queue).unwrap().len(), 1);
        f.backend.wait(write).unwrap();
        assert_eq!(f.backend.queue(f.queue).unwrap().len(), 0);

        let read = f.backend.enqueue_read(f.queue, buf, TransferMode::NonBlocking).unwrap();
        let data = f.backend.take_read(read).unwrap();
        assert_eq!(bytemuck::pod_collect_to_vec::<u8, i32>(&data), vec![1, 2]);
        assert!(f.backend.take_read(read).is_err());
    }

    #[test]
    fn test_finish_drops_completed_event_records() {
        let mut f = fixture(HostBackendConfig::default());
        let buf = f.backend.create_buffer(f.ctx, AccessMode::ReadWrite, 8).unwrap();
        let mut writes = Vec::new();
        for round in 0..100 {
            writes.push(
                f.backend
                    .enqueue_write(f.queue, buf, bytes(&[round, round]), TransferMode::NonBlocking)
                    .unwrap(),
            );
            f.backend.finish(f.queue).unwrap();
        }
        assert!(f.backend.events.is_empty());
        for write in writes {
            f.backend.wait(write).unwrap();
        }

        let read = f.backend.enqueue_read(f.queue, buf, TransferMode::NonBlocking).unwrap();
        f.backend.finish(f.queue).unwrap();
        let data = f.backend.take_read(read).unwrap();
        assert_eq!(bytemuck::pod_collect_to_vec::<u8, i32>(&data), vec![99, 99]);
        assert!(f.backend.wait(EventHandle::new(10_000)).is_err());
    }

    #[test]
    fn test_unwritten_buffer_reads_poison() {
        let mut f = fixture(HostBackendConfig::default());
        let buf = f.backend.create_buffer(f.ctx, AccessMode::ReadWrite, 4).unwrap();
        let read = f.backend.enqueue_read(f.queue, buf, TransferMode::Blocking).unwrap();
        assert_eq!(f.backend.take_read(read).unwrap(), vec![memory::POISON_BYTE; 4]);
    }

    #[test]
    fn test_out_of_memory() {
        let mut f = fixture(HostBackendConfig::single_device(HostDeviceSpec::gpu("tiny").with_memory(64)));
        f.backend.create_buffer(f.ctx, AccessMode::ReadOnly, 48).unwrap();
        assert!(matches!(
            f.backend.create_buffer(f.ctx, AccessMode::ReadOnly, 32),
            Err(BackendError::OutOfMemory { requested: 32, available: 16 })
        ));
    }

    #[test]
    fn test_vec_add_end_to_end() {
        let mut f = fixture(HostBackendConfig::default());
        let a = f.backend.create_buffer(f.ctx, AccessMode::ReadOnly, 16).unwrap();
        let b = f.backend.create_buffer(f.ctx, AccessMode::ReadOnly, 16).unwrap();
        let c = f.backend.create_buffer(f.ctx, AccessMode::WriteOnly, 16).unwrap();
        f.backend.enqueue_write(f.queue, a, bytes(&[0, 1, 2, 3]), TransferMode::NonBlocking).unwrap();
        f.backend.enqueue_write(f.queue, b, bytes(&[0, 1, 2, 3]), TransferMode::NonBlocking).unwrap();

        let program = f.backend.build_program(f.ctx, f.device, VEC_ADD, "").unwrap();
        assert_eq!(f.backend.kernel_names(program).unwrap(), vec!["vec_add".to_string()]);
        let kernel = f.backend.create_kernel(program, "vec_add").unwrap();
        assert_eq!(f.backend.kernel_arg_count(kernel).unwrap(), 3);
        for (i, buf) in [a, b, c].into_iter().enumerate() {
            f.backend.set_kernel_arg(kernel, i as u32, buf.into()).unwrap();
        }
        f.backend.enqueue_kernel(f.queue, kernel, &WorkSpec::one_d(4, Some(4))).unwrap();
        let read = f.backend.enqueue_read(f.queue, c, TransferMode::Blocking).unwrap();
        let out = bytemuck::pod_collect_to_vec::<u8, i32>(&f.backend.take_read(read).unwrap());
        assert_eq!(out, vec![0, 2, 4, 6]);
    }

    #[test]
    fn test_build_failure_carries_log() {
        let mut f = fixture(HostBackendConfig::default());
        let broken = VEC_ADD.replace("B[i];", "B[i]");
        match f.backend.build_program(f.ctx, f.device, &broken, "") {
            Err(BackendError::BuildFailed { log }) => assert!(log.contains("expected ';'")),
            other => panic!("expected build failure, got {:?}", other.map(|_| ())),
        }
        assert!(matches!(
            f.backend.build_program(f.ctx, f.device, VEC_ADD, "--bogus"),
            Err(BackendError::InvalidBuildOptions(_))
        ));
    }

    #[test]
    fn test_build_log_notes_emulated_bodies() {
        let mut f = fixture(HostBackendConfig::default());
        assert!(f.backend.emulates_kernels());
        let wrong = VEC_ADD.replace("A[i] + B[i]", "A[i] - B[i] * 7");
        for options in ["", "-w", "-Werror"] {
            let program = f.backend.build_program(f.ctx, f.device, &wrong, options).unwrap();
            let log = f.backend.build_log(program).unwrap();
            assert!(log.contains("does not execute the body of 'vec_add'"), "{log}");
            f.backend.release_program(program).unwrap();
        }
    }

    #[test]
    fn test_unknown_kernel_builds_with_warning_but_cannot_dispatch() {
        let mut f = fixture(HostBackendConfig::default());
        let source = "__kernel void scale(__global int* data, int k) { data[0] *= k; }";
        let program = f.backend.build_program(f.ctx, f.device, source, "").unwrap();
        assert!(f.backend.build_log(program).unwrap().contains("no host implementation"));

        let kernel = f.backend.create_kernel(program, "scale").unwrap();
        let data = f.backend.create_buffer(f.ctx, AccessMode::ReadWrite, 4).unwrap();
        f.backend.set_kernel_arg(kernel, 0, data.into()).unwrap();
        f.backend.set_kernel_arg(kernel, 1, ScalarArg::I32(2).into()).unwrap();
        assert!(matches!(
            f.backend.enqueue_kernel(f.queue, kernel, &WorkSpec::one_d(1, None)),
            Err(BackendError::UnsupportedOperation(_))
        ));
        assert!(matches!(
            f.backend.create_kernel(program, "missing"),
            Err(BackendError::KernelNotFound(name)) if name == "missing"
        ));
    }

    #[test]
    fn test_argument_checks() {
        let mut f = fixture(HostBackendConfig::default());
        let program = f.backend.build_program(f.ctx, f.device, VEC_ADD, "").unwrap();
        let kernel = f.backend.create_kernel(program, "vec_add").unwrap();
        let buf = f.backend.create_buffer(f.ctx, AccessMode::ReadWrite, 16).unwrap();

        assert!(matches!(
            f.backend.set_kernel_arg(kernel, 3, buf.into()),
            Err(BackendError::ArgumentIndexOutOfRange { index: 3, arity: 3, .. })
        ));
        assert!(matches!(
            f.backend.set_kernel_arg(kernel, 0, ScalarArg::I32(1).into()),
            Err(BackendError::InvalidArgument { index: 0, .. })
        ));

        f.backend.set_kernel_arg(kernel, 0, buf.into()).unwrap();
        assert!(matches!(
            f.backend.enqueue_kernel(f.queue, kernel, &WorkSpec::one_d(4, None)),
            Err(BackendError::UnboundArgument { index: 1, .. })
        ));
    }

    #[test]
    fn test_work_spec_checked_against_device_limits() {
        let mut f = fixture(HostBackendConfig::default());
        let program = f.backend.build_program(f.ctx, f.device, VEC_ADD, "").unwrap();
        let kernel = f.backend.create_kernel(program, "vec_add").unwrap();
        let buf = f.backend.create_buffer(f.ctx, AccessMode::ReadWrite, 16).unwrap();
        for i in 0..3 {
            f.backend.set_kernel_arg(kernel, i, buf.into()).unwrap();
        }
        assert!(matches!(
            f.backend.enqueue_kernel(f.queue, kernel, &WorkSpec::one_d(4096, Some(2048))),
            Err(BackendError::InvalidWorkSize(_))
        ));
    }

    #[test]
    fn test_failed_command_surfaces_on_finish() {
        let mut f = fixture(HostBackendConfig::default());
        let program = f.backend.build_program(f.ctx, f.device, VEC_ADD, "").unwrap();
        let kernel = f.backend.create_kernel(program, "vec_add").unwrap();
        let small = f.backend.create_buffer(f.ctx, AccessMode::ReadWrite, 16).unwrap();
        for i in 0..3 {
            f.backend.set_kernel_arg(kernel, i, small.into()).unwrap();
        }
        // Eight work-items over four elements.
        f.backend.enqueue_kernel(f.queue, kernel, &WorkSpec::one_d(8, None)).unwrap();
        assert!(matches!(f.backend.finish(f.queue), Err(BackendError::CommandFailed { .. })));
        f.backend.finish(f.queue).unwrap();
    }

    #[test]
    fn test_release_context_frees_everything() {
        let mut f = fixture(HostBackendConfig::default());
        f.backend.create_buffer(f.ctx, AccessMode::ReadOnly, 1024).unwrap();
        f.backend.create_buffer(f.ctx, AccessMode::ReadOnly, 1024).unwrap();
        assert_eq!(f.backend.used_bytes(f.device), 2048);

        f.backend.release_queue(f.queue).unwrap();
        f.backend.release_context(f.ctx).unwrap();
        assert_eq!(f.backend.live_buffers(), 0);
        assert_eq!(f.backend.live_queues(), 0);
        assert_eq!(f.backend.live_contexts(), 0);
        assert_eq!(f.backend.used_bytes(f.device), 0);
        assert!(f.backend.release_context(f.ctx).is_err());
    }

    #[test]
    fn test_buffers_do_not_cross_contexts() {
        let mut f = fixture(HostBackendConfig::default());
        let other_ctx = f.backend.create_context(f.device).unwrap();
        let foreign = f.backend.create_buffer(other_ctx, AccessMode::ReadWrite, 4).unwrap();
        assert!(matches!(
            f.backend.enqueue_read(f.queue, foreign, TransferMode::Blocking),
            Err(BackendError::InvalidHandle { kind: "buffer", .. })
        ));
    }
}
