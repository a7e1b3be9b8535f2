//! Compute sessions
//!
//! A [`Session`] owns exactly one context and one in-order command queue on a
//! selected device, plus every buffer allocated through it.
//!
//! ## Lifecycle
//!
//! ```text
//! Session::open ──► context ──► queue
//!      │
//!      ├─ alloc_buffer / write / read / finish
//!      ├─ Program<'s>, Kernel<'s>, PendingRead<'s>   (borrow the session)
//!      ▼
//! close: drain + release queue ──► release buffers ──► release context
//! ```
//!
//! Programs, kernels and pending reads borrow the session, so the borrow
//! checker rejects a `close` while any of them is alive. Dropping an open
//! session closes it.
//!
//! ## Transfers
//!
//! Host data handed to [`Session::write`] is copied into an immutable snapshot
//! at enqueue time; the caller may mutate or drop its slice immediately, even
//! for non-blocking writes. A non-blocking [`Session::read`] returns a
//! [`PendingRead`] that owns the destination, so the data cannot be observed
//! before [`PendingRead::wait`].

use crate::backend::SharedBackend;
use crate::error::{Error, Result};
use offload_backends::{
    AccessMode, BackendError, BufferHandle, ContextHandle, DeviceInfo, EventHandle, QueueHandle, TransferMode,
};
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::mem::size_of;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Typed handle to device memory owned by one session.
///
/// Copying the handle does not copy memory. The buffer lives until it is
/// freed or its session closes.
#[derive(Debug)]
pub struct DeviceBuffer<T> {
    handle: BufferHandle,
    session: u64,
    len: usize,
    mode: AccessMode,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for DeviceBuffer<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for DeviceBuffer<T> {}

impl<T> DeviceBuffer<T> {
    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    /// Id of the owning session.
    pub fn session(&self) -> u64 {
        self.session
    }

    /// Number of `T` elements.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn size_bytes(&self) -> usize {
        self.len * size_of::<T>()
    }
}

/// Completion token for an enqueued transfer or kernel launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Event {
    handle: EventHandle,
    session: u64,
}

impl Event {
    pub fn handle(&self) -> EventHandle {
        self.handle
    }
}

/// A device-to-host copy whose data is available after [`wait`](Self::wait).
#[must_use = "the data of a pending read is only available through `wait`"]
pub struct PendingRead<'s, T> {
    session: &'s Session,
    event: EventHandle,
    len: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<'s, T: bytemuck::Pod> PendingRead<'s, T> {
    pub fn event(&self) -> Event {
        self.session.event(self.event)
    }

    /// Block until the copy completes and return the data.
    pub fn wait(self) -> Result<Vec<T>> {
        let bytes = self.session.backend.write().take_read(self.event)?;
        let mut values: Vec<T> = bytemuck::pod_collect_to_vec(&bytes);
        values.truncate(self.len);
        Ok(values)
    }
}

/// One context and one queue on one device.
pub struct Session {
    id: u64,
    backend: SharedBackend,
    device: DeviceInfo,
    context: ContextHandle,
    queue: QueueHandle,
    /// Outstanding buffers, in allocation order.
    buffers: Mutex<Vec<BufferHandle>>,
    closed: bool,
}

impl Session {
    /// Create a context and a command queue on `device`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceUnavailable`] if the device rejects the context.
    #[tracing::instrument(skip(backend, device), fields(device = %device.name))]
    pub fn open(backend: SharedBackend, device: &DeviceInfo) -> Result<Self> {
        let span = offload_tracing::perf_span!("session_open", device = device.name.as_str());
        let (context, queue) = {
            let mut b = backend.write();
            let context = b.create_context(device.id)?;
            let queue = match b.create_queue(context, device.id) {
                Ok(queue) => queue,
                Err(e) => {
                    let _ = b.release_context(context);
                    return Err(e.into());
                }
            };
            (context, queue)
        };
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            session = id,
            %context,
            %queue,
            duration_us = span.elapsed_us(),
            "session_opened"
        );

        Ok(Self {
            id,
            backend,
            device: device.clone(),
            context,
            queue,
            buffers: Mutex::new(Vec::new()),
            closed: false,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    pub fn context(&self) -> ContextHandle {
        self.context
    }

    pub fn queue(&self) -> QueueHandle {
        self.queue
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.lock().len()
    }

    pub(crate) fn backend(&self) -> &SharedBackend {
        &self.backend
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::SessionClosed { session: self.id });
        }
        Ok(())
    }

    /// Check that `buffer` is a live buffer of this session.
    pub(crate) fn check_buffer<T>(&self, buffer: &DeviceBuffer<T>) -> Result<()> {
        self.ensure_open()?;
        if buffer.session != self.id {
            return Err(Error::ForeignBuffer {
                owner: buffer.session,
                session: self.id,
            });
        }
        if !self.buffers.lock().contains(&buffer.handle) {
            return Err(BackendError::invalid_handle("buffer", buffer.handle.id()).into());
        }
        Ok(())
    }

    pub(crate) fn event(&self, handle: EventHandle) -> Event {
        Event {
            handle,
            session: self.id,
        }
    }

    fn check_event(&self, event: &Event) -> Result<()> {
        self.ensure_open()?;
        if event.session != self.id {
            return Err(BackendError::invalid_handle("event", event.handle.id()).into());
        }
        Ok(())
    }

    /// Allocate room for `len` elements of `T`.
    ///
    /// The contents are undefined until written.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfDeviceMemory`] if the device refuses the allocation.
    #[tracing::instrument(skip(self), fields(session = self.id))]
    pub fn alloc_buffer<T: bytemuck::Pod>(&self, mode: AccessMode, len: usize) -> Result<DeviceBuffer<T>> {
        self.ensure_open()?;
        let bytes = len
            .checked_mul(size_of::<T>())
            .ok_or_else(|| Error::shape(format!("{len} elements overflow the address space")))?;
        let handle = self.backend.write().create_buffer(self.context, mode, bytes)?;
        self.buffers.lock().push(handle);
        Ok(DeviceBuffer {
            handle,
            session: self.id,
            len,
            mode,
            _marker: PhantomData,
        })
    }

    /// Release one buffer before the session closes.
    ///
    /// Pending commands are drained first so none of them touches the
    /// released memory.
    pub fn free<T>(&self, buffer: DeviceBuffer<T>) -> Result<()> {
        self.check_buffer(&buffer)?;
        self.finish()?;
        self.backend.write().release_buffer(buffer.handle)?;
        self.buffers.lock().retain(|h| *h != buffer.handle);
        Ok(())
    }

    /// Enqueue a host-to-device copy of `data`.
    ///
    /// `data` is snapshotted before this call returns.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransferFailure`] if `data` is longer than the buffer.
    #[tracing::instrument(skip(self, buffer, data), fields(session = self.id, buffer = %buffer.handle, elements = data.len()))]
    pub fn write<T: bytemuck::Pod>(&self, buffer: &DeviceBuffer<T>, data: &[T], mode: TransferMode) -> Result<Event> {
        self.check_buffer(buffer)?;
        if data.len() > buffer.len {
            return Err(Error::TransferFailure(format!(
                "{} elements do not fit {} of length {}",
                data.len(),
                buffer.handle,
                buffer.len
            )));
        }
        let snapshot: Arc<[u8]> = Arc::from(bytemuck::cast_slice::<T, u8>(data));
        let handle = self
            .backend
            .write()
            .enqueue_write(self.queue, buffer.handle, snapshot, mode)?;
        Ok(self.event(handle))
    }

    /// Enqueue a device-to-host copy of the whole buffer.
    ///
    /// With [`TransferMode::Blocking`] the copy has completed when this
    /// returns and [`PendingRead::wait`] does not block.
    #[tracing::instrument(skip(self, buffer), fields(session = self.id, buffer = %buffer.handle))]
    pub fn read<T: bytemuck::Pod>(&self, buffer: &DeviceBuffer<T>, mode: TransferMode) -> Result<PendingRead<'_, T>> {
        self.check_buffer(buffer)?;
        let event = self.backend.write().enqueue_read(self.queue, buffer.handle, mode)?;
        Ok(PendingRead {
            session: self,
            event,
            len: buffer.len,
            _marker: PhantomData,
        })
    }

    /// Blocking read into `out`, which must match the buffer length.
    pub fn read_into<T: bytemuck::Pod>(&self, buffer: &DeviceBuffer<T>, out: &mut [T]) -> Result<()> {
        if out.len() != buffer.len {
            return Err(Error::TransferFailure(format!(
                "destination of length {} for {} of length {}",
                out.len(),
                buffer.handle,
                buffer.len
            )));
        }
        let values = self.read(buffer, TransferMode::Blocking)?.wait()?;
        out.copy_from_slice(&values);
        Ok(())
    }

    /// Block until `event` has completed.
    pub fn wait(&self, event: &Event) -> Result<()> {
        self.check_event(event)?;
        self.backend.write().wait(event.handle)?;
        Ok(())
    }

    /// Block until every enqueued command has completed.
    pub fn finish(&self) -> Result<()> {
        self.ensure_open()?;
        self.backend.write().finish(self.queue)?;
        Ok(())
    }

    /// Release the queue (after draining it), the outstanding buffers and the
    /// context, in that order. Closing twice is a no-op.
    ///
    /// Every resource is released even if an earlier step fails; the first
    /// failure is returned.
    #[tracing::instrument(skip(self), fields(session = self.id))]
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let _span = offload_tracing::perf_span!("session_close", session = self.id);

        let mut backend = self.backend.write();
        let mut first_error: Option<BackendError> = None;
        if let Err(e) = backend.release_queue(self.queue) {
            first_error.get_or_insert(e);
        }
        let buffers = std::mem::take(&mut *self.buffers.lock());
        for buffer in &buffers {
            if let Err(e) = backend.release_buffer(*buffer) {
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = backend.release_context(self.context) {
            first_error.get_or_insert(e);
        }

        tracing::debug!(session = self.id, freed_buffers = buffers.len(), "session_closed");
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(session = self.id, error = %e, "session_close_failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::share;
    use offload_backends::{DeviceClass, HostBackend, HostBackendConfig, HostDeviceSpec};

    fn open_session() -> Session {
        open_on(share(HostBackend::new()))
    }

    fn open_on(backend: SharedBackend) -> Session {
        let device = {
            let b = backend.read();
            let platform = b.platforms().unwrap()[0].id;
            b.devices(platform, DeviceClass::Gpu).unwrap().remove(0)
        };
        Session::open(backend, &device).unwrap()
    }

    #[test]
    fn test_write_then_read() {
        let session = open_session();
        let buffer = session.alloc_buffer::<i32>(AccessMode::ReadWrite, 4).unwrap();
        session.write(&buffer, &[1, 2, 3, 4], TransferMode::Blocking).unwrap();
        let values = session.read(&buffer, TransferMode::Blocking).unwrap().wait().unwrap();
        assert_eq!(values, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_write_snapshots_host_data() {
        let session = open_session();
        let buffer = session.alloc_buffer::<i32>(AccessMode::ReadWrite, 3).unwrap();
        let mut host = vec![7, 8, 9];
        session.write(&buffer, &host, TransferMode::NonBlocking).unwrap();
        host.iter_mut().for_each(|v| *v = 0);
        let pending = session.read(&buffer, TransferMode::NonBlocking).unwrap();
        assert_eq!(pending.wait().unwrap(), vec![7, 8, 9]);
    }

    #[test]
    fn test_read_into_requires_matching_length() {
        let session = open_session();
        let buffer = session.alloc_buffer::<i32>(AccessMode::ReadWrite, 2).unwrap();
        session.write(&buffer, &[5, 6], TransferMode::Blocking).unwrap();
        let mut out = [0; 2];
        session.read_into(&buffer, &mut out).unwrap();
        assert_eq!(out, [5, 6]);
        let mut short = [0; 1];
        assert!(matches!(
            session.read_into(&buffer, &mut short),
            Err(Error::TransferFailure(_))
        ));
    }

    #[test]
    fn test_oversized_write_rejected() {
        let session = open_session();
        let buffer = session.alloc_buffer::<i32>(AccessMode::ReadOnly, 2).unwrap();
        assert!(matches!(
            session.write(&buffer, &[1, 2, 3], TransferMode::Blocking),
            Err(Error::TransferFailure(_))
        ));
    }

    #[test]
    fn test_wait_on_event() {
        let session = open_session();
        let buffer = session.alloc_buffer::<u32>(AccessMode::ReadWrite, 1).unwrap();
        let event = session.write(&buffer, &[42], TransferMode::NonBlocking).unwrap();
        session.wait(&event).unwrap();
        session.finish().unwrap();
    }

    #[test]
    fn test_closed_session_rejects_operations() {
        let mut session = open_session();
        let buffer = session.alloc_buffer::<i32>(AccessMode::ReadWrite, 1).unwrap();
        session.close().unwrap();
        session.close().unwrap();
        assert!(session.is_closed());
        assert!(matches!(
            session.alloc_buffer::<i32>(AccessMode::ReadWrite, 1),
            Err(Error::SessionClosed { .. })
        ));
        assert!(matches!(
            session.write(&buffer, &[1], TransferMode::Blocking),
            Err(Error::SessionClosed { .. })
        ));
        assert!(matches!(session.finish(), Err(Error::SessionClosed { .. })));
    }

    #[test]
    fn test_foreign_buffer_rejected() {
        let backend = share(HostBackend::new());
        let first = open_on(backend.clone());
        let second = open_on(backend);
        let buffer = first.alloc_buffer::<i32>(AccessMode::ReadWrite, 1).unwrap();
        assert!(matches!(
            second.write(&buffer, &[1], TransferMode::Blocking),
            Err(Error::ForeignBuffer { owner, session }) if owner == first.id() && session == second.id()
        ));
    }

    #[test]
    fn test_close_releases_everything() {
        let host = share(HostBackend::new());
        {
            let session = open_on(host.clone());
            session.alloc_buffer::<i32>(AccessMode::ReadOnly, 16).unwrap();
            session.alloc_buffer::<i32>(AccessMode::WriteOnly, 16).unwrap();
            assert_eq!(session.live_buffers(), 2);
        }
        let guard = host.read();
        let host = guard.as_any().downcast_ref::<HostBackend>().unwrap();
        assert_eq!(host.live_buffers(), 0);
        assert_eq!(host.live_contexts(), 0);
        assert_eq!(host.live_queues(), 0);
    }

    #[test]
    fn test_free_buffer() {
        let session = open_session();
        let buffer = session.alloc_buffer::<i32>(AccessMode::ReadWrite, 4).unwrap();
        session.free(buffer).unwrap();
        assert_eq!(session.live_buffers(), 0);
        assert!(matches!(session.free(buffer), Err(Error::Backend(BackendError::InvalidHandle { .. }))));
    }

    #[test]
    fn test_out_of_device_memory() {
        let config = HostBackendConfig::single_device(HostDeviceSpec::gpu("tiny").with_memory(64));
        let session = open_on(share(HostBackend::with_config(config)));
        session.alloc_buffer::<i32>(AccessMode::ReadWrite, 16).unwrap();
        assert!(matches!(
            session.alloc_buffer::<i32>(AccessMode::ReadWrite, 1),
            Err(Error::OutOfDeviceMemory { requested: 4, available: 0 })
        ));
    }

    #[test]
    fn test_unavailable_device() {
        let config = HostBackendConfig::single_device(HostDeviceSpec::gpu("busy").unavailable());
        let backend = share(HostBackend::with_config(config));
        let device = {
            let b = backend.read();
            b.devices(b.platforms().unwrap()[0].id, DeviceClass::Gpu).unwrap().remove(0)
        };
        assert!(matches!(Session::open(backend, &device), Err(Error::DeviceUnavailable(_))));
    }
}
