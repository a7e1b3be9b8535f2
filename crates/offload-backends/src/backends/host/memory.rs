//! Device memory for the host backend
//!
//! Each allocation is a plain byte vector tagged with the context and device
//! it belongs to. Usage is tracked per device so that allocations past the
//! configured global memory size fail the way a real device would.

use crate::backend::{AccessMode, BufferHandle, ContextHandle, DeviceId};
use crate::error::{BackendError, Result};
use std::collections::HashMap;

/// Byte written into fresh allocations so reads of unwritten memory are
/// recognisable rather than zero.
pub(crate) const POISON_BYTE: u8 = 0xA5;

pub(crate) struct Allocation {
    pub context: ContextHandle,
    pub device: DeviceId,
    pub mode: AccessMode,
    pub bytes: Vec<u8>,
}

pub(crate) struct MemoryManager {
    buffers: HashMap<BufferHandle, Allocation>,
    used: HashMap<DeviceId, u64>,
    /// Never reused, so a released handle can not alias a later buffer.
    next_buffer_id: u64,
}

impl MemoryManager {
    pub fn new() -> Self {
        Self {
            buffers: HashMap::new(),
            used: HashMap::new(),
            next_buffer_id: 1,
        }
    }

    pub fn allocate(
        &mut self,
        context: ContextHandle,
        device: DeviceId,
        capacity: u64,
        mode: AccessMode,
        size: usize,
    ) -> Result<BufferHandle> {
        if size == 0 {
            return Err(BackendError::InvalidBufferSize(size));
        }
        let used = self.used.get(&device).copied().unwrap_or(0);
        let available = capacity.saturating_sub(used);
        if size as u64 > available {
            return Err(BackendError::OutOfMemory {
                requested: size as u64,
                available,
            });
        }

        let handle = BufferHandle::new(self.next_buffer_id);
        self.next_buffer_id += 1;
        *self.used.entry(device).or_insert(0) += size as u64;
        self.buffers.insert(
            handle,
            Allocation {
                context,
                device,
                mode,
                bytes: vec![POISON_BYTE; size],
            },
        );
        Ok(handle)
    }

    pub fn free(&mut self, handle: BufferHandle) -> Result<()> {
        let allocation = self
            .buffers
            .remove(&handle)
            .ok_or_else(|| BackendError::invalid_handle("buffer", handle.id()))?;
        self.release_bytes(allocation.device, allocation.bytes.len());
        Ok(())
    }

    /// Free every buffer of `context`; returns how many were still live.
    pub fn free_context(&mut self, context: ContextHandle) -> usize {
        let doomed: Vec<BufferHandle> = self
            .buffers
            .iter()
            .filter(|(_, alloc)| alloc.context == context)
            .map(|(handle, _)| *handle)
            .collect();
        for handle in &doomed {
            if let Some(allocation) = self.buffers.remove(handle) {
                self.release_bytes(allocation.device, allocation.bytes.len());
            }
        }
        doomed.len()
    }

    fn release_bytes(&mut self, device: DeviceId, size: usize) {
        if let Some(used) = self.used.get_mut(&device) {
            *used = used.saturating_sub(size as u64);
        }
    }

    pub fn get(&self, handle: BufferHandle) -> Result<&Allocation> {
        self.buffers
            .get(&handle)
            .ok_or_else(|| BackendError::invalid_handle("buffer", handle.id()))
    }

    pub fn get_mut(&mut self, handle: BufferHandle) -> Result<&mut Allocation> {
        self.buffers
            .get_mut(&handle)
            .ok_or_else(|| BackendError::invalid_handle("buffer", handle.id()))
    }

    /// Host-to-device copy into the start of the buffer.
    pub fn copy_to_buffer(&mut self, handle: BufferHandle, data: &[u8]) -> Result<()> {
        let allocation = self.get_mut(handle)?;
        let buffer_size = allocation.bytes.len();
        if data.len() > buffer_size {
            return Err(BackendError::BufferOutOfBounds {
                offset: 0,
                size: data.len(),
                buffer_size,
            });
        }
        allocation.bytes[..data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn copy_from_buffer(&self, handle: BufferHandle) -> Result<Vec<u8>> {
        Ok(self.get(handle)?.bytes.clone())
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn used_bytes(&self, device: DeviceId) -> u64 {
        self.used.get(&device).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CTX: ContextHandle = ContextHandle::new(1);
    const DEV: DeviceId = DeviceId::new(0);

    #[test]
    fn test_allocation_is_poisoned() {
        let mut memory = MemoryManager::new();
        let handle = memory.allocate(CTX, DEV, 1024, AccessMode::ReadWrite, 8).unwrap();
        assert_eq!(memory.copy_from_buffer(handle).unwrap(), vec![POISON_BYTE; 8]);
        assert_eq!(memory.used_bytes(DEV), 8);
    }

    #[test]
    fn test_capacity_is_enforced() {
        let mut memory = MemoryManager::new();
        memory.allocate(CTX, DEV, 100, AccessMode::ReadOnly, 60).unwrap();
        let err = memory.allocate(CTX, DEV, 100, AccessMode::ReadOnly, 60).unwrap_err();
        assert!(matches!(
            err,
            BackendError::OutOfMemory {
                requested: 60,
                available: 40
            }
        ));
    }

    #[test]
    fn test_free_returns_capacity() {
        let mut memory = MemoryManager::new();
        let a = memory.allocate(CTX, DEV, 100, AccessMode::ReadOnly, 100).unwrap();
        memory.free(a).unwrap();
        assert_eq!(memory.used_bytes(DEV), 0);
        let b = memory.allocate(CTX, DEV, 100, AccessMode::ReadOnly, 100).unwrap();
        assert_ne!(a, b, "handles are never reused");
        assert!(matches!(memory.free(a), Err(BackendError::InvalidHandle { .. })));
    }

    #[test]
    fn test_zero_sized_buffer_rejected() {
        let mut memory = MemoryManager::new();
        assert!(matches!(
            memory.allocate(CTX, DEV, 100, AccessMode::ReadOnly, 0),
            Err(BackendError::InvalidBufferSize(0))
        ));
    }

    #[test]
    fn test_free_context_only_touches_its_buffers() {
        let mut memory = MemoryManager::new();
        let other = ContextHandle::new(2);
        memory.allocate(CTX, DEV, 1024, AccessMode::ReadOnly, 16).unwrap();
        memory.allocate(CTX, DEV, 1024, AccessMode::ReadOnly, 16).unwrap();
        let kept = memory.allocate(other, DEV, 1024, AccessMode::ReadOnly, 16).unwrap();

        assert_eq!(memory.free_context(CTX), 2);
        assert_eq!(memory.live_buffers(), 1);
        assert!(memory.get(kept).is_ok());
        assert_eq!(memory.used_bytes(DEV), 16);
    }

    #[test]
    fn test_oversized_write_rejected() {
        let mut memory = MemoryManager::new();
        let handle = memory.allocate(CTX, DEV, 1024, AccessMode::ReadWrite, 4).unwrap();
        assert!(matches!(
            memory.copy_to_buffer(handle, &[0u8; 8]),
            Err(BackendError::BufferOutOfBounds { size: 8, buffer_size: 4, .. })
        ));
        memory.copy_to_buffer(handle, &[1, 2]).unwrap();
        assert_eq!(memory.copy_from_buffer(handle).unwrap(), vec![1, 2, POISON_BYTE, POISON_BYTE]);
    }
}
