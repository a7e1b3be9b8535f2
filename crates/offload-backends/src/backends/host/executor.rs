//! Kernel launches on the host backend
//!
//! ```text
//! launch ──► capture args (decode buffers once)
//!        ──► work-groups in parallel (rayon)
//!              └─ work-items in order, each yields (element, value)
//!        ──► scatter results into the output buffer
//! ```
//!
//! Results are applied after every work-item has run, so a kernel reading
//! and writing the same buffer sees its pre-launch contents.

use super::kernels::{BoundArg, BufferView, HostKernel, KernelArgs, ParamKind, WorkItem};
use super::memory::MemoryManager;
use crate::backend::{KernelArg, WorkSpec};
use crate::error::{BackendError, Result};
use rayon::prelude::*;
use std::sync::Arc;

/// Largest work-group edge picked when the launch leaves the local size open.
const DEFAULT_GROUP_EDGE: usize = 64;

/// Everything a queued launch needs, captured at enqueue time.
pub(crate) struct Launch {
    pub kernel: String,
    pub implementation: Option<Arc<dyn HostKernel>>,
    pub args: Vec<KernelArg>,
    pub work: WorkSpec,
}

/// Run `launch` to completion and return the number of work-items executed.
pub(crate) fn execute(launch: &Launch, memory: &mut MemoryManager) -> Result<usize> {
    let implementation = launch.implementation.as_ref().ok_or_else(|| {
        BackendError::unsupported(format!("kernel `{}` has no host implementation", launch.kernel))
    })?;

    let args = capture_args(launch, implementation.as_ref(), memory)?;
    let output = implementation.output();
    let output_handle = match launch.args.get(output) {
        Some(KernelArg::Buffer(handle)) => *handle,
        _ => {
            return Err(BackendError::execution_error(format!(
                "output argument {output} of `{}` is not a buffer",
                launch.kernel
            )))
        }
    };
    let output_mode = memory.get(output_handle)?.mode;
    if !output_mode.kernel_can_write() {
        return Err(BackendError::AccessViolation {
            buffer: output_handle.id(),
            mode: output_mode,
            operation: "kernel write",
        });
    }

    let global = padded(launch.work.global());
    let local = match launch.work.local() {
        Some(local) => padded(local),
        None => default_local(global),
    };
    let groups = [global[0] / local[0], global[1] / local[1]];
    let group_count = groups[0] * groups[1];

    let writes = (0..group_count)
        .into_par_iter()
        .map(|flat| -> Result<Vec<(usize, i32)>> {
            let group_id = [flat % groups[0], flat / groups[0]];
            let mut results = Vec::with_capacity(local[0] * local[1]);
            for ly in 0..local[1] {
                for lx in 0..local[0] {
                    let item = WorkItem {
                        global_id: [group_id[0] * local[0] + lx, group_id[1] * local[1] + ly],
                        local_id: [lx, ly],
                        group_id,
                    };
                    if let Some(write) = implementation.work_item(&item, &args)? {
                        results.push(write);
                    }
                }
            }
            Ok(results)
        })
        .collect::<Result<Vec<_>>>()?;

    let target = memory.get_mut(output_handle)?;
    let buffer_size = target.bytes.len();
    for (element, value) in writes.into_iter().flatten() {
        let offset = element * 4;
        let slot = target
            .bytes
            .get_mut(offset..offset + 4)
            .ok_or(BackendError::BufferOutOfBounds {
                offset,
                size: 4,
                buffer_size,
            })?;
        slot.copy_from_slice(&value.to_ne_bytes());
    }

    Ok(launch.work.total_work_items())
}

fn capture_args(launch: &Launch, implementation: &dyn HostKernel, memory: &MemoryManager) -> Result<KernelArgs> {
    let signature = implementation.signature();
    let mut args = Vec::with_capacity(launch.args.len());
    for (index, (arg, kind)) in launch.args.iter().zip(signature).enumerate() {
        let bound = match (arg, kind) {
            (KernelArg::Buffer(handle), ParamKind::Buffer(_)) => {
                let allocation = memory.get(*handle)?;
                BoundArg::Buffer(BufferView {
                    handle: *handle,
                    mode: allocation.mode,
                    elements: bytemuck::pod_collect_to_vec::<u8, i32>(&allocation.bytes),
                })
            }
            (KernelArg::Scalar(value), ParamKind::Scalar(_)) => BoundArg::Scalar(*value),
            (_, kind) => {
                return Err(BackendError::execution_error(format!(
                    "argument {index} of `{}` must be {kind:?}",
                    launch.kernel
                )))
            }
        };
        args.push(bound);
    }
    Ok(KernelArgs { args })
}

fn padded(sizes: &[usize]) -> [usize; 2] {
    [sizes.first().copied().unwrap_or(1), sizes.get(1).copied().unwrap_or(1)]
}

/// Group shape used when the launch does not fix one: the largest divisor of
/// dimension 0 up to [`DEFAULT_GROUP_EDGE`], one row in dimension 1.
fn default_local(global: [usize; 2]) -> [usize; 2] {
    let edge = (1..=DEFAULT_GROUP_EDGE.min(global[0]))
        .rev()
        .find(|l| global[0] % l == 0)
        .unwrap_or(1);
    [edge, 1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{AccessMode, ContextHandle, DeviceId};
    use crate::backends::host::kernels::{MatMul, VecAdd};

    const CTX: ContextHandle = ContextHandle::new(1);
    const DEV: DeviceId = DeviceId::new(0);

    fn upload(memory: &mut MemoryManager, mode: AccessMode, data: &[i32]) -> crate::backend::BufferHandle {
        let handle = memory.allocate(CTX, DEV, u64::MAX, mode, data.len() * 4).unwrap();
        memory.copy_to_buffer(handle, bytemuck::cast_slice(data)).unwrap();
        handle
    }

    fn download(memory: &MemoryManager, handle: crate::backend::BufferHandle) -> Vec<i32> {
        bytemuck::pod_collect_to_vec(&memory.copy_from_buffer(handle).unwrap())
    }

    #[test]
    fn test_vec_add_launch() {
        let mut memory = MemoryManager::new();
        let data: Vec<i32> = (0..128).collect();
        let a = upload(&mut memory, AccessMode::ReadOnly, &data);
        let b = upload(&mut memory, AccessMode::ReadOnly, &data);
        let c = memory.allocate(CTX, DEV, u64::MAX, AccessMode::WriteOnly, 128 * 4).unwrap();

        let launch = Launch {
            kernel: "vec_add".into(),
            implementation: Some(Arc::new(VecAdd)),
            args: vec![a.into(), b.into(), c.into()],
            work: WorkSpec::one_d(128, Some(32)),
        };
        assert_eq!(execute(&launch, &mut memory).unwrap(), 128);
        let expected: Vec<i32> = (0..128).map(|i| i * 2).collect();
        assert_eq!(download(&memory, c), expected);
    }

    #[test]
    fn test_mat_mul_launch_without_local_size() {
        let mut memory = MemoryManager::new();
        let a = upload(&mut memory, AccessMode::ReadOnly, &[1, 2, 3, 4]);
        let b = upload(&mut memory, AccessMode::ReadOnly, &[5, 6, 7, 8]);
        let c = memory.allocate(CTX, DEV, u64::MAX, AccessMode::WriteOnly, 16).unwrap();

        let launch = Launch {
            kernel: "mat_mul".into(),
            implementation: Some(Arc::new(MatMul)),
            args: vec![a.into(), b.into(), c.into(), KernelArg::Scalar(2i32.into()), KernelArg::Scalar(2i32.into()), KernelArg::Scalar(2i32.into())],
            work: WorkSpec::two_d([2, 2], None),
        };
        execute(&launch, &mut memory).unwrap();
        assert_eq!(download(&memory, c), vec![19, 22, 43, 50]);
    }

    #[test]
    fn test_read_only_output_rejected() {
        let mut memory = MemoryManager::new();
        let a = upload(&mut memory, AccessMode::ReadOnly, &[1, 2]);
        let launch = Launch {
            kernel: "vec_add".into(),
            implementation: Some(Arc::new(VecAdd)),
            args: vec![a.into(), a.into(), a.into()],
            work: WorkSpec::one_d(2, None),
        };
        assert!(matches!(
            execute(&launch, &mut memory),
            Err(BackendError::AccessViolation { operation: "kernel write", .. })
        ));
    }

    #[test]
    fn test_missing_implementation() {
        let mut memory = MemoryManager::new();
        let launch = Launch {
            kernel: "mystery".into(),
            implementation: None,
            args: vec![],
            work: WorkSpec::one_d(1, None),
        };
        assert!(matches!(
            execute(&launch, &mut memory),
            Err(BackendError::UnsupportedOperation(_))
        ));
    }

    #[test]
    fn test_oversized_range_reports_out_of_bounds() {
        let mut memory = MemoryManager::new();
        let a = upload(&mut memory, AccessMode::ReadOnly, &[1; 8]);
        let c = memory.allocate(CTX, DEV, u64::MAX, AccessMode::ReadWrite, 8 * 4).unwrap();
        let launch = Launch {
            kernel: "vec_add".into(),
            implementation: Some(Arc::new(VecAdd)),
            args: vec![a.into(), a.into(), c.into()],
            work: WorkSpec::one_d(16, Some(8)),
        };
        assert!(matches!(
            execute(&launch, &mut memory),
            Err(BackendError::BufferOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_default_local() {
        assert_eq!(default_local([4096, 1]), [64, 1]);
        assert_eq!(default_local([100, 7]), [50, 1]);
        assert_eq!(default_local([7, 3]), [7, 1]);
    }
}
