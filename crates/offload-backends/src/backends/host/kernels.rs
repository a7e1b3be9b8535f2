//! Host implementations of kernel entry points
//!
//! A source built on the host backend is bound entry point by entry point
//! to a [`HostKernel`] with the same name and parameter list. Each work-item
//! produces at most one element of the kernel's output buffer.

use super::compiler::{AddressSpace, KernelDecl};
use crate::backend::{AccessMode, BufferHandle, ScalarArg};
use crate::error::{BackendError, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Declared kind of one kernel parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// `__global T*` with the given element type.
    Buffer(&'static str),
    /// By-value scalar of the given type.
    Scalar(&'static str),
}

impl ParamKind {
    fn render(self) -> String {
        match self {
            ParamKind::Buffer(ty) => format!("__global {ty}*"),
            ParamKind::Scalar(ty) => ty.to_string(),
        }
    }
}

/// Position of one work-item in the launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkItem {
    pub global_id: [usize; 2],
    pub local_id: [usize; 2],
    pub group_id: [usize; 2],
}

/// Buffer contents as seen by a launch.
#[derive(Debug)]
pub(crate) struct BufferView {
    pub handle: BufferHandle,
    pub mode: AccessMode,
    pub elements: Vec<i32>,
}

#[derive(Debug)]
pub(crate) enum BoundArg {
    Buffer(BufferView),
    Scalar(ScalarArg),
}

/// Arguments of one launch, captured before any work-item runs.
#[derive(Debug)]
pub struct KernelArgs {
    pub(crate) args: Vec<BoundArg>,
}

impl KernelArgs {
    fn buffer(&self, index: usize) -> Result<&BufferView> {
        match self.args.get(index) {
            Some(BoundArg::Buffer(view)) => Ok(view),
            Some(BoundArg::Scalar(_)) => Err(BackendError::execution_error(format!(
                "argument {index} is a scalar, expected a buffer"
            ))),
            None => Err(BackendError::execution_error(format!("argument {index} is missing"))),
        }
    }

    fn readable(&self, index: usize) -> Result<&BufferView> {
        let view = self.buffer(index)?;
        if !view.mode.kernel_can_read() {
            return Err(BackendError::AccessViolation {
                buffer: view.handle.id(),
                mode: view.mode,
                operation: "kernel read",
            });
        }
        Ok(view)
    }

    /// Element `element` of the `int` buffer bound at `index`.
    pub fn load(&self, index: usize, element: usize) -> Result<i32> {
        let view = self.readable(index)?;
        view.elements
            .get(element)
            .copied()
            .ok_or(BackendError::BufferOutOfBounds {
                offset: element * 4,
                size: 4,
                buffer_size: view.elements.len() * 4,
            })
    }

    /// `len` consecutive elements starting at `start`.
    pub fn load_run(&self, index: usize, start: usize, len: usize) -> Result<&[i32]> {
        let view = self.readable(index)?;
        view.elements
            .get(start..start + len)
            .ok_or(BackendError::BufferOutOfBounds {
                offset: start * 4,
                size: len * 4,
                buffer_size: view.elements.len() * 4,
            })
    }

    /// Scalar bound at `index` as a non-negative size.
    pub fn extent(&self, index: usize) -> Result<usize> {
        match self.args.get(index) {
            Some(BoundArg::Scalar(value)) => value
                .as_i64()
                .and_then(|v| usize::try_from(v).ok())
                .ok_or_else(|| BackendError::execution_error(format!("argument {index} must be a non-negative integer"))),
            _ => Err(BackendError::execution_error(format!(
                "argument {index} is not a scalar"
            ))),
        }
    }
}

/// Host-side body of a kernel entry point.
pub trait HostKernel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Parameters in declaration order.
    fn signature(&self) -> &'static [ParamKind];

    /// Index of the `int` buffer argument the kernel writes.
    fn output(&self) -> usize;

    /// Run one work-item. Returns the output element it writes, if any.
    fn work_item(&self, item: &WorkItem, args: &KernelArgs) -> Result<Option<(usize, i32)>>;
}

/// Check a declared kernel against a host implementation.
///
/// Returns a description of the difference when they disagree.
pub(crate) fn signature_mismatch(decl: &KernelDecl, kernel: &dyn HostKernel) -> Option<String> {
    let expected = kernel.signature();
    let agrees = decl.params.len() == expected.len()
        && decl.params.iter().zip(expected).all(|(param, kind)| match kind {
            ParamKind::Buffer(ty) => {
                param.pointer
                    && param.base_type == *ty
                    && matches!(param.address_space, AddressSpace::Global | AddressSpace::Constant)
            }
            ParamKind::Scalar(ty) => !param.pointer && param.base_type == *ty,
        });
    if agrees {
        return None;
    }
    let wanted = expected.iter().map(|k| k.render()).collect::<Vec<_>>().join(", ");
    Some(format!(
        "kernel '{}' does not match the host implementation ({wanted}); dispatching it will fail",
        decl.name
    ))
}

/// `C[i] = A[i] + B[i]` over a 1-D range.
pub struct VecAdd;

impl HostKernel for VecAdd {
    fn name(&self) -> &'static str {
        "vec_add"
    }

    fn signature(&self) -> &'static [ParamKind] {
        &[ParamKind::Buffer("int"), ParamKind::Buffer("int"), ParamKind::Buffer("int")]
    }

    fn output(&self) -> usize {
        2
    }

    fn work_item(&self, item: &WorkItem, args: &KernelArgs) -> Result<Option<(usize, i32)>> {
        let i = item.global_id[0];
        let sum = args.load(0, i)?.wrapping_add(args.load(1, i)?);
        Ok(Some((i, sum)))
    }
}

/// Naive `C = A * B` over a 2-D range; dimension 0 is the row.
///
/// Arguments: `A` (rows x inner), `B` (inner x cols), `C` (rows x cols),
/// then `rows`, `cols` and `inner`.
pub struct MatMul;

impl HostKernel for MatMul {
    fn name(&self) -> &'static str {
        "mat_mul"
    }

    fn signature(&self) -> &'static [ParamKind] {
        &[
            ParamKind::Buffer("int"),
            ParamKind::Buffer("int"),
            ParamKind::Buffer("int"),
            ParamKind::Scalar("int"),
            ParamKind::Scalar("int"),
            ParamKind::Scalar("int"),
        ]
    }

    fn output(&self) -> usize {
        2
    }

    fn work_item(&self, item: &WorkItem, args: &KernelArgs) -> Result<Option<(usize, i32)>> {
        let [row, col] = item.global_id;
        let rows = args.extent(3)?;
        let cols = args.extent(4)?;
        let inner = args.extent(5)?;
        if row >= rows || col >= cols {
            return Ok(None);
        }
        let a_row = args.load_run(0, row * inner, inner)?;
        let mut acc = 0i32;
        for (k, &a) in a_row.iter().enumerate() {
            acc = acc.wrapping_add(a.wrapping_mul(args.load(1, k * cols + col)?));
        }
        Ok(Some((row * cols + col, acc)))
    }
}

/// Kernels available to every [`HostBackend`](super::HostBackend).
pub(crate) fn builtin_kernels() -> HashMap<String, Arc<dyn HostKernel>> {
    let kernels: [Arc<dyn HostKernel>; 2] = [Arc::new(VecAdd), Arc::new(MatMul)];
    kernels.into_iter().map(|k| (k.name().to_string(), k)).collect()
}
