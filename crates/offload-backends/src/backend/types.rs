//! Handles, device descriptions and launch geometry shared by all backends.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! define_handle {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub u64);

        impl $name {
            pub const fn new(id: u64) -> Self {
                $name(id)
            }

            pub const fn id(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

define_handle!(
    /// Identifies a platform as reported by [`Backend::platforms`](super::Backend::platforms).
    PlatformId,
    "platform"
);
define_handle!(
    /// Identifies one device of a platform.
    DeviceId,
    "dev"
);
define_handle!(
    /// Context grouping a single device.
    ContextHandle,
    "ctx"
);
define_handle!(
    /// In-order command queue bound to a context and device.
    QueueHandle,
    "queue"
);
define_handle!(
    /// Device memory allocation.
    ///
    /// Buffers are opaque handles managed by the backend.
    BufferHandle,
    "buf"
);
define_handle!(
    /// Compiled program.
    ProgramHandle,
    "prog"
);
define_handle!(
    /// Kernel entry point created from a program.
    KernelHandle,
    "kern"
);
define_handle!(
    /// Completion token for one enqueued command.
    EventHandle,
    "evt"
);

/// Broad class of a compute device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Gpu,
    Cpu,
    Accelerator,
    Other,
}

impl DeviceClass {
    pub const ALL: [DeviceClass; 4] = [DeviceClass::Gpu, DeviceClass::Cpu, DeviceClass::Accelerator, DeviceClass::Other];

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceClass::Gpu => "gpu",
            DeviceClass::Cpu => "cpu",
            DeviceClass::Accelerator => "accelerator",
            DeviceClass::Other => "other",
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How kernels may touch a buffer. Fixed when the buffer is created.
///
/// The host may always write and read any buffer; the mode only restricts
/// what kernels do with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl AccessMode {
    pub fn kernel_can_read(self) -> bool {
        !matches!(self, AccessMode::WriteOnly)
    }

    pub fn kernel_can_write(self) -> bool {
        !matches!(self, AccessMode::ReadOnly)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AccessMode::ReadOnly => "read_only",
            AccessMode::WriteOnly => "write_only",
            AccessMode::ReadWrite => "read_write",
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether an enqueue call returns before the copy completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferMode {
    #[default]
    Blocking,
    NonBlocking,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformInfo {
    pub id: PlatformId,
    pub name: String,
    pub version: String,
}

/// Work-group limits reported by a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceLimits {
    /// Upper bound on the product of local sizes.
    pub max_work_group_size: usize,
    pub max_work_item_dimensions: u32,
    /// Upper bound on the local size of each dimension.
    pub max_work_item_sizes: Vec<usize>,
}

impl DeviceLimits {
    /// Local-size limit for `dim`; zero for dimensions the device lacks.
    pub fn item_limit(&self, dim: usize) -> usize {
        if dim >= self.max_work_item_dimensions as usize {
            return 0;
        }
        self.max_work_item_sizes.get(dim).copied().unwrap_or(0)
    }
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            max_work_group_size: 1024,
            max_work_item_dimensions: 3,
            max_work_item_sizes: vec![1024, 1024, 64],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub platform: PlatformId,
    pub name: String,
    pub class: DeviceClass,
    pub limits: DeviceLimits,
    pub global_mem_size: u64,
}

/// Scalar kernel argument, passed by value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalarArg {
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
}

impl ScalarArg {
    /// Native-endian bytes, as a runtime expects them.
    pub fn to_ne_bytes(self) -> Vec<u8> {
        match self {
            ScalarArg::I32(v) => v.to_ne_bytes().to_vec(),
            ScalarArg::U32(v) => v.to_ne_bytes().to_vec(),
            ScalarArg::I64(v) => v.to_ne_bytes().to_vec(),
            ScalarArg::U64(v) => v.to_ne_bytes().to_vec(),
            ScalarArg::F32(v) => v.to_ne_bytes().to_vec(),
            ScalarArg::F64(v) => v.to_ne_bytes().to_vec(),
        }
    }

    pub fn type_name(self) -> &'static str {
        match self {
            ScalarArg::I32(_) => "int",
            ScalarArg::U32(_) => "uint",
            ScalarArg::I64(_) => "long",
            ScalarArg::U64(_) => "ulong",
            ScalarArg::F32(_) => "float",
            ScalarArg::F64(_) => "double",
        }
    }

    /// Integer view of the value, if it is an integer.
    pub fn as_i64(self) -> Option<i64> {
        match self {
            ScalarArg::I32(v) => Some(v.into()),
            ScalarArg::U32(v) => Some(v.into()),
            ScalarArg::I64(v) => Some(v),
            ScalarArg::U64(v) => i64::try_from(v).ok(),
            ScalarArg::F32(_) | ScalarArg::F64(_) => None,
        }
    }
}

macro_rules! scalar_from {
    ($($ty:ty => $variant:ident),+ $(,)?) => {
        $(
            impl From<$ty> for ScalarArg {
                fn from(value: $ty) -> Self {
                    ScalarArg::$variant(value)
                }
            }
        )+
    };
}

scalar_from!(i32 => I32, u32 => U32, i64 => I64, u64 => U64, f32 => F32, f64 => F64);

/// One positional kernel argument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelArg {
    Buffer(BufferHandle),
    Scalar(ScalarArg),
}

impl From<BufferHandle> for KernelArg {
    fn from(handle: BufferHandle) -> Self {
        KernelArg::Buffer(handle)
    }
}

impl From<ScalarArg> for KernelArg {
    fn from(value: ScalarArg) -> Self {
        KernelArg::Scalar(value)
    }
}

/// Why a [`WorkSpec`] cannot run on a device.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkSpecViolation {
    #[error("global size of dimension {dim} is zero")]
    ZeroGlobal { dim: usize },
    #[error("local size of dimension {dim} is zero")]
    ZeroLocal { dim: usize },
    #[error("global size {global} of dimension {dim} is not a multiple of local size {local}")]
    NotDivisible { dim: usize, global: usize, local: usize },
    #[error("local size {local} of dimension {dim} exceeds the device limit {limit}")]
    ItemLimit { dim: usize, local: usize, limit: usize },
    #[error("work-group of {product} items exceeds the device limit {limit}")]
    GroupLimit { product: usize, limit: usize },
    #[error("{dims}-D dispatch exceeds the device's {limit} dimensions")]
    Dimensions { dims: usize, limit: usize },
}

/// Global and optional local sizes of a 1-D or 2-D launch.
///
/// Dimension 0 is the first index a kernel reads with `get_global_id(0)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkSpec {
    dims: usize,
    global: [usize; 2],
    local: Option<[usize; 2]>,
}

impl WorkSpec {
    pub fn one_d(global: usize, local: Option<usize>) -> Self {
        Self {
            dims: 1,
            global: [global, 1],
            local: local.map(|l| [l, 1]),
        }
    }

    pub fn two_d(global: [usize; 2], local: Option<[usize; 2]>) -> Self {
        Self { dims: 2, global, local }
    }

    pub fn dimensions(&self) -> usize {
        self.dims
    }

    pub fn global(&self) -> &[usize] {
        &self.global[..self.dims]
    }

    pub fn local(&self) -> Option<&[usize]> {
        self.local.as_ref().map(|l| &l[..self.dims])
    }

    pub fn total_work_items(&self) -> usize {
        self.global().iter().product()
    }

    /// Items per work-group, when a local size is set.
    pub fn group_size(&self) -> Option<usize> {
        self.local().map(|l| l.iter().product())
    }

    /// Check this work size against a device's limits.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint: zero sizes, dimensions the
    /// device lacks, a global size that is not a multiple of the local size,
    /// or a local size above the per-dimension or per-group limit.
    pub fn validate(&self, limits: &DeviceLimits) -> Result<(), WorkSpecViolation> {
        if self.dims > limits.max_work_item_dimensions as usize {
            return Err(WorkSpecViolation::Dimensions {
                dims: self.dims,
                limit: limits.max_work_item_dimensions as usize,
            });
        }
        for (dim, &global) in self.global().iter().enumerate() {
            if global == 0 {
                return Err(WorkSpecViolation::ZeroGlobal { dim });
            }
        }
        let Some(local) = self.local() else {
            return Ok(());
        };
        for (dim, (&global, &local)) in self.global().iter().zip(local).enumerate() {
            if local == 0 {
                return Err(WorkSpecViolation::ZeroLocal { dim });
            }
            if global % local != 0 {
                return Err(WorkSpecViolation::NotDivisible { dim, global, local });
            }
            let limit = limits.item_limit(dim);
            if local > limit {
                return Err(WorkSpecViolation::ItemLimit { dim, local, limit });
            }
        }
        let product: usize = local.iter().product();
        if product > limits.max_work_group_size {
            return Err(WorkSpecViolation::GroupLimit {
                product,
                limit: limits.max_work_group_size,
            });
        }
        Ok(())
    }
}

impl fmt::Display for WorkSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |sizes: &[usize]| sizes.iter().map(|s| s.to_string()).collect::<Vec<_>>().join("x");
        write!(f, "global {}", join(self.global()))?;
        match self.local() {
            Some(local) => write!(f, ", local {}", join(local)),
            None => f.write_str(", local auto"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_display() {
        assert_eq!(BufferHandle::new(7).to_string(), "buf7");
        assert_eq!(EventHandle::new(3).to_string(), "evt3");
        assert_eq!(ContextHandle(1).id(), 1);
    }

    #[test]
    fn test_scalar_bytes_are_native_endian() {
        assert_eq!(ScalarArg::from(1024i32).to_ne_bytes(), 1024i32.to_ne_bytes().to_vec());
        assert_eq!(ScalarArg::F64(0.5).to_ne_bytes().len(), 8);
        assert_eq!(ScalarArg::U64(u64::MAX).as_i64(), None);
        assert_eq!(ScalarArg::F32(1.0).as_i64(), None);
    }

    #[test]
    fn test_access_modes() {
        assert!(AccessMode::ReadOnly.kernel_can_read());
        assert!(!AccessMode::ReadOnly.kernel_can_write());
        assert!(!AccessMode::WriteOnly.kernel_can_read());
        assert!(AccessMode::ReadWrite.kernel_can_write());
    }

    #[test]
    fn test_one_d_spec_accessors() {
        let spec = WorkSpec::one_d(4096, Some(1024));
        assert_eq!(spec.dimensions(), 1);
        assert_eq!(spec.global(), &[4096]);
        assert_eq!(spec.local(), Some(&[1024][..]));
        assert_eq!(spec.total_work_items(), 4096);
        assert_eq!(spec.group_size(), Some(1024));
        assert_eq!(spec.to_string(), "global 4096, local 1024");
    }

    #[test]
    fn test_validate_accepts_reference_shapes() {
        let limits = DeviceLimits::default();
        assert!(WorkSpec::one_d(4096, Some(1024)).validate(&limits).is_ok());
        assert!(WorkSpec::two_d([1024, 1024], Some([16, 16])).validate(&limits).is_ok());
        assert!(WorkSpec::two_d([3, 5], None).validate(&limits).is_ok());
    }

    #[test]
    fn test_validate_rejects_each_violation() {
        let limits = DeviceLimits::default();
        assert_eq!(
            WorkSpec::one_d(0, None).validate(&limits),
            Err(WorkSpecViolation::ZeroGlobal { dim: 0 })
        );
        assert_eq!(
            WorkSpec::one_d(100, Some(0)).validate(&limits),
            Err(WorkSpecViolation::ZeroLocal { dim: 0 })
        );
        assert_eq!(
            WorkSpec::one_d(100, Some(32)).validate(&limits),
            Err(WorkSpecViolation::NotDivisible {
                dim: 0,
                global: 100,
                local: 32
            })
        );
        assert_eq!(
            WorkSpec::one_d(4096, Some(2048)).validate(&limits),
            Err(WorkSpecViolation::ItemLimit {
                dim: 0,
                local: 2048,
                limit: 1024
            })
        );
        assert_eq!(
            WorkSpec::two_d([1024, 1024], Some([64, 32])).validate(&limits),
            Err(WorkSpecViolation::GroupLimit {
                product: 2048,
                limit: 1024
            })
        );
    }

    #[test]
    fn test_validate_respects_dimension_count() {
        let limits = DeviceLimits {
            max_work_group_size: 256,
            max_work_item_dimensions: 1,
            max_work_item_sizes: vec![256],
        };
        assert_eq!(
            WorkSpec::two_d([16, 16], None).validate(&limits),
            Err(WorkSpecViolation::Dimensions { dims: 2, limit: 1 })
        );
        assert_eq!(limits.item_limit(1), 0);
    }
}
