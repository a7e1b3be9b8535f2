//! Backend trait and the types that cross it

mod traits;
mod types;

pub use traits::Backend;
pub use types::{
    AccessMode, BufferHandle, ContextHandle, DeviceClass, DeviceId, DeviceInfo, DeviceLimits, EventHandle, KernelArg,
    KernelHandle, PlatformId, PlatformInfo, ProgramHandle, QueueHandle, ScalarArg, TransferMode, WorkSpec,
    WorkSpecViolation,
};
