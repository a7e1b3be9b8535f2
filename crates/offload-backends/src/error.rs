//! Error types for backend operations

use crate::backend::{AccessMode, WorkSpecViolation};

/// Result type for backend operations
pub type Result<T> = std::result::Result<T, BackendError>;

/// Errors raised by a device runtime.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// A handle that the backend does not know, or one that was already released.
    #[error("invalid {kind} handle: {id}")]
    InvalidHandle { kind: &'static str, id: u64 },

    /// The device refused an allocation.
    #[error("device memory exhausted: requested {requested} bytes, {available} bytes available")]
    OutOfMemory { requested: u64, available: u64 },

    /// Zero-byte buffers are rejected by every runtime.
    #[error("invalid buffer size: {0} bytes")]
    InvalidBufferSize(usize),

    /// The device exists but would not accept a context.
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Program compilation failed; `log` is the compiler output.
    #[error("program build failed")]
    BuildFailed { log: String },

    /// Build options the compiler does not understand.
    #[error("invalid build options: {0}")]
    InvalidBuildOptions(String),

    #[error("kernel not found: {0}")]
    KernelNotFound(String),

    #[error("argument index {index} out of range for kernel `{kernel}` ({arity} arguments)")]
    ArgumentIndexOutOfRange { kernel: String, index: u32, arity: u32 },

    #[error("argument {index} of kernel `{kernel}` is not bound")]
    UnboundArgument { kernel: String, index: u32 },

    /// A buffer bound to a by-value slot, or a scalar bound to a pointer slot.
    #[error("invalid value for argument {index} of kernel `{kernel}`: {reason}")]
    InvalidArgument { kernel: String, index: u32, reason: String },

    /// Buffer access out of bounds
    #[error("buffer access out of bounds: offset {offset} + size {size} > buffer size {buffer_size}")]
    BufferOutOfBounds {
        offset: usize,
        size: usize,
        buffer_size: usize,
    },

    /// A transfer or kernel touched a buffer against its access mode.
    #[error("{operation} not permitted on {mode} buffer buf{buffer}")]
    AccessViolation {
        buffer: u64,
        mode: AccessMode,
        operation: &'static str,
    },

    #[error("invalid work size: {0}")]
    InvalidWorkSize(#[from] WorkSpecViolation),

    /// A queued command failed when the queue reached it.
    #[error("command for event evt{event} failed: {reason}")]
    CommandFailed { event: u64, reason: String },

    #[error("transfer failed: {0}")]
    TransferFailed(String),

    /// Execution error
    #[error("execution error: {0}")]
    ExecutionError(String),

    /// Unsupported operation
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// A native runtime call returned a status code.
    #[error("{operation} failed with runtime status {code}")]
    Runtime { operation: &'static str, code: i32 },
}

impl BackendError {
    pub fn invalid_handle(kind: &'static str, id: u64) -> Self {
        Self::InvalidHandle { kind, id }
    }

    /// Create an execution error
    pub fn execution_error(msg: impl Into<String>) -> Self {
        Self::ExecutionError(msg.into())
    }

    /// Create an unsupported operation error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::UnsupportedOperation(msg.into())
    }

    pub fn transfer(msg: impl Into<String>) -> Self {
        Self::TransferFailed(msg.into())
    }
}
