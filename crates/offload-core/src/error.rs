//! Error types for offload-core operations

use offload_backends::BackendError;
use std::path::PathBuf;

/// Result type for offload-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while orchestrating a device computation
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The runtime reported no platforms at all.
    #[error("no compute platform found on the {backend} backend")]
    NoPlatformFound { backend: &'static str },

    /// No device of the requested class, or the device refused a context.
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("out of device memory: requested {requested} bytes, {available} bytes available")]
    OutOfDeviceMemory { requested: u64, available: u64 },

    /// Kernel compilation failed; `log` is the compiler output, verbatim.
    #[error("kernel build failed")]
    Build { log: String },

    #[error("kernel entry point not found: {0}")]
    EntryPointNotFound(String),

    #[error("argument {index} of kernel `{kernel}` is not bound")]
    UnboundArgument { kernel: String, index: u32 },

    #[error("argument index {index} out of range for kernel `{kernel}` ({arity} arguments)")]
    ArgumentIndexOutOfRange { kernel: String, index: u32, arity: u32 },

    /// The work shape cannot be partitioned for the device.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("transfer failed: {0}")]
    TransferFailure(String),

    /// Device output differs from the host reference. `None` marks a missing
    /// element when the two sides differ in length.
    #[error("verification mismatch at index {index}: expected {expected:?}, got {actual:?}")]
    VerificationMismatch {
        index: usize,
        expected: Option<i32>,
        actual: Option<i32>,
    },

    #[error("session {session} is closed")]
    SessionClosed { session: u64 },

    #[error("buffer belongs to session {owner}, not session {session}")]
    ForeignBuffer { owner: u64, session: u64 },

    /// Problem inputs that violate their own shape.
    #[error("invalid problem: {0}")]
    InvalidProblem(String),

    #[error("cannot read kernel source {}: {source}", path.display())]
    KernelSource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Backend(BackendError),
}

impl Error {
    pub fn shape(msg: impl Into<String>) -> Self {
        Self::ShapeMismatch(msg.into())
    }

    pub fn invalid_problem(msg: impl Into<String>) -> Self {
        Self::InvalidProblem(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// True for failures caused by the machine rather than the inputs.
    pub fn is_environment(&self) -> bool {
        matches!(
            self,
            Self::NoPlatformFound { .. } | Self::DeviceUnavailable(_) | Self::OutOfDeviceMemory { .. }
        )
    }
}

impl From<BackendError> for Error {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::OutOfMemory { requested, available } => Self::OutOfDeviceMemory { requested, available },
            BackendError::DeviceUnavailable(device) => Self::DeviceUnavailable(device),
            BackendError::BuildFailed { log } => Self::Build { log },
            BackendError::KernelNotFound(name) => Self::EntryPointNotFound(name),
            BackendError::UnboundArgument { kernel, index } => Self::UnboundArgument { kernel, index },
            BackendError::ArgumentIndexOutOfRange { kernel, index, arity } => {
                Self::ArgumentIndexOutOfRange { kernel, index, arity }
            }
            BackendError::InvalidWorkSize(violation) => Self::ShapeMismatch(violation.to_string()),
            BackendError::TransferFailed(reason) => Self::TransferFailure(reason),
            BackendError::BufferOutOfBounds {
                offset,
                size,
                buffer_size,
            } => Self::TransferFailure(format!(
                "{size} bytes at offset {offset} exceed a buffer of {buffer_size} bytes"
            )),
            other => Self::Backend(other),
        }
    }
}
