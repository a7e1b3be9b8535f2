//! Backend implementations for different device runtimes
//!
//! This module contains:
//! - `host` - emulated accelerator running kernels on the CPU (always built)
//! - `opencl` - OpenCL runtime via `opencl3` (feature `opencl`)

pub mod host;
pub mod opencl;

// Re-export backends
pub use host::HostBackend;
pub use opencl::OpenClBackend;
