//! Backend selection and the shared backend handle
//!
//! Every session, program and pending transfer holds a clone of the same
//! [`SharedBackend`]:
//!
//! ```text
//! offload-core (Session, Program, Kernel, PendingRead)
//!   ↓ Arc<RwLock<..>>
//! offload-backends::Backend (HostBackend, OpenClBackend)
//! ```

use crate::error::{Error, Result};
use offload_backends::{Backend, HostBackend, HostBackendConfig};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[cfg(feature = "opencl")]
use offload_backends::OpenClBackend;

/// A backend shared between the objects of one run.
pub type SharedBackend = Arc<RwLock<Box<dyn Backend + Send + Sync>>>;

/// Device runtime to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// Emulated accelerator (always available)
    #[default]
    Host,
    /// Installed OpenCL runtime (requires the `opencl` feature)
    OpenCl,
}

impl BackendType {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendType::Host => "host",
            BackendType::OpenCl => "opencl",
        }
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "host" => Ok(BackendType::Host),
            "opencl" => Ok(BackendType::OpenCl),
            other => Err(Error::config(format!("unknown backend `{other}` (expected host or opencl)"))),
        }
    }
}

/// Wrap an already constructed backend.
pub fn share<B: Backend + Send + Sync + 'static>(backend: B) -> SharedBackend {
    Arc::new(RwLock::new(Box::new(backend)))
}

/// Create a backend of the given type.
///
/// # Errors
///
/// Returns [`Error::DeviceUnavailable`] if the runtime cannot be loaded, or
/// [`Error::Config`] if the backend was compiled out.
///
/// # Example
///
/// ```
/// use offload_core::{create_backend, BackendType};
///
/// let backend = create_backend(BackendType::Host)?;
/// assert_eq!(backend.read().name(), "host");
/// # Ok::<(), offload_core::Error>(())
/// ```
#[tracing::instrument]
pub fn create_backend(backend_type: BackendType) -> Result<SharedBackend> {
    let start = std::time::Instant::now();

    let backend: Box<dyn Backend + Send + Sync> = match backend_type {
        BackendType::Host => Box::new(HostBackend::with_config(HostBackendConfig::default())),
        BackendType::OpenCl => {
            #[cfg(feature = "opencl")]
            {
                match OpenClBackend::new() {
                    Ok(backend) => Box::new(backend),
                    Err(e) => {
                        return Err(Error::DeviceUnavailable(format!("failed to load the OpenCL runtime: {e}")));
                    }
                }
            }
            #[cfg(not(feature = "opencl"))]
            {
                return Err(Error::config("OpenCL backend requires the 'opencl' feature to be enabled"));
            }
        }
    };

    let duration_us = start.elapsed().as_micros() as u64;
    tracing::debug!(duration_us = duration_us, backend = %backend_type, "backend_created");

    Ok(Arc::new(RwLock::new(backend)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_backend_type() {
        assert_eq!("host".parse::<BackendType>().unwrap(), BackendType::Host);
        assert_eq!("OpenCL".parse::<BackendType>().unwrap(), BackendType::OpenCl);
        assert!(matches!("cuda".parse::<BackendType>(), Err(Error::Config(_))));
    }

    #[test]
    fn test_create_host_backend() {
        let backend = create_backend(BackendType::Host).unwrap();
        assert_eq!(backend.read().name(), "host");
    }

    #[test]
    #[cfg(not(feature = "opencl"))]
    fn test_opencl_compiled_out() {
        assert!(matches!(create_backend(BackendType::OpenCl), Err(Error::Config(_))));
    }
}
