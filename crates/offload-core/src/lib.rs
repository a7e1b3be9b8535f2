//! Host/device orchestration for offloaded integer kernels
//!
//! This crate provides:
//! - **Device Enumerator**: platform discovery and device selection by class
//! - **Compute Session**: one context and one in-order queue, typed buffers,
//!   snapshotting writes and owned pending reads
//! - **Kernel Program**: build with the compiler log on failure, entry points
//!   with positional argument binding
//! - **Dispatch Planner**: 1-D / 2-D work partitioning within device limits
//! - **Reference Evaluator & Verifier**: host results and element-wise checks
//! - **Pipeline**: the whole run, with every resource released on every path
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌────────────────┐
//! │   Problem    │──►│   Pipeline   │──►│   RunReport    │
//! │  (vec, mat)  │   │              │   │ + Verification │
//! └──────────────┘   └──────┬───────┘   └────────────────┘
//!                           │
//!      ┌──────────────┬─────┴────────┬──────────────┐
//!      ▼              ▼              ▼              ▼
//! ┌──────────┐  ┌──────────┐  ┌──────────┐  ┌──────────┐
//! │Enumerator│  │ Session  │  │ Program  │  │ Planner  │
//! └──────────┘  └────┬─────┘  └────┬─────┘  └────┬─────┘
//!                    └─────────────┼─────────────┘
//!                                  ▼
//!                   offload-backends::Backend (dyn)
//! ```
//!
//! # Usage
//!
//! ```rust
//! use offload_core::{create_backend, run, BackendType, Problem, RunConfig, VectorAdd};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let source = "__kernel void vec_add(__global const int* A, __global const int* B, __global int* C) {
//!     int i = get_global_id(0);
//!     C[i] = A[i] + B[i];
//! }";
//!
//! let backend = create_backend(BackendType::Host)?;
//! let problem = Problem::from(VectorAdd::iota(1024)?);
//! let report = run(&backend, &RunConfig::default(), &problem, source)?;
//! assert!(report.passed());
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod enumerator;
pub mod error;
pub mod pipeline;
pub mod planner;
pub mod problem;
pub mod program;
pub mod reference;
pub mod session;
pub mod verify;

// Re-export public API
pub use backend::{create_backend, share, BackendType, SharedBackend};
pub use config::{MatMulConfig, PolicyKind, RunConfig, VecAddConfig};
pub use enumerator::{enumerate_platforms, probe_devices, select_device, DeviceEnumerator};
pub use error::{Error, Result};
pub use pipeline::{run, RunReport, Timings};
pub use planner::{dispatch, plan, Shape, TilePolicy};
pub use problem::{MatMul, Problem, Staged, VectorAdd};
pub use program::{Kernel, KernelArgument, Program};
pub use reference::{reference_matmul, reference_vector_add};
pub use session::{DeviceBuffer, Event, PendingRead, Session};
pub use verify::{verify, Mismatch, Verification, VerifyMode};
