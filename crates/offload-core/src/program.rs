//! Kernel programs and entry points
//!
//! A [`Program`] is kernel source compiled for the session's device. A
//! [`Kernel`] is one named entry point with positional argument slots that
//! must all be bound before dispatch.
//!
//! Argument types are not checked against the kernel signature here: binding
//! a buffer of the wrong element type is a programmer error the device may
//! or may not catch.

use crate::error::{Error, Result};
use crate::session::{DeviceBuffer, Session};
use offload_backends::{KernelArg, KernelHandle, ProgramHandle, ScalarArg};

/// Values that can be bound to a kernel argument slot.
pub trait KernelArgument {
    /// Convert to a backend argument, checking that buffers belong to `session`.
    fn to_kernel_arg(&self, session: &Session) -> Result<KernelArg>;
}

impl<T> KernelArgument for DeviceBuffer<T> {
    fn to_kernel_arg(&self, session: &Session) -> Result<KernelArg> {
        session.check_buffer(self)?;
        Ok(KernelArg::Buffer(self.handle()))
    }
}

impl<T> KernelArgument for &DeviceBuffer<T> {
    fn to_kernel_arg(&self, session: &Session) -> Result<KernelArg> {
        (*self).to_kernel_arg(session)
    }
}

impl KernelArgument for ScalarArg {
    fn to_kernel_arg(&self, _session: &Session) -> Result<KernelArg> {
        Ok(KernelArg::Scalar(*self))
    }
}

macro_rules! scalar_argument {
    ($($ty:ty),*) => {
        $(
            impl KernelArgument for $ty {
                fn to_kernel_arg(&self, _session: &Session) -> Result<KernelArg> {
                    Ok(KernelArg::Scalar(ScalarArg::from(*self)))
                }
            }
        )*
    };
}

scalar_argument!(i32, u32, i64, u64, f32, f64);

/// Compiled kernel source bound to a session.
pub struct Program<'s> {
    session: &'s Session,
    handle: ProgramHandle,
    kernel_names: Vec<String>,
    log: String,
}

impl<'s> Program<'s> {
    /// Compile `source` for the session's device.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Build`] carrying the compiler log when compilation
    /// fails. No program is created in that case.
    ///
    /// # Example
    ///
    /// ```
    /// use offload_core::{create_backend, BackendType, DeviceEnumerator, Program, Session};
    /// use offload_backends::DeviceClass;
    ///
    /// let enumerator = DeviceEnumerator::new(create_backend(BackendType::Host)?, DeviceClass::Gpu);
    /// let session = Session::open(enumerator.backend().clone(), enumerator.device()?)?;
    /// let program = Program::build(&session, "__kernel void noop(__global int* out) { }")?;
    /// assert_eq!(program.kernel_names(), ["noop"]);
    /// # Ok::<(), offload_core::Error>(())
    /// ```
    pub fn build(session: &'s Session, source: &str) -> Result<Self> {
        Self::build_with_options(session, source, "")
    }

    /// Compile with compiler options such as `-D NAME=VALUE`.
    #[tracing::instrument(skip(session, source), fields(session = session.id(), source_bytes = source.len()))]
    pub fn build_with_options(session: &'s Session, source: &str, options: &str) -> Result<Self> {
        session.ensure_open()?;
        let start = std::time::Instant::now();
        let mut backend = session.backend().write();
        let handle = backend
            .build_program(session.context(), session.device().id, source, options)
            .map_err(|e| match Error::from(e) {
                Error::Build { log } => {
                    tracing::error!(log_bytes = log.len(), "program_build_failed");
                    Error::Build { log }
                }
                other => other,
            })?;
        let names = backend.kernel_names(handle);
        let log = backend.build_log(handle);
        let (kernel_names, log) = match (names, log) {
            (Ok(names), Ok(log)) => (names, log),
            (Err(e), _) | (_, Err(e)) => {
                let _ = backend.release_program(handle);
                return Err(e.into());
            }
        };

        tracing::debug!(
            %handle,
            kernels = kernel_names.len(),
            duration_us = start.elapsed().as_micros() as u64,
            "program_built"
        );
        if !log.trim().is_empty() {
            tracing::warn!(log = %log.trim_end(), "program_build_log");
        }

        Ok(Self {
            session,
            handle,
            kernel_names,
            log,
        })
    }

    pub fn handle(&self) -> ProgramHandle {
        self.handle
    }

    /// Entry points defined by the source, in source order.
    pub fn kernel_names(&self) -> &[String] {
        &self.kernel_names
    }

    /// Compiler output of a successful build (warnings), possibly empty.
    pub fn build_log(&self) -> &str {
        &self.log
    }

    /// Look up an entry point by name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EntryPointNotFound`] if the program has no such kernel.
    pub fn kernel(&self, name: &str) -> Result<Kernel<'s>> {
        self.session.ensure_open()?;
        if !self.kernel_names.iter().any(|k| k == name) {
            return Err(Error::EntryPointNotFound(name.to_string()));
        }
        let mut backend = self.session.backend().write();
        let handle = backend.create_kernel(self.handle, name)?;
        let arity = match backend.kernel_arg_count(handle) {
            Ok(arity) => arity,
            Err(e) => {
                let _ = backend.release_kernel(handle);
                return Err(e.into());
            }
        };
        Ok(Kernel {
            session: self.session,
            handle,
            name: name.to_string(),
            bound: vec![false; arity as usize],
        })
    }
}

impl Drop for Program<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.session.backend().write().release_program(self.handle) {
            tracing::warn!(program = %self.handle, error = %e, "program_release_failed");
        }
    }
}

/// One entry point of a [`Program`], with its argument bindings.
pub struct Kernel<'s> {
    session: &'s Session,
    handle: KernelHandle,
    name: String,
    bound: Vec<bool>,
}

impl<'s> Kernel<'s> {
    pub fn handle(&self) -> KernelHandle {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of argument slots.
    pub fn arity(&self) -> u32 {
        self.bound.len() as u32
    }

    pub fn is_bound(&self, index: u32) -> bool {
        self.bound.get(index as usize).copied().unwrap_or(false)
    }

    /// First slot that has not been bound yet.
    pub fn first_unbound(&self) -> Option<u32> {
        self.bound.iter().position(|b| !b).map(|i| i as u32)
    }

    /// Bind slot `index` to a buffer or scalar.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ArgumentIndexOutOfRange`] if `index` is past the
    /// kernel's arity and [`Error::ForeignBuffer`] for another session's buffer.
    pub fn set_arg<A: KernelArgument>(&mut self, index: u32, arg: A) -> Result<()> {
        if index >= self.arity() {
            return Err(Error::ArgumentIndexOutOfRange {
                kernel: self.name.clone(),
                index,
                arity: self.arity(),
            });
        }
        let arg = arg.to_kernel_arg(self.session)?;
        self.session.backend().write().set_kernel_arg(self.handle, index, arg)?;
        self.bound[index as usize] = true;
        tracing::trace!(kernel = %self.name, index, "kernel_arg_bound");
        Ok(())
    }

    pub(crate) fn session(&self) -> &'s Session {
        self.session
    }
}

impl Drop for Kernel<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.session.backend().write().release_kernel(self.handle) {
            tracing::warn!(kernel = %self.handle, error = %e, "kernel_release_failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::share;
    use offload_backends::{AccessMode, DeviceClass, HostBackend};
    use pretty_assertions::assert_eq;

    const SOURCE: &str = "__kernel void vec_add(__global const int* A, __global const int* B, __global int* C) {\n\
                          int i = get_global_id(0);\n\
                          C[i] = A[i] + B[i];\n\
                          }\n";

    fn open_session() -> Session {
        let backend = share(HostBackend::new());
        let device = {
            let b = backend.read();
            b.devices(b.platforms().unwrap()[0].id, DeviceClass::Gpu).unwrap().remove(0)
        };
        Session::open(backend, &device).unwrap()
    }

    #[test]
    fn test_build_and_lookup() {
        let session = open_session();
        let program = Program::build(&session, SOURCE).unwrap();
        assert_eq!(program.kernel_names(), ["vec_add"]);
        let kernel = program.kernel("vec_add").unwrap();
        assert_eq!(kernel.arity(), 3);
        assert_eq!(kernel.first_unbound(), Some(0));
    }

    #[test]
    fn test_build_failure_carries_log() {
        let session = open_session();
        let broken = SOURCE.replace("B[i];", "B[i]");
        let built = Program::build(&session, &broken);
        match built {
            Err(Error::Build { log }) => assert!(log.contains("expected ';'"), "log: {log}"),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("broken source built"),
        }
    }

    #[test]
    fn test_unknown_entry_point() {
        let session = open_session();
        let program = Program::build(&session, SOURCE).unwrap();
        assert!(matches!(program.kernel("vec_sub"), Err(Error::EntryPointNotFound(name)) if name == "vec_sub"));
    }

    #[test]
    fn test_argument_index_out_of_range() {
        let session = open_session();
        let program = Program::build(&session, SOURCE).unwrap();
        let mut kernel = program.kernel("vec_add").unwrap();
        assert!(matches!(
            kernel.set_arg(3, 1i32),
            Err(Error::ArgumentIndexOutOfRange { index: 3, arity: 3, .. })
        ));
    }

    #[test]
    fn test_binding_tracks_slots() {
        let session = open_session();
        let program = Program::build(&session, SOURCE).unwrap();
        let mut kernel = program.kernel("vec_add").unwrap();
        let a = session.alloc_buffer::<i32>(AccessMode::ReadOnly, 4).unwrap();
        kernel.set_arg(0, &a).unwrap();
        kernel.set_arg(2, a).unwrap();
        assert!(kernel.is_bound(0));
        assert!(!kernel.is_bound(1));
        assert_eq!(kernel.first_unbound(), Some(1));
    }

    #[test]
    fn test_build_options_are_passed_through() {
        let session = open_session();
        assert!(Program::build_with_options(&session, SOURCE, "-D TILE=16").is_ok());
        assert!(matches!(
            Program::build_with_options(&session, SOURCE, "--bogus"),
            Err(Error::Backend(_))
        ));
    }

    #[test]
    fn test_close_after_program_dropped() {
        let mut session = open_session();
        {
            let program = Program::build(&session, SOURCE).unwrap();
            let _kernel = program.kernel("vec_add").unwrap();
        }
        session.close().unwrap();
        assert!(matches!(Program::build(&session, SOURCE), Err(Error::SessionClosed { .. })));
    }
}
