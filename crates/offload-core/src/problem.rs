//! Problem definitions
//!
//! A [`Problem`] bundles everything the pipeline needs to know about one
//! computation: its output shape, the kernel entry point, immutable host
//! inputs, the host reference, and how inputs are staged on the device and
//! bound to kernel arguments.
//!
//! | problem     | kernel    | arguments                           | work shape      |
//! |-------------|-----------|-------------------------------------|-----------------|
//! | `VectorAdd` | `vec_add` | `A, B, C`                           | `n`             |
//! | `MatMul`    | `mat_mul` | `A, B, C, rows, cols, inner` (int)  | `rows` × `cols` |

use crate::error::{Error, Result};
use crate::planner::Shape;
use crate::program::Kernel;
use crate::reference::{reference_matmul, reference_vector_add};
use crate::session::{DeviceBuffer, Session};
use offload_backends::{AccessMode, TransferMode};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

/// Element-wise `C = A + B`.
#[derive(Debug, Clone)]
pub struct VectorAdd {
    a: Arc<[i32]>,
    b: Arc<[i32]>,
}

impl VectorAdd {
    pub const KERNEL: &'static str = "vec_add";
    pub const DEFAULT_ELEMENTS: usize = 4096;
    pub const DEFAULT_TILE_EDGE: usize = 1024;

    /// # Errors
    ///
    /// Returns [`Error::InvalidProblem`] if the inputs are empty or differ in length.
    pub fn new(a: impl Into<Arc<[i32]>>, b: impl Into<Arc<[i32]>>) -> Result<Self> {
        let (a, b) = (a.into(), b.into());
        if a.len() != b.len() {
            return Err(Error::invalid_problem(format!(
                "vector lengths differ: {} and {}",
                a.len(),
                b.len()
            )));
        }
        if a.is_empty() {
            return Err(Error::invalid_problem("vectors are empty"));
        }
        Ok(Self { a, b })
    }

    /// `A = B = [0, 1, .., n-1]`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidProblem`] if `n` is zero or the last index
    /// does not fit a device int.
    pub fn iota(n: usize) -> Result<Self> {
        let last = n.saturating_sub(1);
        let last = i32::try_from(last)
            .map_err(|_| Error::invalid_problem(format!("elements = {n} does not fit a device int")))?;
        let values: Arc<[i32]> = (0..=last).take(n).collect();
        Self::new(values.clone(), values)
    }

    pub fn len(&self) -> usize {
        self.a.len()
    }

    pub fn is_empty(&self) -> bool {
        self.a.is_empty()
    }

    pub fn a(&self) -> &[i32] {
        &self.a
    }

    pub fn b(&self) -> &[i32] {
        &self.b
    }
}

/// Naive dense `C = A·B`, with `A` `rows`×`inner` and `B` `inner`×`cols`.
#[derive(Debug, Clone)]
pub struct MatMul {
    a: Arc<[i32]>,
    b: Arc<[i32]>,
    rows: usize,
    cols: usize,
    inner: usize,
}

impl MatMul {
    pub const KERNEL: &'static str = "mat_mul";
    pub const DEFAULT_DIM: usize = 1024;
    pub const DEFAULT_TILE_EDGE: usize = 16;

    /// # Errors
    ///
    /// Returns [`Error::InvalidProblem`] for zero dimensions, dimensions that
    /// do not fit a device `int`, or inputs whose length disagrees with the shape.
    pub fn new(
        a: impl Into<Arc<[i32]>>,
        b: impl Into<Arc<[i32]>>,
        rows: usize,
        cols: usize,
        inner: usize,
    ) -> Result<Self> {
        check_dims(rows, cols, inner)?;
        let (a, b) = (a.into(), b.into());
        if a.len() != rows * inner {
            return Err(Error::invalid_problem(format!(
                "A holds {} elements, {rows}x{inner} needs {}",
                a.len(),
                rows * inner
            )));
        }
        if b.len() != inner * cols {
            return Err(Error::invalid_problem(format!(
                "B holds {} elements, {inner}x{cols} needs {}",
                b.len(),
                inner * cols
            )));
        }
        Ok(Self {
            a,
            b,
            rows,
            cols,
            inner,
        })
    }

    /// Inputs drawn uniformly from `0..10` with a seeded generator.
    pub fn random(rows: usize, cols: usize, inner: usize, seed: u64) -> Result<Self> {
        check_dims(rows, cols, inner)?;
        let mut rng = StdRng::seed_from_u64(seed);
        let a: Arc<[i32]> = (0..rows * inner).map(|_| rng.gen_range(0..10)).collect();
        let b: Arc<[i32]> = (0..inner * cols).map(|_| rng.gen_range(0..10)).collect();
        Self::new(a, b, rows, cols, inner)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn inner(&self) -> usize {
        self.inner
    }

    pub fn a(&self) -> &[i32] {
        &self.a
    }

    pub fn b(&self) -> &[i32] {
        &self.b
    }
}

fn check_dims(rows: usize, cols: usize, inner: usize) -> Result<()> {
    for (name, value) in [("rows", rows), ("cols", cols), ("inner", inner)] {
        if value == 0 {
            return Err(Error::invalid_problem(format!("{name} must be positive")));
        }
        if i32::try_from(value).is_err() {
            return Err(Error::invalid_problem(format!("{name} = {value} does not fit a device int")));
        }
    }
    rows.checked_mul(inner)
        .and(inner.checked_mul(cols))
        .and(rows.checked_mul(cols))
        .map(|_| ())
        .ok_or_else(|| Error::invalid_problem(format!("{rows}x{inner}x{cols} overflows")))
}

/// Device buffers holding one problem's inputs and output.
#[derive(Debug, Clone, Copy)]
pub struct Staged {
    pub a: DeviceBuffer<i32>,
    pub b: DeviceBuffer<i32>,
    pub c: DeviceBuffer<i32>,
}

/// One computation the pipeline can run.
#[derive(Debug, Clone)]
pub enum Problem {
    VectorAdd(VectorAdd),
    MatMul(MatMul),
}

impl From<VectorAdd> for Problem {
    fn from(p: VectorAdd) -> Self {
        Problem::VectorAdd(p)
    }
}

impl From<MatMul> for Problem {
    fn from(p: MatMul) -> Self {
        Problem::MatMul(p)
    }
}

impl Problem {
    pub fn name(&self) -> &'static str {
        match self {
            Problem::VectorAdd(_) => "vec-add",
            Problem::MatMul(_) => "mat-mul",
        }
    }

    /// Kernel entry point that computes this problem.
    pub fn kernel_name(&self) -> &'static str {
        match self {
            Problem::VectorAdd(_) => VectorAdd::KERNEL,
            Problem::MatMul(_) => MatMul::KERNEL,
        }
    }

    pub fn shape(&self) -> Shape {
        match self {
            Problem::VectorAdd(p) => Shape::OneD(p.len()),
            Problem::MatMul(p) => Shape::TwoD {
                rows: p.rows,
                cols: p.cols,
            },
        }
    }

    pub fn default_tile_edge(&self) -> usize {
        match self {
            Problem::VectorAdd(_) => VectorAdd::DEFAULT_TILE_EDGE,
            Problem::MatMul(_) => MatMul::DEFAULT_TILE_EDGE,
        }
    }

    pub fn output_len(&self) -> usize {
        self.shape().elements()
    }

    /// Expected output, computed on the host.
    pub fn reference(&self) -> Vec<i32> {
        match self {
            Problem::VectorAdd(p) => reference_vector_add(&p.a, &p.b),
            Problem::MatMul(p) => reference_matmul(&p.a, &p.b, p.rows, p.cols, p.inner),
        }
    }

    /// Allocate the buffers and enqueue non-blocking input writes.
    ///
    /// The in-order queue runs the writes before any later launch.
    pub fn stage(&self, session: &Session) -> Result<Staged> {
        let (a, b, output_mode) = match self {
            Problem::VectorAdd(p) => (&p.a, &p.b, AccessMode::WriteOnly),
            Problem::MatMul(p) => (&p.a, &p.b, AccessMode::ReadWrite),
        };
        let staged = Staged {
            a: session.alloc_buffer(AccessMode::ReadOnly, a.len())?,
            b: session.alloc_buffer(AccessMode::ReadOnly, b.len())?,
            c: session.alloc_buffer(output_mode, self.output_len())?,
        };
        session.write(&staged.a, a, TransferMode::NonBlocking)?;
        session.write(&staged.b, b, TransferMode::NonBlocking)?;
        Ok(staged)
    }

    /// Bind every argument slot of `kernel`.
    pub fn bind(&self, kernel: &mut Kernel<'_>, staged: &Staged) -> Result<()> {
        kernel.set_arg(0, &staged.a)?;
        kernel.set_arg(1, &staged.b)?;
        kernel.set_arg(2, &staged.c)?;
        if let Problem::MatMul(p) = self {
            // check_dims guarantees these fit.
            kernel.set_arg(3, p.rows as i32)?;
            kernel.set_arg(4, p.cols as i32)?;
            kernel.set_arg(5, p.inner as i32)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_add_iota() {
        let p = VectorAdd::iota(4).unwrap();
        assert_eq!(p.a(), &[0, 1, 2, 3]);
        assert_eq!(Problem::from(p).reference(), vec![0, 2, 4, 6]);
    }

    #[test]
    fn test_vector_add_rejects_bad_inputs() {
        assert!(matches!(VectorAdd::new(vec![1, 2], vec![1]), Err(Error::InvalidProblem(_))));
        assert!(matches!(VectorAdd::iota(0), Err(Error::InvalidProblem(_))));
        let too_long = i32::MAX as usize + 2;
        assert!(matches!(VectorAdd::iota(too_long), Err(Error::InvalidProblem(msg)) if msg.contains("device int")));
    }

    #[test]
    fn test_mat_mul_shape_checks() {
        assert!(MatMul::new(vec![1, 2, 3, 4], vec![5, 6, 7, 8], 2, 2, 2).is_ok());
        assert!(matches!(
            MatMul::new(vec![1, 2, 3], vec![5, 6, 7, 8], 2, 2, 2),
            Err(Error::InvalidProblem(_))
        ));
        assert!(matches!(MatMul::random(0, 4, 4, 1), Err(Error::InvalidProblem(_))));
        assert!(matches!(
            MatMul::random(1, 1, i32::MAX as usize + 1, 1),
            Err(Error::InvalidProblem(_))
        ));
    }

    #[test]
    fn test_random_is_seeded() {
        let first = MatMul::random(8, 4, 6, 42).unwrap();
        let second = MatMul::random(8, 4, 6, 42).unwrap();
        assert_eq!(first.a(), second.a());
        assert_eq!(first.b(), second.b());
        assert_eq!(first.a().len(), 48);
        assert_eq!(first.b().len(), 24);
        assert!(first.a().iter().chain(first.b()).all(|v| (0..10).contains(v)));
    }

    #[test]
    fn test_problem_metadata() {
        let p = Problem::from(MatMul::random(32, 16, 8, 0).unwrap());
        assert_eq!(p.kernel_name(), "mat_mul");
        assert_eq!(p.shape(), Shape::TwoD { rows: 32, cols: 16 });
        assert_eq!(p.output_len(), 512);
        assert_eq!(p.default_tile_edge(), 16);
    }
}
