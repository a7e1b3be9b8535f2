//! Work partitioning and kernel dispatch
//!
//! [`plan`] turns a problem shape into a [`WorkSpec`] that satisfies the
//! device's limits:
//!
//! - every global dimension is a multiple of its local size
//! - every local size is within the device's per-dimension limit
//! - the product of local sizes is within the work-group limit
//!
//! There is no padding and no truncation: one work-item per output element.
//! Shapes that cannot be partitioned under the chosen policy are a
//! [`Error::ShapeMismatch`].

use crate::error::{Error, Result};
use crate::program::Kernel;
use crate::session::{Event, Session};
use offload_backends::{DeviceLimits, WorkSpec};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tile edge used when a policy names none.
pub const DEFAULT_TILE_EDGE: usize = 16;

// ============================================================================
// Shapes and policies
// ============================================================================

/// Extent of the output, one work-item per element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shape {
    OneD(usize),
    /// Dimension 0 spans rows, dimension 1 spans columns.
    TwoD { rows: usize, cols: usize },
}

impl Shape {
    pub fn elements(&self) -> usize {
        match *self {
            Shape::OneD(n) => n,
            Shape::TwoD { rows, cols } => rows * cols,
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shape::OneD(n) => write!(f, "{n}"),
            Shape::TwoD { rows, cols } => write!(f, "{rows}x{cols}"),
        }
    }
}

/// How the local size is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TilePolicy {
    /// Exactly `edge` (1-D) or `edge`×`edge` (2-D); anything else fails.
    Fixed { edge: usize },
    /// The largest valid local size. In 2-D, the largest product, ties
    /// broken toward square tiles.
    LargestDivisor,
    /// `Fixed` when it fits, `LargestDivisor` otherwise.
    FixedOrDivisor { edge: usize },
}

impl Default for TilePolicy {
    fn default() -> Self {
        TilePolicy::FixedOrDivisor {
            edge: DEFAULT_TILE_EDGE,
        }
    }
}

// ============================================================================
// Planning
// ============================================================================

/// Choose a [`WorkSpec`] for `shape` under `limits`.
///
/// # Errors
///
/// Returns [`Error::ShapeMismatch`] for zero-sized dimensions, 2-D shapes on a
/// 1-D device, or shapes the policy cannot partition.
///
/// # Example
///
/// ```
/// use offload_core::planner::{plan, Shape, TilePolicy};
/// use offload_backends::DeviceLimits;
///
/// let spec = plan(Shape::TwoD { rows: 64, cols: 48 }, &DeviceLimits::default(), TilePolicy::Fixed { edge: 16 })?;
/// assert_eq!(spec.local(), Some(&[16, 16][..]));
/// # Ok::<(), offload_core::Error>(())
/// ```
pub fn plan(shape: Shape, limits: &DeviceLimits, policy: TilePolicy) -> Result<WorkSpec> {
    let spec = match shape {
        Shape::OneD(n) => {
            if n == 0 {
                return Err(Error::shape("1-D shape has zero elements"));
            }
            let local = match policy {
                TilePolicy::Fixed { edge } => fixed_1d(n, limits, edge)?,
                TilePolicy::LargestDivisor => largest_1d(n, limits)?,
                TilePolicy::FixedOrDivisor { edge } => match fixed_1d(n, limits, edge) {
                    Ok(local) => local,
                    Err(_) => largest_1d(n, limits)?,
                },
            };
            WorkSpec::one_d(n, Some(local))
        }
        Shape::TwoD { rows, cols } => {
            if rows == 0 || cols == 0 {
                return Err(Error::shape(format!("2-D shape {shape} has a zero dimension")));
            }
            if limits.max_work_item_dimensions < 2 {
                return Err(Error::shape(format!(
                    "device supports {} work-item dimension(s), shape {shape} needs 2",
                    limits.max_work_item_dimensions
                )));
            }
            let local = match policy {
                TilePolicy::Fixed { edge } => fixed_2d(rows, cols, limits, edge)?,
                TilePolicy::LargestDivisor => largest_2d(rows, cols, limits)?,
                TilePolicy::FixedOrDivisor { edge } => match fixed_2d(rows, cols, limits, edge) {
                    Ok(local) => local,
                    Err(_) => largest_2d(rows, cols, limits)?,
                },
            };
            WorkSpec::two_d([rows, cols], Some(local))
        }
    };
    tracing::debug!(%shape, ?policy, spec = %spec, "work_planned");
    Ok(spec)
}

fn fixed_1d(n: usize, limits: &DeviceLimits, edge: usize) -> Result<usize> {
    let cap = limits.max_work_group_size.min(limits.item_limit(0));
    if edge == 0 || n % edge != 0 {
        return Err(Error::shape(format!("{n} elements are not a multiple of tile {edge}")));
    }
    if edge > cap {
        return Err(Error::shape(format!("tile {edge} exceeds the device limit {cap}")));
    }
    Ok(edge)
}

fn largest_1d(n: usize, limits: &DeviceLimits) -> Result<usize> {
    let cap = limits.max_work_group_size.min(limits.item_limit(0)).min(n);
    (1..=cap)
        .rev()
        .find(|l| n % l == 0)
        .ok_or_else(|| Error::shape(format!("device allows no work-group for {n} elements")))
}

fn fixed_2d(rows: usize, cols: usize, limits: &DeviceLimits, edge: usize) -> Result<[usize; 2]> {
    if edge == 0 || rows % edge != 0 || cols % edge != 0 {
        return Err(Error::shape(format!("{rows}x{cols} is not a multiple of tile {edge}x{edge}")));
    }
    let fits = edge <= limits.item_limit(0)
        && edge <= limits.item_limit(1)
        && edge.saturating_mul(edge) <= limits.max_work_group_size;
    if !fits {
        return Err(Error::shape(format!("tile {edge}x{edge} exceeds the device limits")));
    }
    Ok([edge, edge])
}

fn divisors_up_to(n: usize, cap: usize) -> impl Iterator<Item = usize> {
    (1..=cap.min(n)).filter(move |d| n % d == 0)
}

fn largest_2d(rows: usize, cols: usize, limits: &DeviceLimits) -> Result<[usize; 2]> {
    let mut best: Option<[usize; 2]> = None;
    for lr in divisors_up_to(rows, limits.item_limit(0)) {
        for lc in divisors_up_to(cols, limits.item_limit(1)) {
            let product = lr * lc;
            if product > limits.max_work_group_size {
                continue;
            }
            let better = match best {
                None => true,
                Some([br, bc]) => {
                    let best_product = br * bc;
                    product > best_product || (product == best_product && lr.abs_diff(lc) < br.abs_diff(bc))
                }
            };
            if better {
                best = Some([lr, lc]);
            }
        }
    }
    best.ok_or_else(|| Error::shape(format!("device allows no work-group for {rows}x{cols}")))
}

// ============================================================================
// Dispatch
// ============================================================================

/// Validate `work` and enqueue `kernel` on the session's queue.
///
/// Returns as soon as the launch is queued; completion is observed through
/// the returned event, a blocking read, or [`Session::finish`].
///
/// # Errors
///
/// Returns [`Error::ShapeMismatch`] if `work` violates the device limits and
/// [`Error::UnboundArgument`] if any argument slot is unbound.
#[tracing::instrument(skip(session, kernel), fields(kernel = kernel.name(), work = %work))]
pub fn dispatch(session: &Session, kernel: &Kernel<'_>, work: &WorkSpec) -> Result<Event> {
    session.ensure_open()?;
    if kernel.session().id() != session.id() {
        return Err(Error::ForeignBuffer {
            owner: kernel.session().id(),
            session: session.id(),
        });
    }
    work.validate(&session.device().limits)
        .map_err(|violation| Error::shape(violation.to_string()))?;
    if let Some(index) = kernel.first_unbound() {
        return Err(Error::UnboundArgument {
            kernel: kernel.name().to_string(),
            index,
        });
    }
    let handle = session
        .backend()
        .write()
        .enqueue_kernel(session.queue(), kernel.handle(), work)?;
    Ok(session.event(handle))
}
