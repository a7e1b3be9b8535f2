//! Element-wise comparison of device output against the host reference.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// How much of the output to compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum VerifyMode {
    /// Stop at the first mismatch.
    #[default]
    FirstMismatch,
    /// Compare everything, logging the first `log_limit` mismatches.
    FullScan { log_limit: usize },
}

/// One differing element. `None` marks an element missing on that side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mismatch {
    pub index: usize,
    pub expected: Option<i32>,
    pub actual: Option<i32>,
}

/// Outcome of a comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
    pub matched: bool,
    pub first_mismatch: Option<Mismatch>,
    /// Number of differing elements found. At most 1 in
    /// [`VerifyMode::FirstMismatch`].
    pub mismatches: usize,
    /// Elements compared.
    pub checked: usize,
}

impl Verification {
    /// Turn a mismatch into [`Error::VerificationMismatch`].
    pub fn into_result(self) -> Result<Self> {
        match self.first_mismatch {
            Some(Mismatch {
                index,
                expected,
                actual,
            }) => Err(Error::VerificationMismatch {
                index,
                expected,
                actual,
            }),
            None => Ok(self),
        }
    }
}

/// Compare `actual` against `expected` element by element.
///
/// A length difference counts as a mismatch at the first index present on
/// only one side.
pub fn verify(expected: &[i32], actual: &[i32], mode: VerifyMode) -> Verification {
    let len = expected.len().max(actual.len());
    let mut first_mismatch = None;
    let mut mismatches = 0;
    let mut checked = 0;

    for index in 0..len {
        checked += 1;
        let e = expected.get(index).copied();
        let a = actual.get(index).copied();
        if e == a {
            continue;
        }
        mismatches += 1;
        let mismatch = Mismatch {
            index,
            expected: e,
            actual: a,
        };
        first_mismatch.get_or_insert(mismatch);
        match mode {
            VerifyMode::FirstMismatch => break,
            VerifyMode::FullScan { log_limit } => {
                if mismatches <= log_limit {
                    tracing::warn!(index, expected = ?e, actual = ?a, "verification_mismatch");
                }
            }
        }
    }

    let matched = mismatches == 0;
    tracing::debug!(matched, mismatches, checked, "verification_complete");
    Verification {
        matched,
        first_mismatch,
        mismatches,
        checked,
    }
}
