use std::fmt::Write as _;

use serde::Serialize;

use crate::error::{OpError, Result};
use crate::layout::{numel, unravel};
use crate::tolerance::ToleranceSpec;

/// Offending elements kept for the diagnostic dump.
const MAX_RECORDED: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Mismatch {
    pub flat: usize,
    pub index: Vec<usize>,
    pub actual: f64,
    pub expected: f64,
    pub error: f64,
    pub allowed: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Comparison {
    pub shape: Vec<usize>,
    pub tolerance: ToleranceSpec,
    pub total: usize,
    pub mismatches: usize,
    pub max_abs_error: f64,
    pub worst: Option<Mismatch>,
    recorded: Vec<Mismatch>,
}

/// Elementwise `|actual - expected| <= atol + rtol * |expected|` over logical values.
/// A NaN on either side is always a mismatch.
pub fn compare(
    actual: &[f64],
    expected: &[f64],
    shape: &[usize],
    tolerance: ToleranceSpec,
) -> Result<Comparison> {
    if actual.len() != expected.len() || actual.len() != numel(shape) {
        return Err(OpError::InvalidArgument {
            op: "compare",
            msg: format!(
                "length mismatch: actual={} expected={} shape={shape:?}",
                actual.len(),
                expected.len()
            ),
        });
    }
    let mut mismatches = 0usize;
    let mut max_abs_error = 0.0f64;
    let mut worst: Option<Mismatch> = None;
    let mut recorded = Vec::new();
    for (flat, (&a, &e)) in actual.iter().zip(expected.iter()).enumerate() {
        let error = if a.is_nan() || e.is_nan() {
            f64::INFINITY
        } else if a == e {
            0.0
        } else {
            (a - e).abs()
        };
        max_abs_error = max_abs_error.max(error);
        if tolerance.accepts(a, e) {
            continue;
        }
        mismatches += 1;
        let mismatch = Mismatch {
            flat,
            index: unravel(flat, shape),
            actual: a,
            expected: e,
            error,
            allowed: tolerance.allowed(e),
        };
        if worst.as_ref().map_or(true, |w| mismatch.error > w.error) {
            worst = Some(mismatch.clone());
        }
        if recorded.len() < MAX_RECORDED {
            recorded.push(mismatch);
        }
    }
    Ok(Comparison {
        shape: shape.to_vec(),
        tolerance,
        total: actual.len(),
        mismatches,
        max_abs_error,
        worst,
        recorded,
    })
}

impl Comparison {
    pub fn passed(&self) -> bool {
        self.mismatches == 0
    }

    pub fn recorded(&self) -> &[Mismatch] {
        &self.recorded
    }

    /// Human-readable table of up to `limit` offending elements.
    pub fn debug_dump(&self, limit: usize) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} / {} elements outside atol={:e} rtol={:e} (max abs error {:.3e})",
            self.mismatches,
            self.total,
            self.tolerance.atol,
            self.tolerance.rtol,
            self.max_abs_error
        );
        for mismatch in self.recorded.iter().take(limit) {
            let _ = writeln!(
                out,
                "  {:?}: actual={:<14} expected={:<14} error={:.3e} allowed={:.3e}",
                mismatch.index, mismatch.actual, mismatch.expected, mismatch.error, mismatch.allowed
            );
        }
        if self.mismatches > limit.min(self.recorded.len()) {
            let shown = limit.min(self.recorded.len());
            let _ = writeln!(out, "  ... {} more", self.mismatches - shown);
        }
        out
    }

    pub fn into_result(self) -> Result<Self> {
        match &self.worst {
            None => Ok(self),
            Some(worst) => Err(OpError::ToleranceExceeded {
                mismatches: self.mismatches,
                total: self.total,
                index: worst.index.clone(),
                actual: worst.actual,
                expected: worst.expected,
                error: worst.error,
                allowed: worst.allowed,
            }),
        }
    }
}
