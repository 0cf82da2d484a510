//! Trusted reference results.
//!
//! References run in `f64` on the exact values stored in the trial's input tensors and
//! are only rounded to the trial's element type at the very end, so the oracle adds one
//! rounding step at most.

use crate::dtype::ElementType;
use crate::error::{OpError, Result};
use crate::layout::numel;
use crate::ops::Operator;

pub fn expected(
    op: &dyn Operator,
    dtype: ElementType,
    shape: &[usize],
    inputs: &[Vec<f64>],
) -> Result<Vec<f64>> {
    let mut values = op.reference(shape, inputs)?;
    for value in values.iter_mut() {
        *value = dtype.quantize(*value);
    }
    Ok(values)
}

pub(crate) fn check_inputs(
    op: &'static str,
    shape: &[usize],
    inputs: &[Vec<f64>],
    arity: usize,
) -> Result<()> {
    if shape.is_empty() {
        return Err(OpError::InvalidArgument {
            op,
            msg: "rank must be at least 1".to_string(),
        });
    }
    if inputs.len() != arity {
        return Err(OpError::InvalidArgument {
            op,
            msg: format!("expected {arity} input(s), got {}", inputs.len()),
        });
    }
    let count = numel(shape);
    if let Some((idx, input)) = inputs
        .iter()
        .enumerate()
        .find(|(_, input)| input.len() != count)
    {
        return Err(OpError::InvalidArgument {
            op,
            msg: format!(
                "input {idx} has {} values, shape {shape:?} needs {count}",
                input.len()
            ),
        });
    }
    Ok(())
}

/// Numerically stable softmax over the innermost axis of row-major `x`.
pub fn softmax_last_axis(shape: &[usize], x: &[f64]) -> Vec<f64> {
    let len = shape.last().copied().unwrap_or(1).max(1);
    let mut out = Vec::with_capacity(x.len());
    for row in x.chunks(len) {
        let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let exps: Vec<f64> = row.iter().map(|v| (v - max).exp()).collect();
        let sum: f64 = exps.iter().sum();
        out.extend(exps.iter().map(|e| e / sum));
    }
    out
}

pub fn elementwise_add(a: &[f64], b: &[f64]) -> Vec<f64> {
    a.iter().zip(b.iter()).map(|(x, y)| x + y).collect()
}
