use serde::{Deserialize, Serialize};

use crate::error::{OpError, Result};

pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    if shape.is_empty() {
        return Vec::new();
    }
    let mut strides = vec![0; shape.len()];
    let mut stride: usize = 1;
    for (idx, dim) in shape.iter().enumerate().rev() {
        strides[idx] = stride;
        stride = stride.saturating_mul(*dim);
    }
    strides
}

pub fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Number of storage elements needed to address every logical index
/// (largest reachable offset plus one). `None` on overflow.
pub fn required_elements(shape: &[usize], strides: &[usize]) -> Option<usize> {
    let mut max_offset: usize = 0;
    for (&dim, &stride) in shape.iter().zip(strides.iter()) {
        if dim == 0 {
            return Some(0);
        }
        let span = (dim - 1).checked_mul(stride)?;
        max_offset = max_offset.checked_add(span)?;
    }
    max_offset.checked_add(1)
}

pub fn offset_of(index: &[usize], strides: &[usize]) -> usize {
    index
        .iter()
        .zip(strides.iter())
        .map(|(&idx, &stride)| idx * stride)
        .sum()
}

/// Row-major multi-index of a flat logical position.
pub fn unravel(mut flat: usize, shape: &[usize]) -> Vec<usize> {
    let mut index = vec![0; shape.len()];
    for (axis, &dim) in shape.iter().enumerate().rev() {
        if dim == 0 {
            continue;
        }
        index[axis] = flat % dim;
        flat /= dim;
    }
    index
}

pub fn validate_layout(
    shape: &[usize],
    strides: &[usize],
    storage_len: usize,
    op: &'static str,
) -> Result<()> {
    let invalid = |msg: String| OpError::InvalidLayout {
        op,
        shape: shape.to_vec(),
        strides: strides.to_vec(),
        msg,
    };
    if shape.is_empty() {
        return Err(invalid("rank must be at least 1".to_string()));
    }
    if shape.len() != strides.len() {
        return Err(invalid(format!(
            "shape rank {} does not match strides rank {}",
            shape.len(),
            strides.len()
        )));
    }
    if let Some(axis) = shape.iter().position(|&dim| dim == 0) {
        return Err(invalid(format!("dimension {axis} has size 0")));
    }
    let required = required_elements(shape, strides)
        .ok_or_else(|| invalid("layout span overflow".to_string()))?;
    if storage_len < required {
        return Err(invalid(format!(
            "storage length {storage_len} is smaller than required layout length {required}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayoutKind {
    Contiguous,
    Strided,
    /// At least one axis of size > 1 has stride 0, so distinct indices share storage.
    Aliased,
}

/// Logical shape plus element strides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    shape: Vec<usize>,
    strides: Vec<usize>,
}

impl Layout {
    /// Builds a layout; `strides: None` means row-major contiguous.
    pub fn new(shape: &[usize], strides: Option<&[usize]>) -> Result<Self> {
        let strides = match strides {
            Some(strides) => strides.to_vec(),
            None => contiguous_strides(shape),
        };
        let required = required_elements(shape, &strides).unwrap_or(usize::MAX);
        validate_layout(shape, &strides, required, "layout.new")?;
        Ok(Self {
            shape: shape.to_vec(),
            strides,
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn numel(&self) -> usize {
        numel(&self.shape)
    }

    pub fn required_elements(&self) -> usize {
        required_elements(&self.shape, &self.strides).unwrap_or(usize::MAX)
    }

    pub fn kind(&self) -> LayoutKind {
        let aliased = self
            .shape
            .iter()
            .zip(self.strides.iter())
            .any(|(&dim, &stride)| dim > 1 && stride == 0);
        if aliased {
            LayoutKind::Aliased
        } else if self.strides == contiguous_strides(&self.shape) {
            LayoutKind::Contiguous
        } else {
            LayoutKind::Strided
        }
    }

    pub fn is_contiguous(&self) -> bool {
        self.kind() == LayoutKind::Contiguous
    }

    /// Storage offsets of every logical element, in row-major logical order.
    pub fn offsets(&self) -> StridedOffsets<'_> {
        StridedOffsets::new(&self.shape, &self.strides)
    }

    /// Length and stride of the innermost axis.
    pub fn lane(&self) -> (usize, usize) {
        let last = self.rank() - 1;
        (self.shape[last], self.strides[last])
    }

    /// Base offsets of every innermost-axis lane, in row-major order.
    pub fn lane_offsets(&self) -> StridedOffsets<'_> {
        let last = self.rank() - 1;
        StridedOffsets::new(&self.shape[..last], &self.strides[..last])
    }
}

/// Odometer over a strided layout that yields storage offsets without allocating per step.
#[derive(Debug, Clone)]
pub struct StridedOffsets<'a> {
    shape: &'a [usize],
    strides: &'a [usize],
    index: Vec<usize>,
    offset: usize,
    remaining: usize,
}

impl<'a> StridedOffsets<'a> {
    pub fn new(shape: &'a [usize], strides: &'a [usize]) -> Self {
        Self {
            shape,
            strides,
            index: vec![0; shape.len()],
            offset: 0,
            remaining: numel(shape),
        }
    }
}

impl<'a> Iterator for StridedOffsets<'a> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let current = self.offset;
        self.remaining -= 1;
        if self.remaining > 0 {
            for axis in (0..self.shape.len()).rev() {
                self.index[axis] += 1;
                self.offset += self.strides[axis];
                if self.index[axis] < self.shape[axis] {
                    break;
                }
                self.offset -= self.strides[axis] * self.index[axis];
                self.index[axis] = 0;
            }
        }
        Some(current)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<'a> ExactSizeIterator for StridedOffsets<'a> {}
