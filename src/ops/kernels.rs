use std::ops::{Add, Div, Sub};

use crate::abi::OpKind;
use crate::dtype::{Element, ElementType};
use crate::error::{OpError, Result};
use crate::layout::Layout;

/// Layout and element type of one kernel argument, copied out of a descriptor view.
#[derive(Debug, Clone)]
pub(crate) struct Operand {
    pub layout: Layout,
    pub dtype: ElementType,
}

impl Operand {
    pub fn required_bytes(&self) -> usize {
        self.layout
            .required_elements()
            .saturating_mul(self.dtype.size_in_bytes())
    }
}

/// Where an input's bytes live for the duration of a kernel call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Source {
    /// The input shares its region with the output.
    Output,
    Slot(usize),
}

/// Locked argument bytes. Inputs that alias the output are read through the output
/// slice, so in-place calls see their own earlier writes exactly as the device would.
pub(crate) struct Operands<'a> {
    pub output: &'a mut [u8],
    pub inputs: Vec<&'a [u8]>,
    pub sources: Vec<Source>,
}

impl<'a> Operands<'a> {
    #[inline]
    fn read(&self, input: usize, dtype: ElementType, offset: usize) -> f64 {
        match self.sources[input] {
            Source::Output => dtype.read(self.output, offset),
            Source::Slot(slot) => dtype.read(self.inputs[slot], offset),
        }
    }

    #[inline]
    fn write(&mut self, dtype: ElementType, offset: usize, value: f64) {
        dtype.write(self.output, offset, value);
    }
}

/// Accumulator type a kernel computes in.
pub(crate) trait Compute:
    Element + PartialOrd + Add<Output = Self> + Sub<Output = Self> + Div<Output = Self>
{
    const BYTES: usize;

    fn exp(self) -> Self;

    #[inline]
    fn load(bytes: &[u8], index: usize) -> Self {
        Self::from_le_slice(&bytes[index * Self::BYTES..(index + 1) * Self::BYTES])
    }

    #[inline]
    fn store(self, bytes: &mut [u8], index: usize) {
        self.write_le(&mut bytes[index * Self::BYTES..(index + 1) * Self::BYTES]);
    }
}

macro_rules! impl_compute {
    ($t:ty) => {
        impl Compute for $t {
            const BYTES: usize = std::mem::size_of::<$t>();

            #[inline]
            fn exp(self) -> Self {
                <$t>::exp(self)
            }
        }
    };
}

impl_compute!(f32);
impl_compute!(f64);

pub(crate) fn compute_bytes(dtype: ElementType) -> usize {
    match dtype {
        ElementType::F64 => <f64 as Compute>::BYTES,
        _ => <f32 as Compute>::BYTES,
    }
}

/// Scratch bytes a kernel needs for the given arguments.
pub(crate) fn workspace_bytes(op: OpKind, output: &Operand) -> usize {
    match op {
        OpKind::Softmax => {
            let (len, _) = output.layout.lane();
            len * compute_bytes(output.dtype)
        }
        OpKind::Add => 0,
    }
}

pub(crate) fn run(
    op: OpKind,
    output: &Operand,
    inputs: &[Operand],
    operands: &mut Operands<'_>,
    scratch: &mut [u8],
) -> Result<()> {
    let wide = output.dtype == ElementType::F64;
    match (op, wide) {
        (OpKind::Softmax, false) => softmax::<f32>(&inputs[0], output, operands, scratch),
        (OpKind::Softmax, true) => softmax::<f64>(&inputs[0], output, operands, scratch),
        (OpKind::Add, false) => add::<f32>(&inputs[0], &inputs[1], output, operands),
        (OpKind::Add, true) => add::<f64>(&inputs[0], &inputs[1], output, operands),
    }
}

/// Softmax along the innermost axis. Each lane is staged in `scratch` before the
/// output is written, which keeps aliased in-place calls well defined.
fn softmax<C: Compute>(
    x: &Operand,
    y: &Operand,
    operands: &mut Operands<'_>,
    scratch: &mut [u8],
) -> Result<()> {
    let (len, x_stride) = x.layout.lane();
    let (_, y_stride) = y.layout.lane();
    if scratch.len() < len * C::BYTES {
        return Err(OpError::WorkspaceTooSmall {
            op: "kernels.softmax",
            required: len * C::BYTES,
            provided: scratch.len(),
        });
    }
    for (x_base, y_base) in x.layout.lane_offsets().zip(y.layout.lane_offsets()) {
        let mut max = C::from_f64(f64::NEG_INFINITY);
        for j in 0..len {
            let value = C::from_f64(operands.read(0, x.dtype, x_base + j * x_stride));
            value.store(scratch, j);
            if value > max {
                max = value;
            }
        }
        let mut sum = C::from_f64(0.0);
        for j in 0..len {
            let e = (C::load(scratch, j) - max).exp();
            e.store(scratch, j);
            sum = sum + e;
        }
        for j in 0..len {
            let value = C::load(scratch, j) / sum;
            operands.write(y.dtype, y_base + j * y_stride, value.to_f64());
        }
    }
    Ok(())
}

fn add<C: Compute>(
    a: &Operand,
    b: &Operand,
    c: &Operand,
    operands: &mut Operands<'_>,
) -> Result<()> {
    let offsets = a
        .layout
        .offsets()
        .zip(b.layout.offsets())
        .zip(c.layout.offsets());
    for ((a_off, b_off), c_off) in offsets {
        let lhs = C::from_f64(operands.read(0, a.dtype, a_off));
        let rhs = C::from_f64(operands.read(1, b.dtype, b_off));
        operands.write(c.dtype, c_off, (lhs + rhs).to_f64());
    }
    Ok(())
}
