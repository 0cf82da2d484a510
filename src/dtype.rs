//! Element types understood by the descriptor protocol.
//!
//! Every tensor handed to a backend stores its elements as little-endian bytes of one
//! of these representations. Values cross the host boundary as `f64` so the oracle and
//! comparator never see anything narrower than the widest supported type.

use std::fmt;
use std::mem::size_of;

use half::{bf16, f16};
use serde::{Deserialize, Serialize};

use crate::error::{OpError, Result};
use crate::tolerance::ToleranceSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ElementType {
    F16,
    BF16,
    F32,
    F64,
}

impl ElementType {
    pub const ALL: [ElementType; 4] = [
        ElementType::F16,
        ElementType::BF16,
        ElementType::F32,
        ElementType::F64,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ElementType::F16 => "f16",
            ElementType::BF16 => "bf16",
            ElementType::F32 => "f32",
            ElementType::F64 => "f64",
        }
    }

    pub fn size_in_bytes(self) -> usize {
        match self {
            ElementType::F16 => size_of::<f16>(),
            ElementType::BF16 => size_of::<bf16>(),
            ElementType::F32 => size_of::<f32>(),
            ElementType::F64 => size_of::<f64>(),
        }
    }

    pub fn parse(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "f16" | "half" => Ok(ElementType::F16),
            "bf16" | "bfloat16" => Ok(ElementType::BF16),
            "f32" | "float" => Ok(ElementType::F32),
            "f64" | "double" => Ok(ElementType::F64),
            other => Err(OpError::InvalidArgument {
                op: "element_type.parse",
                msg: format!("unknown element type '{other}'"),
            }),
        }
    }

    /// Tolerance used when an operator does not override it.
    pub fn default_tolerance(self) -> ToleranceSpec {
        match self {
            ElementType::F16 => ToleranceSpec::new(1e-3, 1e-2),
            ElementType::BF16 => ToleranceSpec::new(5e-3, 5e-2),
            ElementType::F32 => ToleranceSpec::new(3e-5, 1e-5),
            ElementType::F64 => ToleranceSpec::new(1e-12, 1e-12),
        }
    }

    /// Rounds `value` to the nearest value representable in this type.
    pub fn quantize(self, value: f64) -> f64 {
        match self {
            ElementType::F16 => f16::from_f64(value).to_f64(),
            ElementType::BF16 => bf16::from_f64(value).to_f64(),
            ElementType::F32 => value as f32 as f64,
            ElementType::F64 => value,
        }
    }

    /// Reads element `index` (in elements, not bytes) from `bytes`.
    pub fn read(self, bytes: &[u8], index: usize) -> f64 {
        match self {
            ElementType::F16 => read_element::<f16>(bytes, index),
            ElementType::BF16 => read_element::<bf16>(bytes, index),
            ElementType::F32 => read_element::<f32>(bytes, index),
            ElementType::F64 => read_element::<f64>(bytes, index),
        }
    }

    /// Writes `value`, rounded to this type, into element `index` of `bytes`.
    pub fn write(self, bytes: &mut [u8], index: usize, value: f64) {
        match self {
            ElementType::F16 => write_element::<f16>(bytes, index, value),
            ElementType::BF16 => write_element::<bf16>(bytes, index, value),
            ElementType::F32 => write_element::<f32>(bytes, index, value),
            ElementType::F64 => write_element::<f64>(bytes, index, value),
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Scalar types that can back a tensor element.
pub trait Element: Copy + Send + Sync + 'static {
    const DTYPE: ElementType;

    fn to_f64(self) -> f64;

    fn from_f64(v: f64) -> Self;

    fn from_le_slice(bytes: &[u8]) -> Self;

    fn write_le(self, out: &mut [u8]);
}

impl Element for f32 {
    const DTYPE: ElementType = ElementType::F32;

    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }

    #[inline]
    fn from_f64(v: f64) -> Self {
        v as f32
    }

    #[inline]
    fn from_le_slice(bytes: &[u8]) -> Self {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(bytes);
        f32::from_le_bytes(buf)
    }

    #[inline]
    fn write_le(self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_le_bytes());
    }
}

impl Element for f64 {
    const DTYPE: ElementType = ElementType::F64;

    #[inline]
    fn to_f64(self) -> f64 {
        self
    }

    #[inline]
    fn from_f64(v: f64) -> Self {
        v
    }

    #[inline]
    fn from_le_slice(bytes: &[u8]) -> Self {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        f64::from_le_bytes(buf)
    }

    #[inline]
    fn write_le(self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_le_bytes());
    }
}

impl Element for f16 {
    const DTYPE: ElementType = ElementType::F16;

    #[inline]
    fn to_f64(self) -> f64 {
        f16::to_f64(self)
    }

    #[inline]
    fn from_f64(v: f64) -> Self {
        f16::from_f64(v)
    }

    #[inline]
    fn from_le_slice(bytes: &[u8]) -> Self {
        f16::from_bits(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    #[inline]
    fn write_le(self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_bits().to_le_bytes());
    }
}

impl Element for bf16 {
    const DTYPE: ElementType = ElementType::BF16;

    #[inline]
    fn to_f64(self) -> f64 {
        bf16::to_f64(self)
    }

    #[inline]
    fn from_f64(v: f64) -> Self {
        bf16::from_f64(v)
    }

    #[inline]
    fn from_le_slice(bytes: &[u8]) -> Self {
        bf16::from_bits(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    #[inline]
    fn write_le(self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_bits().to_le_bytes());
    }
}

fn read_element<T: Element>(bytes: &[u8], index: usize) -> f64 {
    let width = size_of::<T>();
    let start = index * width;
    T::from_le_slice(&bytes[start..start + width]).to_f64()
}

fn write_element<T: Element>(bytes: &mut [u8], index: usize, value: f64) {
    let width = size_of::<T>();
    let start = index * width;
    T::from_f64(value).write_le(&mut bytes[start..start + width]);
}
