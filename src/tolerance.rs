use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::dtype::ElementType;

/// Absolute/relative error bounds: `|actual - expected| <= atol + rtol * |expected|`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ToleranceSpec {
    pub atol: f64,
    pub rtol: f64,
}

impl ToleranceSpec {
    pub const fn new(atol: f64, rtol: f64) -> Self {
        Self { atol, rtol }
    }

    pub fn allowed(&self, expected: f64) -> f64 {
        self.atol + self.rtol * expected.abs()
    }

    pub fn accepts(&self, actual: f64, expected: f64) -> bool {
        if actual.is_nan() || expected.is_nan() {
            return false;
        }
        if actual == expected {
            return true;
        }
        (actual - expected).abs() <= self.allowed(expected)
    }

    /// How much looser `self` is than `other`, taking the larger of the two bound ratios.
    pub fn scale_over(&self, other: &ToleranceSpec) -> f64 {
        let atol = if other.atol > 0.0 {
            self.atol / other.atol
        } else {
            f64::INFINITY
        };
        let rtol = if other.rtol > 0.0 {
            self.rtol / other.rtol
        } else {
            f64::INFINITY
        };
        atol.max(rtol)
    }
}

/// Per-element-type tolerance table for one operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToleranceProfile {
    specs: BTreeMap<ElementType, ToleranceSpec>,
}

impl ToleranceProfile {
    pub fn new() -> Self {
        Self {
            specs: BTreeMap::new(),
        }
    }

    pub fn defaults() -> Self {
        let specs = ElementType::ALL
            .iter()
            .map(|dtype| (*dtype, dtype.default_tolerance()))
            .collect();
        Self { specs }
    }

    pub fn with(mut self, dtype: ElementType, spec: ToleranceSpec) -> Self {
        self.specs.insert(dtype, spec);
        self
    }

    pub fn get(&self, dtype: ElementType) -> ToleranceSpec {
        self.specs
            .get(&dtype)
            .copied()
            .unwrap_or_else(|| dtype.default_tolerance())
    }

    /// Checks that narrower representations never get tighter bounds than wider ones.
    pub fn is_ordered(&self) -> bool {
        let f32_spec = self.get(ElementType::F32);
        let f64_spec = self.get(ElementType::F64);
        let wider_ok = f32_spec.atol >= f64_spec.atol && f32_spec.rtol >= f64_spec.rtol;
        let narrow_ok = [ElementType::F16, ElementType::BF16].iter().all(|dtype| {
            let spec = self.get(*dtype);
            spec.atol >= f32_spec.atol && spec.rtol >= f32_spec.rtol
        });
        wider_ok && narrow_ok
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ElementType, &ToleranceSpec)> {
        self.specs.iter()
    }
}

impl Default for ToleranceProfile {
    fn default() -> Self {
        Self::defaults()
    }
}
