use std::fmt;

use serde::{Deserialize, Serialize};

use crate::device::Device;
use crate::dtype::ElementType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InplaceMode {
    OutOfPlace,
    /// The output aliases input `n`.
    Input(usize),
}

impl fmt::Display for InplaceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InplaceMode::OutOfPlace => f.write_str("out-of-place"),
            InplaceMode::Input(idx) => write!(f, "inplace-input{idx}"),
        }
    }
}

/// One row of an operator's case table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseEntry {
    pub shape: Vec<usize>,
    pub input_strides: Option<Vec<usize>>,
    pub output_strides: Option<Vec<usize>>,
}

impl CaseEntry {
    pub fn new(shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
            input_strides: None,
            output_strides: None,
        }
    }

    pub fn with_input_strides(mut self, strides: &[usize]) -> Self {
        self.input_strides = Some(strides.to_vec());
        self
    }

    pub fn with_output_strides(mut self, strides: &[usize]) -> Self {
        self.output_strides = Some(strides.to_vec());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub shape: Vec<usize>,
    pub input_strides: Option<Vec<usize>>,
    pub output_strides: Option<Vec<usize>>,
    pub inplace: InplaceMode,
}

impl TestCase {
    pub fn label(&self) -> String {
        format!(
            "shape={:?} input_strides={:?} output_strides={:?} {}",
            self.shape, self.input_strides, self.output_strides, self.inplace
        )
    }
}

impl fmt::Display for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// A fully specified unit of work: case × element type × device.
#[derive(Debug, Clone)]
pub struct Trial {
    pub device: Device,
    pub case: TestCase,
    pub dtype: ElementType,
}

impl Trial {
    pub fn label(&self) -> String {
        format!("{} {} {}", self.device.name(), self.dtype, self.case.label())
    }
}

/// Cartesian product of case entries and in-place modes. Enumeration order is
/// entry-major, mode-minor, and never depends on anything but the table itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseTable {
    entries: Vec<CaseEntry>,
    modes: Vec<InplaceMode>,
}

impl CaseTable {
    pub fn new(entries: Vec<CaseEntry>, modes: Vec<InplaceMode>) -> Self {
        Self { entries, modes }
    }

    pub fn entries(&self) -> &[CaseEntry] {
        &self.entries
    }

    pub fn modes(&self) -> &[InplaceMode] {
        &self.modes
    }

    pub fn len(&self) -> usize {
        self.entries.len() * self.modes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cases(&self) -> impl Iterator<Item = TestCase> + '_ {
        self.entries.iter().flat_map(move |entry| {
            self.modes.iter().map(move |mode| TestCase {
                shape: entry.shape.clone(),
                input_strides: entry.input_strides.clone(),
                output_strides: entry.output_strides.clone(),
                inplace: *mode,
            })
        })
    }

    /// Trials for one device: every case, then every element type within a case.
    pub fn trials_for<'a>(
        &'a self,
        device: &'a Device,
        dtypes: &'a [ElementType],
    ) -> impl Iterator<Item = Trial> + 'a {
        self.cases().flat_map(move |case| {
            dtypes.iter().map(move |dtype| Trial {
                device: device.clone(),
                case: case.clone(),
                dtype: *dtype,
            })
        })
    }

    pub fn trials<'a>(
        &'a self,
        devices: &'a [Device],
        dtypes: &'a [ElementType],
    ) -> impl Iterator<Item = Trial> + 'a {
        devices
            .iter()
            .flat_map(move |device| self.trials_for(device, dtypes))
    }
}
