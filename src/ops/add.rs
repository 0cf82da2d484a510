use crate::abi::OpKind;
use crate::cases::{CaseEntry, CaseTable, InplaceMode};
use crate::dtype::ElementType;
use crate::error::Result;
use crate::oracle;
use crate::tolerance::{ToleranceProfile, ToleranceSpec};

/// Elementwise `c = a + b` over equal shapes. Needs no workspace.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddOp;

impl AddOp {
    pub fn cases() -> Vec<CaseEntry> {
        vec![
            CaseEntry::new(&[13, 4]),
            CaseEntry::new(&[13, 4]).with_input_strides(&[10, 1]),
            CaseEntry::new(&[13, 4]).with_output_strides(&[1, 13]),
            CaseEntry::new(&[16, 5632]),
            CaseEntry::new(&[4, 4, 5632]).with_output_strides(&[45056, 5632, 1]),
        ]
    }
}

impl super::Operator for AddOp {
    fn kind(&self) -> OpKind {
        OpKind::Add
    }

    fn case_table(&self) -> CaseTable {
        CaseTable::new(
            Self::cases(),
            vec![
                InplaceMode::OutOfPlace,
                InplaceMode::Input(0),
                InplaceMode::Input(1),
            ],
        )
    }

    fn dtypes(&self) -> Vec<ElementType> {
        vec![
            ElementType::F16,
            ElementType::BF16,
            ElementType::F32,
            ElementType::F64,
        ]
    }

    fn tolerance(&self) -> ToleranceProfile {
        ToleranceProfile::defaults()
            .with(ElementType::F16, ToleranceSpec::new(1e-3, 1e-3))
            .with(ElementType::BF16, ToleranceSpec::new(1e-2, 1e-2))
            .with(ElementType::F32, ToleranceSpec::new(1e-7, 1e-7))
            .with(ElementType::F64, ToleranceSpec::new(1e-12, 1e-12))
    }

    fn reference(&self, shape: &[usize], inputs: &[Vec<f64>]) -> Result<Vec<f64>> {
        oracle::check_inputs("add.reference", shape, inputs, 2)?;
        Ok(oracle::elementwise_add(&inputs[0], &inputs[1]))
    }
}
