use crate::abi::OpKind;
use crate::cases::{CaseEntry, CaseTable, InplaceMode};
use crate::dtype::ElementType;
use crate::error::Result;
use crate::oracle;
use crate::tolerance::{ToleranceProfile, ToleranceSpec};

/// Softmax over the innermost axis.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftmaxOp;

impl SoftmaxOp {
    pub fn cases() -> Vec<CaseEntry> {
        vec![
            CaseEntry::new(&[3, 3]),
            CaseEntry::new(&[32, 512]),
            CaseEntry::new(&[32, 512])
                .with_input_strides(&[1024, 1])
                .with_output_strides(&[1024, 1]),
            CaseEntry::new(&[32, 5, 5]),
            CaseEntry::new(&[32, 20, 512]),
            CaseEntry::new(&[32, 20, 512]).with_input_strides(&[20480, 512, 1]),
            CaseEntry::new(&[28, 15, 15]),
        ]
    }
}

impl super::Operator for SoftmaxOp {
    fn kind(&self) -> OpKind {
        OpKind::Softmax
    }

    fn case_table(&self) -> CaseTable {
        CaseTable::new(
            Self::cases(),
            vec![InplaceMode::Input(0), InplaceMode::OutOfPlace],
        )
    }

    fn dtypes(&self) -> Vec<ElementType> {
        vec![ElementType::F16, ElementType::BF16, ElementType::F32]
    }

    fn tolerance(&self) -> ToleranceProfile {
        ToleranceProfile::defaults()
            .with(ElementType::F16, ToleranceSpec::new(1e-3, 1e-2))
            .with(ElementType::BF16, ToleranceSpec::new(5e-3, 5e-2))
            .with(ElementType::F32, ToleranceSpec::new(3e-5, 1e-5))
    }

    fn reference(&self, shape: &[usize], inputs: &[Vec<f64>]) -> Result<Vec<f64>> {
        oracle::check_inputs("softmax.reference", shape, inputs, 1)?;
        Ok(oracle::softmax_last_axis(shape, &inputs[0]))
    }
}
