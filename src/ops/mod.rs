pub mod add;
pub(crate) mod kernels;
pub mod softmax;

use crate::abi::OpKind;
use crate::cases::CaseTable;
use crate::dtype::ElementType;
use crate::error::{OpError, Result};
use crate::tolerance::ToleranceProfile;

pub use add::AddOp;
pub use softmax::SoftmaxOp;

/// Harness-side definition of an operator: what to test and how to compute the
/// trusted answer. The kernel itself lives behind the backend ABI.
pub trait Operator: Send + Sync {
    fn kind(&self) -> OpKind;

    fn name(&self) -> &'static str {
        self.kind().name()
    }

    fn num_inputs(&self) -> usize {
        self.kind().num_inputs()
    }

    fn case_table(&self) -> CaseTable;

    fn dtypes(&self) -> Vec<ElementType>;

    fn tolerance(&self) -> ToleranceProfile;

    /// Result over logical row-major values, computed in `f64`.
    fn reference(&self, shape: &[usize], inputs: &[Vec<f64>]) -> Result<Vec<f64>>;
}

pub fn builtin_operators() -> Vec<Box<dyn Operator>> {
    vec![Box::new(SoftmaxOp), Box::new(AddOp)]
}

pub fn operator_by_name(name: &str) -> Result<Box<dyn Operator>> {
    builtin_operators()
        .into_iter()
        .find(|op| op.name() == name.trim().to_ascii_lowercase())
        .ok_or_else(|| OpError::InvalidArgument {
            op: "ops.operator_by_name",
            msg: format!("unknown operator '{name}'"),
        })
}
