pub mod abi;
pub mod backend;
pub mod cases;
pub mod compare;
pub mod device;
pub mod dtype;
pub mod error;
pub mod harness;
pub mod layout;
pub mod ops;
pub mod oracle;
pub mod profile;
pub mod protocol;
pub mod storage;
pub mod telemetry;
pub mod tensor;
pub mod tolerance;
pub mod workspace;

pub use abi::{OpKind, OperatorBackend, RawHandle, Status};
pub use backend::HostBackend;
pub use cases::{CaseEntry, CaseTable, InplaceMode, TestCase, Trial};
pub use compare::{compare, Comparison, Mismatch};
pub use device::{enumerate_devices, Device, DeviceKind, Stream};
pub use dtype::{Element, ElementType};
pub use error::{FailureKind, OpError, Result};
pub use harness::{
    FailurePolicy, Harness, HarnessConfig, HarnessReport, StageTiming, TrialOutcome, TrialProfile,
    TrialReport,
};
pub use layout::{Layout, LayoutKind};
pub use ops::{builtin_operators, operator_by_name, AddOp, Operator, SoftmaxOp};
pub use profile::{ProfileReport, Profiler};
pub use protocol::{Created, Descriptor, OpClient, Prepared};
pub use storage::Buffer;
pub use tensor::{Fill, TensorDesc, TensorMeta, TestTensor};
pub use tolerance::{ToleranceProfile, ToleranceSpec};
pub use workspace::{Workspace, WorkspaceManager, WorkspaceStats};
