//! Descriptor ABI between the harness and an operator backend.
//!
//! A backend exposes four calls per operator kind: create a descriptor from tensor
//! descriptor views, report the scratch size it needs, execute against raw device
//! buffers, and destroy. Handles are opaque integers; the backend must copy whatever
//! metadata it needs during `create` because the views are invalidated right after.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::device::{Device, Stream};
use crate::error::OpError;
use crate::storage::Buffer;
use crate::tensor::TensorDesc;

/// Status codes returned by backend calls.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Success = 0,
    /// Malformed call: wrong arity, wrong device, unreadable descriptor view.
    BadParam = 1,
    /// Shapes, strides or types are incompatible with the operator.
    InvalidLayout = 2,
    WorkspaceTooSmall = 3,
    DeviceFault = 4,
    /// Unknown or already destroyed handle.
    InvalidHandle = 5,
}

impl Status {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn is_success(self) -> bool {
        self == Status::Success
    }

    /// Maps a failure status onto the harness error taxonomy.
    pub fn into_error(self, op: &'static str, handle: Option<RawHandle>) -> OpError {
        let subject = match handle {
            Some(handle) => format!("handle {handle}"),
            None => "descriptor".to_string(),
        };
        match self {
            Status::Success | Status::BadParam => OpError::InvalidArgument {
                op,
                msg: format!("backend rejected call on {subject} (status {})", self.code()),
            },
            Status::InvalidLayout => OpError::InvalidLayout {
                op,
                shape: Vec::new(),
                strides: Vec::new(),
                msg: format!("backend rejected layout for {subject}"),
            },
            Status::WorkspaceTooSmall => OpError::WorkspaceTooSmall {
                op,
                required: 0,
                provided: 0,
            },
            Status::DeviceFault => OpError::DeviceFault {
                op,
                msg: format!("backend fault on {subject}"),
            },
            Status::InvalidHandle => OpError::UseAfterFree { op, what: subject },
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RawHandle(pub u64);

impl fmt::Display for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OpKind {
    /// Softmax along the innermost axis.
    Softmax,
    /// Elementwise sum of two inputs.
    Add,
}

impl OpKind {
    pub fn name(self) -> &'static str {
        match self {
            OpKind::Softmax => "softmax",
            OpKind::Add => "add",
        }
    }

    pub fn num_inputs(self) -> usize {
        match self {
            OpKind::Softmax => 1,
            OpKind::Add => 2,
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub type AbiResult<T> = std::result::Result<T, Status>;

pub trait OperatorBackend: Send + Sync {
    fn name(&self) -> &str;

    fn create(
        &self,
        op: OpKind,
        device: &Device,
        output: &TensorDesc,
        inputs: &[&TensorDesc],
    ) -> AbiResult<RawHandle>;

    fn workspace_size(&self, handle: RawHandle) -> AbiResult<usize>;

    /// `stream` is `Some` when the caller wants the work queued rather than run inline.
    #[allow(clippy::too_many_arguments)]
    fn execute(
        &self,
        handle: RawHandle,
        workspace: Option<&Buffer>,
        workspace_size: usize,
        output: &Buffer,
        inputs: &[&Buffer],
        stream: Option<&Stream>,
    ) -> AbiResult<()>;

    fn destroy(&self, handle: RawHandle) -> AbiResult<()>;
}
