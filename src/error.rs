use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum OpError {
    #[error("{op}: invalid layout shape={shape:?} strides={strides:?}: {msg}")]
    InvalidLayout {
        op: &'static str,
        shape: Vec<usize>,
        strides: Vec<usize>,
        msg: String,
    },
    #[error("{op}: {msg}")]
    InvalidArgument { op: &'static str, msg: String },
    #[error("{op}: workspace too small: required {required} bytes, provided {provided}")]
    WorkspaceTooSmall {
        op: &'static str,
        required: usize,
        provided: usize,
    },
    #[error("{op}: device fault: {msg}")]
    DeviceFault { op: &'static str, msg: String },
    #[error("{op}: use after free: {what}")]
    UseAfterFree { op: &'static str, what: String },
    #[error("{op}: double destroy: {what}")]
    DoubleDestroy { op: &'static str, what: String },
    #[error(
        "tolerance exceeded: {mismatches}/{total} elements, worst at {index:?}: \
         actual={actual} expected={expected} error={error:.3e} allowed={allowed:.3e}"
    )]
    ToleranceExceeded {
        mismatches: usize,
        total: usize,
        index: Vec<usize>,
        actual: f64,
        expected: f64,
        error: f64,
        allowed: f64,
    },
    #[error("{op}: unsupported: {msg}")]
    Unsupported { op: &'static str, msg: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    InvalidLayout,
    InvalidArgument,
    WorkspaceTooSmall,
    DeviceFault,
    UseAfterFree,
    DoubleDestroy,
    ToleranceExceeded,
    Unsupported,
}

impl OpError {
    pub fn kind(&self) -> FailureKind {
        match self {
            OpError::InvalidLayout { .. } => FailureKind::InvalidLayout,
            OpError::InvalidArgument { .. } => FailureKind::InvalidArgument,
            OpError::WorkspaceTooSmall { .. } => FailureKind::WorkspaceTooSmall,
            OpError::DeviceFault { .. } => FailureKind::DeviceFault,
            OpError::UseAfterFree { .. } => FailureKind::UseAfterFree,
            OpError::DoubleDestroy { .. } => FailureKind::DoubleDestroy,
            OpError::ToleranceExceeded { .. } => FailureKind::ToleranceExceeded,
            OpError::Unsupported { .. } => FailureKind::Unsupported,
        }
    }

    /// Errors that can only come from a harness bug; these abort a run instead of
    /// failing a single trial.
    pub fn is_protocol_misuse(&self) -> bool {
        matches!(
            self,
            OpError::UseAfterFree { .. }
                | OpError::DoubleDestroy { .. }
                | OpError::WorkspaceTooSmall { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, OpError>;
