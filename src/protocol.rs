//! Typed client over the descriptor ABI.
//!
//! `Descriptor<Created>` can only reach `execute` after its workspace requirement has
//! been queried (`Descriptor<Prepared>`), and `destroy` consumes the descriptor so a
//! destroyed handle cannot be reached again from safe code. A descriptor that is dropped
//! without an explicit `destroy` releases its handle on the way out.

use std::fmt;
use std::sync::Arc;

use log::{debug, warn};

use crate::abi::{OpKind, OperatorBackend, RawHandle, Status};
use crate::device::{Device, Stream};
use crate::error::{OpError, Result};
use crate::storage::Buffer;
use crate::tensor::TensorDesc;
use crate::workspace::Workspace;

/// Handle exists, workspace requirement not yet known.
#[derive(Debug, Clone, Copy)]
pub struct Created;

/// Workspace requirement known; ready to execute.
#[derive(Debug, Clone, Copy)]
pub struct Prepared {
    workspace_bytes: usize,
}

#[derive(Clone)]
pub struct OpClient {
    backend: Arc<dyn OperatorBackend>,
    device: Device,
}

impl OpClient {
    pub fn new(backend: Arc<dyn OperatorBackend>, device: &Device) -> Self {
        Self {
            backend,
            device: device.clone(),
        }
    }

    pub fn backend(&self) -> &Arc<dyn OperatorBackend> {
        &self.backend
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn create(
        &self,
        op: OpKind,
        output: &TensorDesc,
        inputs: &[&TensorDesc],
    ) -> Result<Descriptor<Created>> {
        if inputs.len() != op.num_inputs() {
            return Err(OpError::InvalidArgument {
                op: "descriptor.create",
                msg: format!(
                    "{op} takes {} input(s), got {}",
                    op.num_inputs(),
                    inputs.len()
                ),
            });
        }
        let handle = self
            .backend
            .create(op, &self.device, output, inputs)
            .map_err(|status| create_error(status, output))?;
        debug!(
            "{}: created {op} descriptor {handle} on {}",
            self.backend.name(),
            self.device
        );
        Ok(Descriptor {
            backend: Arc::clone(&self.backend),
            device: self.device.clone(),
            op,
            handle,
            live: true,
            state: Created,
        })
    }
}

impl fmt::Debug for OpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpClient")
            .field("backend", &self.backend.name())
            .field("device", &self.device.name())
            .finish()
    }
}

fn create_error(status: Status, output: &TensorDesc) -> OpError {
    match (status, output.meta()) {
        (Status::InvalidLayout, Ok(meta)) => OpError::InvalidLayout {
            op: "descriptor.create",
            shape: meta.shape,
            strides: meta.strides,
            msg: "backend rejected the tensor layout".to_string(),
        },
        (status, _) => status.into_error("descriptor.create", None),
    }
}

pub struct Descriptor<S> {
    backend: Arc<dyn OperatorBackend>,
    device: Device,
    op: OpKind,
    handle: RawHandle,
    live: bool,
    state: S,
}

impl<S> Descriptor<S> {
    pub fn op(&self) -> OpKind {
        self.op
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn handle(&self) -> RawHandle {
        self.handle
    }

    /// Backend-declared scratch size; stable for the lifetime of the handle.
    pub fn workspace_size(&self) -> Result<usize> {
        self.backend
            .workspace_size(self.handle)
            .map_err(|status| status.into_error("descriptor.workspace_size", Some(self.handle)))
    }

    pub fn destroy(mut self) -> Result<()> {
        self.live = false;
        debug!("{}: destroy descriptor {}", self.backend.name(), self.handle);
        self.backend
            .destroy(self.handle)
            .map_err(|status| match status {
                Status::InvalidHandle => OpError::DoubleDestroy {
                    op: "descriptor.destroy",
                    what: format!("handle {}", self.handle),
                },
                other => other.into_error("descriptor.destroy", Some(self.handle)),
            })
    }

    fn advance<T>(mut self, state: T) -> Descriptor<T> {
        self.live = false;
        Descriptor {
            backend: Arc::clone(&self.backend),
            device: self.device.clone(),
            op: self.op,
            handle: self.handle,
            live: true,
            state,
        }
    }
}

impl Descriptor<Created> {
    pub fn prepare(self) -> Result<Descriptor<Prepared>> {
        let workspace_bytes = self.workspace_size()?;
        Ok(self.advance(Prepared { workspace_bytes }))
    }
}

impl Descriptor<Prepared> {
    pub fn workspace_bytes(&self) -> usize {
        self.state.workspace_bytes
    }

    /// Runs on the device's own stream (inline on synchronous devices).
    pub fn execute(
        &self,
        workspace: &Workspace,
        output: &Buffer,
        inputs: &[&Buffer],
    ) -> Result<()> {
        self.execute_on(workspace, output, inputs, self.device.stream())
    }

    pub fn execute_on(
        &self,
        workspace: &Workspace,
        output: &Buffer,
        inputs: &[&Buffer],
        stream: Option<&Stream>,
    ) -> Result<()> {
        if inputs.len() != self.op.num_inputs() {
            return Err(OpError::InvalidArgument {
                op: "descriptor.execute",
                msg: format!(
                    "{} takes {} input buffer(s), got {}",
                    self.op,
                    self.op.num_inputs(),
                    inputs.len()
                ),
            });
        }
        self.backend
            .execute(
                self.handle,
                workspace.buffer(),
                workspace.size(),
                output,
                inputs,
                stream,
            )
            .map_err(|status| match status {
                Status::WorkspaceTooSmall => OpError::WorkspaceTooSmall {
                    op: "descriptor.execute",
                    required: self.state.workspace_bytes,
                    provided: workspace.size(),
                },
                other => other.into_error("descriptor.execute", Some(self.handle)),
            })
    }
}

impl<S> Drop for Descriptor<S> {
    fn drop(&mut self) {
        if !self.live {
            return;
        }
        debug!(
            "{}: releasing descriptor {} on drop",
            self.backend.name(),
            self.handle
        );
        if let Err(status) = self.backend.destroy(self.handle) {
            warn!(
                "{}: destroy of descriptor {} failed on drop: {status}",
                self.backend.name(),
                self.handle
            );
        }
    }
}

impl<S: fmt::Debug> fmt::Debug for Descriptor<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("backend", &self.backend.name())
            .field("op", &self.op)
            .field("handle", &self.handle)
            .field("live", &self.live)
            .field("state", &self.state)
            .finish()
    }
}
