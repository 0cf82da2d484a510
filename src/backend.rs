//! In-tree backend implementing the descriptor ABI on host devices.
//!
//! `create` copies every shape, stride and type it needs into a private plan, so the
//! caller's descriptor views are never consulted again. Handles index a table; unknown
//! or destroyed handles yield `Status::InvalidHandle`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, warn};

use crate::abi::{AbiResult, OpKind, OperatorBackend, RawHandle, Status};
use crate::device::{Device, DeviceKind, Stream};
use crate::error::Result;
use crate::ops::kernels::{self, Operand, Operands, Source};
use crate::storage::Buffer;
use crate::tensor::{TensorDesc, TensorMeta};

#[derive(Debug)]
struct Plan {
    op: OpKind,
    device: DeviceKind,
    output: Operand,
    inputs: Vec<Operand>,
    workspace_bytes: usize,
}

#[derive(Debug)]
pub struct HostBackend {
    name: String,
    next_handle: AtomicU64,
    plans: Mutex<BTreeMap<RawHandle, Arc<Plan>>>,
}

impl HostBackend {
    pub fn new() -> Self {
        Self::with_name("host")
    }

    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            next_handle: AtomicU64::new(1),
            plans: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn live_handles(&self) -> usize {
        self.plans.lock().map(|plans| plans.len()).unwrap_or(0)
    }

    fn plans(&self) -> AbiResult<MutexGuard<'_, BTreeMap<RawHandle, Arc<Plan>>>> {
        self.plans.lock().map_err(|_| Status::DeviceFault)
    }

    fn plan(&self, handle: RawHandle) -> AbiResult<Arc<Plan>> {
        self.plans()?
            .get(&handle)
            .cloned()
            .ok_or(Status::InvalidHandle)
    }
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn operand(meta: TensorMeta) -> AbiResult<Operand> {
    let layout = meta.layout().map_err(|_| Status::InvalidLayout)?;
    Ok(Operand {
        layout,
        dtype: meta.dtype,
    })
}

fn build_plan(
    op: OpKind,
    device: &Device,
    output: TensorMeta,
    inputs: Vec<TensorMeta>,
) -> AbiResult<Plan> {
    if inputs.len() != op.num_inputs() {
        return Err(Status::BadParam);
    }
    let output = operand(output)?;
    let inputs = inputs.into_iter().map(operand).collect::<AbiResult<Vec<_>>>()?;
    if inputs.iter().any(|input| input.dtype != output.dtype) {
        return Err(Status::InvalidLayout);
    }
    if inputs
        .iter()
        .any(|input| input.layout.shape() != output.layout.shape())
    {
        return Err(Status::InvalidLayout);
    }
    let workspace_bytes = kernels::workspace_bytes(op, &output);
    Ok(Plan {
        op,
        device: device.kind(),
        output,
        inputs,
        workspace_bytes,
    })
}

/// Locks every distinct region once and runs the kernel.
fn launch(
    plan: &Plan,
    workspace: Option<&Buffer>,
    output: &Buffer,
    inputs: &[&Buffer],
) -> Result<()> {
    let mut output_bytes = output.lock()?;
    let mut regions: Vec<&Buffer> = Vec::new();
    let mut sources = Vec::with_capacity(inputs.len());
    for input in inputs {
        if input.same_region(output) {
            sources.push(Source::Output);
        } else if let Some(slot) = regions.iter().position(|region| region.same_region(input)) {
            sources.push(Source::Slot(slot));
        } else {
            regions.push(*input);
            sources.push(Source::Slot(regions.len() - 1));
        }
    }
    let guards = regions
        .iter()
        .map(|region| region.lock())
        .collect::<Result<Vec<_>>>()?;
    let mut scratch_guard = match workspace {
        Some(buffer) => Some(buffer.lock()?),
        None => None,
    };
    let scratch: &mut [u8] = match scratch_guard.as_mut() {
        Some(bytes) => bytes.as_mut_slice(),
        None => &mut [],
    };
    let mut operands = Operands {
        output: output_bytes.as_mut_slice(),
        inputs: guards.iter().map(|guard| guard.as_slice()).collect(),
        sources,
    };
    kernels::run(plan.op, &plan.output, &plan.inputs, &mut operands, scratch)
}

impl OperatorBackend for HostBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(
        &self,
        op: OpKind,
        device: &Device,
        output: &TensorDesc,
        inputs: &[&TensorDesc],
    ) -> AbiResult<RawHandle> {
        let output = output.meta().map_err(|_| Status::BadParam)?;
        let inputs = inputs
            .iter()
            .map(|desc| desc.meta())
            .collect::<Result<Vec<_>>>()
            .map_err(|_| Status::BadParam)?;
        let plan = build_plan(op, device, output, inputs)?;
        let handle = RawHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        debug!(
            "{}: {op} plan {handle} on {} needs {} workspace bytes",
            self.name, plan.device, plan.workspace_bytes
        );
        self.plans()?.insert(handle, Arc::new(plan));
        Ok(handle)
    }

    fn workspace_size(&self, handle: RawHandle) -> AbiResult<usize> {
        Ok(self.plan(handle)?.workspace_bytes)
    }

    fn execute(
        &self,
        handle: RawHandle,
        workspace: Option<&Buffer>,
        workspace_size: usize,
        output: &Buffer,
        inputs: &[&Buffer],
        stream: Option<&Stream>,
    ) -> AbiResult<()> {
        let plan = self.plan(handle)?;
        let provided = workspace.map_or(0, |buffer| buffer.len().min(workspace_size));
        if provided < plan.workspace_bytes {
            return Err(Status::WorkspaceTooSmall);
        }
        if inputs.len() != plan.inputs.len() || output.len() < plan.output.required_bytes() {
            return Err(Status::BadParam);
        }
        if inputs
            .iter()
            .zip(plan.inputs.iter())
            .any(|(buffer, operand)| buffer.len() < operand.required_bytes())
        {
            return Err(Status::BadParam);
        }
        if let Some(scratch) = workspace {
            if scratch.same_region(output)
                || inputs.iter().any(|input| scratch.same_region(input))
            {
                return Err(Status::BadParam);
            }
        }
        match stream {
            Some(stream) => {
                let workspace = workspace.cloned();
                let output = output.clone();
                let inputs: Vec<Buffer> = inputs.iter().map(|input| (*input).clone()).collect();
                stream
                    .submit(move || {
                        let inputs: Vec<&Buffer> = inputs.iter().collect();
                        launch(&plan, workspace.as_ref(), &output, &inputs)
                    })
                    .map_err(|_| Status::DeviceFault)
            }
            None => launch(&plan, workspace, output, inputs).map_err(|err| {
                warn!("{}: {} execute on {handle} failed: {err}", self.name, plan.op);
                Status::DeviceFault
            }),
        }
    }

    fn destroy(&self, handle: RawHandle) -> AbiResult<()> {
        self.plans()?
            .remove(&handle)
            .map(|_| ())
            .ok_or(Status::InvalidHandle)
    }
}
