#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use opcheck::abi::AbiResult;
use opcheck::{
    Buffer, Device, HarnessConfig, HostBackend, OpKind, OperatorBackend, RawHandle, Status,
    Stream, TensorDesc,
};

pub fn assert_approx_eq(actual: &[f64], expected: &[f64], tol: f64) {
    assert_eq!(
        actual.len(),
        expected.len(),
        "Length mismatch: actual={} expected={}",
        actual.len(),
        expected.len()
    );
    for (i, (a, e)) in actual.iter().zip(expected.iter()).enumerate() {
        assert!(
            (*a - *e).abs() <= tol,
            "Mismatch at index {}: actual={} expected={} with tol={}",
            i,
            a,
            e,
            tol
        );
    }
}

pub fn ramp(len: usize, scale: f64) -> Vec<f64> {
    (0..len).map(|idx| idx as f64 * scale - 1.0).collect()
}

/// Small profiling budget so profiled runs stay fast.
pub fn quick_config() -> HarnessConfig {
    HarnessConfig::default().with_warmup(1).with_iterations(3)
}

pub fn host_backend() -> Arc<HostBackend> {
    Arc::new(HostBackend::new())
}

/// Delegates every call to an inner `HostBackend`.
macro_rules! delegate_backend {
    () => {
        fn name(&self) -> &str {
            self.inner.name()
        }

        fn create(
            &self,
            op: OpKind,
            device: &Device,
            output: &TensorDesc,
            inputs: &[&TensorDesc],
        ) -> AbiResult<RawHandle> {
            self.inner.create(op, device, output, inputs)
        }

        fn destroy(&self, handle: RawHandle) -> AbiResult<()> {
            self.inner.destroy(handle)
        }
    };
}

/// Runs the real kernel, then overwrites the output region with NaN bytes.
#[derive(Debug, Default)]
pub struct CorruptingBackend {
    inner: HostBackend,
}

impl OperatorBackend for CorruptingBackend {
    delegate_backend!();

    fn workspace_size(&self, handle: RawHandle) -> AbiResult<usize> {
        self.inner.workspace_size(handle)
    }

    fn execute(
        &self,
        handle: RawHandle,
        workspace: Option<&Buffer>,
        workspace_size: usize,
        output: &Buffer,
        inputs: &[&Buffer],
        _stream: Option<&Stream>,
    ) -> AbiResult<()> {
        self.inner
            .execute(handle, workspace, workspace_size, output, inputs, None)?;
        let mut bytes = output.lock().map_err(|_| Status::DeviceFault)?;
        bytes.iter_mut().for_each(|byte| *byte = 0xFF);
        Ok(())
    }
}

/// Every execute fails with a device fault.
#[derive(Debug, Default)]
pub struct FaultyBackend {
    inner: HostBackend,
}

impl OperatorBackend for FaultyBackend {
    delegate_backend!();

    fn workspace_size(&self, handle: RawHandle) -> AbiResult<usize> {
        self.inner.workspace_size(handle)
    }

    fn execute(
        &self,
        handle: RawHandle,
        _workspace: Option<&Buffer>,
        _workspace_size: usize,
        _output: &Buffer,
        _inputs: &[&Buffer],
        _stream: Option<&Stream>,
    ) -> AbiResult<()> {
        self.inner.workspace_size(handle)?;
        Err(Status::DeviceFault)
    }
}

/// Runs the first execute for real and faults on every later one.
#[derive(Debug, Default)]
pub struct FaultsAfterFirstBackend {
    inner: HostBackend,
    executes: AtomicUsize,
}

impl FaultsAfterFirstBackend {
    pub fn live_handles(&self) -> usize {
        self.inner.live_handles()
    }
}

impl OperatorBackend for FaultsAfterFirstBackend {
    delegate_backend!();

    fn workspace_size(&self, handle: RawHandle) -> AbiResult<usize> {
        self.inner.workspace_size(handle)
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
        if self.executes.fetch_add(1, Ordering::SeqCst) > 0 {
            return Err(Status::DeviceFault);
        }
        self.inner
            .execute(handle, workspace, workspace_size, output, inputs, stream)
    }
}

/// Declares no workspace but still needs one.
#[derive(Debug, Default)]
pub struct UnderstatingBackend {
    inner: HostBackend,
}

impl OperatorBackend for UnderstatingBackend {
    delegate_backend!();

    fn workspace_size(&self, handle: RawHandle) -> AbiResult<usize> {
        self.inner.workspace_size(handle).map(|_| 0)
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
        self.inner
            .execute(handle, workspace, workspace_size, output, inputs, stream)
    }
}

/// Keeps the caller's output view and re-reads it at execute time.
#[derive(Debug, Default)]
pub struct StaleViewBackend {
    inner: HostBackend,
    views: Mutex<BTreeMap<RawHandle, TensorDesc>>,
}

impl OperatorBackend for StaleViewBackend {
    fn name(&self) -> &str {
        "stale-view"
    }

    fn create(
        &self,
        op: OpKind,
        device: &Device,
        output: &TensorDesc,
        inputs: &[&TensorDesc],
    ) -> AbiResult<RawHandle> {
        let handle = self.inner.create(op, device, output, inputs)?;
        self.views
            .lock()
            .map_err(|_| Status::DeviceFault)?
            .insert(handle, output.clone());
        Ok(handle)
    }

    fn workspace_size(&self, handle: RawHandle) -> AbiResult<usize> {
        self.inner.workspace_size(handle)
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
        let views = self.views.lock().map_err(|_| Status::DeviceFault)?;
        let view = views.get(&handle).ok_or(Status::InvalidHandle)?;
        view.meta().map_err(|_| Status::InvalidHandle)?;
        self.inner
            .execute(handle, workspace, workspace_size, output, inputs, stream)
    }

    fn destroy(&self, handle: RawHandle) -> AbiResult<()> {
        if let Ok(mut views) = self.views.lock() {
            views.remove(&handle);
        }
        self.inner.destroy(handle)
    }
}
