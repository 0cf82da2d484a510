use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{OpError, Result};
use crate::storage::Buffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceKind {
    /// Host memory, work runs on the calling thread.
    Cpu,
    /// Host memory, work is queued on a worker stream and only visible after a sync.
    CpuStream,
}

impl DeviceKind {
    pub const ALL: [DeviceKind; 2] = [DeviceKind::Cpu, DeviceKind::CpuStream];

    pub fn name(self) -> &'static str {
        match self {
            DeviceKind::Cpu => "cpu",
            DeviceKind::CpuStream => "cpu-stream",
        }
    }

    pub fn parse(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(DeviceKind::Cpu),
            "cpu-stream" | "cpu_stream" | "stream" => Ok(DeviceKind::CpuStream),
            other => Err(OpError::InvalidArgument {
                op: "device_kind.parse",
                msg: format!("unknown device '{other}'"),
            }),
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

type Job = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

enum Command {
    Run(Job),
    Barrier(SyncSender<()>),
}

/// In-order work queue drained by a dedicated worker thread.
///
/// The first failing job is latched and reported by the next `synchronize`, the same way
/// asynchronous accelerator runtimes surface launch failures.
pub struct Stream {
    name: String,
    sender: Mutex<Option<Sender<Command>>>,
    fault: Arc<Mutex<Option<OpError>>>,
    submitted: AtomicU64,
    handle: Option<JoinHandle<()>>,
}

impl Stream {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let (sender, receiver) = mpsc::channel::<Command>();
        let fault: Arc<Mutex<Option<OpError>>> = Arc::new(Mutex::new(None));
        let worker_fault = Arc::clone(&fault);
        let worker_name = name.clone();
        let handle = thread::spawn(move || {
            for command in receiver {
                match command {
                    Command::Run(job) => {
                        if let Err(err) = job() {
                            warn!("stream {worker_name}: job failed: {err}");
                            if let Ok(mut slot) = worker_fault.lock() {
                                slot.get_or_insert(err);
                            }
                        }
                    }
                    Command::Barrier(reply) => {
                        let _ = reply.send(());
                    }
                }
            }
        });
        Self {
            name,
            sender: Mutex::new(Some(sender)),
            fault,
            submitted: AtomicU64::new(0),
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn submit<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.send(Command::Run(Box::new(job)))?;
        self.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Blocks until every job submitted so far has run, then reports a latched fault.
    pub fn synchronize(&self) -> Result<()> {
        let (reply, done) = mpsc::sync_channel(1);
        self.send(Command::Barrier(reply))?;
        done.recv().map_err(|_| OpError::DeviceFault {
            op: "stream.synchronize",
            msg: format!("stream {} worker exited", self.name),
        })?;
        let mut slot = self.fault.lock().map_err(|_| OpError::DeviceFault {
            op: "stream.synchronize",
            msg: "fault slot poisoned".to_string(),
        })?;
        match slot.take() {
            Some(err) => Err(OpError::DeviceFault {
                op: "stream.synchronize",
                msg: err.to_string(),
            }),
            None => Ok(()),
        }
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    fn send(&self, command: Command) -> Result<()> {
        let sender = self.sender.lock().map_err(|_| OpError::DeviceFault {
            op: "stream.send",
            msg: "stream sender poisoned".to_string(),
        })?;
        sender
            .as_ref()
            .ok_or_else(|| OpError::DeviceFault {
                op: "stream.send",
                msg: format!("stream {} is closed", self.name),
            })?
            .send(command)
            .map_err(|_| OpError::DeviceFault {
                op: "stream.send",
                msg: format!("stream {} worker exited", self.name),
            })
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.join() {
                warn!("stream {} worker join failed: {err:?}", self.name);
            }
        }
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("name", &self.name)
            .field("submitted", &self.submitted())
            .finish()
    }
}

/// A compute target. Clones share the same stream.
#[derive(Clone)]
pub struct Device {
    kind: DeviceKind,
    ordinal: usize,
    stream: Option<Arc<Stream>>,
}

impl Device {
    pub fn new(kind: DeviceKind, ordinal: usize) -> Self {
        let stream = match kind {
            DeviceKind::Cpu => None,
            DeviceKind::CpuStream => Some(Arc::new(Stream::new(format!(
                "{}:{ordinal}",
                kind.name()
            )))),
        };
        Self {
            kind,
            ordinal,
            stream,
        }
    }

    pub fn cpu() -> Self {
        Self::new(DeviceKind::Cpu, 0)
    }

    pub fn cpu_stream(ordinal: usize) -> Self {
        Self::new(DeviceKind::CpuStream, ordinal)
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn name(&self) -> String {
        format!("{}:{}", self.kind.name(), self.ordinal)
    }

    pub fn is_async(&self) -> bool {
        self.stream.is_some()
    }

    pub fn stream(&self) -> Option<&Stream> {
        self.stream.as_deref()
    }

    /// Barrier before reading results or around timed regions; a no-op on synchronous devices.
    pub fn synchronize(&self) -> Result<()> {
        match self.stream.as_deref() {
            Some(stream) => stream.synchronize(),
            None => Ok(()),
        }
    }

    pub fn allocate(&self, bytes: usize) -> Result<Buffer> {
        if bytes > isize::MAX as usize {
            return Err(OpError::DeviceFault {
                op: "device.allocate",
                msg: format!("{}: cannot allocate {bytes} bytes", self.name()),
            });
        }
        debug!("{}: allocate {bytes} bytes", self.name());
        Ok(Buffer::zeroed(bytes))
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("kind", &self.kind)
            .field("ordinal", &self.ordinal)
            .field("async", &self.is_async())
            .finish()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.name(), self.ordinal)
    }
}

/// Instantiates one device per requested kind, skipping duplicates, in request order.
pub fn enumerate_devices(kinds: &[DeviceKind]) -> Vec<Device> {
    let mut seen = Vec::with_capacity(kinds.len());
    let mut devices = Vec::with_capacity(kinds.len());
    for kind in kinds {
        if seen.contains(kind) {
            continue;
        }
        seen.push(*kind);
        devices.push(Device::new(*kind, 0));
    }
    devices
}
