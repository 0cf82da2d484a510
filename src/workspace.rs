use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::device::Device;
use crate::error::Result;
use crate::storage::Buffer;

#[derive(Debug, Default)]
struct Counters {
    allocations: AtomicUsize,
    live_bytes: AtomicUsize,
    peak_bytes: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceStats {
    pub allocations: usize,
    pub live_bytes: usize,
    pub peak_bytes: usize,
}

/// Hands out scratch buffers on one device and tracks what is still live.
#[derive(Clone)]
pub struct WorkspaceManager {
    device: Device,
    counters: Arc<Counters>,
}

impl WorkspaceManager {
    pub fn new(device: &Device) -> Self {
        Self {
            device: device.clone(),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Zero-byte requests succeed without touching the device.
    pub fn acquire(&self, size: usize) -> Result<Workspace> {
        if size == 0 {
            return Ok(Workspace {
                buffer: None,
                size: 0,
                counters: None,
            });
        }
        let buffer = self.device.allocate(size)?;
        self.counters.allocations.fetch_add(1, Ordering::Relaxed);
        let live = self.counters.live_bytes.fetch_add(size, Ordering::Relaxed) + size;
        self.counters.peak_bytes.fetch_max(live, Ordering::Relaxed);
        debug!("{}: workspace acquired ({size} bytes)", self.device.name());
        Ok(Workspace {
            buffer: Some(buffer),
            size,
            counters: Some(Arc::clone(&self.counters)),
        })
    }

    pub fn stats(&self) -> WorkspaceStats {
        WorkspaceStats {
            allocations: self.counters.allocations.load(Ordering::Relaxed),
            live_bytes: self.counters.live_bytes.load(Ordering::Relaxed),
            peak_bytes: self.counters.peak_bytes.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for WorkspaceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkspaceManager")
            .field("device", &self.device.name())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Scratch memory for one descriptor; released when dropped.
pub struct Workspace {
    buffer: Option<Buffer>,
    size: usize,
    counters: Option<Arc<Counters>>,
}

impl Workspace {
    pub fn empty() -> Self {
        Self {
            buffer: None,
            size: 0,
            counters: None,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn buffer(&self) -> Option<&Buffer> {
        self.buffer.as_ref()
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Some(counters) = self.counters.take() {
            counters.live_bytes.fetch_sub(self.size, Ordering::Relaxed);
            debug!("workspace released ({} bytes)", self.size);
        }
    }
}

impl fmt::Debug for Workspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workspace")
            .field("size", &self.size)
            .field("allocated", &self.buffer.is_some())
            .finish()
    }
}
