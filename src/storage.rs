use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{OpError, Result};

/// Device memory region. Clones share the same bytes, which is how in-place trials hand
/// one region to a backend as both input and output.
#[derive(Clone)]
pub struct Buffer {
    bytes: Arc<Mutex<Vec<u8>>>,
    len: usize,
}

impl Buffer {
    pub fn zeroed(len: usize) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(vec![0u8; len])),
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True when both handles point at the same region.
    pub fn same_region(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.bytes, &other.bytes)
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, Vec<u8>>> {
        self.bytes.lock().map_err(|_| OpError::DeviceFault {
            op: "buffer.lock",
            msg: "buffer lock poisoned".to_string(),
        })
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(self.lock()?.clone())
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len)
            .field("region", &Arc::as_ptr(&self.bytes))
            .finish()
    }
}
