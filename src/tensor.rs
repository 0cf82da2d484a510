use std::fmt;
use std::sync::{Arc, Mutex};

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::device::Device;
use crate::dtype::ElementType;
use crate::error::{OpError, Result};
use crate::layout::{validate_layout, Layout};
use crate::storage::Buffer;

/// Shape/stride/type metadata exported to a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorMeta {
    pub shape: Vec<usize>,
    pub strides: Vec<usize>,
    pub dtype: ElementType,
}

impl TensorMeta {
    pub fn layout(&self) -> Result<Layout> {
        Layout::new(&self.shape, Some(&self.strides))
    }

    pub fn required_bytes(&self) -> usize {
        crate::layout::required_elements(&self.shape, &self.strides)
            .and_then(|elems| elems.checked_mul(self.dtype.size_in_bytes()))
            .unwrap_or(usize::MAX)
    }
}

/// Descriptor view handed to `create`. Like a C descriptor pointer it can be copied by a
/// backend, but once the owner destroys it every copy reads back `UseAfterFree`.
#[derive(Clone)]
pub struct TensorDesc {
    slot: Arc<Mutex<Option<TensorMeta>>>,
}

impl TensorDesc {
    pub fn new(meta: TensorMeta) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(meta))),
        }
    }

    pub fn meta(&self) -> Result<TensorMeta> {
        let slot = self.slot.lock().map_err(|_| OpError::DeviceFault {
            op: "tensor_desc.meta",
            msg: "descriptor lock poisoned".to_string(),
        })?;
        slot.clone().ok_or_else(|| OpError::UseAfterFree {
            op: "tensor_desc.meta",
            what: "tensor descriptor view".to_string(),
        })
    }

    pub fn is_live(&self) -> bool {
        self.slot.lock().map(|slot| slot.is_some()).unwrap_or(false)
    }

    /// Irreversibly clears the metadata for every copy of this view.
    pub fn destroy(self) {
        if let Ok(mut slot) = self.slot.lock() {
            slot.take();
        }
    }
}

impl fmt::Debug for TensorDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.meta() {
            Ok(meta) => f.debug_tuple("TensorDesc").field(&meta).finish(),
            Err(_) => f.write_str("TensorDesc(<destroyed>)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Fill {
    Zeros,
    /// Uniform in `[-1, 1)` from a seeded generator.
    Random { seed: u64 },
    /// Logical-order values, rounded to the element type.
    Values(Vec<f64>),
}

/// A tensor owned by the harness for the length of one trial.
pub struct TestTensor {
    layout: Layout,
    dtype: ElementType,
    device: Device,
    storage: Buffer,
    desc: Option<TensorDesc>,
}

impl TestTensor {
    pub fn new(
        shape: &[usize],
        strides: Option<&[usize]>,
        dtype: ElementType,
        device: &Device,
        fill: Fill,
    ) -> Result<Self> {
        let layout = Layout::new(shape, strides)?;
        let bytes = layout
            .required_elements()
            .checked_mul(dtype.size_in_bytes())
            .ok_or_else(|| OpError::InvalidLayout {
                op: "test_tensor.new",
                shape: shape.to_vec(),
                strides: layout.strides().to_vec(),
                msg: "storage size overflow".to_string(),
            })?;
        let storage = device.allocate(bytes)?;
        let desc = TensorDesc::new(TensorMeta {
            shape: layout.shape().to_vec(),
            strides: layout.strides().to_vec(),
            dtype,
        });
        let tensor = Self {
            layout,
            dtype,
            device: device.clone(),
            storage,
            desc: Some(desc),
        };
        match fill {
            Fill::Zeros => {}
            Fill::Random { seed } => {
                let mut rng = StdRng::seed_from_u64(seed);
                let values: Vec<f64> = (0..tensor.layout.numel())
                    .map(|_| rng.gen_range(-1.0..1.0))
                    .collect();
                tensor.write_logical(&values)?;
            }
            Fill::Values(values) => tensor.write_logical(&values)?,
        }
        Ok(tensor)
    }

    pub fn from_values(
        values: &[f64],
        shape: &[usize],
        strides: Option<&[usize]>,
        dtype: ElementType,
        device: &Device,
    ) -> Result<Self> {
        Self::new(shape, strides, dtype, device, Fill::Values(values.to_vec()))
    }

    /// Second logical view over the same storage, with its own descriptor view.
    pub fn alias(&self) -> Self {
        Self {
            layout: self.layout.clone(),
            dtype: self.dtype,
            device: self.device.clone(),
            storage: self.storage.clone(),
            desc: Some(TensorDesc::new(self.meta())),
        }
    }

    pub fn shape(&self) -> &[usize] {
        self.layout.shape()
    }

    pub fn strides(&self) -> &[usize] {
        self.layout.strides()
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn dtype(&self) -> ElementType {
        self.dtype
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn numel(&self) -> usize {
        self.layout.numel()
    }

    pub fn meta(&self) -> TensorMeta {
        TensorMeta {
            shape: self.layout.shape().to_vec(),
            strides: self.layout.strides().to_vec(),
            dtype: self.dtype,
        }
    }

    pub fn descriptor(&self) -> Result<&TensorDesc> {
        self.desc.as_ref().ok_or_else(|| OpError::UseAfterFree {
            op: "test_tensor.descriptor",
            what: "descriptor view already destroyed".to_string(),
        })
    }

    pub fn has_descriptor(&self) -> bool {
        self.desc.is_some()
    }

    /// Invalidates the exported descriptor view. Storage stays readable.
    pub fn destroy_desc(&mut self) {
        if let Some(desc) = self.desc.take() {
            desc.destroy();
        }
    }

    pub fn data(&self) -> &Buffer {
        &self.storage
    }

    pub fn shares_storage_with(&self, other: &TestTensor) -> bool {
        self.storage.same_region(&other.storage)
    }

    /// Gathers logical elements in row-major order.
    pub fn read_logical(&self) -> Result<Vec<f64>> {
        let bytes = self.storage.lock()?;
        self.check_storage(bytes.len(), "test_tensor.read_logical")?;
        Ok(self
            .layout
            .offsets()
            .map(|offset| self.dtype.read(&bytes, offset))
            .collect())
    }

    /// Scatters logical elements; later writes win where the layout aliases.
    pub fn write_logical(&self, values: &[f64]) -> Result<()> {
        if values.len() != self.layout.numel() {
            return Err(OpError::InvalidArgument {
                op: "test_tensor.write_logical",
                msg: format!(
                    "expected {} values for shape {:?}, got {}",
                    self.layout.numel(),
                    self.layout.shape(),
                    values.len()
                ),
            });
        }
        let mut bytes = self.storage.lock()?;
        self.check_storage(bytes.len(), "test_tensor.write_logical")?;
        for (offset, value) in self.layout.offsets().zip(values.iter()) {
            self.dtype.write(&mut bytes, offset, *value);
        }
        Ok(())
    }

    fn check_storage(&self, bytes: usize, op: &'static str) -> Result<()> {
        validate_layout(
            self.layout.shape(),
            self.layout.strides(),
            bytes / self.dtype.size_in_bytes(),
            op,
        )
    }
}

impl fmt::Debug for TestTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestTensor")
            .field("shape", &self.shape())
            .field("strides", &self.strides())
            .field("dtype", &self.dtype)
            .field("device", &self.device.name())
            .field("descriptor_live", &self.has_descriptor())
            .finish()
    }
}
