use std::{
    fmt::{Debug, Display},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, PoisonError,
    },
};

use rand::Rng;

use crate::{
    compute_graph,
    device::{Device, PooledBuffer},
    error::{ArrayError, Result},
    host::HostArray,
    layout::Layout,
    operation::OperationDescriptor,
};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub(crate) struct NodeId(usize);

impl NodeId {
    fn new() -> Self {
        static COUNT: AtomicUsize = AtomicUsize::new(0);
        Self(COUNT.fetch_add(1, Ordering::SeqCst))
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Element type of an array. Only 32-bit floats are supported.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DType {
    F32,
}

impl DType {
    pub fn wgsl_type(self) -> &'static str {
        match self {
            DType::F32 => "f32",
        }
    }

    pub fn size(self) -> usize {
        match self {
            DType::F32 => size_of::<f32>(),
        }
    }
}

/// A strided view of device memory, or a lazy promise of one.
///
/// Cloning shares the node: once any clone is materialized, all of them are.
#[derive(Clone)]
pub struct StridedArray {
    node: Arc<ArrayNode>,
}

struct ArrayNode {
    id: NodeId,
    device: Device,
    state: RwLock<ArrayState>,
}

#[derive(Clone)]
pub(crate) struct ArrayState {
    pub(crate) layout: Layout,
    /// Shared with every view of the same data.
    pub(crate) buffer: Option<Arc<PooledBuffer>>,
    /// Every logical element has this value; no buffer is needed.
    pub(crate) constant: Option<f32>,
    pub(crate) op: Option<OperationDescriptor>,
    pub(crate) lazy: bool,
}

/// What a kernel reads for one operand.
pub(crate) enum KernelOperand {
    Constant(f32),
    Buffer {
        buffer: Arc<PooledBuffer>,
        layout: Layout,
    },
}

pub trait IntoArray<const R: usize> {
    /// Row-major values and the shape they form.
    fn into_host(self) -> Result<(Vec<f32>, Vec<usize>)>;
}

impl IntoArray<0> for f32 {
    fn into_host(self) -> Result<(Vec<f32>, Vec<usize>)> {
        Ok((vec![self], Vec::new()))
    }
}

impl<'a, I> IntoArray<1> for I
where
    I: IntoIterator<Item = &'a f32, IntoIter: ExactSizeIterator>,
{
    fn into_host(self) -> Result<(Vec<f32>, Vec<usize>)> {
        let data: Vec<f32> = self.into_iter().copied().collect();
        let len = data.len();
        Ok((data, vec![len]))
    }
}

impl<'a, I, I2> IntoArray<2> for I
where
    I: IntoIterator<Item = I2, IntoIter: ExactSizeIterator>,
    I2: IntoIterator<Item = &'a f32, IntoIter: ExactSizeIterator>,
{
    fn into_host(self) -> Result<(Vec<f32>, Vec<usize>)> {
        let mut iter = self.into_iter().map(IntoIterator::into_iter).peekable();
        let rows = iter.len();
        let columns = iter.peek().map(ExactSizeIterator::len).unwrap_or_default();
        let mut data = Vec::with_capacity(rows * columns);
        for row in iter {
            let size = row.len();
            if size != columns {
                return Err(ArrayError::shape(format!(
                    "expected a rectangular matrix. The first row has {columns} elements, but another row has {size}"
                )));
            }
            data.extend(row.copied());
        }
        Ok((data, vec![rows, columns]))
    }
}

impl<'a, I, I2, I3> IntoArray<3> for I
where
    I: IntoIterator<Item = I2, IntoIter: ExactSizeIterator>,
    I2: IntoIterator<Item = I3, IntoIter: ExactSizeIterator>,
    I3: IntoIterator<Item = &'a f32, IntoIter: ExactSizeIterator>,
{
    fn into_host(self) -> Result<(Vec<f32>, Vec<usize>)> {
        let mut shape = vec![0; 3];
        let mut data = Vec::new();
        let outer = self.into_iter();
        shape[0] = outer.len();
        for (i, matrix) in outer.enumerate() {
            let matrix = matrix.into_iter();
            if i == 0 {
                shape[1] = matrix.len();
            }
            if matrix.len() != shape[1] {
                return Err(ArrayError::shape(format!(
                    "expected {} rows in every matrix, found {}",
                    shape[1],
                    matrix.len()
                )));
            }
            for (j, row) in matrix.enumerate() {
                let row = row.into_iter();
                if i == 0 && j == 0 {
                    shape[2] = row.len();
                }
                if row.len() != shape[2] {
                    return Err(ArrayError::shape(format!(
                        "expected {} columns in every row, found {}",
                        shape[2],
                        row.len()
                    )));
                }
                data.extend(row.copied());
            }
        }
        Ok((data, shape))
    }
}

fn validate_shape(shape: &[usize]) -> Result<()> {
    if shape.contains(&0) {
        return Err(ArrayError::shape(format!(
            "dimensions must be positive, got {shape:?}"
        )));
    }
    Ok(())
}

impl StridedArray {
    pub fn new<const R: usize>(device: &Device, data: impl IntoArray<R>) -> Result<Self> {
        let (data, shape) = data.into_host()?;
        Self::from_vec(device, &data, &shape)
    }

    pub fn from_vec(device: &Device, data: &[f32], shape: &[usize]) -> Result<Self> {
        validate_shape(shape)?;
        let elements: usize = shape.iter().product();
        if elements != data.len() {
            return Err(ArrayError::shape(format!(
                "{} values cannot fill shape {shape:?}",
                data.len()
            )));
        }
        if let [value] = data {
            return Ok(Self::constant(device, *value, shape));
        }
        let buffer = device.upload(data)?;
        Ok(Self::from_buffer(device, buffer, Layout::contiguous(shape)))
    }

    /// A rank 0 array holding `value`.
    pub fn scalar(device: &Device, value: f32) -> Self {
        Self::constant(device, value, &[])
    }

    pub fn empty(device: &Device, shape: &[usize]) -> Result<Self> {
        validate_shape(shape)?;
        let layout = Layout::contiguous(shape);
        let buffer = device.alloc(layout.num_elements())?;
        Ok(Self::from_buffer(device, buffer, layout))
    }

    pub fn full(device: &Device, shape: &[usize], value: f32) -> Result<Self> {
        validate_shape(shape)?;
        let layout = Layout::contiguous(shape);
        if layout.num_elements() == 1 {
            return Ok(Self::constant(device, value, shape));
        }
        let buffer = device.fill(layout.num_elements(), value)?;
        Ok(Self::from_buffer(device, buffer, layout))
    }

    /// Samples from `[low, high)`.
    pub fn uniform(device: &Device, low: f32, high: f32, shape: &[usize]) -> Result<Self> {
        let distribution = rand::distr::Uniform::new(low, high)
            .map_err(|err| ArrayError::unsupported(format!("uniform({low}, {high}): {err}")))?;
        let elements = shape.iter().product();
        let data: Vec<f32> = {
            let mut rng = device.rng();
            (&mut *rng).sample_iter(distribution).take(elements).collect()
        };
        Self::from_vec(device, &data, shape)
    }

    pub fn normal(device: &Device, loc: f32, scale: f32, shape: &[usize]) -> Result<Self> {
        // rand_distr accepts a negative scale and mirrors the samples.
        if !loc.is_finite() || !scale.is_finite() || scale < 0.0 {
            return Err(ArrayError::unsupported(format!(
                "normal({loc}, {scale}): scale must be a finite non-negative number"
            )));
        }
        let distribution = rand_distr::Normal::new(loc, scale)
            .map_err(|err| ArrayError::unsupported(format!("normal({loc}, {scale}): {err}")))?;
        let elements = shape.iter().product();
        let data: Vec<f32> = {
            let mut rng = device.rng();
            (&mut *rng).sample_iter(distribution).take(elements).collect()
        };
        Self::from_vec(device, &data, shape)
    }

    fn constant(device: &Device, value: f32, shape: &[usize]) -> Self {
        Self::from_state(
            device,
            ArrayState {
                layout: Layout::contiguous(shape),
                buffer: None,
                constant: Some(value),
                op: None,
                lazy: false,
            },
        )
    }

    fn from_buffer(device: &Device, buffer: PooledBuffer, layout: Layout) -> Self {
        Self::from_state(
            device,
            ArrayState {
                layout,
                buffer: Some(Arc::new(buffer)),
                constant: None,
                op: None,
                lazy: false,
            },
        )
    }

    pub(crate) fn from_state(device: &Device, state: ArrayState) -> Self {
        Self {
            node: Arc::new(ArrayNode {
                id: NodeId::new(),
                device: device.clone(),
                state: RwLock::new(state),
            }),
        }
    }

    /// A lazy node with a fresh row-major layout.
    pub(crate) fn lazy(device: &Device, shape: &[usize], op: OperationDescriptor) -> Self {
        Self::from_state(
            device,
            ArrayState {
                layout: Layout::contiguous(shape),
                buffer: None,
                constant: None,
                op: Some(op),
                lazy: true,
            },
        )
    }

    /// Force the node right away when the device is not in lazy mode.
    pub(crate) fn finish(self) -> Result<Self> {
        if !self.device().config().lazy {
            self.realize()?;
        }
        Ok(self)
    }

    pub(crate) fn id(&self) -> NodeId {
        self.node.id
    }

    pub(crate) fn state(&self) -> RwLockReadGuard<'_, ArrayState> {
        self.node
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn state_mut(&self) -> RwLockWriteGuard<'_, ArrayState> {
        self.node
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn descriptor(&self) -> Option<OperationDescriptor> {
        self.state().op.clone()
    }

    /// Rewrite the pending operation of a lazy node.
    pub(crate) fn set_descriptor(&self, op: OperationDescriptor) {
        let mut state = self.state_mut();
        debug_assert!(state.lazy, "only lazy nodes are rewritten");
        state.op = Some(op);
    }

    /// Replace a lazy node with a known constant.
    pub(crate) fn become_constant(&self, value: f32) {
        let mut state = self.state_mut();
        state.constant = Some(value);
        state.buffer = None;
        state.op = None;
        state.lazy = false;
    }

    /// Attach the computed buffer. `layout` replaces the declared layout when the
    /// result landed in a caller supplied destination.
    pub(crate) fn materialize(
        &self,
        buffer: Option<Arc<PooledBuffer>>,
        constant: Option<f32>,
        layout: Option<Layout>,
    ) {
        let mut state = self.state_mut();
        state.buffer = buffer;
        state.constant = constant;
        if let Some(layout) = layout {
            state.layout = layout;
        }
        state.op = None;
        state.lazy = false;
    }

    pub(crate) fn kernel_operand(&self) -> Result<KernelOperand> {
        let state = self.state();
        if let Some(value) = state.constant {
            return Ok(KernelOperand::Constant(value));
        }
        match &state.buffer {
            Some(buffer) => Ok(KernelOperand::Buffer {
                buffer: buffer.clone(),
                layout: state.layout.clone(),
            }),
            None => Err(ArrayError::unsupported(
                "array has neither a buffer nor a constant value",
            )),
        }
    }

    /// Like [`Self::kernel_operand`], but constants are written out to a buffer.
    pub(crate) fn buffer_operand(&self) -> Result<(Arc<PooledBuffer>, Layout)> {
        match self.kernel_operand()? {
            KernelOperand::Buffer { buffer, layout } => Ok((buffer, layout)),
            KernelOperand::Constant(value) => {
                let layout = Layout::contiguous(self.shape().as_ref());
                let buffer = self.device().fill(layout.num_elements(), value)?;
                Ok((Arc::new(buffer), layout))
            }
        }
    }

    pub(crate) fn shares_buffer(&self, other: &StridedArray) -> bool {
        match (&self.state().buffer, &other.state().buffer) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn device(&self) -> &Device {
        &self.node.device
    }

    pub fn layout(&self) -> Layout {
        self.state().layout.clone()
    }

    pub fn shape(&self) -> Box<[usize]> {
        self.state().layout.shape().into()
    }

    pub fn strides(&self) -> Box<[usize]> {
        self.state().layout.strides().into()
    }

    pub fn offset(&self) -> usize {
        self.state().layout.offset()
    }

    pub fn ndim(&self) -> usize {
        self.state().layout.rank()
    }

    pub fn num_elements(&self) -> usize {
        self.state().layout.num_elements()
    }

    pub fn dtype(&self) -> DType {
        DType::F32
    }

    pub fn is_lazy(&self) -> bool {
        self.state().lazy
    }

    pub fn is_c_contiguous(&self) -> bool {
        self.state().layout.is_c_contiguous()
    }

    pub fn is_f_contiguous(&self) -> bool {
        self.state().layout.is_f_contiguous()
    }

    /// The value shared by every element, when known without reading the device.
    pub fn constant_value(&self) -> Option<f32> {
        self.state().constant
    }

    /// Optimize and execute the graph behind this array. A no-op once materialized.
    pub fn realize(&self) -> Result<()> {
        if !self.is_lazy() {
            return Ok(());
        }
        compute_graph::optimize(self);
        compute_graph::resolve(self)
    }

    /// Blocking copy of the logical contents into host memory.
    pub fn to_host(&self) -> Result<HostArray> {
        self.realize()?;
        let (layout, constant, buffer) = {
            let state = self.state();
            (state.layout.clone(), state.constant, state.buffer.clone())
        };
        let shape = layout.shape().into();
        if let Some(value) = constant {
            return Ok(HostArray::new(vec![value; layout.num_elements()], shape));
        }
        match buffer {
            Some(buffer) if layout.is_c_contiguous() => {
                let data =
                    self.device()
                        .download(&buffer, layout.offset(), layout.num_elements())?;
                Ok(HostArray::new(data, shape))
            }
            Some(_) => self.contiguous()?.to_host(),
            None => Err(ArrayError::unsupported(
                "array has neither a buffer nor a constant value",
            )),
        }
    }
}

impl Debug for StridedArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        let mut debug = f.debug_struct("StridedArray");
        debug
            .field("id", &format_args!("{}", self.id()))
            .field("layout", &format_args!("{}", state.layout));
        if let Some(value) = state.constant {
            debug.field("constant", &value);
        }
        if let Some(op) = &state.op {
            debug.field("op", &op.label());
        }
        debug.field("lazy", &state.lazy).finish()
    }
}
