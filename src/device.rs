use std::{
    collections::{BTreeMap, HashMap},
    fmt::Display,
    ops::Deref,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use rand::{rngs::StdRng, SeedableRng};
use wgpu::{util::DownloadBuffer, COPY_BUFFER_ALIGNMENT};

use crate::{
    array::DType,
    config::DeviceConfig,
    error::{ArrayError, Result},
    kernel::KernelCache,
    operation::Operator,
};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Round a byte size up to something wgpu can copy and bind.
pub(crate) fn padded_tensor_size(unpadded_size: u64) -> u64 {
    // Valid vulkan usage is
    // 1. buffer size must be a multiple of COPY_BUFFER_ALIGNMENT.
    // 2. buffer size must be greater than 0.
    // Therefore we round the value up to the nearest multiple, and ensure it's at least COPY_BUFFER_ALIGNMENT.
    let align_mask = COPY_BUFFER_ALIGNMENT - 1;
    ((unpadded_size + align_mask) & !align_mask).max(COPY_BUFFER_ALIGNMENT)
}

/// The compute context every array is created on.
///
/// Owns the wgpu device and queue, the buffer pool, the compiled kernel cache and
/// the random generator. Cloning is cheap and shares all of them.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

struct DeviceInner {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_info: wgpu::AdapterInfo,
    limits: wgpu::Limits,
    config: DeviceConfig,
    pool: Arc<BufferPool>,
    kernels: KernelCache,
    stats: Mutex<KernelStats>,
    rng: Mutex<StdRng>,
}

impl Device {
    /// Create a device configured from `WGPU_ARRAY_*` environment variables.
    pub async fn new() -> Result<Self> {
        Self::with_config(DeviceConfig::from_env()).await
    }

    pub async fn with_config(config: DeviceConfig) -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let mut adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: config.power_preference,
                force_fallback_adapter: config.force_fallback_adapter,
                compatible_surface: None,
            })
            .await;
        if adapter.is_err() && !config.force_fallback_adapter {
            log::warn!("no hardware adapter available, trying the fallback adapter");
            adapter = instance
                .request_adapter(&wgpu::RequestAdapterOptions {
                    power_preference: config.power_preference,
                    force_fallback_adapter: true,
                    compatible_surface: None,
                })
                .await;
        }
        let adapter = adapter.map_err(|err| ArrayError::Device(err.to_string()))?;
        let adapter_info = adapter.get_info();
        let limits = adapter.limits();

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("wgpu-array"),
                required_features: wgpu::Features::empty(),
                required_limits: limits.clone(),
                ..Default::default()
            })
            .await
            .map_err(|err| ArrayError::Device(err.to_string()))?;
        log::info!(
            "using adapter {} ({:?}, {:?})",
            adapter_info.name,
            adapter_info.device_type,
            adapter_info.backend
        );

        let rng = StdRng::seed_from_u64(config.seed);
        Ok(Self {
            inner: Arc::new(DeviceInner {
                device,
                queue,
                adapter_info,
                limits,
                config,
                pool: Arc::default(),
                kernels: KernelCache::default(),
                stats: Mutex::default(),
                rng: Mutex::new(rng),
            }),
        })
    }

    pub fn wgpu_device(&self) -> &wgpu::Device {
        &self.inner.device
    }

    pub fn wgpu_queue(&self) -> &wgpu::Queue {
        &self.inner.queue
    }

    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.inner.adapter_info
    }

    pub fn limits(&self) -> &wgpu::Limits {
        &self.inner.limits
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.inner.config
    }

    pub(crate) fn kernels(&self) -> &KernelCache {
        &self.inner.kernels
    }

    pub(crate) fn rng(&self) -> MutexGuard<'_, StdRng> {
        lock(&self.inner.rng)
    }

    pub(crate) fn same_device(&self, other: &Device) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Largest work-group the reduction kernels may use.
    pub(crate) fn max_workgroup_size(&self) -> u32 {
        let limits = self.limits();
        let adapter_max = limits
            .max_compute_invocations_per_workgroup
            .min(limits.max_compute_workgroup_size_x)
            .min(limits.max_compute_workgroup_storage_size / size_of::<f32>() as u32);
        self.config()
            .max_workgroup_size
            .map_or(adapter_max, |size| size.clamp(1, adapter_max))
    }

    pub fn kernel_stats(&self) -> KernelStats {
        lock(&self.inner.stats).clone()
    }

    pub fn reset_kernel_stats(&self) {
        *lock(&self.inner.stats) = KernelStats::default();
    }

    pub(crate) fn record_launch(&self, operator: Operator) {
        *lock(&self.inner.stats)
            .launches
            .entry(operator)
            .or_default() += 1;
    }

    pub(crate) fn record_compile(&self, cache_hit: bool) {
        let mut stats = lock(&self.inner.stats);
        if cache_hit {
            stats.cache_hits += 1;
        } else {
            stats.kernels_compiled += 1;
        }
    }

    /// A storage buffer with room for `elements` f32 values, reused from the pool
    /// when possible.
    pub(crate) fn alloc(&self, elements: usize) -> Result<PooledBuffer> {
        let bytes = padded_tensor_size((elements * DType::F32.size()) as u64);
        let max = self
            .limits()
            .max_buffer_size
            .min(self.limits().max_storage_buffer_binding_size as u64);
        if bytes > max {
            return Err(ArrayError::Allocation {
                bytes,
                message: format!("exceeds the device limit of {max} bytes"),
            });
        }

        if let Some(buffer) = self.inner.pool.take(bytes) {
            return Ok(PooledBuffer::new(buffer, bytes, &self.inner.pool));
        }

        self.wgpu_device()
            .push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self.wgpu_device().create_buffer(&wgpu::BufferDescriptor {
            label: None,
            size: bytes,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        if let Some(err) = futures::executor::block_on(self.wgpu_device().pop_error_scope()) {
            return Err(ArrayError::Allocation {
                bytes,
                message: err.to_string(),
            });
        }
        log::trace!("allocated a new {bytes} byte buffer");
        Ok(PooledBuffer::new(buffer, bytes, &self.inner.pool))
    }

    pub(crate) fn upload(&self, data: &[f32]) -> Result<PooledBuffer> {
        let buffer = self.alloc(data.len())?;
        self.wgpu_queue()
            .write_buffer(&buffer, 0, bytemuck::cast_slice(data));
        Ok(buffer)
    }

    pub(crate) fn fill(&self, elements: usize, value: f32) -> Result<PooledBuffer> {
        self.upload(&vec![value; elements])
    }

    /// Blocking copy of `len` elements starting at element `start`.
    pub(crate) fn download(&self, buffer: &wgpu::Buffer, start: usize, len: usize) -> Result<Vec<f32>> {
        let element = DType::F32.size() as u64;
        let range = start as u64 * element..(start + len) as u64 * element;
        let (sender, receiver) = futures_channel::oneshot::channel();
        DownloadBuffer::read_buffer(
            self.wgpu_device(),
            self.wgpu_queue(),
            &buffer.slice(range),
            move |result| {
                _ = sender.send(result);
            },
        );
        self.wgpu_device()
            .poll(wgpu::PollType::Wait)
            .map_err(|err| ArrayError::Device(err.to_string()))?;
        let downloaded = futures::executor::block_on(receiver)
            .map_err(|_| ArrayError::Device("readback was cancelled".to_string()))?
            .map_err(|err| ArrayError::Device(err.to_string()))?;
        let values: &[f32] = bytemuck::try_cast_slice(&downloaded[..])
            .map_err(|err| ArrayError::Device(err.to_string()))?;
        Ok(values.to_vec())
    }
}

/// Freed device buffers, keyed by padded byte size.
#[derive(Default)]
pub(crate) struct BufferPool {
    free: Mutex<HashMap<u64, Vec<wgpu::Buffer>>>,
}

impl BufferPool {
    fn take(&self, bytes: u64) -> Option<wgpu::Buffer> {
        lock(&self.free).get_mut(&bytes)?.pop()
    }

    fn give_back(&self, bytes: u64, buffer: wgpu::Buffer) {
        lock(&self.free).entry(bytes).or_default().push(buffer);
    }

    #[cfg(test)]
    fn free_buffers(&self, bytes: u64) -> usize {
        lock(&self.free).get(&bytes).map_or(0, Vec::len)
    }
}

/// A device buffer that returns to its pool when dropped.
pub(crate) struct PooledBuffer {
    buffer: Option<wgpu::Buffer>,
    bytes: u64,
    pool: Arc<BufferPool>,
}

impl PooledBuffer {
    fn new(buffer: wgpu::Buffer, bytes: u64, pool: &Arc<BufferPool>) -> Self {
        Self {
            buffer: Some(buffer),
            bytes,
            pool: pool.clone(),
        }
    }
}

impl Deref for PooledBuffer {
    type Target = wgpu::Buffer;

    fn deref(&self) -> &Self::Target {
        self.buffer
            .as_ref()
            .expect("the buffer is only taken when the handle is dropped")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.give_back(self.bytes, buffer);
        }
    }
}

/// Counters of kernel launches and compilations on one device.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KernelStats {
    launches: BTreeMap<Operator, usize>,
    kernels_compiled: usize,
    cache_hits: usize,
}

impl KernelStats {
    pub fn launches(&self, operator: Operator) -> usize {
        self.launches.get(&operator).copied().unwrap_or_default()
    }

    pub fn total_launches(&self) -> usize {
        self.launches.values().sum()
    }

    pub fn kernels_compiled(&self) -> usize {
        self.kernels_compiled
    }

    pub fn cache_hits(&self) -> usize {
        self.cache_hits
    }
}

impl Display for KernelStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{} launches, {} kernels compiled, {} cache hits",
            self.total_launches(),
            self.kernels_compiled,
            self.cache_hits
        )?;
        for (operator, count) in &self.launches {
            writeln!(f, "  {operator}: {count}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::test_device;

    #[test]
    fn padding() {
        assert_eq!(padded_tensor_size(0), 4);
        assert_eq!(padded_tensor_size(4), 4);
        assert_eq!(padded_tensor_size(5), 8);
        assert_eq!(padded_tensor_size(12), 12);
    }

    #[tokio::test]
    async fn upload_and_download() {
        let Some(device) = test_device().await else {
            return;
        };
        let buffer = device.upload(&[1., 2., 3., 4., 5.]).unwrap();
        assert_eq!(device.download(&buffer, 0, 5).unwrap(), [1., 2., 3., 4., 5.]);
        assert_eq!(device.download(&buffer, 2, 2).unwrap(), [3., 4.]);

        let filled = device.fill(3, 7.5).unwrap();
        assert_eq!(device.download(&filled, 0, 3).unwrap(), [7.5; 3]);
    }

    #[tokio::test]
    async fn dropped_buffers_are_reused() {
        let Some(device) = test_device().await else {
            return;
        };
        let pool = device.inner.pool.clone();
        let buffer = device.alloc(16).unwrap();
        assert_eq!(pool.free_buffers(64), 0);
        drop(buffer);
        assert_eq!(pool.free_buffers(64), 1);
        let reused = device.alloc(16).unwrap();
        assert_eq!(pool.free_buffers(64), 0);
        drop(reused);
        assert_eq!(pool.free_buffers(64), 1);
    }

    #[tokio::test]
    async fn oversized_allocations_fail() {
        let Some(device) = test_device().await else {
            return;
        };
        let elements = device.limits().max_buffer_size as usize;
        assert!(matches!(
            device.alloc(elements),
            Err(ArrayError::Allocation { .. })
        ));
    }
}
