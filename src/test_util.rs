use crate::{config::DeviceConfig, device::Device};

pub(crate) async fn test_device() -> Option<Device> {
    test_device_with(DeviceConfig::default()).await
}

/// A fresh device, or `None` when the machine has no usable adapter.
pub(crate) async fn test_device_with(config: DeviceConfig) -> Option<Device> {
    _ = env_logger::builder().is_test(true).try_init();
    match Device::with_config(config).await {
        Ok(device) => Some(device),
        Err(err) => {
            log::warn!("skipping GPU test: {err}");
            None
        }
    }
}
