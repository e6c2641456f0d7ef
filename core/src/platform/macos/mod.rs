pub mod camera;
pub mod loopback;
pub mod screen;

use std::sync::OnceLock;

use metal::Device;

/// Process-wide default Metal device, shared by every GPU-path backend for
/// `CVMetalTextureCache` creation.
pub fn shared_metal_device() -> Device {
    static DEVICE: OnceLock<MetalDeviceHandle> = OnceLock::new();
    DEVICE
        .get_or_init(|| MetalDeviceHandle(Device::system_default().expect("no Metal device available")))
        .0
        .clone()
}

struct MetalDeviceHandle(Device);
unsafe impl Send for MetalDeviceHandle {}
unsafe impl Sync for MetalDeviceHandle {}
