pub mod camera;
pub mod loopback;
pub mod screen;

use std::sync::OnceLock;

use common::win32::Direct3DDevice;

/// Process-wide Direct3D11 device, shared by every GPU-path backend on this
/// OS so `CreateSharedHandle`/`OpenSharedHandle` round-trips are meaningful
/// across independently-owned textures (mirrors the teacher's global device
/// singleton).
pub fn shared_d3d_device() -> &'static Direct3DDevice {
    static DEVICE: OnceLock<Direct3DDevice> = OnceLock::new();
    DEVICE.get_or_init(|| Direct3DDevice::new().expect("D3D11CreateDevice failed"))
}
