//! Windows-only handle wrappers shared by the camera (Media Foundation),
//! screen (Windows Graphics Capture / DXGI Desktop Duplication), and loopback
//! (WASAPI) backends.

pub use windows;

use windows::Win32::Graphics::Direct3D::D3D_DRIVER_TYPE_HARDWARE;
use windows::Win32::Graphics::Direct3D11::{
    D3D11CreateDevice, ID3D11Device, ID3D11DeviceContext, ID3D11Texture2D,
    D3D11_CREATE_DEVICE_BGRA_SUPPORT, D3D11_CREATE_DEVICE_FLAG, D3D11_SDK_VERSION,
    D3D11_TEXTURE2D_DESC,
};
use windows::Win32::Graphics::Dxgi::{IDXGIResource1, DXGI_SHARED_RESOURCE_READ};
use windows::Win32::Foundation::HANDLE;
use windows::core::{Interface, Result as WinResult, GUID, PCWSTR};

/// A process-wide Direct3D11 device + immediate context pair.
///
/// Every GPU-path backend (camera hardware transforms, screen duplication,
/// texture sharing across contexts) shares one of these rather than creating
/// its own device, matching the teacher's `DIRECT_3D_DEVICE` global: device
/// creation is not free, and sharing one device is what makes
/// `CreateSharedHandle`/`OpenSharedHandle` round-trips meaningful across
/// independently-owned textures.
#[derive(Clone)]
pub struct Direct3DDevice {
    pub device: ID3D11Device,
    pub context: ID3D11DeviceContext,
}

unsafe impl Send for Direct3DDevice {}
unsafe impl Sync for Direct3DDevice {}

impl Direct3DDevice {
    pub fn new() -> WinResult<Self> {
        let mut device = None;
        let mut context = None;

        unsafe {
            D3D11CreateDevice(
                None,
                D3D_DRIVER_TYPE_HARDWARE,
                None,
                D3D11_CREATE_DEVICE_BGRA_SUPPORT | D3D11_CREATE_DEVICE_FLAG(0),
                None,
                D3D11_SDK_VERSION,
                Some(&mut device),
                None,
                Some(&mut context),
            )?;
        }

        Ok(Self {
            device: device.expect("D3D11CreateDevice reported success without a device"),
            context: context.expect("D3D11CreateDevice reported success without a context"),
        })
    }
}

/// Convenience accessors on `ID3D11Texture2D` used by the GPU sharing path:
/// query the texture's description, and mint a shared `HANDLE` for it via
/// `IDXGIResource1::CreateSharedHandle`, per spec.md's camera/screen GPU
/// notes.
pub trait EasyTexture {
    fn desc(&self) -> D3D11_TEXTURE2D_DESC;
    fn get_shared(&self) -> WinResult<HANDLE>;
}

impl EasyTexture for ID3D11Texture2D {
    fn desc(&self) -> D3D11_TEXTURE2D_DESC {
        let mut desc = D3D11_TEXTURE2D_DESC::default();
        unsafe { self.GetDesc(&mut desc) };
        desc
    }

    fn get_shared(&self) -> WinResult<HANDLE> {
        let resource: IDXGIResource1 = self.cast()?;
        unsafe { resource.CreateSharedHandle(None, DXGI_SHARED_RESOURCE_READ.0 as u32, PCWSTR::null()) }
    }
}

/// One value that can be installed into an `IMFAttributes` store. Media
/// Foundation's attribute API is a single `SetUINT32`/`SetString`/`SetGUID`/
/// `SetBlob`/... family keyed by property-specific types; this enum plus
/// [`MediaFoundationIMFAttributesSetHelper`] collapses that family into one
/// `attributes.set(KEY, value)` call site, matching how the camera backend
/// configures a source reader.
#[derive(Debug, Clone)]
pub enum IMFValue {
    U32(u32),
    /// A pair packed into a single `UINT64` attribute (high 32 bits first),
    /// used for `MF_MT_FRAME_SIZE` (width, height) and `MF_MT_FRAME_RATE`
    /// (numerator, denominator).
    DoubleU32(u32, u32),
    GUID(GUID),
    String(String),
}

pub trait MediaFoundationIMFAttributesSetHelper {
    fn set(&mut self, key: windows::core::GUID, value: IMFValue) -> WinResult<()>;

    fn get_string(&self, key: windows::core::GUID) -> Option<String>;
}

impl MediaFoundationIMFAttributesSetHelper for windows::Win32::Media::MediaFoundation::IMFAttributes {
    fn set(&mut self, key: windows::core::GUID, value: IMFValue) -> WinResult<()> {
        unsafe {
            match value {
                IMFValue::U32(v) => self.SetUINT32(&key, v),
                IMFValue::DoubleU32(hi, lo) => self.SetUINT64(&key, ((hi as u64) << 32) | lo as u64),
                IMFValue::GUID(v) => self.SetGUID(&key, &v),
                IMFValue::String(v) => {
                    let wide: Vec<u16> = v.encode_utf16().chain(std::iter::once(0)).collect();
                    self.SetString(&key, PCWSTR(wide.as_ptr()))
                }
            }
        }
    }

    fn get_string(&self, key: windows::core::GUID) -> Option<String> {
        unsafe {
            let mut len = 0u32;
            if self.GetStringLength(&key, &mut len).is_err() {
                return None;
            }

            let mut buffer = vec![0u16; len as usize + 1];
            let mut written = 0u32;
            self.GetString(&key, &mut buffer, Some(&mut written)).ok()?;

            Some(String::from_utf16_lossy(&buffer[..written as usize]))
        }
    }
}

/// MMCSS ("Multimedia Class Scheduler Service") thread classes used to ask
/// the Windows scheduler for capture-appropriate priority. Joining returns a
/// guard that reverts the registration on drop, so a producer thread can
/// simply hold it for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaThreadClass {
    Capture,
    Playback,
    ProAudio,
}

impl MediaThreadClass {
    fn name(self) -> &'static str {
        match self {
            Self::Capture => "Capture",
            Self::Playback => "Playback",
            Self::ProAudio => "Pro Audio",
        }
    }

    /// Registers the current thread with MMCSS. Returns `None` (rather than
    /// an error) if registration fails, since capture must still proceed
    /// without the scheduling hint — only `log::warn!`s at the call site.
    pub fn join(self) -> Option<MediaThreadClassGuard> {
        use windows::Win32::Media::Audio::{AvRevertMmThreadCharacteristics, AvSetMmThreadCharacteristicsW};

        let wide: Vec<u16> = self.name().encode_utf16().chain(std::iter::once(0)).collect();
        let mut task_index = 0u32;

        let handle = unsafe {
            AvSetMmThreadCharacteristicsW(PCWSTR(wide.as_ptr()), &mut task_index)
        }
        .ok()?;

        if handle.is_invalid() {
            return None;
        }

        Some(MediaThreadClassGuard {
            handle,
            revert: AvRevertMmThreadCharacteristics,
        })
    }
}

pub struct MediaThreadClassGuard {
    handle: HANDLE,
    revert: unsafe extern "system" fn(HANDLE) -> windows::core::BOOL,
}

unsafe impl Send for MediaThreadClassGuard {}

impl Drop for MediaThreadClassGuard {
    fn drop(&mut self) {
        unsafe {
            let _ = (self.revert)(self.handle);
        }
    }
}
