//! Camera capture via Media Foundation's `IMFSourceReader`, driven from a
//! dedicated producer thread that blocks on `ReadSample` and re-requests
//! after every delivery. The GPU path pulls the underlying D3D11 texture
//! through `IMFDXGIBuffer::GetResource`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use windows::core::Interface;
use windows::Win32::Graphics::Direct3D11::{
    ID3D11Texture2D, D3D11_RESOURCE_MISC_SHARED, D3D11_RESOURCE_MISC_SHARED_NTHANDLE,
    D3D11_TEXTURE2D_DESC, D3D11_USAGE_DEFAULT,
};
use windows::Win32::Media::MediaFoundation::{
    IMF2DBuffer, IMFActivate, IMFAttributes, IMFDXGIBuffer, IMFMediaBuffer,
    IMFMediaSource, IMFSample, IMFSourceReader,
    MFCreateAttributes, MFCreateDeviceSource, MFCreateSourceReaderFromMediaSource,
    MFEnumDeviceSources, MFShutdown, MFStartup, MFSTARTUP_FULL, MF_DEVSOURCE_ATTRIBUTE_SOURCE_TYPE,
    MF_DEVSOURCE_ATTRIBUTE_SOURCE_TYPE_VIDCAP_SYMBOLIC_LINK, MF_MT_FRAME_RATE, MF_MT_FRAME_SIZE,
    MF_MT_SUBTYPE, MF_READWRITE_ENABLE_HARDWARE_TRANSFORMS,
    MF_SOURCE_READER_FIRST_VIDEO_STREAM,
};

use common::win32::{EasyTexture, IMFValue, MediaFoundationIMFAttributesSetHelper, MediaThreadClass};

use crate::envelope::{
    BufferEnvelope, ContentType, EnvelopeBody, EnvelopeKind, ReleasableResource, ReleaseArena,
};
use crate::error::{MiniavError, Result};
use crate::format::{ConfiguredFormat, OutputPreference, PixelFormat, VideoFormat, plane_layout};
use crate::source::DeviceDescriptor;
use crate::vtable::{CaptureBackend, ConfigureRequest, FrameCallback};

use super::shared_d3d_device;

struct SampleResource {
    sample: IMFSample,
    buffer: IMFMediaBuffer,
    locked_2d: bool,
}

unsafe impl Send for SampleResource {}

impl ReleasableResource for SampleResource {
    fn release(self: Box<Self>) {
        if self.locked_2d {
            if let Ok(buffer_2d) = self.buffer.cast::<IMF2DBuffer>() {
                unsafe {
                    let _ = buffer_2d.Unlock2D();
                }
            }
        }
        drop(self.sample);
    }
}

struct SharedTextureResource {
    #[allow(dead_code)]
    texture: ID3D11Texture2D,
}

unsafe impl Send for SharedTextureResource {}

impl ReleasableResource for SharedTextureResource {
    fn release(self: Box<Self>) {
        // The shared HANDLE was transferred to the user at delivery time;
        // per §4.5 this is the lone exception to "release frees everything".
    }
}

pub struct CameraBackend {
    device_id: Option<String>,
    format: Option<VideoFormat>,
    reader: Option<IMFSourceReader>,
    source: Option<IMFMediaSource>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    mf_started: bool,
}

impl CameraBackend {
    pub fn new() -> Self {
        Self {
            device_id: None,
            format: None,
            reader: None,
            source: None,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
            mf_started: false,
        }
    }

    fn enumerate_sources(&self) -> Result<Vec<(String, String)>> {
        unsafe {
            let mut attributes: Option<IMFAttributes> = None;
            MFCreateAttributes(&mut attributes, 1)
                .map_err(|e| MiniavError::from_native("MFCreateAttributes", e))?;
            let attributes = attributes.unwrap();
            attributes
                .set(
                    MF_DEVSOURCE_ATTRIBUTE_SOURCE_TYPE,
                    IMFValue::GUID(MF_DEVSOURCE_ATTRIBUTE_SOURCE_TYPE_VIDCAP_SYMBOLIC_LINK),
                )
                .map_err(|e| MiniavError::from_native("IMFAttributes::set", e))?;

            let mut activates: *mut Option<IMFActivate> = std::ptr::null_mut();
            let mut count = 0u32;
            MFEnumDeviceSources(&attributes, &mut activates, &mut count)
                .map_err(|e| MiniavError::from_native("MFEnumDeviceSources", e))?;

            let slice = std::slice::from_raw_parts(activates, count as usize);
            let mut out = Vec::with_capacity(count as usize);
            for activate in slice.iter().flatten() {
                let id = activate
                    .get_string(MF_DEVSOURCE_ATTRIBUTE_SOURCE_TYPE_VIDCAP_SYMBOLIC_LINK)
                    .unwrap_or_default();
                out.push((id.clone(), id));
            }
            Ok(out)
        }
    }
}

impl Default for CameraBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureBackend for CameraBackend {
    fn name(&self) -> &'static str {
        "mediafoundation-camera"
    }

    fn probe(&self) -> bool {
        // Media Foundation is present on every supported Windows version;
        // the real test is whether startup succeeds, deferred to init.
        true
    }

    fn init(&mut self) -> Result<()> {
        unsafe {
            MFStartup(windows::Win32::Media::MediaFoundation::MF_VERSION, MFSTARTUP_FULL)
                .map_err(|e| MiniavError::from_native("MFStartup", e))?;
        }
        self.mf_started = true;
        Ok(())
    }

    fn destroy(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.reader.take();
        self.source.take();
        if self.mf_started {
            unsafe {
                let _ = MFShutdown();
            }
            self.mf_started = false;
        }
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        Ok(self
            .enumerate_sources()?
            .into_iter()
            .map(|(id, name)| DeviceDescriptor::new(id, name))
            .collect())
    }

    fn get_supported_formats(&self, _device_id: &str) -> Result<Vec<ConfiguredFormat>> {
        Err(MiniavError::NotImplemented(
            "IMFSourceReader media-type enumeration",
        ))
    }

    fn get_default_format(&self, _device_id: &str) -> Result<ConfiguredFormat> {
        Ok(ConfiguredFormat::Video(VideoFormat {
            size: common::Size { width: 640, height: 480 },
            pixel_format: PixelFormat::Yuy2,
            frame_rate_num: 30,
            frame_rate_den: 1,
            output_preference: OutputPreference::Cpu,
        }))
    }

    fn configure(&mut self, request: &ConfigureRequest) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(MiniavError::InvalidOperation("cannot configure while running"));
        }

        let ConfiguredFormat::Video(format) = request.format else {
            return Err(MiniavError::FormatNotSupported);
        };

        let device_id = request
            .device_id
            .clone()
            .ok_or_else(|| MiniavError::InvalidArgument("camera device_id required".into()))?;

        unsafe {
            let mut attributes: Option<IMFAttributes> = None;
            MFCreateAttributes(&mut attributes, 2)
                .map_err(|e| MiniavError::from_native("MFCreateAttributes", e))?;
            let mut attributes = attributes.unwrap();
            attributes
                .set(
                    MF_DEVSOURCE_ATTRIBUTE_SOURCE_TYPE,
                    IMFValue::GUID(MF_DEVSOURCE_ATTRIBUTE_SOURCE_TYPE_VIDCAP_SYMBOLIC_LINK),
                )
                .map_err(|e| MiniavError::from_native("IMFAttributes::set", e))?;
            attributes
                .set(
                    MF_DEVSOURCE_ATTRIBUTE_SOURCE_TYPE_VIDCAP_SYMBOLIC_LINK,
                    IMFValue::String(device_id.clone()),
                )
                .map_err(|e| MiniavError::from_native("IMFAttributes::set", e))?;

            let source: IMFMediaSource = MFCreateDeviceSource(&attributes)
                .map_err(|e| MiniavError::from_native("MFCreateDeviceSource", e))?;

            let mut reader_attributes: Option<IMFAttributes> = None;
            MFCreateAttributes(&mut reader_attributes, 2)
                .map_err(|e| MiniavError::from_native("MFCreateAttributes", e))?;
            let mut reader_attributes = reader_attributes.unwrap();
            reader_attributes
                .set(MF_READWRITE_ENABLE_HARDWARE_TRANSFORMS, IMFValue::U32(1))
                .map_err(|e| MiniavError::from_native("IMFAttributes::set", e))?;

            // Synchronous mode: our own producer thread below blocks on
            // ReadSample and re-requests after every delivery, which gives
            // the same "one ReadSample per callback" discipline as the
            // async-callback mode without a COM adapter object.
            let reader = MFCreateSourceReaderFromMediaSource(&source, &reader_attributes)
                .map_err(|e| MiniavError::from_native("MFCreateSourceReaderFromMediaSource", e))?;

            let media_type = reader
                .GetCurrentMediaType(MF_SOURCE_READER_FIRST_VIDEO_STREAM.0 as u32)
                .map_err(|e| MiniavError::from_native("GetCurrentMediaType", e))?;
            media_type
                .set(MF_MT_FRAME_SIZE, IMFValue::DoubleU32(format.size.width, format.size.height))
                .ok();
            media_type
                .set(MF_MT_FRAME_RATE, IMFValue::DoubleU32(format.frame_rate_num, format.frame_rate_den))
                .ok();
            let _ = MF_MT_SUBTYPE;

            self.source = Some(source);
            self.reader = Some(reader);
        }

        self.device_id = Some(device_id);
        self.format = Some(format);
        Ok(())
    }

    fn start_capture(
        &mut self,
        arena: Arc<Mutex<ReleaseArena>>,
        callback: FrameCallback,
        user_data: usize,
    ) -> Result<()> {
        let reader = self
            .reader
            .as_ref()
            .ok_or(MiniavError::NotInitialized)?
            .clone();
        let format = self.format.ok_or(MiniavError::NotInitialized)?;

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();

        let thread = std::thread::Builder::new()
            .name("miniav-camera-win32".into())
            .spawn(move || {
                let _thread_class = MediaThreadClass::Capture.join();
                let callback = Arc::new(callback);

                while running.load(Ordering::SeqCst) {
                    pump_one(&reader, &arena, &callback, format, user_data, &running);
                }
            })
            .map_err(|e| MiniavError::from_native("thread::spawn", e))?;

        self.thread = Some(thread);
        Ok(())
    }

    fn stop_capture(&mut self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        Ok(())
    }

    fn get_configured_format(&self) -> Result<ConfiguredFormat> {
        self.format.map(ConfiguredFormat::Video).ok_or(MiniavError::NotInitialized)
    }
}

#[allow(clippy::too_many_arguments)]
fn pump_one(
    reader: &IMFSourceReader,
    arena: &Arc<Mutex<ReleaseArena>>,
    callback: &Arc<FrameCallback>,
    format: VideoFormat,
    user_data: usize,
    running: &Arc<AtomicBool>,
) {
    let mut stream_flags = 0u32;
    let mut timestamp = 0i64;
    let mut sample: Option<IMFSample> = None;

    let result = unsafe {
        reader.ReadSample(
            MF_SOURCE_READER_FIRST_VIDEO_STREAM.0 as u32,
            0,
            None,
            Some(&mut stream_flags),
            Some(&mut timestamp),
            Some(&mut sample),
        )
    };

    if result.is_err() || !running.load(Ordering::SeqCst) {
        return;
    }

    let Some(sample) = sample else { return };

    let buffer = match unsafe { sample.ConvertToContiguousBuffer() } {
        Ok(buffer) => buffer,
        Err(err) => {
            log::warn!("ConvertToContiguousBuffer failed: {err}");
            return;
        }
    };

    match format.output_preference {
        OutputPreference::Gpu | OutputPreference::GpuIfAvailable => {
            if let Ok(dxgi_buffer) = buffer.cast::<IMFDXGIBuffer>() {
                if deliver_gpu(&dxgi_buffer, arena, callback, format, timestamp, user_data) {
                    return;
                }
            }
            if format.output_preference == OutputPreference::Gpu {
                log::warn!("GPU delivery unavailable for this sample; falling back to CPU");
            }
            deliver_cpu(sample, buffer, arena, callback, format, timestamp, user_data);
        }
        OutputPreference::Cpu => {
            deliver_cpu(sample, buffer, arena, callback, format, timestamp, user_data);
        }
    }
}

fn deliver_gpu(
    dxgi_buffer: &IMFDXGIBuffer,
    arena: &Arc<Mutex<ReleaseArena>>,
    callback: &Arc<FrameCallback>,
    format: VideoFormat,
    timestamp: i64,
    user_data: usize,
) -> bool {
    let texture: ID3D11Texture2D = match unsafe { dxgi_buffer.GetResource() } {
        Ok(texture) => texture,
        Err(_) => return false,
    };

    let desc = texture.desc();
    let shareable = if desc.MiscFlags.0 & D3D11_RESOURCE_MISC_SHARED.0 != 0 {
        texture.clone()
    } else {
        let device = &shared_d3d_device().device;
        let context = &shared_d3d_device().context;

        let mut shared_desc = D3D11_TEXTURE2D_DESC {
            MiscFlags: D3D11_RESOURCE_MISC_SHARED | D3D11_RESOURCE_MISC_SHARED_NTHANDLE,
            Usage: D3D11_USAGE_DEFAULT,
            ..desc
        };
        shared_desc.BindFlags = desc.BindFlags;

        let mut created: Option<ID3D11Texture2D> = None;
        let result = unsafe { device.CreateTexture2D(&shared_desc, None, Some(&mut created)) };
        match (result, created) {
            (Ok(()), Some(created)) => {
                unsafe { context.CopyResource(&created, &texture) };
                created
            }
            _ => return false,
        }
    };

    let handle = match shareable.get_shared() {
        Ok(handle) => handle,
        Err(_) => return false,
    };

    let planes = plane_layout(format.pixel_format, format.size, format.size.width as usize * 4);
    let envelope = BufferEnvelope {
        kind: EnvelopeKind::Video,
        content_type: ContentType::GpuD3d11SharedHandle,
        timestamp_us: (timestamp as u64) / 10,
        body: EnvelopeBody::Video(crate::envelope::VideoSubRecord {
            format,
            planes,
            data_ptr: handle.0 as usize,
        }),
        data_size_bytes: 0,
        user_data,
        release_token: arena.lock().insert(Box::new(SharedTextureResource { texture: shareable })),
    };

    callback(envelope);
    true
}

fn deliver_cpu(
    sample: IMFSample,
    buffer: IMFMediaBuffer,
    arena: &Arc<Mutex<ReleaseArena>>,
    callback: &Arc<FrameCallback>,
    format: VideoFormat,
    timestamp: i64,
    user_data: usize,
) {
    let buffer_2d = buffer.cast::<IMF2DBuffer>().ok();

    let (data_ptr, stride, locked_2d) = if let Some(buffer_2d) = &buffer_2d {
        let mut scanline = std::ptr::null_mut();
        let mut pitch = 0i32;
        match unsafe { buffer_2d.Lock2D(&mut scanline, &mut pitch) } {
            Ok(()) => (scanline as usize, pitch.unsigned_abs() as usize, true),
            Err(_) => (0, format.size.width as usize * 2, false),
        }
    } else {
        let mut data = std::ptr::null_mut();
        let mut max_len = 0u32;
        let mut current_len = 0u32;
        unsafe {
            let _ = buffer.Lock(&mut data, Some(&mut max_len), Some(&mut current_len));
        }
        (data as usize, format.size.width as usize * 2, false)
    };

    let planes = plane_layout(format.pixel_format, format.size, stride);
    let data_size_bytes = unsafe { buffer.GetCurrentLength().unwrap_or(0) } as usize;

    let envelope = BufferEnvelope {
        kind: EnvelopeKind::Video,
        content_type: ContentType::Cpu,
        timestamp_us: (timestamp as u64) / 10,
        body: EnvelopeBody::Video(crate::envelope::VideoSubRecord {
            format,
            planes,
            data_ptr,
        }),
        data_size_bytes,
        user_data,
        release_token: arena.lock().insert(Box::new(SampleResource {
            sample,
            buffer,
            locked_2d,
        })),
    };

    callback(envelope);
}

pub fn descriptor() -> crate::registry::BackendDescriptor {
    crate::registry::BackendDescriptor {
        name: "mediafoundation-camera",
        factory: Box::new(|| Box::new(CameraBackend::new())),
    }
}
