//! Camera capture via `AVCaptureSession`. The sample-buffer delegate method
//! runs on a serial dispatch queue owned by the session. The GPU path uses
//! `CVMetalTextureCache`, which requires a non-planar, Metal-mappable pixel
//! format; planar formats fall back to the CPU path via
//! `CVPixelBufferLockBaseAddress`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use objc2::rc::Retained;
use objc2::{define_class, msg_send, DeclaredClass, MainThreadMarker};
use objc2_av_foundation::{
    AVCaptureDevice, AVCaptureDeviceInput, AVCaptureSession, AVCaptureVideoDataOutput,
    AVCaptureVideoDataOutputSampleBufferDelegate, AVMediaTypeVideo,
};
use objc2_core_media::CMSampleBufferGetImageBuffer;
use objc2_foundation::{NSObject, NSObjectProtocol};
use parking_lot::Mutex;

use common::macos::{MetalTextureCache, PixelLayout, PixelMemoryBuffer};

use crate::envelope::{
    BufferEnvelope, ContentType, EnvelopeBody, EnvelopeKind, ReleasableResource, ReleaseArena,
};
use crate::error::{MiniavError, Result};
use crate::format::{ConfiguredFormat, OutputPreference, PixelFormat, VideoFormat, plane_layout};
use crate::producer::timestamp_us;
use crate::source::DeviceDescriptor;
use crate::vtable::{CaptureBackend, ConfigureRequest, FrameCallback};

use super::shared_metal_device;

fn map_pixel_layout(format: PixelFormat) -> PixelLayout {
    match format {
        PixelFormat::Bgra32 => PixelLayout::Bgra,
        PixelFormat::Rgba32 => PixelLayout::Rgba,
        PixelFormat::Nv12 => PixelLayout::Nv12,
        PixelFormat::I420 => PixelLayout::I420,
        PixelFormat::Yuy2 => PixelLayout::Bgra, // not natively produced by AVFoundation's common presets
    }
}

struct PixelBufferCpuResource {
    // Owns the lock for the envelope's lifetime; dropping this struct
    // unlocks via PixelMemoryBuffer's Drop impl.
    _locked: PixelMemoryBuffer<'static>,
}

unsafe impl Send for PixelBufferCpuResource {}

impl ReleasableResource for PixelBufferCpuResource {
    fn release(self: Box<Self>) {}
}

struct MetalTextureResource {
    _texture: objc2_core_video::CVMetalTexture,
}

unsafe impl Send for MetalTextureResource {}

impl ReleasableResource for MetalTextureResource {
    fn release(self: Box<Self>) {}
}

struct DelegateState {
    arena: Mutex<Option<Arc<Mutex<ReleaseArena>>>>,
    callback: Mutex<Option<FrameCallback>>,
    user_data: Mutex<usize>,
    format: Mutex<Option<VideoFormat>>,
    metal_cache: Mutex<Option<MetalTextureCache>>,
}

impl Default for DelegateState {
    fn default() -> Self {
        Self {
            arena: Mutex::new(None),
            callback: Mutex::new(None),
            user_data: Mutex::new(0),
            format: Mutex::new(None),
            metal_cache: Mutex::new(None),
        }
    }
}

define_class!(
    #[unsafe(super(NSObject))]
    #[name = "MiniavCameraDelegate"]
    #[ivars = DelegateState]
    struct CameraDelegate;

    unsafe impl NSObjectProtocol for CameraDelegate {}

    unsafe impl AVCaptureVideoDataOutputSampleBufferDelegate for CameraDelegate {
        #[unsafe(method(captureOutput:didOutputSampleBuffer:fromConnection:))]
        fn capture_output_did_output_sample_buffer(
            &self,
            _output: &AVCaptureVideoDataOutput,
            sample_buffer: &objc2_core_media::CMSampleBuffer,
            _connection: &objc2_av_foundation::AVCaptureConnection,
        ) {
            self.handle_sample_buffer(sample_buffer);
        }

        #[unsafe(method(captureOutput:didDropSampleBuffer:fromConnection:))]
        fn capture_output_did_drop_sample_buffer(
            &self,
            _output: &AVCaptureVideoDataOutput,
            _sample_buffer: &objc2_core_media::CMSampleBuffer,
            _connection: &objc2_av_foundation::AVCaptureConnection,
        ) {
            log::warn!("AVCaptureVideoDataOutput dropped a sample buffer");
        }
    }
);

impl CameraDelegate {
    fn handle_sample_buffer(&self, sample_buffer: &objc2_core_media::CMSampleBuffer) {
        let state = self.ivars();
        let Some(format) = *state.format.lock() else { return };
        let Some(arena) = state.arena.lock().clone() else { return };

        let image_buffer = unsafe { CMSampleBufferGetImageBuffer(sample_buffer) };
        let Some(image_buffer) = image_buffer else { return };
        let image_buffer = image_buffer as *const _ as objc2_core_video::CVPixelBufferRef;

        let timestamp = timestamp_us();

        let deliver = |envelope: BufferEnvelope| {
            if let Some(callback) = state.callback.lock().as_ref() {
                callback(envelope);
            }
        };

        match format.output_preference {
            OutputPreference::Gpu | OutputPreference::GpuIfAvailable => {
                let layout = common::macos::pixel_buffer_layout(image_buffer);
                if matches!(layout, PixelLayout::Bgra | PixelLayout::Rgba) {
                    let mut cache_guard = state.metal_cache.lock();
                    if cache_guard.is_none() {
                        *cache_guard = MetalTextureCache::new(shared_metal_device()).ok();
                    }
                    if let Some(cache) = cache_guard.as_ref() {
                        let pixel_buffer: common::macos::PixelBuffer = image_buffer.into();
                        if let Ok(texture) = cache.create_texture(pixel_buffer) {
                            let planes = plane_layout(format.pixel_format, format.size, format.size.width as usize * 4);
                            let token = arena.lock().insert(Box::new(MetalTextureResource { _texture: texture.clone() }));
                            deliver(BufferEnvelope {
                                kind: EnvelopeKind::Video,
                                content_type: ContentType::GpuMetalTexture,
                                timestamp_us: timestamp,
                                body: EnvelopeBody::Video(crate::envelope::VideoSubRecord {
                                    format,
                                    planes,
                                    data_ptr: &texture as *const _ as usize,
                                }),
                                data_size_bytes: 0,
                                user_data: *state.user_data.lock(),
                                release_token: token,
                            });
                            return;
                        }
                    }
                }
                // Planar format or cache miss: fall through to CPU path.
                self.deliver_cpu(image_buffer, format, &arena, &deliver, timestamp);
            }
            OutputPreference::Cpu => {
                self.deliver_cpu(image_buffer, format, &arena, &deliver, timestamp);
            }
        }
    }

    fn deliver_cpu(
        &self,
        image_buffer: objc2_core_video::CVPixelBufferRef,
        format: VideoFormat,
        arena: &Arc<Mutex<ReleaseArena>>,
        deliver: &dyn Fn(BufferEnvelope),
        timestamp: u64,
    ) {
        let locked: PixelMemoryBuffer<'static> =
            unsafe { std::mem::transmute(PixelMemoryBuffer::from(image_buffer)) };
        let data_ptr = locked.data[0].as_ptr() as usize;
        let stride = locked.linesize[0];
        let data_size_bytes: usize = locked.linesize.iter().sum();
        let planes = plane_layout(format.pixel_format, format.size, stride);

        let token = arena
            .lock()
            .insert(Box::new(PixelBufferCpuResource { _locked: locked }));

        deliver(BufferEnvelope {
            kind: EnvelopeKind::Video,
            content_type: ContentType::Cpu,
            timestamp_us: timestamp,
            body: EnvelopeBody::Video(crate::envelope::VideoSubRecord {
                format,
                planes,
                data_ptr,
            }),
            data_size_bytes,
            user_data: *self.ivars().user_data.lock(),
            release_token: token,
        });
    }
}

pub struct CameraBackend {
    device_id: Option<String>,
    format: Option<VideoFormat>,
    session: Option<Retained<AVCaptureSession>>,
    delegate: Option<Retained<CameraDelegate>>,
    running: Arc<AtomicBool>,
}

impl CameraBackend {
    pub fn new() -> Self {
        Self {
            device_id: None,
            format: None,
            session: None,
            delegate: None,
            running: Arc::new(AtomicBool::new(false)),
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
        "avfoundation-camera"
    }

    fn probe(&self) -> bool {
        unsafe { AVCaptureDevice::devicesWithMediaType(AVMediaTypeVideo) }.len() > 0
    }

    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    fn destroy(&mut self) {
        if let Some(session) = self.session.take() {
            unsafe { session.stopRunning() };
        }
        self.delegate.take();
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        let devices = unsafe { AVCaptureDevice::devicesWithMediaType(AVMediaTypeVideo) };
        Ok(devices
            .iter()
            .map(|device| {
                let id = unsafe { device.uniqueID() }.to_string();
                let name = unsafe { device.localizedName() }.to_string();
                DeviceDescriptor::new(id, name)
            })
            .collect())
    }

    fn get_supported_formats(&self, _device_id: &str) -> Result<Vec<ConfiguredFormat>> {
        Err(MiniavError::NotImplemented("AVCaptureDevice.formats enumeration"))
    }

    fn get_default_format(&self, _device_id: &str) -> Result<ConfiguredFormat> {
        Ok(ConfiguredFormat::Video(VideoFormat {
            size: common::Size { width: 1280, height: 720 },
            pixel_format: PixelFormat::Nv12,
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

        let devices = unsafe { AVCaptureDevice::devicesWithMediaType(AVMediaTypeVideo) };
        let device = devices
            .iter()
            .find(|d| unsafe { d.uniqueID() }.to_string() == device_id)
            .ok_or_else(|| MiniavError::DeviceNotFound(device_id.clone()))?;

        let session = unsafe { AVCaptureSession::new() };
        let input = unsafe { AVCaptureDeviceInput::deviceInputWithDevice_error(device) }
            .map_err(|e| MiniavError::from_native("AVCaptureDeviceInput", e))?;

        unsafe {
            session.beginConfiguration();
            if session.canAddInput(&input) {
                session.addInput(&input);
            }
            session.commitConfiguration();
        }

        let _ = map_pixel_layout(format.pixel_format);

        self.session = Some(session);
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
        let format = self.format.ok_or(MiniavError::NotInitialized)?;
        let session = self.session.clone().ok_or(MiniavError::NotInitialized)?;

        let mtm = MainThreadMarker::new()
            .ok_or_else(|| MiniavError::SystemCallFailed("AVCaptureSession setup requires the main thread".into()))?;
        let delegate = CameraDelegate::alloc(mtm).set_ivars(DelegateState::default());
        let delegate: Retained<CameraDelegate> = unsafe { msg_send![super(delegate), init] };

        *delegate.ivars().arena.lock() = Some(arena);
        *delegate.ivars().callback.lock() = Some(callback);
        *delegate.ivars().user_data.lock() = user_data;
        *delegate.ivars().format.lock() = Some(format);

        let output = unsafe { AVCaptureVideoDataOutput::new() };
        unsafe {
            output.setSampleBufferDelegate_queue(
                Some(objc2::runtime::ProtocolObject::from_ref(&*delegate)),
                Some(&dispatch_queue()),
            );

            session.beginConfiguration();
            if session.canAddOutput(&output) {
                session.addOutput(&output);
            }
            session.commitConfiguration();
            session.startRunning();
        }

        self.delegate = Some(delegate);
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop_capture(&mut self) -> Result<()> {
        if let Some(session) = &self.session {
            unsafe { session.stopRunning() };
        }
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn get_configured_format(&self) -> Result<ConfiguredFormat> {
        self.format.map(ConfiguredFormat::Video).ok_or(MiniavError::NotInitialized)
    }
}

fn dispatch_queue() -> Retained<dispatch2::DispatchQueue> {
    dispatch2::DispatchQueue::new(Some(c"miniav.camera"), dispatch2::DispatchQueueAttr::SERIAL)
}

pub fn descriptor() -> crate::registry::BackendDescriptor {
    crate::registry::BackendDescriptor {
        name: "avfoundation-camera",
        factory: Box::new(|| Box::new(CameraBackend::new())),
    }
}
