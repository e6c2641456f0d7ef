//! Screen capture via Windows Graphics Capture, through the `windows-capture`
//! crate's `GraphicsCaptureApiHandler` abstraction over
//! `IDirect3D11CaptureFramePool`/`GraphicsCaptureSession`. If
//! `capture_audio` is requested, an internal WASAPI loopback capture is
//! attached to the same callback stream with `Audio`-tagged envelopes.

use std::sync::Arc;

use parking_lot::Mutex;
use windows_capture::capture::{CaptureControl, Context, GraphicsCaptureApiHandler};
use windows_capture::frame::Frame;
use windows_capture::graphics_capture_api::InternalCaptureControl;
use windows_capture::monitor::Monitor;
use windows_capture::settings::{ColorFormat, CursorCaptureSettings, DrawBorderSettings, Settings};

use crate::envelope::{
    BufferEnvelope, ContentType, EnvelopeBody, EnvelopeKind, ReleasableResource, ReleaseArena,
};
use crate::error::{MiniavError, Result};
use crate::format::{ConfiguredFormat, OutputPreference, PixelFormat, VideoFormat, plane_layout};
use crate::producer::timestamp_us;
use crate::source::DeviceDescriptor;
use crate::target::TargetDescriptor;
use crate::vtable::{CaptureBackend, ConfigureRequest, FrameCallback};

use super::loopback::LoopbackBackend;

struct FrameCopyResource {
    _bytes: Vec<u8>,
}

impl ReleasableResource for FrameCopyResource {
    fn release(self: Box<Self>) {}
}

type SharedCallback = Arc<dyn Fn(BufferEnvelope) + Send + Sync>;

struct HandlerContext {
    arena: Arc<Mutex<ReleaseArena>>,
    callback: SharedCallback,
    user_data: usize,
    format: VideoFormat,
}

struct ScreenHandler {
    context: Arc<HandlerContext>,
}

impl GraphicsCaptureApiHandler for ScreenHandler {
    type Flags = Arc<HandlerContext>;
    type Error = MiniavError;

    fn new(ctx: Context<Self::Flags>) -> std::result::Result<Self, Self::Error> {
        Ok(Self { context: ctx.flags })
    }

    fn on_frame_arrived(
        &mut self,
        frame: &mut Frame,
        _capture_control: InternalCaptureControl,
    ) -> std::result::Result<(), Self::Error> {
        let width = frame.width();
        let height = frame.height();

        let mut buffer = frame
            .buffer()
            .map_err(|e| MiniavError::from_native("Frame::buffer", e))?;
        let stride = buffer.row_pitch() as usize;
        let raw = buffer
            .as_raw_buffer();
        let bytes = raw.to_vec();
        let data_ptr = bytes.as_ptr() as usize;
        let data_size_bytes = bytes.len();

        let mut format = self.context.format;
        format.size = common::Size { width, height };
        let planes = plane_layout(format.pixel_format, format.size, stride);

        let token = self
            .context
            .arena
            .lock()
            .insert(Box::new(FrameCopyResource { _bytes: bytes }));

        let envelope = BufferEnvelope {
            kind: EnvelopeKind::Video,
            content_type: ContentType::Cpu,
            timestamp_us: timestamp_us(),
            body: EnvelopeBody::Video(crate::envelope::VideoSubRecord {
                format,
                planes,
                data_ptr,
            }),
            data_size_bytes,
            user_data: self.context.user_data,
            release_token: token,
        };

        (self.context.callback)(envelope);
        Ok(())
    }

    fn on_closed(&mut self) -> std::result::Result<(), Self::Error> {
        Ok(())
    }
}

pub struct ScreenBackend {
    target: Option<TargetDescriptor>,
    format: Option<VideoFormat>,
    capture_audio: bool,
    capture_control: Option<CaptureControl<ScreenHandler, MiniavError>>,
    loopback: Option<LoopbackBackend>,
}

impl ScreenBackend {
    pub fn new() -> Self {
        Self {
            target: None,
            format: None,
            capture_audio: false,
            capture_control: None,
            loopback: None,
        }
    }

    fn resolve_monitor(&self) -> Result<Monitor> {
        match &self.target {
            Some(TargetDescriptor::DisplayId(index)) => Monitor::from_index(*index as usize)
                .map_err(|e| MiniavError::from_native("Monitor::from_index", e)),
            _ => Monitor::primary().map_err(|e| MiniavError::from_native("Monitor::primary", e)),
        }
    }
}

impl Default for ScreenBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureBackend for ScreenBackend {
    fn name(&self) -> &'static str {
        "wgc-screen"
    }

    fn probe(&self) -> bool {
        // Windows Graphics Capture requires Windows 10 1803+; the API set
        // itself is the real gate and is exercised at init/start time.
        true
    }

    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    fn destroy(&mut self) {
        if let Some(control) = self.capture_control.take() {
            let _ = control.stop();
        }
        self.loopback.take();
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        let monitors = Monitor::enumerate().map_err(|e| MiniavError::from_native("Monitor::enumerate", e))?;
        Ok(monitors
            .into_iter()
            .enumerate()
            .map(|(index, _)| DeviceDescriptor::new(format!("display_{index}"), format!("Display {index}")))
            .collect())
    }

    fn get_supported_formats(&self, _device_id: &str) -> Result<Vec<ConfiguredFormat>> {
        Err(MiniavError::NotImplemented("WGC reports a single native format per monitor"))
    }

    fn get_default_format(&self, _device_id: &str) -> Result<ConfiguredFormat> {
        Ok(ConfiguredFormat::Video(VideoFormat {
            size: common::Size { width: 1920, height: 1080 },
            pixel_format: PixelFormat::Bgra32,
            frame_rate_num: 60,
            frame_rate_den: 1,
            output_preference: OutputPreference::Cpu,
        }))
    }

    fn configure(&mut self, request: &ConfigureRequest) -> Result<()> {
        if self.capture_control.is_some() {
            return Err(MiniavError::InvalidOperation("cannot configure while running"));
        }

        let ConfiguredFormat::Video(format) = request.format else {
            return Err(MiniavError::FormatNotSupported);
        };

        self.target = request.target.clone();
        self.format = Some(format);
        self.capture_audio = request.capture_audio;
        Ok(())
    }

    fn start_capture(
        &mut self,
        arena: Arc<Mutex<ReleaseArena>>,
        callback: FrameCallback,
        user_data: usize,
    ) -> Result<()> {
        let format = self.format.ok_or(MiniavError::NotInitialized)?;
        let monitor = self.resolve_monitor()?;

        let shared_callback: SharedCallback = Arc::from(callback);

        let handler_context = Arc::new(HandlerContext {
            arena: arena.clone(),
            callback: shared_callback.clone(),
            user_data,
            format,
        });

        let settings = Settings::new(
            monitor,
            CursorCaptureSettings::WithoutCursor,
            DrawBorderSettings::WithoutBorder,
            ColorFormat::Bgra8,
            handler_context.clone(),
        );

        let control = ScreenHandler::start_free_threaded(settings)
            .map_err(|e| MiniavError::from_native("GraphicsCaptureApiHandler::start_free_threaded", e))?;
        self.capture_control = Some(control);

        if self.capture_audio {
            let mut loopback = LoopbackBackend::new();
            loopback.init()?;
            loopback.configure(&ConfigureRequest {
                device_id: None,
                target: None,
                format: ConfiguredFormat::Audio(crate::format::AudioFormat {
                    sample_rate: 48000,
                    channels: 2,
                    sample_format: crate::format::SampleFormat::F32,
                    frames_per_callback_hint: 480,
                }),
                capture_audio: false,
            })?;
            let loopback_callback = shared_callback.clone();
            loopback.start_capture(
                arena,
                Box::new(move |envelope| loopback_callback(envelope)),
                user_data,
            )?;
            self.loopback = Some(loopback);
        }

        Ok(())
    }

    fn stop_capture(&mut self) -> Result<()> {
        if let Some(control) = self.capture_control.take() {
            control.stop()?;
        }
        if let Some(mut loopback) = self.loopback.take() {
            let _ = loopback.stop_capture();
        }
        Ok(())
    }

    fn get_configured_format(&self) -> Result<ConfiguredFormat> {
        self.format.map(ConfiguredFormat::Video).ok_or(MiniavError::NotInitialized)
    }
}

pub fn descriptor() -> crate::registry::BackendDescriptor {
    crate::registry::BackendDescriptor {
        name: "wgc-screen",
        factory: Box::new(|| Box::new(ScreenBackend::new())),
    }
}
