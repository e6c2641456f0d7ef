//! System-audio loopback via ScreenCaptureKit's audio tap: an `SCStream`
//! configured for audio-only capture (video dimensions pinned to a minimal
//! size and the video output handler left unattached) against the main
//! display. macOS has no native per-process loopback API exposed here, so
//! `ProcessId`/`WindowHandle` targets are treated as system-wide capture —
//! this is a platform-driven Non-goal, not a core-layer choice.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use screencapturekit::shareable_content::SCShareableContent;
use screencapturekit::stream::configuration::SCStreamConfiguration;
use screencapturekit::stream::content_filter::SCContentFilter;
use screencapturekit::stream::output_trait::SCStreamOutputTrait;
use screencapturekit::stream::output_type::SCStreamOutputType;
use screencapturekit::stream::SCStream;

use crate::envelope::{
    AudioSubRecord, BufferEnvelope, ContentType, EnvelopeBody, EnvelopeKind, ReleasableResource,
    ReleaseArena,
};
use crate::error::{MiniavError, Result};
use crate::format::{AudioFormat, ConfiguredFormat, SampleFormat};
use crate::producer::timestamp_us;
use crate::source::DeviceDescriptor;
use crate::vtable::{CaptureBackend, ConfigureRequest, FrameCallback};

struct HeapCopyResource {
    _bytes: Vec<u8>,
}

impl ReleasableResource for HeapCopyResource {
    fn release(self: Box<Self>) {}
}

struct AudioOutput {
    arena: Arc<Mutex<ReleaseArena>>,
    callback: Arc<dyn Fn(BufferEnvelope) + Send + Sync>,
    user_data: usize,
    format: AudioFormat,
}

impl SCStreamOutputTrait for AudioOutput {
    fn did_output_sample_buffer(
        &self,
        sample_buffer: screencapturekit::cm_sample_buffer::CMSampleBuffer,
        output_type: SCStreamOutputType,
    ) {
        if output_type != SCStreamOutputType::Audio {
            return;
        }

        let Some(bytes) = sample_buffer.get_data() else { return };
        let bytes = bytes.to_vec();
        let data_ptr = bytes.as_ptr() as usize;
        let data_size_bytes = bytes.len();
        let bytes_per_frame = (self.format.channels as usize) * 4;
        let num_frames = (data_size_bytes / bytes_per_frame.max(1)) as u32;

        let token = self.arena.lock().insert(Box::new(HeapCopyResource { _bytes: bytes }));

        (self.callback)(BufferEnvelope {
            kind: EnvelopeKind::Audio,
            content_type: ContentType::Cpu,
            timestamp_us: timestamp_us(),
            body: EnvelopeBody::Audio(AudioSubRecord {
                format: self.format,
                num_frames,
                data_ptr,
            }),
            data_size_bytes,
            user_data: self.user_data,
            release_token: token,
        });
    }
}

pub struct LoopbackBackend {
    format: Option<AudioFormat>,
    stream: Option<SCStream>,
    running: Arc<AtomicBool>,
}

impl LoopbackBackend {
    pub fn new() -> Self {
        Self {
            format: None,
            stream: None,
            running: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Default for LoopbackBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureBackend for LoopbackBackend {
    fn name(&self) -> &'static str {
        "screencapturekit-loopback"
    }

    fn probe(&self) -> bool {
        SCShareableContent::get().is_ok()
    }

    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    fn destroy(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.stop_capture();
        }
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        Ok(vec![DeviceDescriptor::new("", "System Audio")])
    }

    fn get_supported_formats(&self, _device_id: &str) -> Result<Vec<ConfiguredFormat>> {
        Err(MiniavError::NotImplemented("ScreenCaptureKit reports a single audio format"))
    }

    fn get_default_format(&self, _device_id: &str) -> Result<ConfiguredFormat> {
        Ok(ConfiguredFormat::Audio(AudioFormat {
            sample_rate: 48_000,
            channels: 2,
            sample_format: SampleFormat::F32,
            frames_per_callback_hint: 0,
        }))
    }

    fn configure(&mut self, request: &ConfigureRequest) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(MiniavError::InvalidOperation("cannot configure while running"));
        }

        let ConfiguredFormat::Audio(format) = request.format else {
            return Err(MiniavError::FormatNotSupported);
        };

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

        let content = SCShareableContent::get()
            .map_err(|e| MiniavError::from_native("SCShareableContent.getShareableContent", e))?;
        let display = content
            .displays()
            .first()
            .ok_or_else(|| MiniavError::DeviceNotFound("no display available for audio tap".into()))?
            .clone();

        let filter = SCContentFilter::new_with_display_excluding_windows(&display, &[]);

        let mut config = SCStreamConfiguration::new();
        config.set_width(2);
        config.set_height(2);
        config.set_captures_audio(true);
        config.set_sample_rate(format.sample_rate);
        config.set_channel_count(format.channels as u32);

        let output = AudioOutput {
            arena,
            callback: Arc::from(callback),
            user_data,
            format,
        };

        let mut stream = SCStream::new(&filter, &config);
        stream.add_output_handler(output, SCStreamOutputType::Audio);
        stream
            .start_capture()
            .map_err(|e| MiniavError::from_native("SCStream.startCapture", e))?;

        self.stream = Some(stream);
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop_capture(&mut self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(stream) = self.stream.take() {
            stream
                .stop_capture()
                .map_err(|e| MiniavError::from_native("SCStream.stopCapture", e))?;
        }
        Ok(())
    }

    fn get_configured_format(&self) -> Result<ConfiguredFormat> {
        self.format.map(ConfiguredFormat::Audio).ok_or(MiniavError::NotInitialized)
    }
}

pub fn descriptor() -> crate::registry::BackendDescriptor {
    crate::registry::BackendDescriptor {
        name: "screencapturekit-loopback",
        factory: Box::new(|| Box::new(LoopbackBackend::new())),
    }
}
