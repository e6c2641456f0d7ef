//! Screen (and optionally system audio) capture via ScreenCaptureKit. Both
//! the video and audio delegate methods run on a single serial queue;
//! `CMSampleBuffer`s are emitted natively for both, with audio buffers
//! copied to heap since the underlying `CMBlockBuffer` is not retained.
//!
//! Per the open design question on macOS version support: only
//! ScreenCaptureKit (12.3+) is implemented. There is no `CGDisplayCreateImage`
//! fallback; unavailability on older OS surfaces as a `NotSupported` error
//! from `probe`.

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
use crate::format::{
    AudioFormat, ConfiguredFormat, OutputPreference, PixelFormat, SampleFormat, VideoFormat,
    plane_layout,
};
use crate::producer::timestamp_us;
use crate::source::DeviceDescriptor;
use crate::target::TargetDescriptor;
use crate::vtable::{CaptureBackend, ConfigureRequest, FrameCallback};

struct HeapCopyResource {
    _bytes: Vec<u8>,
}

impl ReleasableResource for HeapCopyResource {
    fn release(self: Box<Self>) {}
}

struct StreamOutput {
    arena: Arc<Mutex<ReleaseArena>>,
    callback: Arc<dyn Fn(BufferEnvelope) + Send + Sync>,
    user_data: usize,
    video_format: VideoFormat,
    audio_format: AudioFormat,
}

impl SCStreamOutputTrait for StreamOutput {
    fn did_output_sample_buffer(
        &self,
        sample_buffer: screencapturekit::cm_sample_buffer::CMSampleBuffer,
        output_type: SCStreamOutputType,
    ) {
        let Some(bytes) = sample_buffer.get_data() else { return };
        let bytes = bytes.to_vec();
        let data_ptr = bytes.as_ptr() as usize;
        let data_size_bytes = bytes.len();
        let timestamp = timestamp_us();

        let (kind, content_type, body) = match output_type {
            SCStreamOutputType::Screen => {
                let stride = self.video_format.size.width as usize * 4;
                let planes = plane_layout(self.video_format.pixel_format, self.video_format.size, stride);
                (
                    EnvelopeKind::Video,
                    ContentType::Cpu,
                    EnvelopeBody::Video(crate::envelope::VideoSubRecord {
                        format: self.video_format,
                        planes,
                        data_ptr,
                    }),
                )
            }
            SCStreamOutputType::Audio => {
                let bytes_per_frame = (self.audio_format.channels as usize) * 4;
                let num_frames = (data_size_bytes / bytes_per_frame.max(1)) as u32;
                (
                    EnvelopeKind::Audio,
                    ContentType::Cpu,
                    EnvelopeBody::Audio(AudioSubRecord {
                        format: self.audio_format,
                        num_frames,
                        data_ptr,
                    }),
                )
            }
        };

        let token = self.arena.lock().insert(Box::new(HeapCopyResource { _bytes: bytes }));

        (self.callback)(BufferEnvelope {
            kind,
            content_type,
            timestamp_us: timestamp,
            body,
            data_size_bytes,
            user_data: self.user_data,
            release_token: token,
        });
    }
}

pub struct ScreenBackend {
    target: Option<TargetDescriptor>,
    video_format: Option<VideoFormat>,
    capture_audio: bool,
    stream: Option<SCStream>,
    running: Arc<AtomicBool>,
}

impl ScreenBackend {
    pub fn new() -> Self {
        Self {
            target: None,
            video_format: None,
            capture_audio: false,
            stream: None,
            running: Arc::new(AtomicBool::new(false)),
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
        "screencapturekit-screen"
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
        let content = SCShareableContent::get()
            .map_err(|e| MiniavError::from_native("SCShareableContent.getShareableContent", e))?;
        Ok(content
            .displays()
            .iter()
            .enumerate()
            .map(|(index, _)| DeviceDescriptor::new(format!("display_{index}"), format!("Display {index}")))
            .collect())
    }

    fn get_supported_formats(&self, _device_id: &str) -> Result<Vec<ConfiguredFormat>> {
        Err(MiniavError::NotImplemented("ScreenCaptureKit reports one native format per display"))
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
        if self.running.load(Ordering::SeqCst) {
            return Err(MiniavError::InvalidOperation("cannot configure while running"));
        }

        let ConfiguredFormat::Video(format) = request.format else {
            return Err(MiniavError::FormatNotSupported);
        };

        self.target = request.target.clone();
        self.video_format = Some(format);
        self.capture_audio = request.capture_audio;
        Ok(())
    }

    fn start_capture(
        &mut self,
        arena: Arc<Mutex<ReleaseArena>>,
        callback: FrameCallback,
        user_data: usize,
    ) -> Result<()> {
        let video_format = self.video_format.ok_or(MiniavError::NotInitialized)?;

        let content = SCShareableContent::get()
            .map_err(|e| MiniavError::from_native("SCShareableContent.getShareableContent", e))?;

        let display_index = match &self.target {
            Some(TargetDescriptor::DisplayId(index)) => *index as usize,
            _ => 0,
        };
        let display = content
            .displays()
            .get(display_index)
            .ok_or_else(|| MiniavError::DeviceNotFound(format!("display_{display_index}")))?
            .clone();

        let filter = SCContentFilter::new_with_display_excluding_windows(&display, &[]);

        let mut config = SCStreamConfiguration::new();
        config.set_width(video_format.size.width);
        config.set_height(video_format.size.height);
        config.set_captures_audio(self.capture_audio);
        if self.capture_audio {
            config.set_sample_rate(48_000);
            config.set_channel_count(2);
        }

        let output = StreamOutput {
            arena,
            callback: Arc::from(callback),
            user_data,
            video_format,
            audio_format: AudioFormat {
                sample_rate: 48_000,
                channels: 2,
                sample_format: SampleFormat::F32,
                frames_per_callback_hint: 0,
            },
        };

        let mut stream = SCStream::new(&filter, &config);
        stream.add_output_handler(output, SCStreamOutputType::Screen);
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
        self.video_format.map(ConfiguredFormat::Video).ok_or(MiniavError::NotInitialized)
    }
}

pub fn descriptor() -> crate::registry::BackendDescriptor {
    crate::registry::BackendDescriptor {
        name: "screencapturekit-screen",
        factory: Box::new(|| Box::new(ScreenBackend::new())),
    }
}
