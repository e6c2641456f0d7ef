//! Camera capture via V4L2. The acquisition loop opens the device, negotiates
//! the format, and reads mmap'd buffers on a dedicated thread; V4L2 gives no
//! way to be notified of a new frame other than blocking `read`/`dequeue`, so
//! there is no async-callback path to choose between here unlike the
//! Windows/macOS camera backends.

use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use v4l::buffer::Type as BufferType;
use v4l::io::mmap::Stream as MmapStream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, Format as V4lFormat, FourCC};

use common::Size;

use crate::envelope::{
    BufferEnvelope, ContentType, EnvelopeBody, EnvelopeKind, ReleasableResource, ReleaseArena,
    VideoSubRecord,
};
use crate::error::{MiniavError, Result};
use crate::format::{plane_layout, ConfiguredFormat, OutputPreference, PixelFormat, VideoFormat};
use crate::producer::{timestamp_us, StopSignal};
use crate::source::DeviceDescriptor;
use crate::vtable::{CaptureBackend, ConfigureRequest, FrameCallback};

fn fourcc_for(pixel_format: PixelFormat) -> Option<FourCC> {
    match pixel_format {
        PixelFormat::Yuy2 => Some(FourCC::new(b"YUYV")),
        PixelFormat::Nv12 => Some(FourCC::new(b"NV12")),
        PixelFormat::I420 => Some(FourCC::new(b"YU12")),
        PixelFormat::Bgra32 | PixelFormat::Rgba32 => None,
    }
}

fn pixel_format_for(fourcc: FourCC) -> Option<PixelFormat> {
    match &fourcc.repr {
        b"YUYV" => Some(PixelFormat::Yuy2),
        b"NV12" => Some(PixelFormat::Nv12),
        b"YU12" => Some(PixelFormat::I420),
        _ => None,
    }
}

struct HeapCopyResource {
    _bytes: Vec<u8>,
}

impl ReleasableResource for HeapCopyResource {
    fn release(self: Box<Self>) {}
}

pub struct CameraBackend {
    device_path: Option<String>,
    format: Option<VideoFormat>,
    stop: StopSignal,
    thread: Option<JoinHandle<()>>,
}

impl CameraBackend {
    pub fn new() -> Self {
        Self {
            device_path: None,
            format: None,
            stop: StopSignal::new(),
            thread: None,
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
        "v4l2-camera"
    }

    fn probe(&self) -> bool {
        !v4l::context::enum_devices().is_empty()
    }

    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    fn destroy(&mut self) {
        self.stop.signal();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        Ok(v4l::context::enum_devices()
            .into_iter()
            .map(|node| {
                let path = node.path().display().to_string();
                let name = node.name().unwrap_or_else(|| path.clone());
                DeviceDescriptor::new(path, name)
            })
            .collect())
    }

    fn get_supported_formats(&self, device_id: &str) -> Result<Vec<ConfiguredFormat>> {
        let device = Device::with_path(device_id)
            .map_err(|e| MiniavError::from_native("v4l2 open", e))?;

        let descriptions = device
            .enum_formats()
            .map_err(|e| MiniavError::from_native("VIDIOC_ENUM_FMT", e))?;

        let mut formats = Vec::new();
        for description in descriptions {
            let Some(pixel_format) = pixel_format_for(description.fourcc) else {
                continue;
            };

            let framesizes = device
                .enum_framesizes(description.fourcc)
                .map_err(|e| MiniavError::from_native("VIDIOC_ENUM_FRAMESIZES", e))?;

            for framesize in framesizes {
                for discrete in framesize.size.to_discrete() {
                    formats.push(ConfiguredFormat::Video(VideoFormat {
                        size: Size { width: discrete.width, height: discrete.height },
                        pixel_format,
                        frame_rate_num: 30,
                        frame_rate_den: 1,
                        output_preference: OutputPreference::Cpu,
                    }));
                }
            }
        }

        Ok(formats)
    }

    fn get_default_format(&self, device_id: &str) -> Result<ConfiguredFormat> {
        let device = Device::with_path(device_id)
            .map_err(|e| MiniavError::from_native("v4l2 open", e))?;
        let current = Capture::format(&device).map_err(|e| MiniavError::from_native("VIDIOC_G_FMT", e))?;

        let pixel_format = pixel_format_for(current.fourcc).ok_or(MiniavError::FormatNotSupported)?;
        Ok(ConfiguredFormat::Video(VideoFormat {
            size: Size { width: current.width, height: current.height },
            pixel_format,
            frame_rate_num: 30,
            frame_rate_den: 1,
            output_preference: OutputPreference::Cpu,
        }))
    }

    fn configure(&mut self, request: &ConfigureRequest) -> Result<()> {
        if self.thread.is_some() {
            return Err(MiniavError::InvalidOperation("cannot configure while running"));
        }

        let device_id = request
            .device_id
            .clone()
            .ok_or_else(|| MiniavError::InvalidArgument("device_id required for camera domain".into()))?;

        let ConfiguredFormat::Video(format) = request.format else {
            return Err(MiniavError::FormatNotSupported);
        };

        let fourcc = fourcc_for(format.pixel_format).ok_or(MiniavError::FormatNotSupported)?;

        let device = Device::with_path(&device_id)
            .map_err(|e| MiniavError::DeviceNotFound(format!("{device_id}: {e}")))?;
        let requested = V4lFormat::new(format.size.width, format.size.height, fourcc);
        let negotiated = Capture::set_format(&device, &requested)
            .map_err(|e| MiniavError::from_native("VIDIOC_S_FMT", e))?;

        let negotiated_pixel_format = pixel_format_for(negotiated.fourcc).unwrap_or(format.pixel_format);

        self.device_path = Some(device_id);
        self.format = Some(VideoFormat {
            size: Size { width: negotiated.width, height: negotiated.height },
            pixel_format: negotiated_pixel_format,
            frame_rate_num: format.frame_rate_num,
            frame_rate_den: format.frame_rate_den,
            output_preference: OutputPreference::Cpu,
        });
        Ok(())
    }

    fn start_capture(
        &mut self,
        arena: Arc<Mutex<ReleaseArena>>,
        callback: FrameCallback,
        user_data: usize,
    ) -> Result<()> {
        let device_path = self.device_path.clone().ok_or(MiniavError::NotInitialized)?;
        let format = self.format.ok_or(MiniavError::NotInitialized)?;

        self.stop = StopSignal::new();
        let stop = self.stop.clone();

        let thread = std::thread::Builder::new()
            .name("miniav-camera-v4l2".into())
            .spawn(move || run_capture_loop(device_path, format, arena, callback, user_data, stop))
            .map_err(|e| MiniavError::SystemCallFailed(e.to_string()))?;

        self.thread = Some(thread);
        Ok(())
    }

    fn stop_capture(&mut self) -> Result<()> {
        self.stop.signal();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        Ok(())
    }

    fn get_configured_format(&self) -> Result<ConfiguredFormat> {
        self.format.map(ConfiguredFormat::Video).ok_or(MiniavError::NotInitialized)
    }
}

fn run_capture_loop(
    device_path: String,
    format: VideoFormat,
    arena: Arc<Mutex<ReleaseArena>>,
    callback: FrameCallback,
    user_data: usize,
    stop: StopSignal,
) {
    let mut device = match Device::with_path(&device_path) {
        Ok(device) => device,
        Err(err) => {
            log::error!("v4l2 camera: reopen failed for capture thread: {err}");
            return;
        }
    };

    let fourcc = match fourcc_for(format.pixel_format) {
        Some(fourcc) => fourcc,
        None => return,
    };
    if let Err(err) = Capture::set_format(&device, &V4lFormat::new(format.size.width, format.size.height, fourcc)) {
        log::error!("v4l2 camera: re-negotiating format on capture thread failed: {err}");
        return;
    }

    let mut stream = match MmapStream::with_buffers(&mut device, BufferType::VideoCapture, 4) {
        Ok(stream) => stream,
        Err(err) => {
            log::error!("v4l2 camera: failed to allocate mmap buffers: {err}");
            return;
        }
    };

    let stride = format.size.width as usize
        * match format.pixel_format {
            PixelFormat::Yuy2 => 2,
            PixelFormat::Nv12 | PixelFormat::I420 => 1,
            PixelFormat::Bgra32 | PixelFormat::Rgba32 => 4,
        };

    while !stop.is_signaled() {
        let (buf, _metadata) = match stream.next() {
            Ok(pair) => pair,
            Err(err) => {
                log::warn!("v4l2 camera: dequeue failed, stopping: {err}");
                break;
            }
        };

        let bytes = buf.to_vec();
        let data_ptr = bytes.as_ptr() as usize;
        let data_size_bytes = bytes.len();
        let planes = plane_layout(format.pixel_format, format.size, stride);

        let token = arena.lock().insert(Box::new(HeapCopyResource { _bytes: bytes }));

        callback(BufferEnvelope {
            kind: EnvelopeKind::Video,
            content_type: ContentType::Cpu,
            timestamp_us: timestamp_us(),
            body: EnvelopeBody::Video(VideoSubRecord { format, planes, data_ptr }),
            data_size_bytes,
            user_data,
            release_token: token,
        });
    }
}

pub fn descriptor() -> crate::registry::BackendDescriptor {
    crate::registry::BackendDescriptor {
        name: "v4l2-camera",
        factory: Box::new(|| Box::new(CameraBackend::new())),
    }
}
