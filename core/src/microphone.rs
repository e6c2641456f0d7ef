//! The microphone backend: the one domain backed by a single cross-platform
//! crate (`cpal`) rather than a per-OS implementation, since host/device
//! enumeration and a callback-driven input stream are exactly what `cpal`
//! already abstracts over CoreAudio/WASAPI/ALSA.

use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat as CpalSampleFormat, Stream};
use parking_lot::Mutex;

use crate::envelope::{
    AudioSubRecord, BufferEnvelope, ContentType, EnvelopeBody, EnvelopeKind, ReleasableResource,
    ReleaseArena,
};
use crate::error::{MiniavError, Result};
use crate::format::{AudioFormat, ConfiguredFormat, SampleFormat};
use crate::producer::timestamp_us;
use crate::source::DeviceDescriptor;
use crate::vtable::{CaptureBackend, ConfigureRequest, FrameCallback};

struct HeapAudioCopy {
    // Keeps the backing allocation alive until release; the pointer handed
    // out in the envelope aliases this buffer.
    _bytes: Box<[u8]>,
}

impl ReleasableResource for HeapAudioCopy {
    fn release(self: Box<Self>) {}
}

pub struct MicrophoneBackend {
    device_id: Option<String>,
    format: Option<AudioFormat>,
    stream: Option<Stream>,
}

impl MicrophoneBackend {
    pub fn new() -> Self {
        Self {
            device_id: None,
            format: None,
            stream: None,
        }
    }

    fn host() -> cpal::Host {
        cpal::default_host()
    }

    fn find_device(&self, device_id: &str) -> Result<cpal::Device> {
        let host = Self::host();
        host.input_devices()
            .map_err(|e| MiniavError::from_native("cpal::input_devices", e))?
            .find(|d| d.name().map(|n| n == device_id).unwrap_or(false))
            .ok_or_else(|| MiniavError::DeviceNotFound(device_id.to_string()))
    }

    fn default_device(&self) -> Result<cpal::Device> {
        Self::host()
            .default_input_device()
            .ok_or_else(|| MiniavError::DeviceNotFound("no default input device".into()))
    }
}

impl Default for MicrophoneBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureBackend for MicrophoneBackend {
    fn name(&self) -> &'static str {
        "cpal-microphone"
    }

    fn probe(&self) -> bool {
        cpal::default_host().default_input_device().is_some()
    }

    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    fn destroy(&mut self) {
        self.stream.take();
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        let host = Self::host();
        let devices = host
            .input_devices()
            .map_err(|e| MiniavError::from_native("cpal::input_devices", e))?;

        Ok(devices
            .filter_map(|d| d.name().ok())
            .map(|name| DeviceDescriptor::new(name.clone(), name))
            .collect())
    }

    fn get_supported_formats(&self, device_id: &str) -> Result<Vec<ConfiguredFormat>> {
        let device = self.find_device(device_id)?;
        let configs = device
            .supported_input_configs()
            .map_err(|e| MiniavError::from_native("cpal::supported_input_configs", e))?;

        Ok(configs
            .map(|range| {
                let config = range.with_max_sample_rate();
                ConfiguredFormat::Audio(AudioFormat {
                    sample_rate: config.sample_rate().0,
                    channels: config.channels(),
                    sample_format: map_sample_format(config.sample_format()),
                    frames_per_callback_hint: 0,
                })
            })
            .collect())
    }

    fn get_default_format(&self, device_id: &str) -> Result<ConfiguredFormat> {
        let device = if device_id.is_empty() {
            self.default_device()?
        } else {
            self.find_device(device_id)?
        };

        let config = device
            .default_input_config()
            .map_err(|e| MiniavError::from_native("cpal::default_input_config", e))?;

        Ok(ConfiguredFormat::Audio(AudioFormat {
            sample_rate: config.sample_rate().0,
            channels: config.channels(),
            sample_format: map_sample_format(config.sample_format()),
            frames_per_callback_hint: 0,
        }))
    }

    fn configure(&mut self, request: &ConfigureRequest) -> Result<()> {
        if self.stream.is_some() {
            return Err(MiniavError::InvalidOperation("cannot configure while running"));
        }

        let ConfiguredFormat::Audio(format) = request.format else {
            return Err(MiniavError::FormatNotSupported);
        };

        self.device_id = request.device_id.clone();
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

        let device = match &self.device_id {
            Some(id) => self.find_device(id)?,
            None => self.default_device()?,
        };

        let config = cpal::StreamConfig {
            channels: format.channels,
            sample_rate: cpal::SampleRate(format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let callback = Arc::new(callback);

        let stream = match format.sample_format {
            SampleFormat::F32 => {
                let stream_callback = callback.clone();
                let stream_arena = arena.clone();
                device
                    .build_input_stream(
                        &config,
                        move |data: &[f32], _| {
                            deliver(&stream_arena, &stream_callback, format, data, user_data);
                        },
                        |err| log::error!("cpal input stream error: {err}"),
                        None,
                    )
                    .map_err(|e| MiniavError::from_native("cpal::build_input_stream", e))?
            }
            SampleFormat::I16 => {
                let stream_callback = callback.clone();
                let stream_arena = arena.clone();
                device
                    .build_input_stream(
                        &config,
                        move |data: &[i16], _| {
                            deliver(&stream_arena, &stream_callback, format, data, user_data);
                        },
                        |err| log::error!("cpal input stream error: {err}"),
                        None,
                    )
                    .map_err(|e| MiniavError::from_native("cpal::build_input_stream", e))?
            }
        };

        stream
            .play()
            .map_err(|e| MiniavError::from_native("cpal::Stream::play", e))?;

        self.stream = Some(stream);
        Ok(())
    }

    fn stop_capture(&mut self) -> Result<()> {
        // Dropping the stream halts callbacks synchronously; cpal guarantees
        // no further callback fires once the stream value is gone.
        self.stream.take();
        Ok(())
    }

    fn get_configured_format(&self) -> Result<ConfiguredFormat> {
        self.format.map(ConfiguredFormat::Audio).ok_or(MiniavError::NotInitialized)
    }
}

fn map_sample_format(format: CpalSampleFormat) -> SampleFormat {
    match format {
        CpalSampleFormat::I16 => SampleFormat::I16,
        _ => SampleFormat::F32,
    }
}

fn deliver<T: bytemuck::NoUninit>(
    arena: &Arc<Mutex<ReleaseArena>>,
    callback: &Arc<FrameCallback>,
    format: AudioFormat,
    data: &[T],
    user_data: usize,
) {
    let bytes = bytemuck::cast_slice(data).to_vec().into_boxed_slice();
    let data_ptr = bytes.as_ptr() as usize;
    let data_size_bytes = bytes.len();
    let num_frames = (data.len() / format.channels.max(1) as usize) as u32;

    let token = arena.lock().insert(Box::new(HeapAudioCopy { _bytes: bytes }));

    let envelope = BufferEnvelope {
        kind: EnvelopeKind::Audio,
        content_type: ContentType::Cpu,
        timestamp_us: timestamp_us(),
        body: EnvelopeBody::Audio(AudioSubRecord {
            format,
            num_frames,
            data_ptr,
        }),
        data_size_bytes,
        user_data,
        release_token: token,
    };

    callback(envelope);
}
