//! System-audio loopback via PulseAudio (or PipeWire's pulse-compatible
//! server) monitor sources: every sink exposes a paired `<sink>.monitor`
//! source, and recording from it is the standard Linux loopback idiom —
//! there is no separate "loopback API" the way WASAPI or ScreenCaptureKit
//! expose one. Enumeration drives the PulseAudio mainloop synchronously to
//! completion for each introspection call, matching the blocking
//! request/response shape every other backend's one-shot enumerate uses.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::thread::JoinHandle;

use libpulse_binding::callbacks::ListResult;
use libpulse_binding::context::{Context, FlagSet as ContextFlagSet, State as ContextState};
use libpulse_binding::mainloop::standard::{IterateResult, Mainloop};
use libpulse_binding::proplist::Proplist;
use libpulse_binding::sample::{Format as PaFormat, Spec as PaSpec};
use libpulse_binding::stream::Direction as PaDirection;
use libpulse_simple_binding::Simple;
use parking_lot::Mutex;

use crate::envelope::{
    AudioSubRecord, BufferEnvelope, ContentType, EnvelopeBody, EnvelopeKind, ReleasableResource,
    ReleaseArena,
};
use crate::error::{MiniavError, Result};
use crate::format::{AudioFormat, ConfiguredFormat, SampleFormat};
use crate::producer::{timestamp_us, StopSignal};
use crate::source::DeviceDescriptor;
use crate::target::{parse_target_identifier, TargetDescriptor};
use crate::vtable::{CaptureBackend, ConfigureRequest, FrameCallback};

const APPLICATION_NAME: &str = "miniav";

fn run_mainloop_to_ready(mainloop: &mut Mainloop, context: &Context) -> Result<()> {
    loop {
        match mainloop.iterate(true) {
            IterateResult::Success(_) => {}
            IterateResult::Err(e) => return Err(MiniavError::from_native("pa_mainloop_iterate", e)),
            IterateResult::Quit(_) => {
                return Err(MiniavError::SystemCallFailed("pulseaudio mainloop quit before context ready".into()))
            }
        }
        match context.get_state() {
            ContextState::Ready => return Ok(()),
            ContextState::Failed | ContextState::Terminated => {
                return Err(MiniavError::DeviceLost("pulseaudio context failed to connect".into()))
            }
            _ => {}
        }
    }
}

fn connect_context() -> Result<(Mainloop, Context)> {
    let mut mainloop = Mainloop::new().ok_or(MiniavError::SystemCallFailed("pa_mainloop_new failed".into()))?;
    let proplist = Proplist::new().ok_or(MiniavError::SystemCallFailed("pa_proplist_new failed".into()))?;
    let mut context = Context::new_with_proplist(&mainloop, APPLICATION_NAME, &proplist)
        .ok_or(MiniavError::SystemCallFailed("pa_context_new failed".into()))?;

    context
        .connect(None, ContextFlagSet::NOFLAGS, None)
        .map_err(|e| MiniavError::from_native("pa_context_connect", e))?;

    run_mainloop_to_ready(&mut mainloop, &context)?;
    Ok((mainloop, context))
}

fn default_sink_monitor(context: &mut Context, mainloop: &mut Mainloop) -> Result<String> {
    let result: Arc<StdMutex<Option<String>>> = Arc::new(StdMutex::new(None));
    let done = Arc::new(AtomicBool::new(false));

    let result_cb = result.clone();
    let done_cb = done.clone();
    let _op = context.introspect().get_server_info(move |info| {
        if let Some(name) = &info.default_sink_name {
            *result_cb.lock().unwrap() = Some(format!("{name}.monitor"));
        }
        done_cb.store(true, Ordering::SeqCst);
    });

    while !done.load(Ordering::SeqCst) {
        match mainloop.iterate(true) {
            IterateResult::Success(_) => {}
            IterateResult::Err(e) => return Err(MiniavError::from_native("pa_mainloop_iterate", e)),
            IterateResult::Quit(_) => break,
        }
    }

    result
        .lock()
        .unwrap()
        .clone()
        .ok_or_else(|| MiniavError::DeviceNotFound("no default sink reported by pulseaudio server".into()))
}

fn enumerate_monitor_sources(context: &mut Context, mainloop: &mut Mainloop) -> Result<Vec<DeviceDescriptor>> {
    let sources: Arc<StdMutex<Vec<DeviceDescriptor>>> = Arc::new(StdMutex::new(Vec::new()));
    let done = Arc::new(AtomicBool::new(false));

    let sources_cb = sources.clone();
    let done_cb = done.clone();
    let _op = context.introspect().get_source_info_list(move |result| match result {
        ListResult::Item(info) => {
            if info.monitor_of_sink.is_none() {
                return;
            }
            let name = info.name.as_ref().map(|n| n.to_string()).unwrap_or_default();
            let description = info
                .description
                .as_ref()
                .map(|d| d.to_string())
                .unwrap_or_else(|| name.clone());
            sources_cb.lock().unwrap().push(DeviceDescriptor::new(name, description));
        }
        ListResult::End | ListResult::Error => done_cb.store(true, Ordering::SeqCst),
    });

    while !done.load(Ordering::SeqCst) {
        match mainloop.iterate(true) {
            IterateResult::Success(_) => {}
            IterateResult::Err(e) => return Err(MiniavError::from_native("pa_mainloop_iterate", e)),
            IterateResult::Quit(_) => break,
        }
    }

    Ok(sources.lock().unwrap().clone())
}

struct HeapAudioCopy {
    _bytes: Vec<u8>,
}

impl ReleasableResource for HeapAudioCopy {
    fn release(self: Box<Self>) {}
}

pub struct LoopbackBackend {
    monitor_source: Option<String>,
    format: Option<AudioFormat>,
    stop: StopSignal,
    thread: Option<JoinHandle<()>>,
}

impl LoopbackBackend {
    pub fn new() -> Self {
        Self {
            monitor_source: None,
            format: None,
            stop: StopSignal::new(),
            thread: None,
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
        "pulseaudio-loopback"
    }

    fn probe(&self) -> bool {
        connect_context().is_ok()
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
        let (mut mainloop, mut context) = connect_context()?;
        let devices = enumerate_monitor_sources(&mut context, &mut mainloop)?;
        context.disconnect();
        Ok(devices)
    }

    fn get_supported_formats(&self, _device_id: &str) -> Result<Vec<ConfiguredFormat>> {
        Err(MiniavError::NotImplemented("pulseaudio monitor sources negotiate format on open"))
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
        if self.thread.is_some() {
            return Err(MiniavError::InvalidOperation("cannot configure while running"));
        }

        let ConfiguredFormat::Audio(format) = request.format else {
            return Err(MiniavError::FormatNotSupported);
        };

        let identifier = request.device_id.clone().unwrap_or_default();
        let target = parse_target_identifier(&identifier, |_| None);

        let monitor_source = match target {
            TargetDescriptor::DeviceId(id) => id,
            TargetDescriptor::SystemAudio | TargetDescriptor::ProcessId(_) | TargetDescriptor::WindowHandle(_) => {
                let (mut mainloop, mut context) = connect_context()?;
                let monitor = default_sink_monitor(&mut context, &mut mainloop)?;
                context.disconnect();
                monitor
            }
            TargetDescriptor::DisplayId(_) | TargetDescriptor::Region { .. } => {
                return Err(MiniavError::InvalidArgument("loopback target must resolve to an audio source".into()))
            }
        };

        self.monitor_source = Some(monitor_source);
        self.format = Some(format);
        Ok(())
    }

    fn start_capture(
        &mut self,
        arena: Arc<Mutex<ReleaseArena>>,
        callback: FrameCallback,
        user_data: usize,
    ) -> Result<()> {
        let monitor_source = self.monitor_source.clone().ok_or(MiniavError::NotInitialized)?;
        let format = self.format.ok_or(MiniavError::NotInitialized)?;

        self.stop = StopSignal::new();
        let stop = self.stop.clone();

        let thread = std::thread::Builder::new()
            .name("miniav-loopback-pulse".into())
            .spawn(move || run_capture_loop(monitor_source, format, arena, callback, user_data, stop))
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
        self.format.map(ConfiguredFormat::Audio).ok_or(MiniavError::NotInitialized)
    }
}

fn run_capture_loop(
    monitor_source: String,
    format: AudioFormat,
    arena: Arc<Mutex<ReleaseArena>>,
    callback: FrameCallback,
    user_data: usize,
    stop: StopSignal,
) {
    let spec = PaSpec {
        format: PaFormat::F32le,
        rate: format.sample_rate,
        channels: format.channels as u8,
    };
    if !spec.is_valid() {
        log::error!("pulseaudio loopback: invalid sample spec {spec:?}");
        return;
    }

    let simple = match Simple::new(
        None,
        APPLICATION_NAME,
        PaDirection::Record,
        Some(&monitor_source),
        "loopback",
        &spec,
        None,
        None,
    ) {
        Ok(simple) => simple,
        Err(err) => {
            log::error!("pulseaudio loopback: failed to open '{monitor_source}': {err}");
            return;
        }
    };

    let bytes_per_frame = spec.frame_size();
    let chunk_frames = (spec.rate as usize / 50).max(1);
    let mut buffer = vec![0u8; chunk_frames * bytes_per_frame];

    while !stop.is_signaled() {
        if let Err(err) = simple.read(&mut buffer) {
            log::warn!("pulseaudio loopback: read failed, stopping: {err}");
            break;
        }

        let bytes = buffer.clone();
        let data_ptr = bytes.as_ptr() as usize;
        let data_size_bytes = bytes.len();
        let num_frames = (data_size_bytes / bytes_per_frame.max(1)) as u32;

        let token = arena.lock().insert(Box::new(HeapAudioCopy { _bytes: bytes }));

        callback(BufferEnvelope {
            kind: EnvelopeKind::Audio,
            content_type: ContentType::Cpu,
            timestamp_us: timestamp_us(),
            body: EnvelopeBody::Audio(AudioSubRecord { format, num_frames, data_ptr }),
            data_size_bytes,
            user_data,
            release_token: token,
        });
    }

    let _ = simple.drain();
}

pub fn descriptor() -> crate::registry::BackendDescriptor {
    crate::registry::BackendDescriptor {
        name: "pulseaudio-loopback",
        factory: Box::new(|| Box::new(LoopbackBackend::new())),
    }
}
