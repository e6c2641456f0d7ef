//! End-to-end exercises of the public `CaptureContext`/`BackendRegistry` API
//! against a `FakeBackend` that runs its own producer thread, complementing
//! the state-machine/accounting unit tests colocated with `context.rs`.
//! Covers post-stop delivery, callback serialization, timestamp ordering,
//! and aggregated enumeration across duplicate device ids.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use miniav_core::envelope::{
    AudioSubRecord, BufferEnvelope, ContentType, EnvelopeBody, EnvelopeKind, ReleasableResource,
    ReleaseArena,
};
use miniav_core::format::{AudioFormat, ConfiguredFormat, SampleFormat};
use miniav_core::registry::{BackendDescriptor, BackendRegistry};
use miniav_core::source::DeviceDescriptor;
use miniav_core::vtable::{CaptureBackend, ConfigureRequest, FrameCallback};
use miniav_core::{CaptureContext, CaptureDomain, MiniavError};

struct NullResource;
impl ReleasableResource for NullResource {
    fn release(self: Box<Self>) {}
}

fn audio_format() -> ConfiguredFormat {
    ConfiguredFormat::Audio(AudioFormat {
        sample_rate: 48_000,
        channels: 2,
        sample_format: SampleFormat::F32,
        frames_per_callback_hint: 480,
    })
}

/// A backend whose `start_capture` spawns a thread firing callbacks on a
/// tight loop until `stop_capture` signals it to stop, mirroring the shape
/// every real platform backend's producer thread takes.
struct ThreadedFakeBackend {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    configured_format: Option<ConfiguredFormat>,
    device_id: &'static str,
}

impl ThreadedFakeBackend {
    fn new(device_id: &'static str) -> Self {
        Self {
            stop: Arc::new(AtomicBool::new(false)),
            thread: None,
            configured_format: None,
            device_id,
        }
    }
}

impl CaptureBackend for ThreadedFakeBackend {
    fn name(&self) -> &'static str {
        "threaded-fake"
    }

    fn probe(&self) -> bool {
        true
    }

    fn init(&mut self) -> Result<(), MiniavError> {
        Ok(())
    }

    fn destroy(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, MiniavError> {
        Ok(vec![DeviceDescriptor::new(self.device_id, "Threaded Fake")])
    }

    fn get_supported_formats(&self, _device_id: &str) -> Result<Vec<ConfiguredFormat>, MiniavError> {
        Ok(vec![])
    }

    fn get_default_format(&self, _device_id: &str) -> Result<ConfiguredFormat, MiniavError> {
        Ok(audio_format())
    }

    fn configure(&mut self, request: &ConfigureRequest) -> Result<(), MiniavError> {
        self.configured_format = Some(request.format);
        Ok(())
    }

    fn start_capture(
        &mut self,
        arena: Arc<Mutex<ReleaseArena>>,
        callback: FrameCallback,
        user_data: usize,
    ) -> Result<(), MiniavError> {
        self.stop.store(false, Ordering::SeqCst);
        let stop = self.stop.clone();

        let thread = std::thread::spawn(move || {
            let mut timestamp = 0u64;
            while !stop.load(Ordering::SeqCst) {
                timestamp += 1;
                let token = arena.lock().insert(Box::new(NullResource));
                callback(BufferEnvelope {
                    kind: EnvelopeKind::Audio,
                    content_type: ContentType::Cpu,
                    timestamp_us: timestamp,
                    body: EnvelopeBody::Audio(AudioSubRecord {
                        format: AudioFormat {
                            sample_rate: 48_000,
                            channels: 2,
                            sample_format: SampleFormat::F32,
                            frames_per_callback_hint: 480,
                        },
                        num_frames: 480,
                        data_ptr: 0,
                    }),
                    data_size_bytes: 0,
                    user_data,
                    release_token: token,
                });
                std::thread::sleep(Duration::from_millis(2));
            }
        });

        self.thread = Some(thread);
        Ok(())
    }

    fn stop_capture(&mut self) -> Result<(), MiniavError> {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        Ok(())
    }

    fn get_configured_format(&self) -> Result<ConfiguredFormat, MiniavError> {
        self.configured_format.ok_or(MiniavError::NotInitialized)
    }
}

fn threaded_registry(device_id: &'static str) -> BackendRegistry {
    BackendRegistry::new(vec![BackendDescriptor {
        name: "threaded-fake",
        factory: Box::new(move || Box::new(ThreadedFakeBackend::new(device_id)) as Box<dyn CaptureBackend>),
    }])
}

/// Property 3: once `stop_capture` returns, no callback fires afterward,
/// even after sleeping well beyond one producer iteration.
#[test]
fn no_post_stop_delivery() {
    let registry = threaded_registry("dev-0");
    let mut ctx = CaptureContext::create(CaptureDomain::Microphone, &registry).unwrap();
    ctx.configure(None, None, audio_format(), false, |_| None).unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let fired_cb = fired.clone();
    ctx.start(Box::new(move |_| { fired_cb.fetch_add(1, Ordering::SeqCst); }), 0).unwrap();

    std::thread::sleep(Duration::from_millis(20));
    ctx.stop().unwrap();

    let count_at_stop = fired.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(fired.load(Ordering::SeqCst), count_at_stop);
}

/// Property 4: two callbacks on the same context never overlap. The fake
/// backend fires from a single dedicated thread (the same shape every real
/// producer uses), so serialization holds by construction; this asserts it
/// by detecting re-entrancy via a non-reentrant guard flag.
#[test]
fn callbacks_never_overlap() {
    let registry = threaded_registry("dev-0");
    let mut ctx = CaptureContext::create(CaptureDomain::Microphone, &registry).unwrap();
    ctx.configure(None, None, audio_format(), false, |_| None).unwrap();

    let in_callback = Arc::new(AtomicBool::new(false));
    let overlap_detected = Arc::new(AtomicBool::new(false));
    let in_callback_cb = in_callback.clone();
    let overlap_cb = overlap_detected.clone();

    ctx.start(
        Box::new(move |_| {
            if in_callback_cb.swap(true, Ordering::SeqCst) {
                overlap_cb.store(true, Ordering::SeqCst);
            }
            std::thread::sleep(Duration::from_micros(500));
            in_callback_cb.store(false, Ordering::SeqCst);
        }),
        0,
    )
    .unwrap();

    std::thread::sleep(Duration::from_millis(30));
    ctx.stop().unwrap();

    assert!(!overlap_detected.load(Ordering::SeqCst));
}

/// Property 5: successive non-dropped callbacks report non-decreasing
/// timestamps.
#[test]
fn timestamps_are_monotonic() {
    let registry = threaded_registry("dev-0");
    let mut ctx = CaptureContext::create(CaptureDomain::Microphone, &registry).unwrap();
    ctx.configure(None, None, audio_format(), false, |_| None).unwrap();

    let last = Arc::new(AtomicU64::new(0));
    let violations = Arc::new(AtomicUsize::new(0));
    let last_cb = last.clone();
    let violations_cb = violations.clone();

    ctx.start(
        Box::new(move |envelope| {
            let previous = last_cb.swap(envelope.timestamp_us, Ordering::SeqCst);
            if envelope.timestamp_us < previous {
                violations_cb.fetch_add(1, Ordering::SeqCst);
            }
        }),
        0,
    )
    .unwrap();

    std::thread::sleep(Duration::from_millis(30));
    ctx.stop().unwrap();

    assert_eq!(violations.load(Ordering::SeqCst), 0);
    assert!(last.load(Ordering::SeqCst) > 0);
}

/// Scenario (d): reconfiguring after a stop succeeds and the new format is
/// reported back through `get_configured_format`.
#[test]
fn reconfigure_after_stop_reports_new_format() {
    let registry = threaded_registry("dev-0");
    let mut ctx = CaptureContext::create(CaptureDomain::Microphone, &registry).unwrap();

    ctx.configure(None, None, audio_format(), false, |_| None).unwrap();
    ctx.start(Box::new(|_| {}), 0).unwrap();
    ctx.stop().unwrap();

    let second_format = ConfiguredFormat::Audio(AudioFormat {
        sample_rate: 44_100,
        channels: 1,
        sample_format: SampleFormat::I16,
        frames_per_callback_hint: 441,
    });
    ctx.configure(None, None, second_format, false, |_| None).unwrap();
    ctx.start(Box::new(|_| {}), 0).unwrap();
    ctx.stop().unwrap();

    assert_eq!(ctx.get_configured_format().unwrap(), second_format);
}

/// Scenario (e): destroying a running context stops delivery with no leak
/// of the release arena's outstanding count.
#[test]
fn destroy_while_running_stops_delivery() {
    let registry = threaded_registry("dev-0");
    let mut ctx = CaptureContext::create(CaptureDomain::Microphone, &registry).unwrap();
    ctx.configure(None, None, audio_format(), false, |_| None).unwrap();
    ctx.start(Box::new(|_| {}), 0).unwrap();

    std::thread::sleep(Duration::from_millis(10));
    ctx.destroy();
    // ctx is consumed; nothing further to assert beyond "destroy returned
    // without panicking and joined the producer thread".
}

/// Scenario (f): aggregated enumeration across multiple probing backends
/// deduplicates by device id.
#[test]
fn enumerate_aggregated_deduplicates_across_backends() {
    let registry = BackendRegistry::new(vec![
        BackendDescriptor {
            name: "endpoint-a",
            factory: Box::new(|| Box::new(ThreadedFakeBackend::new("pid:100")) as Box<dyn CaptureBackend>),
        },
        BackendDescriptor {
            name: "endpoint-b",
            factory: Box::new(|| Box::new(ThreadedFakeBackend::new("pid:100")) as Box<dyn CaptureBackend>),
        },
        BackendDescriptor {
            name: "endpoint-c",
            factory: Box::new(|| Box::new(ThreadedFakeBackend::new("pid:200")) as Box<dyn CaptureBackend>),
        },
    ]);

    let devices = registry.enumerate_aggregated().unwrap();
    assert_eq!(devices.len(), 2);
    let ids: Vec<&str> = devices.iter().map(|d| d.id.as_str()).collect();
    assert!(ids.contains(&"pid:100"));
    assert!(ids.contains(&"pid:200"));
}
