//! The Capture Context: a per-domain handle that owns one selected backend,
//! its configuration, and its lifecycle state machine (§4.3). The hardest
//! part of the core alongside the Producer Engine, since every invariant in
//! §3 and every transition in §4.3's table must hold for every domain and
//! every backend.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::domain::CaptureDomain;
use crate::envelope::{ReleaseArena, ReleaseToken};
use crate::error::{MiniavError, Result};
use crate::format::ConfiguredFormat;
use crate::registry::BackendRegistry;
use crate::target::{parse_target_identifier, TargetDescriptor};
use crate::vtable::{CaptureBackend, ConfigureRequest, FrameCallback};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Created,
    Configured,
    Running,
    Stopped,
    Destroyed,
}

/// Per-domain handle owning a selected backend. Constructed via
/// [`CaptureContext::create`], which performs the registry's selection-probe
/// walk; invariant 1 from §3 is enforced by `create` never returning a
/// context whose `backend` field is empty.
pub struct CaptureContext {
    domain: CaptureDomain,
    backend: Box<dyn CaptureBackend>,
    phase: LifecyclePhase,
    configured_format: Option<ConfiguredFormat>,
    target: Option<TargetDescriptor>,
    capture_audio: bool,
    arena: Arc<Mutex<ReleaseArena>>,
    /// Records whether the most recent loopback configure degraded from
    /// process-filtered to endpoint-wide capture, per the §9 design note on
    /// process-specific loopback's graceful degradation.
    effective_target_fallback: bool,
}

impl CaptureContext {
    /// Walks `registry`'s selection-probe list; the first successful probe
    /// is the commitment point and its backend's `init` is invoked. Probe
    /// acceptance followed by `init` failure fails context creation outright
    /// rather than trying the next registry entry (§4.2).
    pub fn create(domain: CaptureDomain, registry: &BackendRegistry) -> Result<Self> {
        let backend = registry.select()?;

        Ok(Self {
            domain,
            backend,
            phase: LifecyclePhase::Created,
            configured_format: None,
            target: None,
            capture_audio: false,
            arena: Arc::new(Mutex::new(ReleaseArena::new())),
            effective_target_fallback: false,
        })
    }

    pub fn domain(&self) -> CaptureDomain {
        self.domain
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.phase
    }

    /// Installs format and, for loopback/screen, a target identifier string
    /// parsed per §4.6's grammar. Permitted only in `Created` or `Stopped`
    /// (invariant 2); `Running` always fails with `AlreadyRunning` without
    /// touching the prior configuration.
    pub fn configure(
        &mut self,
        device_id: Option<&str>,
        target_identifier: Option<&str>,
        format: ConfiguredFormat,
        capture_audio: bool,
        resolve_hwnd_pid: impl FnOnce(usize) -> Option<u32>,
    ) -> Result<()> {
        if self.phase == LifecyclePhase::Running {
            return Err(MiniavError::AlreadyRunning);
        }
        if self.phase == LifecyclePhase::Destroyed {
            return Err(MiniavError::InvalidHandle);
        }

        let target = if self.domain.uses_target_resolver() {
            let identifier = target_identifier.unwrap_or("");
            Some(parse_target_identifier(identifier, resolve_hwnd_pid))
        } else {
            None
        };

        let request = ConfigureRequest {
            device_id: device_id.map(str::to_string),
            target: target.clone(),
            format,
            capture_audio,
        };

        // Old configuration is retained on failure (invariant 2's failure
        // branch); only commit the new state after the backend accepts it.
        self.backend.configure(&request)?;

        self.configured_format = Some(format);
        self.target = target;
        self.capture_audio = capture_audio;
        self.phase = LifecyclePhase::Configured;
        Ok(())
    }

    /// Starts the producer engine. Permitted only in `Configured` (invariant
    /// 3); on failure the phase remains `Configured` and the callback is
    /// cleared (it was never installed, since `start_capture` itself failed
    /// before accepting it).
    pub fn start(&mut self, callback: FrameCallback, user_data: usize) -> Result<()> {
        if self.phase != LifecyclePhase::Configured {
            return Err(MiniavError::NotInitialized);
        }

        match self
            .backend
            .start_capture(self.arena.clone(), callback, user_data)
        {
            Ok(()) => {
                self.phase = LifecyclePhase::Running;
                Ok(())
            }
            Err(err) => {
                // Phase stays Configured; no callback was retained by the
                // backend since start_capture itself reported failure.
                Err(err)
            }
        }
    }

    /// Idempotent in `Stopped`/`Created` (invariant 4, returns success
    /// without calling the backend). On `Running`, always transitions to
    /// `Stopped` even if the backend's `stop_capture` itself returns an
    /// error — state-change authority wins over the backend result, per
    /// §4.3's transition table.
    pub fn stop(&mut self) -> Result<()> {
        match self.phase {
            LifecyclePhase::Created | LifecyclePhase::Stopped => Ok(()),
            LifecyclePhase::Destroyed => Err(MiniavError::InvalidHandle),
            LifecyclePhase::Configured | LifecyclePhase::Running => {
                let result = self.backend.stop_capture();
                self.phase = LifecyclePhase::Stopped;
                result
            }
        }
    }

    /// Auto-stops if `Running`, then tears down the backend and drains any
    /// outstanding release payloads the user never released (invariant 5).
    /// After this call the context must not be used again.
    pub fn destroy(mut self) {
        if self.phase == LifecyclePhase::Running {
            let _ = self.backend.stop_capture();
        }

        self.backend.destroy();
        self.arena.lock().drain();
        self.phase = LifecyclePhase::Destroyed;
    }

    pub fn get_configured_format(&self) -> Result<ConfiguredFormat> {
        self.configured_format
            .ok_or(MiniavError::NotInitialized)
    }

    pub fn effective_target_fallback(&self) -> bool {
        self.effective_target_fallback
    }

    pub(crate) fn set_effective_target_fallback(&mut self, fallback: bool) {
        self.effective_target_fallback = fallback;
    }

    pub fn release_buffer(&self, token: ReleaseToken) {
        self.arena.lock().release(token);
    }

    pub fn outstanding_envelopes(&self) -> usize {
        self.arena.lock().outstanding()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{BufferEnvelope, ContentType, EnvelopeBody, EnvelopeKind, ReleasableResource};
    use crate::format::{AudioFormat, SampleFormat};
    use crate::registry::{BackendDescriptor, BackendRegistry};
    use crate::source::DeviceDescriptor;
    use crate::vtable::CaptureBackend;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct NullResource;
    impl ReleasableResource for NullResource {
        fn release(self: Box<Self>) {}
    }

    struct FakeBackend {
        running: Arc<AtomicBool>,
        callbacks_fired: Arc<AtomicUsize>,
        fail_start: bool,
        fail_configure: bool,
        configured_format: Option<ConfiguredFormat>,
    }

    impl CaptureBackend for FakeBackend {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn probe(&self) -> bool {
            true
        }

        fn init(&mut self) -> Result<()> {
            Ok(())
        }

        fn destroy(&mut self) {}

        fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
            Ok(vec![])
        }

        fn get_supported_formats(&self, _device_id: &str) -> Result<Vec<ConfiguredFormat>> {
            Ok(vec![])
        }

        fn get_default_format(&self, _device_id: &str) -> Result<ConfiguredFormat> {
            Err(MiniavError::NotSupported("n/a".into()))
        }

        fn configure(&mut self, request: &ConfigureRequest) -> Result<()> {
            if self.fail_configure {
                return Err(MiniavError::FormatNotSupported);
            }
            self.configured_format = Some(request.format);
            Ok(())
        }

        fn start_capture(
            &mut self,
            arena: Arc<Mutex<ReleaseArena>>,
            callback: FrameCallback,
            user_data: usize,
        ) -> Result<()> {
            if self.fail_start {
                return Err(MiniavError::SystemCallFailed("device busy".into()));
            }

            self.running.store(true, Ordering::SeqCst);
            let token = arena.lock().insert(Box::new(NullResource));
            let envelope = BufferEnvelope {
                kind: EnvelopeKind::Audio,
                content_type: ContentType::Cpu,
                timestamp_us: 0,
                body: EnvelopeBody::Audio(crate::envelope::AudioSubRecord {
                    format: AudioFormat {
                        sample_rate: 48000,
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
            };
            callback(envelope);
            self.callbacks_fired.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn stop_capture(&mut self) -> Result<()> {
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn get_configured_format(&self) -> Result<ConfiguredFormat> {
            self.configured_format.ok_or(MiniavError::NotInitialized)
        }
    }

    fn registry(fail_start: bool, fail_configure: bool) -> BackendRegistry {
        BackendRegistry::new(vec![BackendDescriptor {
            name: "fake",
            factory: Box::new(move || {
                Box::new(FakeBackend {
                    running: Arc::new(AtomicBool::new(false)),
                    callbacks_fired: Arc::new(AtomicUsize::new(0)),
                    fail_start,
                    fail_configure,
                    configured_format: None,
                }) as Box<dyn CaptureBackend>
            }),
        }])
    }

    fn audio_format() -> ConfiguredFormat {
        ConfiguredFormat::Audio(AudioFormat {
            sample_rate: 48000,
            channels: 2,
            sample_format: SampleFormat::F32,
            frames_per_callback_hint: 480,
        })
    }

    #[test]
    fn start_on_created_returns_not_initialized() {
        let registry = registry(false, false);
        let mut ctx = CaptureContext::create(CaptureDomain::Microphone, &registry).unwrap();
        let err = ctx.start(Box::new(|_| {}), 0).unwrap_err();
        assert!(matches!(err, MiniavError::NotInitialized));
    }

    #[test]
    fn configure_on_running_returns_already_running() {
        let registry = registry(false, false);
        let mut ctx = CaptureContext::create(CaptureDomain::Microphone, &registry).unwrap();
        ctx.configure(None, None, audio_format(), false, |_| None).unwrap();
        ctx.start(Box::new(|_| {}), 0).unwrap();

        let err = ctx
            .configure(None, None, audio_format(), false, |_| None)
            .unwrap_err();
        assert!(matches!(err, MiniavError::AlreadyRunning));
        assert_eq!(ctx.phase(), LifecyclePhase::Running);
    }

    #[test]
    fn stop_on_non_running_returns_success() {
        let registry = registry(false, false);
        let mut ctx = CaptureContext::create(CaptureDomain::Microphone, &registry).unwrap();
        assert!(ctx.stop().is_ok());
        assert_eq!(ctx.phase(), LifecyclePhase::Created);
    }

    #[test]
    fn start_failure_keeps_configured_phase() {
        let registry = registry(true, false);
        let mut ctx = CaptureContext::create(CaptureDomain::Microphone, &registry).unwrap();
        ctx.configure(None, None, audio_format(), false, |_| None).unwrap();

        assert!(ctx.start(Box::new(|_| {}), 0).is_err());
        assert_eq!(ctx.phase(), LifecyclePhase::Configured);
    }

    #[test]
    fn configure_failure_retains_prior_state() {
        let registry = registry(false, true);
        let mut ctx = CaptureContext::create(CaptureDomain::Microphone, &registry).unwrap();
        assert!(ctx
            .configure(None, None, audio_format(), false, |_| None)
            .is_err());
        assert_eq!(ctx.phase(), LifecyclePhase::Created);
        assert!(ctx.get_configured_format().is_err());
    }

    #[test]
    fn envelope_accounting_zero_outstanding_after_release() {
        let registry = registry(false, false);
        let mut ctx = CaptureContext::create(CaptureDomain::Microphone, &registry).unwrap();
        ctx.configure(None, None, audio_format(), false, |_| None).unwrap();

        let released_token = Arc::new(Mutex::new(None));
        let captured = released_token.clone();
        ctx.start(
            Box::new(move |envelope| {
                *captured.lock() = Some(envelope.release_token);
            }),
            0,
        )
        .unwrap();

        assert_eq!(ctx.outstanding_envelopes(), 1);
        let token = released_token.lock().take().unwrap();
        ctx.release_buffer(token);
        assert_eq!(ctx.outstanding_envelopes(), 0);
    }

    #[test]
    fn destroy_drains_unreleased_envelopes() {
        let registry = registry(false, false);
        let mut ctx = CaptureContext::create(CaptureDomain::Microphone, &registry).unwrap();
        ctx.configure(None, None, audio_format(), false, |_| None).unwrap();
        ctx.start(Box::new(|_| {}), 0).unwrap();
        ctx.destroy();
        // No assertion beyond "does not panic": the context is consumed.
    }
}
