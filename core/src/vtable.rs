//! The Backend Vtable, restated as a trait: one implementation per platform
//! provider, dyn-dispatched from inside a Capture Context. Mirrors the
//! `CaptureHandler` shape the camera/screen/audio backends in this crate all
//! share, generalized to every domain's configure/start/stop/release
//! operations instead of one `CaptureOptions` type per concrete handler.

use crate::envelope::{BufferEnvelope, ReleaseArena};
use crate::error::Result;
use crate::format::ConfiguredFormat;
use crate::source::DeviceDescriptor;
use crate::target::TargetDescriptor;

/// Delivered to the producer engine's installed callback. Carries the
/// envelope plus the raw `user_data` pointer installed at `Start`.
pub type FrameCallback = Box<dyn Fn(BufferEnvelope) + Send + Sync>;

/// What a backend needs from the context to configure and run: the device or
/// target to open, the requested format, and (screen domain only) whether to
/// capture audio alongside video.
#[derive(Debug, Clone)]
pub struct ConfigureRequest {
    pub device_id: Option<String>,
    pub target: Option<TargetDescriptor>,
    pub format: ConfiguredFormat,
    pub capture_audio: bool,
}

/// One platform provider's implementation of a domain's operation set.
///
/// `init`/`destroy` bracket the backend-private state's lifetime and must be
/// safe to call even when `start_capture` never ran — `destroy` in
/// particular must tolerate a partially initialized state, since a failed
/// `init` still runs `destroy` on the way out.
pub trait CaptureBackend: Send {
    fn name(&self) -> &'static str;

    /// Cheap probe: can this backend run on the current system? Does not
    /// commit to opening any device. Probe failure means "try the next
    /// registry entry", not "the domain is unavailable".
    fn probe(&self) -> bool;

    fn init(&mut self) -> Result<()>;

    /// Must be safe to call on a state for which `init` partially failed;
    /// must not assume `start_capture` ever ran.
    fn destroy(&mut self);

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>>;

    fn get_supported_formats(&self, device_id: &str) -> Result<Vec<ConfiguredFormat>>;

    fn get_default_format(&self, device_id: &str) -> Result<ConfiguredFormat>;

    /// Installs format and (loopback/screen) target. Must fail with
    /// `InvalidOperation` if called while running, `FormatNotSupported` if
    /// the format cannot be realized, `DeviceNotFound` if the device/target
    /// does not resolve.
    fn configure(&mut self, request: &ConfigureRequest) -> Result<()>;

    /// Starts the producer engine. `callback` is moved in and must be
    /// retained for the lifetime of the running capture; `user_data` is
    /// passed through on every envelope untouched.
    fn start_capture(
        &mut self,
        arena: std::sync::Arc<parking_lot::Mutex<ReleaseArena>>,
        callback: FrameCallback,
        user_data: usize,
    ) -> Result<()>;

    /// Halts production, waits for any in-flight callback to return, and
    /// releases any frames dequeued but not yet delivered. Must always leave
    /// the backend in a state where no further callback fires, even if this
    /// call itself returns an error (the context transitions to `Stopped`
    /// regardless per the state machine's authoritative-stop rule).
    fn stop_capture(&mut self) -> Result<()>;

    /// The actually-negotiated format, which may differ from what was
    /// requested in `configure`.
    fn get_configured_format(&self) -> Result<ConfiguredFormat>;
}
