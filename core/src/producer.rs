//! Shared machinery the per-backend Producer Engines build on: the
//! stop-signal primitive every polling-thread backend uses, and the
//! timestamp/backpressure helpers common to all of them. The backend-specific
//! acquisition loops themselves live under `platform/`.

use std::sync::Arc;

use common::atomic::EasyAtomic;
use std::sync::atomic::AtomicBool;

/// A manual-reset stop flag shared between a producer thread and the thread
/// calling `stop_capture`. Cloning shares the same underlying flag.
#[derive(Clone)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn signal(&self) {
        self.0.set(true);
    }

    pub fn is_signaled(&self) -> bool {
        self.0.get()
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns the current monotonic timestamp in microseconds, used by
/// backends whose platform API does not hand back its own high-resolution
/// clock reading (most polling-thread loopback/microphone paths). Backends
/// with a native monotonic source (QPC on Windows, `CMSampleBufferGetPresentationTimeStamp`
/// on macOS, `pw_buffer->time` on PipeWire) use that instead, per §4.4.
pub fn timestamp_us() -> u64 {
    common::monotonic_timestamp_us()
}

/// Ensures successive timestamps handed to the user callback are
/// non-decreasing (§5's ordering guarantee), clamping a backend-reported
/// timestamp that would otherwise regress (e.g. due to clock-source jitter
/// across a device-loss recovery) up to the previous value.
pub struct MonotonicClamp {
    last: Option<u64>,
}

impl MonotonicClamp {
    pub fn new() -> Self {
        Self { last: None }
    }

    pub fn clamp(&mut self, timestamp_us: u64) -> u64 {
        let value = match self.last {
            Some(last) if timestamp_us < last => last,
            _ => timestamp_us,
        };
        self.last = Some(value);
        value
    }
}

impl Default for MonotonicClamp {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_signal_starts_clear() {
        let signal = StopSignal::new();
        assert!(!signal.is_signaled());
        signal.signal();
        assert!(signal.is_signaled());
    }

    #[test]
    fn shared_stop_signal_is_visible_across_clones() {
        let signal = StopSignal::new();
        let clone = signal.clone();
        clone.signal();
        assert!(signal.is_signaled());
    }

    #[test]
    fn monotonic_clamp_never_regresses() {
        let mut clamp = MonotonicClamp::new();
        assert_eq!(clamp.clamp(100), 100);
        assert_eq!(clamp.clamp(50), 100);
        assert_eq!(clamp.clamp(150), 150);
    }
}
