pub mod atomic;
pub mod logger;

#[cfg(target_os = "windows")]
pub mod win32;

#[cfg(target_os = "macos")]
pub mod macos;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A pixel dimension pair, shared by every video format description in the
/// core.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

/// Returns a timestamp in microseconds on the process's monotonic clock.
///
/// Every producer engine stamps envelopes with this (or a more precise
/// platform-native monotonic source, such as `CMSampleBufferGetPresentationTimeStamp`
/// or a cached QPC frequency) so that `timestamp_us` is comparable across
/// frames from the same context regardless of which backend produced them.
pub fn monotonic_timestamp_us() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;

    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);

    start.elapsed().as_micros() as u64
}
