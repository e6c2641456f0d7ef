//! Per-OS backend wiring. Each platform module exports one
//! [`crate::registry::BackendDescriptor`]-producing function per domain;
//! [`build_registry`] is the single dispatch point gated on
//! `target_os`.

use crate::domain::CaptureDomain;
use crate::microphone::MicrophoneBackend;
use crate::registry::{BackendDescriptor, BackendRegistry};

#[cfg(target_os = "windows")]
pub mod win32;

#[cfg(target_os = "macos")]
pub mod macos;

#[cfg(target_os = "linux")]
pub mod linux;

fn microphone_descriptor() -> BackendDescriptor {
    BackendDescriptor {
        name: "cpal-microphone",
        factory: Box::new(|| Box::new(MicrophoneBackend::new())),
    }
}

/// Assembles the ordered backend list for one domain on the current target
/// OS. Microphone capture is cross-platform (`cpal`) and so appears
/// identically on every OS; the other three domains are backed by exactly
/// one platform-specific descriptor each, since each OS has exactly one
/// native capture API per domain in this design (no in-process fallback
/// chain beyond the registry's probe/init contract).
pub fn build_registry(domain: CaptureDomain) -> BackendRegistry {
    match domain {
        CaptureDomain::Microphone => BackendRegistry::new(vec![microphone_descriptor()]),

        #[cfg(target_os = "windows")]
        CaptureDomain::Camera => BackendRegistry::new(vec![win32::camera::descriptor()]),
        #[cfg(target_os = "windows")]
        CaptureDomain::Loopback => BackendRegistry::new(vec![win32::loopback::descriptor()]),
        #[cfg(target_os = "windows")]
        CaptureDomain::Screen => BackendRegistry::new(vec![win32::screen::descriptor()]),

        #[cfg(target_os = "macos")]
        CaptureDomain::Camera => BackendRegistry::new(vec![macos::camera::descriptor()]),
        #[cfg(target_os = "macos")]
        CaptureDomain::Loopback => BackendRegistry::new(vec![macos::loopback::descriptor()]),
        #[cfg(target_os = "macos")]
        CaptureDomain::Screen => BackendRegistry::new(vec![macos::screen::descriptor()]),

        #[cfg(target_os = "linux")]
        CaptureDomain::Camera => BackendRegistry::new(vec![linux::camera::descriptor()]),
        #[cfg(target_os = "linux")]
        CaptureDomain::Loopback => BackendRegistry::new(vec![linux::loopback::descriptor()]),
        #[cfg(target_os = "linux")]
        CaptureDomain::Screen => BackendRegistry::new(vec![linux::screen::descriptor()]),

        #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
        _ => BackendRegistry::new(vec![]),
    }
}
