//! The Target Resolver: translates a textual or structured target identifier
//! into a backend-specific capture handle, for the loopback and screen
//! domains only. Camera and microphone address devices directly by device id
//! and never go through this module.

use crate::error::{MiniavError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetDescriptor {
    SystemAudio,
    ProcessId(u32),
    WindowHandle(usize),
    DisplayId(u32),
    DeviceId(String),
    /// A sub-rectangle of another target, e.g. a region of a display.
    Region {
        target: Box<TargetDescriptor>,
        x: i32,
        y: i32,
        width: u32,
        height: u32,
    },
}

/// Parses the string grammar from the external interface:
/// `"" | "hwnd:" hex_ptr | "pid:" decimal | "display_" decimal | opaque_string`.
///
/// `resolve_hwnd_pid` is invoked for a `hwnd:` identifier to map the window
/// handle to an owning process id (`GetWindowThreadProcessId` on Windows);
/// resolution failure degrades to [`TargetDescriptor::SystemAudio`] rather
/// than propagating an error, per §4.6.
pub fn parse_target_identifier(
    id: &str,
    resolve_hwnd_pid: impl FnOnce(usize) -> Option<u32>,
) -> TargetDescriptor {
    if id.is_empty() {
        return TargetDescriptor::SystemAudio;
    }

    if let Some(hex) = id.strip_prefix("hwnd:") {
        let hwnd = parse_hex_ptr(hex);
        return match hwnd.and_then(resolve_hwnd_pid) {
            Some(pid) => TargetDescriptor::ProcessId(pid),
            None => TargetDescriptor::SystemAudio,
        };
    }

    if let Some(decimal) = id.strip_prefix("pid:") {
        if let Ok(pid) = decimal.parse::<u32>() {
            return TargetDescriptor::ProcessId(pid);
        }
    }

    if let Some(decimal) = id.strip_prefix("display_") {
        if let Ok(display) = decimal.parse::<u32>() {
            return TargetDescriptor::DisplayId(display);
        }
    }

    TargetDescriptor::DeviceId(id.to_string())
}

fn parse_hex_ptr(hex: &str) -> Option<usize> {
    let hex = hex.strip_prefix("0x").unwrap_or(hex);
    usize::from_str_radix(hex, 16).ok()
}

/// Formats a target identifier back into its string grammar. Round-trips
/// with [`parse_target_identifier`] modulo canonical hex casing (always
/// lowercase, `0x`-prefixed here).
pub fn format_target_identifier(target: &TargetDescriptor) -> String {
    match target {
        TargetDescriptor::SystemAudio => String::new(),
        TargetDescriptor::ProcessId(pid) => format!("pid:{pid}"),
        TargetDescriptor::WindowHandle(hwnd) => format!("hwnd:0x{hwnd:x}"),
        TargetDescriptor::DisplayId(display) => format!("display_{display}"),
        TargetDescriptor::DeviceId(id) => id.clone(),
        TargetDescriptor::Region { target, .. } => format_target_identifier(target),
    }
}

/// Effective loopback selection after resolving a target against the set of
/// active render endpoints. Process/window targets that fail process-filtered
/// capture fall back to endpoint-wide capture; this is recorded so
/// `GetConfiguredFormat` can surface the degradation (§9 design note).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopbackSelection {
    DefaultEndpoint,
    ExplicitEndpoint { device_id: String },
    ProcessFiltered { endpoint_device_id: String, pid: u32 },
}

/// Picks the loopback selection strategy for a resolved target, given the
/// default render endpoint's device id. Does not itself attempt the
/// process-filtered `InitializeSharedAudioStream` call; that belongs to the
/// Windows loopback backend, which calls this to decide intent and then
/// falls back to [`LoopbackSelection::ExplicitEndpoint`] on failure.
pub fn select_loopback_strategy(
    target: &TargetDescriptor,
    default_endpoint_device_id: &str,
) -> LoopbackSelection {
    match target {
        TargetDescriptor::SystemAudio => LoopbackSelection::DefaultEndpoint,
        TargetDescriptor::ProcessId(pid) => LoopbackSelection::ProcessFiltered {
            endpoint_device_id: default_endpoint_device_id.to_string(),
            pid: *pid,
        },
        TargetDescriptor::WindowHandle(_) => LoopbackSelection::DefaultEndpoint,
        TargetDescriptor::DisplayId(_) => LoopbackSelection::DefaultEndpoint,
        TargetDescriptor::DeviceId(id) => LoopbackSelection::ExplicitEndpoint {
            device_id: id.clone(),
        },
        TargetDescriptor::Region { target, .. } => {
            select_loopback_strategy(target, default_endpoint_device_id)
        }
    }
}

pub fn require_target(target: Option<&TargetDescriptor>) -> Result<&TargetDescriptor> {
    target.ok_or_else(|| MiniavError::InvalidArgument("target descriptor required".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_pid() {
        let parsed = parse_target_identifier("pid:1234", |_| None);
        assert_eq!(parsed, TargetDescriptor::ProcessId(1234));
        assert_eq!(format_target_identifier(&parsed), "pid:1234");
    }

    #[test]
    fn round_trips_hwnd() {
        let parsed = parse_target_identifier("hwnd:0xABC", |hwnd| {
            assert_eq!(hwnd, 0xABC);
            Some(42)
        });
        assert_eq!(parsed, TargetDescriptor::ProcessId(42));

        // Re-formatting a resolved hwnd yields its resolved pid form, not
        // the original hwnd string; round-trip of the *hwnd* grammar itself
        // is exercised via format_target_identifier(&WindowHandle(..)).
        let raw = TargetDescriptor::WindowHandle(0xABC);
        assert_eq!(format_target_identifier(&raw), "hwnd:0xabc");
    }

    #[test]
    fn round_trips_display() {
        let parsed = parse_target_identifier("display_2", |_| None);
        assert_eq!(parsed, TargetDescriptor::DisplayId(2));
        assert_eq!(format_target_identifier(&parsed), "display_2");
    }

    #[test]
    fn empty_string_is_system_default() {
        assert_eq!(
            parse_target_identifier("", |_| None),
            TargetDescriptor::SystemAudio
        );
    }

    #[test]
    fn hwnd_resolution_failure_falls_back_to_system_default() {
        assert_eq!(
            parse_target_identifier("hwnd:0x1", |_| None),
            TargetDescriptor::SystemAudio
        );
    }

    #[test]
    fn opaque_string_is_device_id() {
        assert_eq!(
            parse_target_identifier("my-camera-0", |_| None),
            TargetDescriptor::DeviceId("my-camera-0".to_string())
        );
    }

    #[test]
    fn process_target_selects_filtered_strategy() {
        let strategy = select_loopback_strategy(&TargetDescriptor::ProcessId(99), "endpoint-0");
        assert_eq!(
            strategy,
            LoopbackSelection::ProcessFiltered {
                endpoint_device_id: "endpoint-0".to_string(),
                pid: 99,
            }
        );
    }
}
