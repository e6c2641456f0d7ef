//! The Backend Registry: a compile-time-ordered table of providers per
//! domain, used for selection (context creation) and enumeration (listing
//! devices without committing to a backend).

use crate::error::{MiniavError, Result};
use crate::source::{dedup_by_id, DeviceDescriptor};
use crate::vtable::CaptureBackend;

/// A factory for one backend entry. Kept as a boxed closure rather than a
/// bare fn pointer so platform modules can close over constructor arguments
/// (e.g. a shared Direct3D device) without a separate per-backend
/// registration type.
pub type BackendFactory = Box<dyn Fn() -> Box<dyn CaptureBackend> + Send + Sync>;

pub struct BackendDescriptor {
    pub name: &'static str,
    pub factory: BackendFactory,
}

/// Ordered list of backend descriptors for one domain. Construction order is
/// platform preference order: the first entry whose `probe()` succeeds wins
/// context creation.
pub struct BackendRegistry {
    descriptors: Vec<BackendDescriptor>,
}

impl BackendRegistry {
    pub fn new(descriptors: Vec<BackendDescriptor>) -> Self {
        Self { descriptors }
    }

    /// Walks the registry in order, invoking each descriptor's probe. The
    /// first probe to succeed is the commitment point: its backend is
    /// constructed and `init` is invoked. A probe returning false means "not
    /// applicable on this machine" and the loop continues to the next
    /// descriptor; it is not itself an error.
    ///
    /// If `init` fails after a successful probe, the registry does **not**
    /// fall over to the next backend — the caller receives the init error.
    pub fn select(&self) -> Result<Box<dyn CaptureBackend>> {
        for descriptor in &self.descriptors {
            let mut backend = (descriptor.factory)();
            if !backend.probe() {
                continue;
            }

            backend.init()?;
            return Ok(backend);
        }

        Err(MiniavError::DeviceNotFound(
            "no backend in the registry probed successfully on this system".into(),
        ))
    }

    /// Tries every backend's `enumerate` op in order, returning the first
    /// success. Unlike [`select`](Self::select), a failing enumerate call
    /// does not commit to anything; it just means the next backend is tried.
    pub fn enumerate_all(&self) -> Result<Vec<DeviceDescriptor>> {
        let mut last_error = None;

        for descriptor in &self.descriptors {
            let backend = (descriptor.factory)();
            if !backend.probe() {
                continue;
            }

            match backend.enumerate() {
                Ok(devices) => return Ok(dedup_by_id(devices)),
                Err(err) => last_error = Some(err),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            MiniavError::DeviceNotFound("no backend in the registry is usable on this system".into())
        }))
    }

    /// Aggregates enumeration results across every probing backend instead
    /// of stopping at the first success, used by loopback process-target
    /// enumeration which must walk every active render endpoint rather than
    /// just the default one (§4.6, testable property 8f).
    pub fn enumerate_aggregated(&self) -> Result<Vec<DeviceDescriptor>> {
        let mut all = Vec::new();
        let mut any_ok = false;

        for descriptor in &self.descriptors {
            let backend = (descriptor.factory)();
            if !backend.probe() {
                continue;
            }

            if let Ok(devices) = backend.enumerate() {
                any_ok = true;
                all.extend(devices);
            }
        }

        if !any_ok {
            return Err(MiniavError::DeviceNotFound(
                "no backend in the registry is usable on this system".into(),
            ));
        }

        Ok(dedup_by_id(all))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::ReleaseArena;
    use crate::format::ConfiguredFormat;
    use crate::vtable::{ConfigureRequest, FrameCallback};
    use std::sync::Arc;

    struct FakeBackend {
        probe_result: bool,
        init_result: fn() -> Result<()>,
    }

    impl CaptureBackend for FakeBackend {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn probe(&self) -> bool {
            self.probe_result
        }

        fn init(&mut self) -> Result<()> {
            (self.init_result)()
        }

        fn destroy(&mut self) {}

        fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
            Ok(vec![DeviceDescriptor::new("fake-0", "Fake Device")])
        }

        fn get_supported_formats(&self, _device_id: &str) -> Result<Vec<ConfiguredFormat>> {
            Ok(vec![])
        }

        fn get_default_format(&self, _device_id: &str) -> Result<ConfiguredFormat> {
            Err(MiniavError::NotSupported("fake backend has no default format".into()))
        }

        fn configure(&mut self, _request: &ConfigureRequest) -> Result<()> {
            Ok(())
        }

        fn start_capture(
            &mut self,
            _arena: Arc<parking_lot::Mutex<ReleaseArena>>,
            _callback: FrameCallback,
            _user_data: usize,
        ) -> Result<()> {
            Ok(())
        }

        fn stop_capture(&mut self) -> Result<()> {
            Ok(())
        }

        fn get_configured_format(&self) -> Result<ConfiguredFormat> {
            Err(MiniavError::NotInitialized)
        }
    }

    fn descriptor(name: &'static str, probe_result: bool, init_result: fn() -> Result<()>) -> BackendDescriptor {
        BackendDescriptor {
            name,
            factory: Box::new(move || {
                Box::new(FakeBackend { probe_result, init_result }) as Box<dyn CaptureBackend>
            }),
        }
    }

    #[test]
    fn first_successful_probe_wins() {
        let registry = BackendRegistry::new(vec![
            descriptor("unavailable", false, || Ok(())),
            descriptor("available", true, || Ok(())),
            descriptor("also-available", true, || Ok(())),
        ]);

        let backend = registry.select().unwrap();
        assert_eq!(backend.name(), "fake");
    }

    #[test]
    fn probe_failure_tries_next_descriptor() {
        let registry = BackendRegistry::new(vec![
            descriptor("a", false, || Ok(())),
            descriptor("b", false, || Ok(())),
        ]);

        assert!(registry.select().is_err());
    }

    #[test]
    fn init_failure_after_probe_does_not_fall_over_to_next_backend() {
        let registry = BackendRegistry::new(vec![
            descriptor(
                "probes-ok-inits-bad",
                true,
                || Err(MiniavError::SystemCallFailed("boom".into())),
            ),
            descriptor("never-reached", true, || Ok(())),
        ]);

        let err = registry.select().unwrap_err();
        assert!(matches!(err, MiniavError::SystemCallFailed(_)));
    }

    #[test]
    fn enumerate_all_returns_first_success() {
        let registry = BackendRegistry::new(vec![descriptor("a", true, || Ok(()))]);
        let devices = registry.enumerate_all().unwrap();
        assert_eq!(devices.len(), 1);
    }
}
