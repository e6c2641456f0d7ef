//! The MiniAV Capture Core: a uniform, reference-counted, zero-copy-capable
//! buffer pipeline multiplexing camera, microphone, loopback-audio, and
//! screen capture across platform backends behind one producer/consumer
//! contract.
//!
//! Dependency order, leaves first: [`envelope`] (Buffer Envelope + Release
//! Payload arena), [`vtable`] (Backend Vtable), [`registry`] (Backend
//! Registry), [`context`] (Capture Context state machine), [`producer`]
//! (Producer Engine shared machinery; per-backend loops under `platform`),
//! [`target`] (Target Resolver).

pub mod context;
pub mod domain;
pub mod envelope;
pub mod error;
pub mod format;
pub mod microphone;
pub mod producer;
pub mod registry;
pub mod source;
pub mod target;
pub mod vtable;

pub mod platform;

pub use context::{CaptureContext, LifecyclePhase};
pub use domain::CaptureDomain;
pub use envelope::{BufferEnvelope, ContentType, EnvelopeKind, ReleaseToken};
pub use error::{MiniavError, Result};
pub use format::{AudioFormat, ConfiguredFormat, OutputPreference, PixelFormat, VideoFormat};
pub use registry::BackendRegistry;
pub use target::TargetDescriptor;

/// Builds the platform-appropriate registry for a domain, in backend
/// preference order. This is the one place that knows which concrete
/// backends exist on which OS; everything above `registry` is
/// platform-agnostic.
pub fn default_registry(domain: CaptureDomain) -> BackendRegistry {
    platform::build_registry(domain)
}
