//! The Buffer Envelope and its Release Payload: the payload delivered to the
//! user callback, and the heap record of native resources reclaimed when the
//! user calls `release_buffer` exactly once.
//!
//! Design note: the original threads a raw pointer through the envelope as
//! its release token. Here the envelope instead holds an arena-indexed
//! identifier into the owning Capture Context's release-payload arena (see
//! [`ReleaseArena`]); `release_buffer` resolves the index through the context
//! rather than dereferencing a pointer handed back by the caller, so a stale
//! envelope released after its context has been destroyed cannot reach freed
//! memory — the context (and its arena) has already dropped, and the slot
//! simply does not resolve.

use crate::format::{PlaneLayout, MAX_PLANES};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    Video,
    Audio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Cpu,
    GpuGenericHandle,
    GpuD3d11SharedHandle,
    GpuMetalTexture,
    GpuDmabufFd,
}

impl ContentType {
    /// Per design note open question 2: GPU content reports a zero data size
    /// (the byte count is not meaningful off a texture/fd handle); CPU
    /// content reports the real byte count.
    pub fn is_gpu(self) -> bool {
        !matches!(self, Self::Cpu)
    }
}

/// Opaque index into a [`ReleaseArena`], handed to the user embedded in the
/// envelope. Never dereferenced directly by calling code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseToken(pub(crate) usize);

#[derive(Debug, Clone)]
pub struct VideoSubRecord {
    pub format: crate::format::VideoFormat,
    pub planes: [Option<PlaneLayout>; MAX_PLANES],
    /// Per content type: for CPU, the mapped base address of plane 0 (or the
    /// sole plane); for GPU, the native handle value reinterpreted as an
    /// integer (texture pointer, `HANDLE`, or fd) for marshalling purposes.
    pub data_ptr: usize,
}

#[derive(Debug, Clone)]
pub struct AudioSubRecord {
    pub format: crate::format::AudioFormat,
    pub num_frames: u32,
    pub data_ptr: usize,
}

#[derive(Debug, Clone)]
pub enum EnvelopeBody {
    Video(VideoSubRecord),
    Audio(AudioSubRecord),
}

/// One captured frame/chunk, as delivered to the user callback.
#[derive(Debug, Clone)]
pub struct BufferEnvelope {
    pub kind: EnvelopeKind,
    pub content_type: ContentType,
    pub timestamp_us: u64,
    pub body: EnvelopeBody,
    pub data_size_bytes: usize,
    pub user_data: usize,
    pub release_token: ReleaseToken,
}

/// The backend-specific native resource(s) a Release Payload holds, kept
/// behind the vtable so `miniav-core` itself never matches on backend
/// identity — only the owning backend's `release_buffer` impl does.
pub trait ReleasableResource: Send {
    /// Reclaims the native resource(s): unmap/unlock mapped memory, release a
    /// retained platform sample, close a duplicated fd, or free a heap copy.
    /// Must be idempotent-safe to call at most once; the arena enforces the
    /// at-most-once invariant by removing the slot before calling this.
    fn release(self: Box<Self>);
}

struct ReleaseSlot {
    resource: Option<Box<dyn ReleasableResource>>,
}

/// Per-context arena of in-flight Release Payloads. A slot is taken (its
/// index becomes a [`ReleaseToken`]) when an envelope is produced and freed
/// when the user calls release; releasing twice or releasing a token from a
/// different (e.g. destroyed-and-recreated) context is a documented no-op
/// rather than undefined behavior, since the slot is simply empty or does
/// not exist in the new arena.
#[derive(Default)]
pub struct ReleaseArena {
    slots: Vec<ReleaseSlot>,
    free_list: Vec<usize>,
}

impl ReleaseArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, resource: Box<dyn ReleasableResource>) -> ReleaseToken {
        let slot = ReleaseSlot { resource: Some(resource) };

        let index = if let Some(index) = self.free_list.pop() {
            self.slots[index] = slot;
            index
        } else {
            self.slots.push(slot);
            self.slots.len() - 1
        };

        ReleaseToken(index)
    }

    /// Resolves and releases the payload at `token`. A no-op if the token is
    /// out of range or already released (the at-most-once release
    /// invariant), matching the release-discipline contract for null or
    /// already-released envelopes.
    pub fn release(&mut self, token: ReleaseToken) {
        if let Some(slot) = self.slots.get_mut(token.0) {
            if let Some(resource) = slot.resource.take() {
                self.free_list.push(token.0);
                resource.release();
            }
        }
    }

    /// Number of slots still holding a live resource; used by the test
    /// harness to assert zero net outstanding after teardown.
    pub fn outstanding(&self) -> usize {
        self.slots.iter().filter(|s| s.resource.is_some()).count()
    }

    /// Releases every still-held resource, in arbitrary order. Called on
    /// context destroy/auto-stop so an un-released-by-the-user envelope does
    /// not leak past context teardown (the underlying platform resource is
    /// still reclaimed; only the user's visibility into it is gone).
    pub fn drain(&mut self) {
        for slot in &mut self.slots {
            if let Some(resource) = slot.resource.take() {
                resource.release();
            }
        }
        self.free_list.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingResource(Arc<AtomicUsize>);

    impl ReleasableResource for CountingResource {
        fn release(self: Box<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn release_is_exactly_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let mut arena = ReleaseArena::new();
        let token = arena.insert(Box::new(CountingResource(released.clone())));

        assert_eq!(arena.outstanding(), 1);
        arena.release(token);
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(arena.outstanding(), 0);

        // Releasing again, or releasing a stale token, is a no-op.
        arena.release(token);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drain_releases_all_outstanding() {
        let released = Arc::new(AtomicUsize::new(0));
        let mut arena = ReleaseArena::new();
        for _ in 0..3 {
            arena.insert(Box::new(CountingResource(released.clone())));
        }

        assert_eq!(arena.outstanding(), 3);
        arena.drain();
        assert_eq!(released.load(Ordering::SeqCst), 3);
        assert_eq!(arena.outstanding(), 0);
    }

    #[test]
    fn stale_token_from_recreated_arena_is_noop() {
        let released = Arc::new(AtomicUsize::new(0));
        let mut arena = ReleaseArena::new();
        let token = arena.insert(Box::new(CountingResource(released.clone())));
        arena.drain();

        let mut new_arena = ReleaseArena::new();
        new_arena.release(token);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
