//! macOS-only `CVPixelBuffer`/Metal handle wrappers shared by the camera
//! (AVFoundation), screen (ScreenCaptureKit), and loopback/microphone
//! (ScreenCaptureKit audio tap / cpal) backends.

use std::fmt::Display;

pub use core_video::pixel_buffer::CVPixelBufferRef;
pub use core_video::r#return::CVReturn as ErrorCode;

use core_video::metal_texture::CVMetalTexture;
use core_video::metal_texture_cache::{CVMetalTextureCache, CVMetalTextureCacheRef};
use core_video::pixel_buffer::{
    kCVPixelBufferLock_ReadOnly, kCVPixelFormatType_32BGRA, kCVPixelFormatType_32RGBA,
    kCVPixelFormatType_420YpCbCr8BiPlanarFullRange, kCVPixelFormatType_420YpCbCr8BiPlanarVideoRange,
    kCVPixelFormatType_420YpCbCr8Planar, CVPixelBufferGetBaseAddressOfPlane,
    CVPixelBufferGetBytesPerRowOfPlane, CVPixelBufferGetHeight, CVPixelBufferGetPixelFormatType,
    CVPixelBufferGetWidth, CVPixelBufferLockBaseAddress, CVPixelBufferUnlockBaseAddress,
};

use metal::{Device, MTLPixelFormat};

use crate::Size;

/// A coarse tag for the pixel layout a `CVPixelBuffer` reports, enough to
/// pick a plane count and a Metal pixel format without pulling in the full
/// video-format enum from `miniav-core` (this crate sits below it).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    Bgra,
    Rgba,
    I420,
    Nv12,
}

#[derive(Debug)]
pub struct Error(ErrorCode);

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "core video error code={}", self.0)
    }
}

impl From<ErrorCode> for Error {
    fn from(value: ErrorCode) -> Self {
        Self(value)
    }
}

#[allow(non_upper_case_globals)]
pub fn pixel_buffer_layout(buffer: CVPixelBufferRef) -> PixelLayout {
    match unsafe { CVPixelBufferGetPixelFormatType(buffer) } {
        kCVPixelFormatType_32RGBA => PixelLayout::Rgba,
        kCVPixelFormatType_32BGRA => PixelLayout::Bgra,
        kCVPixelFormatType_420YpCbCr8Planar => PixelLayout::I420,
        kCVPixelFormatType_420YpCbCr8BiPlanarVideoRange
        | kCVPixelFormatType_420YpCbCr8BiPlanarFullRange => PixelLayout::Nv12,
        format => unimplemented!("unsupported CVPixelBuffer format = {:?}", format),
    }
}

pub fn pixel_buffer_size(buffer: CVPixelBufferRef) -> Size {
    Size {
        width: unsafe { CVPixelBufferGetWidth(buffer) } as u32,
        height: unsafe { CVPixelBufferGetHeight(buffer) } as u32,
    }
}

fn plane_count(layout: PixelLayout) -> usize {
    match layout {
        PixelLayout::Bgra | PixelLayout::Rgba => 1,
        PixelLayout::Nv12 => 2,
        PixelLayout::I420 => 3,
    }
}

/// A `CVPixelBufferLockBaseAddress`-locked view over a CPU-backed pixel
/// buffer. Unlocks on drop, so the lock's lifetime is exactly the lifetime of
/// this value — the same pattern the Release Payload relies on for the CPU
/// fallback path of the camera/screen backends.
pub struct PixelMemoryBuffer<'a> {
    pub size: Size,
    pub layout: PixelLayout,
    pub data: [&'a [u8]; 4],
    pub linesize: [usize; 4],
    buffer: CVPixelBufferRef,
}

impl<'a> PixelMemoryBuffer<'a> {
    pub fn as_ref(&self) -> CVPixelBufferRef {
        self.buffer
    }
}

impl<'a> From<(CVPixelBufferRef, PixelLayout, Size)> for PixelMemoryBuffer<'a> {
    fn from((buffer, layout, size): (CVPixelBufferRef, PixelLayout, Size)) -> Self {
        unsafe {
            CVPixelBufferLockBaseAddress(buffer, kCVPixelBufferLock_ReadOnly);
        }

        let mut this = Self {
            size,
            layout,
            buffer,
            data: [&[]; 4],
            linesize: [0; 4],
        };

        for i in 0..plane_count(layout) {
            let stride = unsafe { CVPixelBufferGetBytesPerRowOfPlane(buffer, i) };
            let plane_height = if layout == PixelLayout::I420 && i > 0 {
                size.height / 2
            } else {
                size.height
            };

            this.linesize[i] = stride;
            this.data[i] = unsafe {
                std::slice::from_raw_parts(
                    CVPixelBufferGetBaseAddressOfPlane(buffer, i) as *const _,
                    stride * plane_height as usize,
                )
            };
        }

        this
    }
}

impl<'a> From<CVPixelBufferRef> for PixelMemoryBuffer<'a> {
    fn from(buffer: CVPixelBufferRef) -> Self {
        Self::from((buffer, pixel_buffer_layout(buffer), pixel_buffer_size(buffer)))
    }
}

impl<'a> Drop for PixelMemoryBuffer<'a> {
    fn drop(&mut self) {
        unsafe {
            CVPixelBufferUnlockBaseAddress(self.buffer, kCVPixelBufferLock_ReadOnly);
        }
    }
}

/// An un-locked, `Copy`-able reference to a GPU-resident `CVPixelBuffer`,
/// used on the GPU output-preference path where the buffer is handed to
/// `CVMetalTextureCache` rather than mapped.
#[derive(Clone, Copy)]
pub struct PixelBuffer {
    buffer: CVPixelBufferRef,
    pub layout: PixelLayout,
    pub size: Size,
}

impl PixelBuffer {
    pub fn as_ref(&self) -> CVPixelBufferRef {
        self.buffer
    }
}

impl From<CVPixelBufferRef> for PixelBuffer {
    fn from(buffer: CVPixelBufferRef) -> Self {
        Self {
            buffer,
            layout: pixel_buffer_layout(buffer),
            size: pixel_buffer_size(buffer),
        }
    }
}

/// Wraps `CVMetalTextureCache`, the bridge that turns a `CVPixelBuffer` into
/// a Metal-mappable texture without a copy. Requires a non-planar,
/// Metal-compatible pixel format (BGRA/RGBA); planar formats (I420, NV12)
/// must fall back to the CPU path, per spec.md's macOS camera notes.
pub struct MetalTextureCache(CVMetalTextureCache);

impl MetalTextureCache {
    pub fn new(device: Device) -> Result<Self, Error> {
        Ok(Self(CVMetalTextureCache::new(None, device, None)?))
    }

    pub fn create_texture(&self, buffer: PixelBuffer) -> Result<CVMetalTexture, Error> {
        let pixel_format = match buffer.layout {
            PixelLayout::Bgra => MTLPixelFormat::BGRA8Unorm,
            PixelLayout::Rgba => MTLPixelFormat::RGBA8Unorm,
            _ => unimplemented!(
                "CVMetalTextureCache requires a non-planar format, got {:?}",
                buffer.layout
            ),
        };

        Ok(self.0.create_texture_from_image(
            buffer.as_ref(),
            None,
            pixel_format,
            buffer.size.width as usize,
            buffer.size.height as usize,
            0,
        )?)
    }

    pub fn flush(&self) {
        self.0.flush(0);
    }

    pub fn as_ref(&self) -> CVMetalTextureCacheRef {
        use core_foundation::base::TCFType;
        self.0.as_concrete_TypeRef()
    }
}
