//! The configured-format data model: what a caller requests via `Configure`
//! and what a backend reports back via `GetConfiguredFormat`, which may
//! differ from the request.

use common::Size;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Bgra32,
    Rgba32,
    Yuy2,
    Nv12,
    I420,
}

impl PixelFormat {
    pub fn plane_count(self) -> usize {
        match self {
            Self::Bgra32 | Self::Rgba32 | Self::Yuy2 => 1,
            Self::Nv12 => 2,
            Self::I420 => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputPreference {
    Cpu,
    Gpu,
    GpuIfAvailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoFormat {
    pub size: Size,
    pub pixel_format: PixelFormat,
    pub frame_rate_num: u32,
    pub frame_rate_den: u32,
    pub output_preference: OutputPreference,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    I16,
    F32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
    /// Hint only; backends may deliver a different frame count per callback.
    pub frames_per_callback_hint: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfiguredFormat {
    Video(VideoFormat),
    Audio(AudioFormat),
}

/// Describes one plane of a captured frame, independent of content type:
/// `data_ptr`'s meaning (mapped memory vs. native GPU handle) is carried by
/// the envelope's content type, not by the plane record itself.
#[derive(Debug, Clone, Copy)]
pub struct PlaneLayout {
    pub width: u32,
    pub height: u32,
    pub stride_bytes: usize,
    pub offset_bytes: usize,
    pub subresource_index: u32,
}

/// Maximum plane count the envelope's plane array carries, per the external
/// contract's "fixed maximum plane count (>=4)".
pub const MAX_PLANES: usize = 4;

/// Computes the plane layout for one of the three supported pixel layouts,
/// given a base stride for plane 0 (`stride_y`, in bytes, already accounting
/// for any backend row-alignment padding).
///
/// Matches testable property 7: NV12's chroma plane is half-resolution with
/// the same stride as luma; I420's two chroma planes are quarter-resolution
/// with half the luma stride and are laid out contiguously after Y then U.
pub fn plane_layout(
    pixel_format: PixelFormat,
    size: Size,
    stride_y: usize,
) -> [Option<PlaneLayout>; MAX_PLANES] {
    let mut planes = [None; MAX_PLANES];

    match pixel_format {
        PixelFormat::Bgra32 | PixelFormat::Rgba32 | PixelFormat::Yuy2 => {
            planes[0] = Some(PlaneLayout {
                width: size.width,
                height: size.height,
                stride_bytes: stride_y,
                offset_bytes: 0,
                subresource_index: 0,
            });
        }
        PixelFormat::Nv12 => {
            let y_size = stride_y * size.height as usize;
            planes[0] = Some(PlaneLayout {
                width: size.width,
                height: size.height,
                stride_bytes: stride_y,
                offset_bytes: 0,
                subresource_index: 0,
            });
            planes[1] = Some(PlaneLayout {
                width: size.width / 2,
                height: size.height / 2,
                stride_bytes: stride_y,
                offset_bytes: y_size,
                subresource_index: 0,
            });
        }
        PixelFormat::I420 => {
            let stride_uv = stride_y / 2;
            let y_size = stride_y * size.height as usize;
            let uv_size = stride_uv * (size.height as usize / 2);
            planes[0] = Some(PlaneLayout {
                width: size.width,
                height: size.height,
                stride_bytes: stride_y,
                offset_bytes: 0,
                subresource_index: 0,
            });
            planes[1] = Some(PlaneLayout {
                width: size.width / 2,
                height: size.height / 2,
                stride_bytes: stride_uv,
                offset_bytes: y_size,
                subresource_index: 0,
            });
            planes[2] = Some(PlaneLayout {
                width: size.width / 2,
                height: size.height / 2,
                stride_bytes: stride_uv,
                offset_bytes: y_size + uv_size,
                subresource_index: 0,
            });
        }
    }

    planes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nv12_1920x1080_layout() {
        let size = Size { width: 1920, height: 1080 };
        let planes = plane_layout(PixelFormat::Nv12, size, 1920);

        let y = planes[0].unwrap();
        assert_eq!((y.width, y.height, y.offset_bytes), (1920, 1080, 0));
        assert!(y.stride_bytes >= 1920);

        let uv = planes[1].unwrap();
        assert_eq!((uv.width, uv.height), (960, 540));
        assert_eq!(uv.stride_bytes, y.stride_bytes);
        assert_eq!(uv.offset_bytes, y.stride_bytes * 1080);

        assert!(planes[2].is_none());
    }

    #[test]
    fn i420_640x480_layout() {
        let size = Size { width: 640, height: 480 };
        let planes = plane_layout(PixelFormat::I420, size, 640);

        let y = planes[0].unwrap();
        assert_eq!((y.width, y.height, y.offset_bytes), (640, 480, 0));
        assert!(y.stride_bytes >= 640);

        let u = planes[1].unwrap();
        assert_eq!((u.width, u.height), (320, 240));
        assert_eq!(u.stride_bytes, y.stride_bytes / 2);
        assert_eq!(u.offset_bytes, y.stride_bytes * 480);

        let v = planes[2].unwrap();
        assert_eq!((v.width, v.height), (320, 240));
        assert_eq!(v.stride_bytes, u.stride_bytes);
        assert_eq!(v.offset_bytes, u.offset_bytes + u.stride_bytes * 240);
    }

    #[test]
    fn bgra32_1280x720_layout() {
        let size = Size { width: 1280, height: 720 };
        let planes = plane_layout(PixelFormat::Bgra32, size, 1280 * 4);

        let plane0 = planes[0].unwrap();
        assert!(plane0.stride_bytes >= 1280 * 4);
        assert!(planes[1].is_none());
    }
}
