use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;

/// Pixel formats a surface can be configured with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Rgba8888,
    Yuyv4,
    Nv12,
    Nv21,
}

impl PixelFormat {
    /// Bytes per row for the luma/packed plane
    pub const fn row_stride(self, width: u32) -> usize {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => 3 * width as usize,
            PixelFormat::Rgba8888 => 4 * width as usize,
            PixelFormat::Yuyv4 => 2 * width as usize,
            PixelFormat::Nv12 | PixelFormat::Nv21 => width as usize,
        }
    }

    /// Total bytes needed to back one image of this format
    pub const fn image_size(self, width: u32, height: u32) -> usize {
        match self {
            // Y plane plus interleaved half-resolution chroma plane
            PixelFormat::Nv12 | PixelFormat::Nv21 => width as usize * height as usize * 3 / 2,
            _ => self.row_stride(width) * height as usize,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::Rgb24 => "RGB3",
            PixelFormat::Bgr24 => "BGR3",
            PixelFormat::Rgba8888 => "RGBA",
            PixelFormat::Yuyv4 => "YUYV",
            PixelFormat::Nv12 => "NV12",
            PixelFormat::Nv21 => "NV21",
        };
        f.write_str(name)
    }
}

/// Rectangular region of a buffer, used for damage and flush extents
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Region covering a whole `width` x `height` image
    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width as i32, height as i32)
    }
}

/// Memory usage flags requested from the buffer allocator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferUsage(u64);

impl BufferUsage {
    pub const CPU_READ: BufferUsage = BufferUsage(1 << 0);
    pub const CPU_WRITE: BufferUsage = BufferUsage(1 << 1);
    pub const MEM_DMA: BufferUsage = BufferUsage(1 << 3);
    pub const VIDEO_ENCODER: BufferUsage = BufferUsage(1 << 16);

    pub const fn union(self, other: BufferUsage) -> BufferUsage {
        BufferUsage(self.0 | other.0)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn contains(self, other: BufferUsage) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for BufferUsage {
    type Output = BufferUsage;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.union(rhs)
    }
}
