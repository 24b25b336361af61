//! Pixel format definitions and frame size formulas

use serde::{Deserialize, Serialize};
use std::fmt;

/// Pixel formats and codec tags understood by capture and sink devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixelFormat {
    /// UYVY 4:2:2 packed format (chroma first)
    Uyvy,
    /// YUYV 4:2:2 packed format (luma first)
    Yuyv,
    /// NV12 semi-planar format (Y plane + interleaved UV)
    Nv12,
    /// YUV420 planar format (Y, U, V planes)
    Yuv420,
    /// MJPEG compressed stream
    Mjpeg,
    /// H.264 elementary stream
    H264,
}

impl PixelFormat {
    /// V4L2 FourCC code
    pub fn fourcc(&self) -> &'static [u8; 4] {
        match self {
            PixelFormat::Uyvy => b"UYVY",
            PixelFormat::Yuyv => b"YUYV",
            PixelFormat::Nv12 => b"NV12",
            PixelFormat::Yuv420 => b"YU12",
            PixelFormat::Mjpeg => b"MJPG",
            PixelFormat::H264 => b"H264",
        }
    }

    /// Try to convert from a V4L2 FourCC code
    pub fn from_fourcc(fourcc: &[u8; 4]) -> Option<Self> {
        match fourcc {
            b"UYVY" => Some(PixelFormat::Uyvy),
            b"YUYV" | b"YUY2" => Some(PixelFormat::Yuyv),
            b"NV12" => Some(PixelFormat::Nv12),
            b"YU12" | b"I420" => Some(PixelFormat::Yuv420),
            b"MJPG" | b"JPEG" => Some(PixelFormat::Mjpeg),
            b"H264" => Some(PixelFormat::H264),
            _ => None,
        }
    }

    /// Render a raw FourCC for log messages, e.g. `UYVY`
    pub fn fourcc_string(raw: u32) -> String {
        raw.to_le_bytes()
            .iter()
            .map(|&b| if b.is_ascii_graphic() { b as char } else { '?' })
            .collect()
    }

    /// Check if format is a compressed bitstream
    pub fn is_compressed(&self) -> bool {
        matches!(self, PixelFormat::Mjpeg | PixelFormat::H264)
    }

    /// Check if format is one of the packed 4:2:2 layouts
    pub fn is_packed_422(&self) -> bool {
        matches!(self, PixelFormat::Uyvy | PixelFormat::Yuyv)
    }

    /// Check if format belongs to the 4:2:0 family
    pub fn is_420(&self) -> bool {
        matches!(self, PixelFormat::Nv12 | PixelFormat::Yuv420)
    }

    /// Calculate expected frame size for a given resolution
    /// Returns None for compressed formats (variable size)
    pub fn frame_size(&self, resolution: Resolution) -> Option<usize> {
        let pixels = resolution.pixels() as usize;
        match self {
            PixelFormat::Uyvy | PixelFormat::Yuyv => Some(pixels * 2),
            PixelFormat::Nv12 | PixelFormat::Yuv420 => Some(pixels * 3 / 2),
            PixelFormat::Mjpeg | PixelFormat::H264 => None,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::Uyvy => "UYVY",
            PixelFormat::Yuyv => "YUYV",
            PixelFormat::Nv12 => "NV12",
            PixelFormat::Yuv420 => "YUV420",
            PixelFormat::Mjpeg => "MJPEG",
            PixelFormat::H264 => "H264",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "UYVY" => Ok(PixelFormat::Uyvy),
            "YUYV" | "YUY2" => Ok(PixelFormat::Yuyv),
            "NV12" => Ok(PixelFormat::Nv12),
            "YUV420" | "I420" | "YU12" => Ok(PixelFormat::Yuv420),
            "MJPEG" | "MJPG" => Ok(PixelFormat::Mjpeg),
            "H264" => Ok(PixelFormat::H264),
            _ => Err(format!("Unknown pixel format: {}", s)),
        }
    }
}

/// Resolution (width x height)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Both axes positive and even, as 4:2:0 subsampling halves them
    pub fn is_subsampling_aligned(&self) -> bool {
        self.width > 0 && self.height > 0 && self.width % 2 == 0 && self.height % 2 == 0
    }

    /// Get total pixels
    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Bytes used by a raw 4:2:0 sink frame (`w*h*12/8`)
    pub fn yuv420_size(&self) -> usize {
        (self.pixels() * 12 / 8) as usize
    }

    pub const VGA: Resolution = Resolution {
        width: 640,
        height: 480,
    };
    pub const HD720: Resolution = Resolution {
        width: 1280,
        height: 720,
    };
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl From<(u32, u32)> for Resolution {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}
