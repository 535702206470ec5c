//! Captured frame types.
//!
//! Pixel payloads are held in [`Bytes`] and frames are shared as
//! `Arc<Frame>`, so snapshots and encoders never copy pixel data until it is
//! written out.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Raster layouts the cameras produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// Packed 8-bit RGB.
    Rgb24,
    /// Planar YUV 4:2:0 (I420).
    Yuv420,
}

impl PixelFormat {
    /// Number of bytes in one frame of the given dimensions.
    #[must_use]
    pub fn frame_len(self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            Self::Rgb24 => pixels * 3,
            Self::Yuv420 => pixels + 2 * (width.div_ceil(2) as usize * height.div_ceil(2) as usize),
        }
    }

    /// The name ffmpeg uses for this layout.
    #[must_use]
    pub fn ffmpeg_name(self) -> &'static str {
        match self {
            Self::Rgb24 => "rgb24",
            Self::Yuv420 => "yuv420p",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rgb24 => write!(f, "rgb24"),
            Self::Yuv420 => write!(f, "yuv420"),
        }
    }
}

/// One image as delivered by a camera, before it is stamped into a [`Frame`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawImage {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Raster layout of `data`.
    pub format: PixelFormat,
    /// Pixel payload.
    pub data: Bytes,
}

impl RawImage {
    /// Whether `data` has exactly the size the format and dimensions imply.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.data.len() == self.format.frame_len(self.width, self.height)
    }
}

/// A captured frame. Immutable once created.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    /// Monotonically increasing, unique per recorder run.
    pub sequence: u64,
    /// Monotonic capture time.
    pub captured_at: Instant,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Raster layout of `pixels`.
    pub format: PixelFormat,
    /// Pixel payload, shared without copying.
    pub pixels: Bytes,
}

impl Frame {
    /// Stamp a camera image with its sequence number and capture time.
    #[must_use]
    pub fn new(sequence: u64, captured_at: Instant, image: RawImage) -> Self {
        Self {
            sequence,
            captured_at,
            width: image.width,
            height: image.height,
            format: image.format,
            pixels: image.data,
        }
    }

    /// Size of the pixel payload in bytes.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }
}

// Pixel payloads are large; keep them out of debug output.
impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.sequence)
            .field("captured_at", &self.captured_at)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}
