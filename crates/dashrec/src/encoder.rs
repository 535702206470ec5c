//! Encode-and-write backends.
//!
//! A [`ClipWriter`] turns an ordered run of frames into one media file at a
//! given path. Callers hand it a hidden temporary path and rename the result
//! into place, so a writer never needs to clean up after itself.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::frame::{Frame, PixelFormat};

/// Writes frames to a media file.
#[async_trait]
pub trait ClipWriter: Send + Sync + std::fmt::Debug {
    /// File extension of the produced media, without the dot.
    fn extension(&self) -> &'static str;

    /// Encode `frames` (ascending capture order) into `dest`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Encode`] if the file could not be produced. A partial
    /// file may be left at `dest`.
    async fn write_clip(&self, frames: &[Arc<Frame>], dest: &Path) -> Result<()>;
}

/// Encodes H.264 MP4 clips by piping raw frames into ffmpeg.
#[derive(Debug, Clone)]
pub struct FfmpegClipWriter {
    ffmpeg_path: String,
    frame_rate: u32,
}

impl FfmpegClipWriter {
    /// Create a writer producing video at `frame_rate`.
    #[must_use]
    pub fn new(ffmpeg_path: impl Into<String>, frame_rate: u32) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            frame_rate,
        }
    }

    /// ffmpeg arguments for raw input of the given geometry.
    #[must_use]
    pub fn command_args(&self, width: u32, height: u32, format: PixelFormat, dest: &Path) -> Vec<String> {
        vec![
            "-y".into(),
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            format.ffmpeg_name().into(),
            "-video_size".into(),
            format!("{width}x{height}"),
            "-framerate".into(),
            self.frame_rate.to_string(),
            "-i".into(),
            "-".into(),
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            "veryfast".into(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-movflags".into(),
            "+faststart".into(),
            "-f".into(),
            "mp4".into(),
            dest.display().to_string(),
        ]
    }
}

#[async_trait]
impl ClipWriter for FfmpegClipWriter {
    fn extension(&self) -> &'static str {
        "mp4"
    }

    async fn write_clip(&self, frames: &[Arc<Frame>], dest: &Path) -> Result<()> {
        let first = frames
            .first()
            .ok_or_else(|| Error::no_frames(dest.display().to_string()))?;
        let (width, height, format) = (first.width, first.height, first.format);

        let mut child = Command::new(&self.ffmpeg_path)
            .args(self.command_args(width, height, format, dest))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::encode(dest, format!("failed to start {}: {e}", self.ffmpeg_path)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::encode(dest, "ffmpeg has no stdin"))?;

        let mut written = 0_usize;
        for frame in frames {
            if (frame.width, frame.height, frame.format) != (width, height, format) {
                warn!(sequence = frame.sequence, "skipping frame with mismatched geometry");
                continue;
            }
            if let Err(e) = stdin.write_all(&frame.pixels).await {
                // ffmpeg exited early; its stderr says why.
                debug!(error = %e, "ffmpeg closed its input");
                break;
            }
            written += 1;
        }
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::encode(dest, e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::encode(
                dest,
                format!("ffmpeg exited with {}: {}", output.status, stderr.trim()),
            ));
        }

        debug!(frames = written, dest = %dest.display(), "clip encoded");
        Ok(())
    }
}

/// Writes the newest frame of a run as a JPEG still.
#[derive(Debug, Clone, Default)]
pub struct JpegStillWriter;

impl JpegStillWriter {
    /// Create a still writer.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ClipWriter for JpegStillWriter {
    fn extension(&self) -> &'static str {
        "jpg"
    }

    async fn write_clip(&self, frames: &[Arc<Frame>], dest: &Path) -> Result<()> {
        let frame = frames
            .last()
            .cloned()
            .ok_or_else(|| Error::no_frames(dest.display().to_string()))?;
        let dest: PathBuf = dest.to_path_buf();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let rgb = match frame.format {
                PixelFormat::Rgb24 => frame.pixels.to_vec(),
                PixelFormat::Yuv420 => yuv420_to_rgb(&frame.pixels, frame.width, frame.height)
                    .ok_or_else(|| Error::encode(&dest, "truncated YUV420 frame"))?,
            };
            let image = image::RgbImage::from_raw(frame.width, frame.height, rgb)
                .ok_or_else(|| Error::encode(&dest, "frame size does not match dimensions"))?;
            image
                .save_with_format(&dest, image::ImageFormat::Jpeg)
                .map_err(|e| Error::encode(&dest, e.to_string()))
        })
        .await
        .map_err(|e| Error::encode(PathBuf::new(), format!("still writer task failed: {e}")))?
    }
}

/// Convert planar I420 to packed RGB (BT.601, limited range).
///
/// Returns `None` if `data` is shorter than the geometry requires.
#[must_use]
pub fn yuv420_to_rgb(data: &[u8], width: u32, height: u32) -> Option<Vec<u8>> {
    let (w, h) = (width as usize, height as usize);
    let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
    if data.len() < PixelFormat::Yuv420.frame_len(width, height) {
        return None;
    }
    let (y_plane, rest) = data.split_at(w * h);
    let (u_plane, v_plane) = rest.split_at(cw * ch);

    let mut rgb = Vec::with_capacity(w * h * 3);
    for row in 0..h {
        for col in 0..w {
            let y = i32::from(y_plane[row * w + col]) - 16;
            let chroma = (row / 2) * cw + col / 2;
            let u = i32::from(u_plane[chroma]) - 128;
            let v = i32::from(v_plane[chroma]) - 128;

            let c = 298 * y + 128;
            let r = (c + 409 * v) >> 8;
            let g = (c - 100 * u - 208 * v) >> 8;
            let b = (c + 516 * u) >> 8;
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            rgb.extend([r.clamp(0, 255) as u8, g.clamp(0, 255) as u8, b.clamp(0, 255) as u8]);
        }
    }
    Some(rgb)
}

#[cfg(test)]
pub(crate) mod tests {
    use bytes::Bytes;
    use parking_lot::Mutex;
    use tokio::time::Instant;

    use super::*;
    use crate::frame::tests::test_image;
    use crate::frame::RawImage;

    /// Writes raw pixel bytes and records what it was given.
    #[derive(Debug, Default)]
    pub(crate) struct MemoryClipWriter {
        pub(crate) calls: Mutex<Vec<Vec<u64>>>,
        pub(crate) fail: bool,
    }

    impl MemoryClipWriter {
        pub(crate) fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        pub(crate) fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl ClipWriter for MemoryClipWriter {
        fn extension(&self) -> &'static str {
            "raw"
        }

        async fn write_clip(&self, frames: &[Arc<Frame>], dest: &Path) -> Result<()> {
            self.calls
                .lock()
                .push(frames.iter().map(|f| f.sequence).collect());
            let mut bytes = Vec::new();
            for frame in frames {
                bytes.extend_from_slice(&frame.pixels);
            }
            if self.fail {
                // Leave a half-written file behind, as a crashing encoder would.
                tokio::fs::write(dest, &bytes[..bytes.len() / 2]).await?;
                return Err(Error::encode(dest, "disk full"));
            }
            tokio::fs::write(dest, bytes).await?;
            Ok(())
        }
    }

    #[test]
    fn test_ffmpeg_command_args() {
        let writer = FfmpegClipWriter::new("ffmpeg", 30);
        let args = writer.command_args(1280, 720, PixelFormat::Yuv420, Path::new("/c/.a.mp4.part"));
        let joined = args.join(" ");

        assert!(joined.contains("-f rawvideo"));
        assert!(joined.contains("-pix_fmt yuv420p"));
        assert!(joined.contains("-video_size 1280x720"));
        assert!(joined.contains("-framerate 30"));
        assert!(joined.contains("-f mp4"));
        assert_eq!(args.last().map(String::as_str), Some("/c/.a.mp4.part"));
    }

    #[test]
    fn test_extensions() {
        assert_eq!(FfmpegClipWriter::new("ffmpeg", 30).extension(), "mp4");
        assert_eq!(JpegStillWriter::new().extension(), "jpg");
    }

    #[tokio::test]
    async fn test_ffmpeg_missing_binary_is_encode_error() {
        let dir = tempfile::tempdir().unwrap();
        let writer = FfmpegClipWriter::new("/nonexistent/ffmpeg", 30);
        let frame = Arc::new(Frame::new(0, Instant::now(), test_image(1)));

        let err = writer
            .write_clip(&[frame], &dir.path().join("x.mp4"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Encode { .. }));
    }

    #[tokio::test]
    async fn test_writers_refuse_empty_input() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("empty.jpg");

        let err = JpegStillWriter::new().write_clip(&[], &dest).await.unwrap_err();
        assert!(err.is_no_data());
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_jpeg_writer_writes_rgb_frame() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("still.jpg");
        let frames = vec![
            Arc::new(Frame::new(0, Instant::now(), test_image(10))),
            Arc::new(Frame::new(1, Instant::now(), test_image(200))),
        ];

        JpegStillWriter::new().write_clip(&frames, &dest).await.unwrap();

        let bytes = std::fs::read(&dest).unwrap();
        // JPEG SOI marker.
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }

    #[tokio::test]
    async fn test_jpeg_writer_converts_yuv420() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("still.jpg");
        let image = RawImage {
            width: 4,
            height: 4,
            format: PixelFormat::Yuv420,
            data: Bytes::from(vec![128_u8; PixelFormat::Yuv420.frame_len(4, 4)]),
        };
        let frame = Arc::new(Frame::new(0, Instant::now(), image));

        JpegStillWriter::new().write_clip(&[frame], &dest).await.unwrap();
        assert!(dest.metadata().unwrap().len() > 0);
    }

    #[test]
    fn test_yuv420_to_rgb_grey_and_black() {
        // Mid-grey: Y=126 with neutral chroma.
        let mut data = vec![126_u8; 4];
        data.extend([128, 128]);
        let rgb = yuv420_to_rgb(&data, 2, 2).unwrap();
        assert_eq!(rgb.len(), 12);
        assert!(rgb.iter().all(|&c| c == rgb[0]));

        // Y=16 is black in limited range.
        let mut black = vec![16_u8; 4];
        black.extend([128, 128]);
        assert!(yuv420_to_rgb(&black, 2, 2).unwrap().iter().all(|&c| c == 0));
    }

    #[test]
    fn test_yuv420_to_rgb_rejects_short_input() {
        assert!(yuv420_to_rgb(&[0; 5], 2, 2).is_none());
    }
}
