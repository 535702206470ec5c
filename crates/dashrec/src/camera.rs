//! Camera backends.
//!
//! A [`Camera`] yields one raw image per call. Two real backends exist and
//! one is chosen at startup by [`CameraBackend::open`]:
//!
//! - [`NativeCamera`]: the board's CSI camera, streamed as raw YUV 4:2:0 from
//!   `rpicam-vid`.
//! - [`GenericUsbCamera`]: any V4L2 device, streamed as raw RGB from `ffmpeg`.
//!
//! Both read fixed-size frames from a child process's stdout.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::config::CameraConfig;
use crate::error::{Error, Result};
use crate::frame::{PixelFormat, RawImage};

/// Which backend to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Native camera if available, otherwise generic USB.
    #[default]
    Auto,
    /// Native CSI camera only.
    Native,
    /// Generic USB camera only.
    GenericUsb,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Native => write!(f, "native"),
            Self::GenericUsb => write!(f, "generic_usb"),
        }
    }
}

/// A source of frames.
#[async_trait]
pub trait Camera: Send + std::fmt::Debug {
    /// Backend name for logging.
    fn name(&self) -> &'static str;

    /// Capture one image.
    ///
    /// Implementations must be cancel-safe: dropping the future part-way
    /// must not lose frame alignment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransientCapture`] when this capture failed but the
    /// device may still deliver later frames.
    async fn capture_one_frame(&mut self) -> Result<RawImage>;

    /// Release the device. Called exactly once when capture stops.
    async fn release(&mut self);
}

/// Reads fixed-size frames from a byte stream.
///
/// Partial reads are kept across calls, so a caller may abandon
/// [`FrameReader::next_frame`] (e.g. on timeout) and resume later without
/// losing alignment.
#[derive(Debug)]
pub struct FrameReader<R> {
    reader: R,
    pending: BytesMut,
    frame_len: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap `reader`, splitting it into frames of `frame_len` bytes.
    pub fn new(reader: R, frame_len: usize) -> Self {
        Self {
            reader,
            pending: BytesMut::with_capacity(frame_len),
            frame_len,
        }
    }

    /// Read the next complete frame. `Ok(None)` means end of stream.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    pub async fn next_frame(&mut self) -> std::io::Result<Option<Bytes>> {
        while self.pending.len() < self.frame_len {
            let missing = (self.frame_len - self.pending.len()) as u64;
            // `read_buf` is cancel-safe. `take` stops it at the frame boundary.
            let n = (&mut self.reader).take(missing).read_buf(&mut self.pending).await?;
            if n == 0 {
                return Ok(None);
            }
        }
        let frame = self.pending.split_to(self.frame_len).freeze();
        self.pending.reserve(self.frame_len);
        Ok(Some(frame))
    }

    /// Bytes buffered towards the next frame.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Shared plumbing for cameras that stream raw frames from a child process.
#[derive(Debug)]
struct ProcessStream {
    name: &'static str,
    child: Child,
    frames: FrameReader<ChildStdout>,
    width: u32,
    height: u32,
    format: PixelFormat,
}

impl ProcessStream {
    fn spawn(
        name: &'static str,
        program: &str,
        args: &[String],
        config: &CameraConfig,
        format: PixelFormat,
    ) -> Result<Self> {
        debug!(camera = name, program, ?args, "spawning camera process");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::camera_acquire(name, format!("{program}: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::camera_acquire(name, "camera process has no stdout"))?;

        Ok(Self {
            name,
            child,
            frames: FrameReader::new(stdout, format.frame_len(config.width, config.height)),
            width: config.width,
            height: config.height,
            format,
        })
    }

    async fn next_image(&mut self) -> Result<RawImage> {
        match self.frames.next_frame().await {
            Ok(Some(data)) => Ok(RawImage {
                width: self.width,
                height: self.height,
                format: self.format,
                data,
            }),
            Ok(None) => {
                let status = self.child.try_wait().ok().flatten();
                Err(Error::transient_capture(
                    self.name,
                    format!("camera stream ended (exit status {status:?})"),
                ))
            }
            Err(e) => Err(Error::transient_capture(self.name, e.to_string())),
        }
    }

    async fn release(&mut self) {
        if let Err(e) = self.child.kill().await {
            warn!(camera = self.name, error = %e, "failed to stop camera process");
        }
        info!(camera = self.name, "camera released");
    }
}

/// The board's native CSI camera.
#[derive(Debug)]
pub struct NativeCamera {
    stream: ProcessStream,
}

impl NativeCamera {
    /// Backend name.
    pub const NAME: &'static str = "native";

    /// Arguments for an endless raw YUV 4:2:0 stream on stdout.
    #[must_use]
    pub fn command_args(config: &CameraConfig) -> Vec<String> {
        vec![
            "--timeout".into(),
            "0".into(),
            "--nopreview".into(),
            "--codec".into(),
            "yuv420".into(),
            "--width".into(),
            config.width.to_string(),
            "--height".into(),
            config.height.to_string(),
            "--framerate".into(),
            config.frame_rate.to_string(),
            "--output".into(),
            "-".into(),
        ]
    }

    /// Start streaming from the native camera.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CameraAcquire`] if the camera tool cannot be started.
    pub fn open(config: &CameraConfig) -> Result<Self> {
        let stream = ProcessStream::spawn(
            Self::NAME,
            &config.native_command,
            &Self::command_args(config),
            config,
            PixelFormat::Yuv420,
        )?;
        Ok(Self { stream })
    }
}

#[async_trait]
impl Camera for NativeCamera {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn capture_one_frame(&mut self) -> Result<RawImage> {
        self.stream.next_image().await
    }

    async fn release(&mut self) {
        self.stream.release().await;
    }
}

/// A generic V4L2 USB camera.
#[derive(Debug)]
pub struct GenericUsbCamera {
    stream: ProcessStream,
}

impl GenericUsbCamera {
    /// Backend name.
    pub const NAME: &'static str = "generic_usb";

    /// Arguments for an endless raw RGB stream on stdout.
    #[must_use]
    pub fn command_args(config: &CameraConfig) -> Vec<String> {
        vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-f".into(),
            "v4l2".into(),
            "-framerate".into(),
            config.frame_rate.to_string(),
            "-video_size".into(),
            format!("{}x{}", config.width, config.height),
            "-i".into(),
            config.device.display().to_string(),
            "-pix_fmt".into(),
            PixelFormat::Rgb24.ffmpeg_name().into(),
            "-f".into(),
            "rawvideo".into(),
            "-".into(),
        ]
    }

    /// Start streaming from the USB camera.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CameraAcquire`] if the device node is missing or
    /// ffmpeg cannot be started.
    pub fn open(config: &CameraConfig) -> Result<Self> {
        if !Path::new(&config.device).exists() {
            return Err(Error::camera_acquire(
                Self::NAME,
                format!("device {} not found", config.device.display()),
            ));
        }
        let stream = ProcessStream::spawn(
            Self::NAME,
            &config.ffmpeg_path,
            &Self::command_args(config),
            config,
            PixelFormat::Rgb24,
        )?;
        Ok(Self { stream })
    }
}

#[async_trait]
impl Camera for GenericUsbCamera {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn capture_one_frame(&mut self) -> Result<RawImage> {
        self.stream.next_image().await
    }

    async fn release(&mut self) {
        self.stream.release().await;
    }
}

/// The camera chosen at startup.
#[derive(Debug)]
pub enum CameraBackend {
    /// Native CSI camera.
    Native(NativeCamera),
    /// Generic USB camera.
    GenericUsb(GenericUsbCamera),
}

impl CameraBackend {
    /// Open the configured backend. `auto` prefers the native camera and
    /// falls back to USB.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CameraAcquire`] if no usable camera could be opened.
    /// This is fatal for startup.
    pub fn open(config: &CameraConfig) -> Result<Self> {
        match config.backend {
            BackendKind::Native => NativeCamera::open(config).map(Self::Native),
            BackendKind::GenericUsb => GenericUsbCamera::open(config).map(Self::GenericUsb),
            BackendKind::Auto => match NativeCamera::open(config) {
                Ok(camera) => Ok(Self::Native(camera)),
                Err(e) => {
                    info!(error = %e, "native camera unavailable, falling back to USB");
                    GenericUsbCamera::open(config).map(Self::GenericUsb)
                }
            },
        }
    }
}

#[async_trait]
impl Camera for CameraBackend {
    fn name(&self) -> &'static str {
        match self {
            Self::Native(camera) => camera.name(),
            Self::GenericUsb(camera) => camera.name(),
        }
    }

    async fn capture_one_frame(&mut self) -> Result<RawImage> {
        match self {
            Self::Native(camera) => camera.capture_one_frame().await,
            Self::GenericUsb(camera) => camera.capture_one_frame().await,
        }
    }

    async fn release(&mut self) {
        match self {
            Self::Native(camera) => camera.release().await,
            Self::GenericUsb(camera) => camera.release().await,
        }
    }
}
