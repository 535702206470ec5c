//! Recorder lifecycle.
//!
//! [`Recorder::start`] acquires the camera, prepares the clip directory and
//! spawns the capture and sensor tasks. [`Recorder::shutdown`] stops them in
//! order: capture first, then in-flight extractions with a grace period.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncBufRead;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::buffer::{BufferStats, FrameBuffer};
use crate::camera::{Camera, CameraBackend};
use crate::capture::{CaptureLoop, CaptureStats};
use crate::clip::EventType;
use crate::config::Config;
use crate::context::{RecorderContext, StopHandle};
use crate::dispatcher::{EventDispatcher, Trigger};
use crate::encoder::{FfmpegClipWriter, JpegStillWriter};
use crate::error::Result;
use crate::sensor::SensorReader;
use crate::storage::StorageManager;
use crate::upload::{HttpUploader, NoopUploader, Uploader};

/// Runtime switches layered over the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecorderOptions {
    /// Read the sensor link if it is enabled in the configuration.
    pub sensor: bool,
    /// Upload if it is enabled in the configuration.
    pub upload: bool,
}

impl Default for RecorderOptions {
    fn default() -> Self {
        Self {
            sensor: true,
            upload: true,
        }
    }
}

/// What the recorder did before it stopped.
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    /// Capture loop counters.
    pub capture: CaptureStats,
    /// Frame buffer counters at shutdown.
    pub buffer: BufferStats,
    /// Whether every in-flight extraction finished within the grace period.
    pub drained: bool,
}

/// A running recorder.
#[derive(Debug)]
pub struct Recorder {
    ctx: Arc<RecorderContext>,
    dispatcher: Arc<EventDispatcher>,
    capture: JoinHandle<CaptureStats>,
    sensor: Option<JoinHandle<()>>,
    shutdown_grace: Duration,
}

impl Recorder {
    /// Open the configured camera and start recording.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::CameraAcquire`] if no camera could be opened,
    /// or [`crate::Error::DirectoryCreate`] if the clip directory cannot be
    /// created. Both abort startup.
    pub fn start(config: &Config, options: RecorderOptions) -> Result<Self> {
        let camera = CameraBackend::open(&config.camera)?;
        info!(camera = camera.name(), "Camera acquired");
        Self::start_with_camera(config, options, camera)
    }

    /// Start recording from an already opened camera.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::DirectoryCreate`] if the clip directory cannot
    /// be created.
    pub fn start_with_camera<C>(config: &Config, options: RecorderOptions, camera: C) -> Result<Self>
    where
        C: Camera + 'static,
    {
        let storage = Arc::new(StorageManager::new(
            config.clips_dir(),
            config.clips.max_storage_bytes,
            config.clips.eviction_target_ratio,
        ));
        storage.ensure_dir()?;
        if let Err(e) = storage.sweep_partials() {
            warn!(error = %e, "could not sweep partial clips");
        }

        let buffer = Arc::new(FrameBuffer::for_duration(
            config.buffer.duration_seconds,
            config.camera.frame_rate,
        ));
        let uploader = build_uploader(config, options);
        let ctx = Arc::new(
            RecorderContext::new(
                Arc::clone(&buffer),
                storage,
                Arc::new(FfmpegClipWriter::new(
                    config.clips.ffmpeg_path.clone(),
                    config.camera.frame_rate,
                )),
                Arc::new(JpegStillWriter::new()),
                config.camera.frame_rate,
                config.events.clone(),
            )
            .with_uploader(uploader, config.upload.forward_telemetry),
        );
        let dispatcher = Arc::new(EventDispatcher::new(
            Arc::clone(&ctx),
            config.clips.max_concurrent_extractions,
        ));

        let capture = tokio::spawn(
            CaptureLoop::new(
                camera,
                buffer,
                config.frame_interval(),
                config.capture_timeout(),
            )
            .run(ctx.stop.clone()),
        );

        let sensor = (options.sensor && config.sensor.enabled).then(|| {
            let port = config.sensor.port.clone();
            let dispatcher = Arc::clone(&dispatcher);
            let stop = ctx.stop.clone();
            tokio::spawn(async move {
                match SensorReader::open_serial(&port).await {
                    Ok(reader) => {
                        info!(port = %port.display(), "Sensor link open");
                        let records = run_sensor(reader, &dispatcher, &stop).await;
                        info!(records, "Sensor link closed");
                    }
                    // Recording continues without triggers.
                    Err(e) => warn!(error = %e, "sensor link unavailable"),
                }
            })
        });

        info!(
            clips = %ctx.storage.dir().display(),
            capacity = config.buffer_capacity(),
            "Recorder started"
        );

        Ok(Self {
            ctx,
            dispatcher,
            capture,
            sensor,
            shutdown_grace: config.shutdown_grace(),
        })
    }

    /// The shared context.
    #[must_use]
    pub fn context(&self) -> &Arc<RecorderContext> {
        &self.ctx
    }

    /// The event dispatcher.
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    /// Run until Ctrl-C or SIGTERM, then shut down.
    ///
    /// On Unix, `SIGUSR1` requests a manual clip and `SIGUSR2` a manual
    /// screenshot.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if signal handlers cannot be installed.
    pub async fn run_until_shutdown(self) -> Result<ShutdownReport> {
        self.wait_for_signals().await?;
        Ok(self.shutdown().await)
    }

    #[cfg(unix)]
    async fn wait_for_signals(&self) -> Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        let mut manual_clip = signal(SignalKind::user_defined1())?;
        let mut manual_still = signal(SignalKind::user_defined2())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = terminate.recv() => break,
                () = self.ctx.stop.stopped() => break,
                _ = manual_clip.recv() => {
                    self.dispatcher.dispatch(Trigger::clip(EventType::Manual));
                }
                _ = manual_still.recv() => {
                    self.dispatcher.dispatch(Trigger::screenshot(EventType::Manual));
                }
            }
        }
        Ok(())
    }

    #[cfg(not(unix))]
    async fn wait_for_signals(&self) -> Result<()> {
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            () = self.ctx.stop.stopped() => {}
        }
        Ok(())
    }

    /// Stop capture, then wait for in-flight extractions.
    pub async fn shutdown(self) -> ShutdownReport {
        info!("Shutting down");
        self.ctx.stop.stop();

        let capture = match self.capture.await {
            Ok(stats) => stats,
            Err(e) => {
                error!(error = %e, "capture task failed");
                CaptureStats::default()
            }
        };
        if let Some(sensor) = self.sensor {
            sensor.abort();
            let _ = sensor.await;
        }

        let drained = self.dispatcher.shutdown(self.shutdown_grace).await;
        let report = ShutdownReport {
            capture,
            buffer: self.ctx.buffer.stats(),
            drained,
        };
        info!(
            captured = report.capture.captured,
            errors = report.capture.errors,
            stalls = report.capture.stalls,
            drained = report.drained,
            "Recorder stopped"
        );
        report
    }
}

fn build_uploader(config: &Config, options: RecorderOptions) -> Arc<dyn Uploader> {
    if !(options.upload && config.upload.enabled) {
        return Arc::new(NoopUploader);
    }
    let Some(url) = config.upload.server_url.as_deref() else {
        return Arc::new(NoopUploader);
    };
    match HttpUploader::new(url, config.upload_timeout()) {
        Ok(uploader) => {
            info!(server = url, "Uploads enabled");
            Arc::new(uploader)
        }
        Err(e) => {
            warn!(error = %e, "uploads disabled");
            Arc::new(NoopUploader)
        }
    }
}

/// Feed sensor lines to `dispatcher` until the stream ends or `stop` fires.
/// Returns the number of lines read.
pub async fn run_sensor<R>(mut reader: SensorReader<R>, dispatcher: &EventDispatcher, stop: &StopHandle) -> u64
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = 0;
    loop {
        let line = tokio::select! {
            biased;
            () = stop.stopped() => break,
            line = reader.next_line() => line,
        };
        match line {
            Ok(Some(line)) => {
                lines += 1;
                dispatcher.handle_line(&line);
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "sensor read failed");
                break;
            }
        }
    }
    lines
}
