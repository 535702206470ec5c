//! The capture loop.
//!
//! One task pulls images from the camera at the nominal frame rate, stamps
//! them and appends them to the frame buffer. It never waits on extraction.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::buffer::FrameBuffer;
use crate::camera::Camera;
use crate::context::StopHandle;
use crate::error::Error;
use crate::frame::{Frame, RawImage};

/// Counters reported when the loop exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CaptureStats {
    /// Frames appended to the buffer.
    pub captured: u64,
    /// Captures that failed.
    pub errors: u64,
    /// Captures that exceeded the capture timeout.
    pub stalls: u64,
}

/// Drives a [`Camera`] into a [`FrameBuffer`].
#[derive(Debug)]
pub struct CaptureLoop<C: Camera> {
    camera: C,
    buffer: Arc<FrameBuffer>,
    frame_interval: Duration,
    capture_timeout: Duration,
    next_sequence: u64,
}

impl<C: Camera> CaptureLoop<C> {
    /// Create a loop ticking every `frame_interval`.
    ///
    /// A capture taking longer than `capture_timeout` is abandoned and the
    /// loop moves on to the next tick.
    #[must_use]
    pub fn new(
        camera: C,
        buffer: Arc<FrameBuffer>,
        frame_interval: Duration,
        capture_timeout: Duration,
    ) -> Self {
        Self {
            camera,
            buffer,
            frame_interval,
            capture_timeout,
            next_sequence: 0,
        }
    }

    /// Run until `stop` is signalled, then release the camera.
    pub async fn run(mut self, stop: StopHandle) -> CaptureStats {
        let mut stats = CaptureStats::default();
        let mut ticker = interval(self.frame_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            camera = self.camera.name(),
            interval_ms = self.frame_interval.as_millis(),
            "Capture started"
        );

        loop {
            tokio::select! {
                biased;
                () = stop.stopped() => break,
                _ = ticker.tick() => {}
            }

            let outcome = tokio::select! {
                biased;
                () = stop.stopped() => break,
                outcome = timeout(self.capture_timeout, self.camera.capture_one_frame()) => outcome,
            };

            match outcome {
                Ok(Ok(image)) => match self.store(image) {
                    Ok(()) => stats.captured += 1,
                    Err(e) => {
                        stats.errors += 1;
                        warn!(error = %e, "dropping frame");
                    }
                },
                Ok(Err(e)) => {
                    stats.errors += 1;
                    if e.is_transient() {
                        warn!(error = %e, "frame capture failed");
                    } else {
                        error!(error = %e, "frame capture failed");
                    }
                }
                Err(_) => {
                    stats.stalls += 1;
                    let err = Error::CaptureStalled {
                        camera: self.camera.name(),
                        timeout_ms: u64::try_from(self.capture_timeout.as_millis())
                            .unwrap_or(u64::MAX),
                    };
                    warn!(error = %err, "frame capture stalled");
                }
            }
        }

        self.camera.release().await;
        info!(
            captured = stats.captured,
            errors = stats.errors,
            stalls = stats.stalls,
            "Capture stopped"
        );
        stats
    }

    fn store(&mut self, image: RawImage) -> crate::Result<()> {
        if !image.is_complete() {
            return Err(Error::transient_capture(
                self.camera.name(),
                format!(
                    "expected {} bytes for {}x{} {}, got {}",
                    image.format.frame_len(image.width, image.height),
                    image.width,
                    image.height,
                    image.format,
                    image.data.len()
                ),
            ));
        }

        let frame = Frame::new(self.next_sequence, Instant::now(), image);
        if !self.buffer.push(frame) {
            return Err(Error::transient_capture(
                self.camera.name(),
                "buffer rejected out-of-order frame",
            ));
        }
        debug!(sequence = self.next_sequence, "frame captured");
        self.next_sequence += 1;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;

    use super::*;
    use crate::buffer::FrameRange;
    use crate::frame::tests::test_image;

    #[derive(Debug)]
    pub(crate) enum Step {
        Frame(u8),
        Short,
        Fail,
        Stall,
    }

    /// Plays back a script, then signals `done` and stalls.
    #[derive(Debug)]
    pub(crate) struct ScriptedCamera {
        script: VecDeque<Step>,
        done: Option<StopHandle>,
        released: Arc<AtomicBool>,
    }

    impl ScriptedCamera {
        pub(crate) fn new(script: Vec<Step>, done: Option<StopHandle>) -> (Self, Arc<AtomicBool>) {
            let released = Arc::new(AtomicBool::new(false));
            let camera = Self {
                script: script.into(),
                done,
                released: Arc::clone(&released),
            };
            (camera, released)
        }
    }

    #[async_trait]
    impl Camera for ScriptedCamera {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn capture_one_frame(&mut self) -> crate::Result<RawImage> {
            match self.script.pop_front() {
                Some(Step::Frame(fill)) => Ok(test_image(fill)),
                Some(Step::Short) => Ok(RawImage {
                    data: Bytes::from_static(&[1, 2, 3]),
                    ..test_image(0)
                }),
                Some(Step::Fail) => Err(Error::transient_capture("scripted", "short read")),
                Some(Step::Stall) => std::future::pending().await,
                None => {
                    if let Some(done) = &self.done {
                        done.stop();
                    }
                    std::future::pending().await
                }
            }
        }

        async fn release(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    fn capture_loop(camera: ScriptedCamera, buffer: &Arc<FrameBuffer>) -> CaptureLoop<ScriptedCamera> {
        CaptureLoop::new(
            camera,
            Arc::clone(buffer),
            Duration::from_millis(100),
            Duration::from_millis(50),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_captures_into_buffer_in_order() {
        let stop = StopHandle::new();
        let (camera, released) = ScriptedCamera::new(
            vec![Step::Frame(1), Step::Frame(2), Step::Frame(3)],
            Some(stop.clone()),
        );
        let buffer = Arc::new(FrameBuffer::new(10));

        let stats = capture_loop(camera, &buffer).run(stop).await;

        assert_eq!(stats.captured, 3);
        assert_eq!(stats.errors, 0);
        let frames = buffer.snapshot(FrameRange::Last(10)).into_frames();
        let sequences: Vec<u64> = frames.iter().map(|f| f.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
        assert_eq!(frames[2].pixels[0], 3);
        assert!(frames
            .windows(2)
            .all(|w| w[0].captured_at < w[1].captured_at));
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_and_stalls_do_not_stop_capture() {
        let stop = StopHandle::new();
        let (camera, _released) = ScriptedCamera::new(
            vec![
                Step::Frame(1),
                Step::Fail,
                Step::Stall,
                Step::Short,
                Step::Frame(2),
            ],
            Some(stop.clone()),
        );
        let buffer = Arc::new(FrameBuffer::new(10));

        let stats = capture_loop(camera, &buffer).run(stop).await;

        assert_eq!(
            stats,
            CaptureStats {
                captured: 2,
                errors: 2,
                stalls: 1
            }
        );
        // Sequence numbers stay contiguous across failures.
        let sequences: Vec<u64> = buffer
            .snapshot(FrameRange::Last(10))
            .frames()
            .iter()
            .map(|f| f.sequence)
            .collect();
        assert_eq!(sequences, vec![0, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_stalled_capture() {
        let stop = StopHandle::new();
        let (camera, released) = ScriptedCamera::new(vec![Step::Stall], None);
        let buffer = Arc::new(FrameBuffer::new(10));
        let capture = CaptureLoop::new(
            camera,
            Arc::clone(&buffer),
            Duration::from_millis(100),
            Duration::from_secs(3600),
        );

        let handle = tokio::spawn(capture.run(stop.clone()));
        tokio::time::sleep(Duration::from_secs(1)).await;
        stop.stop();

        let stats = handle.await.unwrap();
        assert_eq!(stats.stalls, 0);
        assert!(buffer.is_empty());
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_follow_nominal_interval() {
        let stop = StopHandle::new();
        let (camera, _released) = ScriptedCamera::new(
            (0..5).map(Step::Frame).collect(),
            Some(stop.clone()),
        );
        let buffer = Arc::new(FrameBuffer::new(10));

        capture_loop(camera, &buffer).run(stop).await;

        let snapshot = buffer.snapshot(FrameRange::Last(10));
        assert_eq!(snapshot.len(), 5);
        assert_eq!(snapshot.span(), Duration::from_millis(400));
    }
}
