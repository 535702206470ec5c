//! Clip extraction.
//!
//! An extraction waits for its post-roll to elapse, snapshots the frame
//! window around the event, writes it to a hidden temporary file and renames
//! it into place. Each extraction runs in its own task and only touches the
//! buffer for the duration of the snapshot.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, Utc};
use tokio::time::sleep_until;
use tracing::{debug, info, warn};

use crate::buffer::FrameRange;
use crate::clip::{Clip, ClipRequest, EventType, MediaType};
use crate::context::RecorderContext;
use crate::encoder::ClipWriter;
use crate::error::{Error, Result};
use crate::frame::Frame;

/// Lifecycle of one extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractorState {
    /// Not started.
    Idle,
    /// Waiting for post-event frames to be captured.
    WaitingPostRoll,
    /// Copying frames out of the buffer.
    Snapshotting,
    /// Writing the clip file.
    Encoding,
    /// Clip written.
    Done,
    /// Extraction failed; no clip was produced.
    Failed,
}

impl fmt::Display for ExtractorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::WaitingPostRoll => write!(f, "waiting_post_roll"),
            Self::Snapshotting => write!(f, "snapshotting"),
            Self::Encoding => write!(f, "encoding"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Runs one extraction against a shared [`RecorderContext`].
#[derive(Debug)]
pub struct ClipExtractor {
    ctx: Arc<RecorderContext>,
    state: ExtractorState,
}

impl ClipExtractor {
    /// Create an idle extractor.
    #[must_use]
    pub fn new(ctx: Arc<RecorderContext>) -> Self {
        Self {
            ctx,
            state: ExtractorState::Idle,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ExtractorState {
        self.state
    }

    fn transition(&mut self, next: ExtractorState) {
        debug!(from = %self.state, to = %next, "extractor state");
        self.state = next;
    }

    /// Produce a video clip for `request`.
    ///
    /// Waits until `requested_at + seconds_after` before snapshotting, so the
    /// post-event frames exist. The clip holds the frames captured within
    /// `[requested_at - seconds_before, requested_at + seconds_after]`,
    /// capped at `(seconds_before + seconds_after) * frame_rate`.
    ///
    /// If the recorder stops during the wait, the clip is cut from whatever
    /// has been captured by then.
    ///
    /// # Errors
    ///
    /// - [`Error::NoFrames`] if the window is empty; no file is written.
    /// - [`Error::Encode`] or [`Error::StorageIo`] if writing fails; no partial
    ///   file is left behind.
    pub async fn extract(&mut self, request: &ClipRequest) -> Result<Clip> {
        let result = self.run_extract(request).await;
        self.finish(&result).await;
        result
    }

    async fn run_extract(&mut self, request: &ClipRequest) -> Result<Clip> {
        self.transition(ExtractorState::WaitingPostRoll);
        let end = request.requested_at + request.post_roll();
        tokio::select! {
            biased;
            () = self.ctx.stop.stopped() => {
                // Capture has stopped; no more frames are coming.
                debug!(event = %request.event_type, "stop requested, cutting post-roll short");
            }
            () = sleep_until(end) => {}
        }

        self.transition(ExtractorState::Snapshotting);
        let mut snapshot = self.ctx.buffer.snapshot(FrameRange::Between {
            start: request.requested_at.checked_sub(request.pre_roll()),
            end,
        });
        snapshot.keep_last(request.max_frames(self.ctx.frame_rate));
        if snapshot.is_empty() {
            return Err(Error::no_frames(format!("{} clip", request.event_type)));
        }
        let duration = snapshot.span();
        let frames = snapshot.into_frames();

        self.transition(ExtractorState::Encoding);
        let writer = Arc::clone(&self.ctx.clip_writer);
        let clip = self
            .write(&*writer, request.event_type, MediaType::VideoClip, &frames, duration, request)
            .await?;

        info!(
            event = %request.event_type,
            frames = clip.frame_count,
            bytes = clip.size_bytes,
            path = %clip.file_path.display(),
            "Clip saved"
        );
        Ok(clip)
    }

    /// Write the most recent frame as a still image.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoFrames`] if nothing has been captured yet, or a
    /// write error as for [`Self::extract`].
    pub async fn screenshot(&mut self, event_type: EventType) -> Result<Clip> {
        let result = self.run_screenshot(event_type).await;
        self.finish(&result).await;
        result
    }

    async fn run_screenshot(&mut self, event_type: EventType) -> Result<Clip> {
        self.transition(ExtractorState::Snapshotting);
        let frame = self
            .ctx
            .buffer
            .latest()
            .ok_or_else(|| Error::no_frames(format!("{event_type} screenshot")))?;

        self.transition(ExtractorState::Encoding);
        let request = ClipRequest {
            event_type,
            seconds_before: 0,
            seconds_after: 0,
            requested_at: frame.captured_at,
            requested_wall: Local::now(),
        };
        let writer = Arc::clone(&self.ctx.still_writer);
        let clip = self
            .write(&*writer, event_type, MediaType::Screenshot, &[frame], Duration::ZERO, &request)
            .await?;

        info!(event = %event_type, path = %clip.file_path.display(), "Screenshot saved");
        Ok(clip)
    }

    async fn write(
        &self,
        writer: &dyn ClipWriter,
        event_type: EventType,
        media_type: MediaType,
        frames: &[Arc<Frame>],
        duration: Duration,
        request: &ClipRequest,
    ) -> Result<Clip> {
        let reservation = self
            .ctx
            .namer
            .reserve(event_type, request.requested_wall, writer.extension());
        let partial = reservation.partial_path();

        if let Err(e) = writer.write_clip(frames, &partial).await {
            remove_partial(&partial).await;
            return Err(e);
        }
        if let Err(e) = tokio::fs::rename(&partial, reservation.path()).await {
            remove_partial(&partial).await;
            return Err(Error::StorageIo {
                path: reservation.path().to_path_buf(),
                source: e,
            });
        }

        let size_bytes = tokio::fs::metadata(reservation.path())
            .await
            .map_err(|source| Error::StorageIo {
                path: reservation.path().to_path_buf(),
                source,
            })?
            .len();

        Ok(Clip {
            file_path: reservation.path().to_path_buf(),
            event_type,
            media_type,
            created_at: Utc::now(),
            size_bytes,
            frame_count: frames.len(),
            duration,
        })
    }

    async fn finish(&mut self, result: &Result<Clip>) {
        match result {
            Ok(_) => {
                self.transition(ExtractorState::Done);
                self.enforce_quota().await;
            }
            Err(e) if e.is_no_data() => {
                self.transition(ExtractorState::Failed);
                info!(error = %e, "nothing to extract");
            }
            Err(e) => {
                self.transition(ExtractorState::Failed);
                warn!(error = %e, "extraction failed");
            }
        }
    }

    async fn enforce_quota(&self) {
        // Directory listing and unlinks are blocking filesystem calls.
        let storage = Arc::clone(&self.ctx.storage);
        match tokio::task::spawn_blocking(move || storage.enforce_quota()).await {
            Ok(Ok(report)) if report.evicted_any() => {
                debug!(deleted = report.deleted.len(), "quota enforced after write");
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(error = %e, "quota enforcement failed"),
            Err(e) => warn!(error = %e, "quota task failed"),
        }
    }
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed partial clip"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove partial clip"),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use tokio::time::Instant;

    use super::*;
    use crate::buffer::FrameBuffer;
    use crate::config::{ClipWindow, EventsConfig};
    use crate::encoder::tests::MemoryClipWriter;
    use crate::frame::tests::test_image;
    use crate::storage::StorageManager;

    pub(crate) fn test_context(
        dir: &Path,
        buffer: Arc<FrameBuffer>,
        writer: Arc<MemoryClipWriter>,
        frame_rate: u32,
    ) -> Arc<RecorderContext> {
        let storage = Arc::new(StorageManager::new(dir, u64::MAX, 0.9));
        Arc::new(RecorderContext::new(
            buffer,
            storage,
            Arc::clone(&writer) as Arc<dyn ClipWriter>,
            writer,
            frame_rate,
            EventsConfig::default(),
        ))
    }

    /// Pushes frames at `frame_rate` until `count` frames exist.
    pub(crate) fn spawn_producer(
        buffer: Arc<FrameBuffer>,
        frame_rate: u32,
        count: u64,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let period = Duration::from_secs(1) / frame_rate;
            let start = Instant::now();
            for sequence in 0..count {
                tokio::time::sleep_until(start + period * u32::try_from(sequence).unwrap()).await;
                #[allow(clippy::cast_possible_truncation)]
                let fill = sequence as u8;
                buffer.push(Frame::new(sequence, Instant::now(), test_image(fill)));
            }
        })
    }

    fn request_at(event_type: EventType, before: u32, after: u32, at: Instant) -> ClipRequest {
        ClipRequest {
            requested_at: at,
            ..ClipRequest::now(event_type, ClipWindow::new(before, after))
        }
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ExtractorState::Idle.to_string(), "idle");
        assert_eq!(ExtractorState::WaitingPostRoll.to_string(), "waiting_post_roll");
        assert_eq!(ExtractorState::Encoding.to_string(), "encoding");
        assert_eq!(ExtractorState::Failed.to_string(), "failed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_extract_waits_for_post_roll_and_bounds_window() {
        let dir = tempfile::tempdir().unwrap();
        // 30 fps for 30 seconds fits in 1000 frames.
        let buffer = Arc::new(FrameBuffer::new(1000));
        let writer = Arc::new(MemoryClipWriter::default());
        let ctx = test_context(dir.path(), Arc::clone(&buffer), Arc::clone(&writer), 30);
        let producer = spawn_producer(Arc::clone(&buffer), 30, 900);

        tokio::time::sleep(Duration::from_secs(10)).await;
        let request = request_at(EventType::HarshBraking, 5, 5, Instant::now());

        let mut extractor = ClipExtractor::new(ctx);
        let clip = extractor.extract(&request).await.unwrap();

        assert_eq!(extractor.state(), ExtractorState::Done);
        assert!(Instant::now() >= request.requested_at + Duration::from_secs(5));
        assert!(clip.frame_count <= 300);
        assert!(clip.frame_count >= 299);
        assert!(clip.duration >= Duration::from_millis(9900));
        assert!(clip.duration <= Duration::from_secs(10));
        assert_eq!(clip.media_type, MediaType::VideoClip);
        assert_eq!(clip.event_type, EventType::HarshBraking);

        // Every frame in the clip falls inside the window.
        let sequences = writer.calls.lock()[0].clone();
        let frames = buffer.snapshot(FrameRange::Last(1000)).into_frames();
        for seq in &sequences {
            let frame = frames.iter().find(|f| f.sequence == *seq).unwrap();
            assert!(frame.captured_at + Duration::from_secs(5) >= request.requested_at);
            assert!(frame.captured_at <= request.requested_at + Duration::from_secs(5));
        }
        assert!(sequences.windows(2).all(|w| w[0] < w[1]));

        let on_disk = std::fs::metadata(&clip.file_path).unwrap();
        assert_eq!(on_disk.len(), clip.size_bytes);
        producer.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_extract_near_startup_gets_partial_clip() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = Arc::new(FrameBuffer::new(1000));
        let writer = Arc::new(MemoryClipWriter::default());
        let ctx = test_context(dir.path(), Arc::clone(&buffer), writer, 30);
        let producer = spawn_producer(Arc::clone(&buffer), 30, 900);

        // Only 2 seconds of history exist before the event.
        tokio::time::sleep(Duration::from_secs(2)).await;
        let request = request_at(EventType::Manual, 10, 3, Instant::now());

        let clip = ClipExtractor::new(ctx).extract(&request).await.unwrap();
        assert!(clip.frame_count < 13 * 30);
        assert!(clip.duration <= Duration::from_secs(5));
        producer.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_extract_empty_buffer_is_no_data() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = Arc::new(FrameBuffer::new(10));
        let writer = Arc::new(MemoryClipWriter::default());
        let ctx = test_context(dir.path(), buffer, Arc::clone(&writer), 30);

        let request = request_at(EventType::Speeding, 2, 1, Instant::now());
        let mut extractor = ClipExtractor::new(ctx);
        let err = extractor.extract(&request).await.unwrap_err();

        assert!(err.is_no_data());
        assert_eq!(extractor.state(), ExtractorState::Failed);
        assert_eq!(writer.call_count(), 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = Arc::new(FrameBuffer::new(100));
        let writer = Arc::new(MemoryClipWriter::failing());
        let ctx = test_context(dir.path(), Arc::clone(&buffer), writer, 10);
        buffer.push(Frame::new(0, Instant::now(), test_image(1)));

        let request = request_at(EventType::Manual, 1, 0, Instant::now());
        let mut extractor = ClipExtractor::new(ctx);
        let err = extractor.extract(&request).await.unwrap_err();

        assert!(matches!(err, Error::Encode { .. }));
        assert_eq!(extractor.state(), ExtractorState::Failed);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cuts_post_roll_short() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = Arc::new(FrameBuffer::new(100));
        let writer = Arc::new(MemoryClipWriter::default());
        let ctx = test_context(dir.path(), Arc::clone(&buffer), Arc::clone(&writer), 10);
        buffer.push(Frame::new(0, Instant::now(), test_image(1)));

        let started = Instant::now();
        let request = request_at(EventType::FollowDistance, 5, 60, started);
        let task = {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move { ClipExtractor::new(ctx).extract(&request).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        ctx.stop.stop();

        let clip = task.await.unwrap().unwrap();
        assert!(Instant::now() < started + Duration::from_secs(60));
        assert_eq!(clip.frame_count, 1);
        assert_eq!(writer.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_overlapping_requests_get_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = Arc::new(FrameBuffer::new(1000));
        let writer = Arc::new(MemoryClipWriter::default());
        let ctx = test_context(dir.path(), Arc::clone(&buffer), Arc::clone(&writer), 30);
        let producer = spawn_producer(Arc::clone(&buffer), 30, 900);

        tokio::time::sleep(Duration::from_secs(5)).await;
        let at = Instant::now();
        let first = request_at(EventType::HarshBraking, 3, 2, at);
        let second = request_at(EventType::HarshBraking, 3, 2, at);

        let mut extractor_a = ClipExtractor::new(Arc::clone(&ctx));
        let mut extractor_b = ClipExtractor::new(Arc::clone(&ctx));
        let (a, b) = tokio::join!(extractor_a.extract(&first), extractor_b.extract(&second),);
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_ne!(a.file_path, b.file_path);
        assert!(a.file_path.exists());
        assert!(b.file_path.exists());
        assert_eq!(ctx.namer.reserved_count(), 0);
        producer.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_screenshot_uses_latest_frame() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = Arc::new(FrameBuffer::new(10));
        let writer = Arc::new(MemoryClipWriter::default());
        let ctx = test_context(dir.path(), Arc::clone(&buffer), Arc::clone(&writer), 10);
        for seq in 0..3 {
            buffer.push(Frame::new(seq, Instant::now(), test_image(1)));
            tokio::time::advance(Duration::from_millis(100)).await;
        }

        let clip = ClipExtractor::new(ctx).screenshot(EventType::Manual).await.unwrap();

        assert_eq!(clip.media_type, MediaType::Screenshot);
        assert_eq!(clip.frame_count, 1);
        assert_eq!(clip.duration, Duration::ZERO);
        assert_eq!(writer.calls.lock()[0], vec![2]);
    }

    #[tokio::test]
    async fn test_screenshot_without_frames_is_no_data() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Arc::new(MemoryClipWriter::default());
        let ctx = test_context(dir.path(), Arc::new(FrameBuffer::new(10)), writer, 10);

        let err = ClipExtractor::new(ctx)
            .screenshot(EventType::Manual)
            .await
            .unwrap_err();
        assert!(err.is_no_data());
    }

    /// Writes half the frame data, pauses, then finishes the file.
    #[derive(Debug)]
    struct SlowWriter;

    #[async_trait::async_trait]
    impl ClipWriter for SlowWriter {
        fn extension(&self) -> &'static str {
            "raw"
        }

        async fn write_clip(&self, frames: &[Arc<Frame>], dest: &Path) -> Result<()> {
            let bytes: Vec<u8> = frames.iter().flat_map(|f| f.pixels.iter().copied()).collect();
            let (head, tail) = bytes.split_at(bytes.len() / 2);
            tokio::fs::write(dest, head).await?;
            tokio::time::sleep(Duration::from_secs(2)).await;
            let mut file = tokio::fs::OpenOptions::new().append(true).open(dest).await?;
            tokio::io::AsyncWriteExt::write_all(&mut file, tail).await?;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_during_write_keeps_in_flight_clip() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("speeding_20200101_000000.raw");
        std::fs::write(&old, vec![0_u8; 100]).unwrap();

        let buffer = Arc::new(FrameBuffer::new(10));
        buffer.push(Frame::new(0, Instant::now(), test_image(7)));
        let ctx = Arc::new(RecorderContext::new(
            buffer,
            Arc::new(StorageManager::new(dir.path(), 50, 0.8)),
            Arc::new(SlowWriter),
            Arc::new(SlowWriter),
            10,
            EventsConfig::default(),
        ));

        let task = {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move { ClipExtractor::new(ctx).screenshot(EventType::Manual).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;

        let partials: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".part"))
            .collect();
        assert_eq!(partials.len(), 1);

        // What `dashrec clips prune` runs while the recorder is writing.
        let report = ctx.storage.enforce_quota().unwrap();
        assert_eq!(report.deleted, vec![old.clone()]);
        assert!(partials[0].path().exists());

        let clip = task.await.unwrap().unwrap();
        assert!(clip.file_path.exists());
        assert_eq!(clip.size_bytes, 24);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extract_enforces_quota_after_write() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("manual_20200101_000000.raw");
        std::fs::write(&old, vec![0_u8; 100]).unwrap();

        let buffer = Arc::new(FrameBuffer::new(100));
        let writer = Arc::new(MemoryClipWriter::default());
        let storage = Arc::new(StorageManager::new(dir.path(), 110, 0.5));
        let ctx = Arc::new(RecorderContext::new(
            Arc::clone(&buffer),
            storage,
            Arc::clone(&writer) as Arc<dyn ClipWriter>,
            writer,
            10,
            EventsConfig::default(),
        ));
        buffer.push(Frame::new(0, Instant::now(), test_image(1)));

        let request = request_at(EventType::Manual, 1, 0, Instant::now());
        let clip = ClipExtractor::new(ctx).extract(&request).await.unwrap();

        assert!(clip.file_path.exists());
        assert!(!old.exists());
    }
}
