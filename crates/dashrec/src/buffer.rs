//! Fixed-capacity, time-ordered ring store of captured frames.
//!
//! One producer ([`crate::capture::CaptureLoop`]) pushes; any number of
//! extractors take snapshots concurrently. Frames are stored as `Arc<Frame>`
//! so the lock is only ever held while moving pointers, never while copying
//! pixel data.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::warn;

use crate::frame::Frame;

/// Which frames a snapshot should contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameRange {
    /// Frames captured within `[start, end]`. A `None` start is unbounded.
    ///
    /// An `end` past the newest frame simply yields everything up to the
    /// tail.
    Between {
        /// Inclusive lower bound.
        start: Option<Instant>,
        /// Inclusive upper bound.
        end: Instant,
    },
    /// The most recent `n` frames.
    Last(usize),
}

/// An immutable point-in-time copy of part of the buffer.
#[derive(Debug, Clone, Default)]
pub struct FrameSnapshot {
    frames: Vec<Arc<Frame>>,
}

impl FrameSnapshot {
    /// Number of frames in the snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether the snapshot holds no frames.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Frames in ascending capture order.
    #[must_use]
    pub fn frames(&self) -> &[Arc<Frame>] {
        &self.frames
    }

    /// The oldest frame.
    #[must_use]
    pub fn first(&self) -> Option<&Arc<Frame>> {
        self.frames.first()
    }

    /// The newest frame.
    #[must_use]
    pub fn last(&self) -> Option<&Arc<Frame>> {
        self.frames.last()
    }

    /// Time between the first and last frame.
    #[must_use]
    pub fn span(&self) -> Duration {
        match (self.frames.first(), self.frames.last()) {
            (Some(first), Some(last)) => last.captured_at - first.captured_at,
            _ => Duration::ZERO,
        }
    }

    /// Drop the oldest frames so at most `max` remain.
    pub fn keep_last(&mut self, max: usize) {
        if self.frames.len() > max {
            self.frames.drain(..self.frames.len() - max);
        }
    }

    /// Consume the snapshot, returning the frames.
    #[must_use]
    pub fn into_frames(self) -> Vec<Arc<Frame>> {
        self.frames
    }
}

/// Counters kept by the buffer.
#[derive(Debug, Default)]
struct Stats {
    pushed: AtomicU64,
    evicted: AtomicU64,
    rejected: AtomicU64,
}

/// A point-in-time view of the buffer counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferStats {
    /// Frames accepted by `push`.
    pub pushed: u64,
    /// Frames evicted to make room.
    pub evicted: u64,
    /// Frames refused because they broke ordering.
    pub rejected: u64,
    /// Frames currently held.
    pub len: usize,
    /// Fixed capacity.
    pub capacity: usize,
}

/// Ring store of the most recent `capacity` frames.
///
/// Retained frames are always contiguous in `sequence` and strictly
/// ascending in `captured_at`.
#[derive(Debug)]
pub struct FrameBuffer {
    frames: Mutex<VecDeque<Arc<Frame>>>,
    capacity: usize,
    stats: Stats,
}

impl FrameBuffer {
    /// Create a buffer holding at most `capacity` frames.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "frame buffer capacity must be non-zero");
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            stats: Stats::default(),
        }
    }

    /// Create a buffer sized for `duration_seconds` of video at `frame_rate`.
    #[must_use]
    pub fn for_duration(duration_seconds: u32, frame_rate: u32) -> Self {
        Self::new(duration_seconds as usize * frame_rate as usize)
    }

    /// Fixed capacity in frames.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    /// Whether the buffer holds no frames.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    /// Append a frame, evicting the single oldest frame when full.
    ///
    /// Returns `false` (and keeps the buffer unchanged) if the frame does not
    /// directly follow the current newest frame in sequence and time.
    pub fn push(&self, frame: Frame) -> bool {
        let frame = Arc::new(frame);
        let mut frames = self.frames.lock();

        if let Some(newest) = frames.back() {
            if frame.sequence != newest.sequence + 1 || frame.captured_at <= newest.captured_at {
                drop(frames);
                warn!(
                    sequence = frame.sequence,
                    "rejecting out-of-order frame"
                );
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        }

        if frames.len() == self.capacity {
            frames.pop_front();
            self.stats.evicted.fetch_add(1, Ordering::Relaxed);
        }
        frames.push_back(frame);
        self.stats.pushed.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Copy out the frames selected by `range`.
    ///
    /// Only `Arc` pointers are cloned while the lock is held.
    #[must_use]
    pub fn snapshot(&self, range: FrameRange) -> FrameSnapshot {
        let frames = self.frames.lock();
        let selected: Vec<Arc<Frame>> = match range {
            FrameRange::Between { start, end } => {
                let lo = start.map_or(0, |start| frames.partition_point(|f| f.captured_at < start));
                let hi = frames.partition_point(|f| f.captured_at <= end);
                if lo >= hi {
                    Vec::new()
                } else {
                    frames.range(lo..hi).cloned().collect()
                }
            }
            FrameRange::Last(n) => {
                let skip = frames.len().saturating_sub(n);
                frames.range(skip..).cloned().collect()
            }
        };
        FrameSnapshot { frames: selected }
    }

    /// The most recent frame, if any.
    #[must_use]
    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.frames.lock().back().cloned()
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> BufferStats {
        let len = self.len();
        BufferStats {
            pushed: self.stats.pushed.load(Ordering::Relaxed),
            evicted: self.stats.evicted.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
            len,
            capacity: self.capacity,
        }
    }
}
