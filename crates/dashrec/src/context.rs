//! Shared recorder state.
//!
//! Everything the capture loop, the extractors and the dispatcher share lives
//! in one [`RecorderContext`], passed around as `Arc<RecorderContext>`.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::buffer::FrameBuffer;
use crate::clip::ClipNamer;
use crate::config::EventsConfig;
use crate::encoder::ClipWriter;
use crate::storage::StorageManager;
use crate::upload::{NoopUploader, Uploader};

/// A cloneable stop signal shared by every recorder task.
///
/// Tasks either poll [`StopHandle::should_stop`] or await
/// [`StopHandle::stopped`] inside a `select!`.
#[derive(Debug, Clone)]
pub struct StopHandle {
    signal: Arc<watch::Sender<bool>>,
}

impl Default for StopHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl StopHandle {
    /// Create a new, unsignalled handle.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            signal: Arc::new(tx),
        }
    }

    /// Signal every holder to stop.
    pub fn stop(&self) {
        self.signal.send_replace(true);
    }

    /// Check if the stop signal has been sent.
    #[must_use]
    pub fn should_stop(&self) -> bool {
        *self.signal.borrow()
    }

    /// Resolve once the stop signal has been sent.
    pub async fn stopped(&self) {
        let mut rx = self.signal.subscribe();
        // The sender lives in `self`, so this only returns once signalled.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

/// A GPS fix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Degrees north.
    pub latitude: f64,
    /// Degrees east.
    pub longitude: f64,
}

/// Most recent location reported by the sensor link.
#[derive(Debug, Default)]
pub struct LocationState {
    current: RwLock<Option<Location>>,
}

impl LocationState {
    /// Record a new fix.
    pub fn update(&self, location: Location) {
        *self.current.write() = Some(location);
    }

    /// The last fix, if any.
    #[must_use]
    pub fn current(&self) -> Option<Location> {
        *self.current.read()
    }
}

/// State shared across the recorder's tasks.
#[derive(Debug)]
pub struct RecorderContext {
    /// The rolling frame buffer.
    pub buffer: Arc<FrameBuffer>,
    /// The clip directory.
    pub storage: Arc<StorageManager>,
    /// Unique clip names.
    pub namer: ClipNamer,
    /// Writes video clips.
    pub clip_writer: Arc<dyn ClipWriter>,
    /// Writes screenshots.
    pub still_writer: Arc<dyn ClipWriter>,
    /// Reports clips and events.
    pub uploader: Arc<dyn Uploader>,
    /// Last known location.
    pub location: LocationState,
    /// Shutdown signal.
    pub stop: StopHandle,
    /// Nominal capture rate.
    pub frame_rate: u32,
    /// Clip windows per event type.
    pub events: EventsConfig,
    /// Whether raw sensor records are forwarded to the uploader.
    pub forward_telemetry: bool,
}

impl RecorderContext {
    /// Build a context around `buffer` and `storage`.
    ///
    /// Uses [`NoopUploader`] until [`Self::with_uploader`]
    /// replaces it.
    #[must_use]
    pub fn new(
        buffer: Arc<FrameBuffer>,
        storage: Arc<StorageManager>,
        clip_writer: Arc<dyn ClipWriter>,
        still_writer: Arc<dyn ClipWriter>,
        frame_rate: u32,
        events: EventsConfig,
    ) -> Self {
        let namer = ClipNamer::new(storage.dir());
        Self {
            buffer,
            storage,
            namer,
            clip_writer,
            still_writer,
            uploader: Arc::new(NoopUploader),
            location: LocationState::default(),
            stop: StopHandle::new(),
            frame_rate,
            events,
            forward_telemetry: false,
        }
    }

    /// Replace the uploader.
    #[must_use]
    pub fn with_uploader(mut self, uploader: Arc<dyn Uploader>, forward_telemetry: bool) -> Self {
        self.uploader = uploader;
        self.forward_telemetry = forward_telemetry;
        self
    }
}
