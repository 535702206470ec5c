//! Event dispatch.
//!
//! Turns triggers into clip extractions. Each trigger becomes exactly one
//! task; the caller never waits for it. A semaphore bounds how many
//! extractions run at once, and every task is tracked so shutdown can wait
//! for them with a deadline.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::clip::{ClipRequest, EventType};
use crate::config::ClipWindow;
use crate::context::RecorderContext;
use crate::error::Error;
use crate::extractor::{ClipExtractor, ExtractorState};
use crate::sensor::SensorRecord;
use crate::upload::{ClipUpload, SENSOR_DATA_EVENT};

/// What a trigger asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    /// A video clip around the trigger instant.
    Clip(EventType),
    /// A still of the most recent frame.
    Screenshot(EventType),
}

impl TriggerKind {
    /// The event type being recorded.
    #[must_use]
    pub fn event_type(self) -> EventType {
        match self {
            Self::Clip(event_type) | Self::Screenshot(event_type) => event_type,
        }
    }
}

/// An inbound trigger with an optional sensor payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Trigger {
    /// What to record.
    pub kind: TriggerKind,
    /// Sensor record that caused the trigger, reported as an event once the
    /// clip is saved.
    pub payload: Option<Value>,
}

impl Trigger {
    /// A clip trigger without payload.
    #[must_use]
    pub fn clip(event_type: EventType) -> Self {
        Self {
            kind: TriggerKind::Clip(event_type),
            payload: None,
        }
    }

    /// A screenshot trigger without payload.
    #[must_use]
    pub fn screenshot(event_type: EventType) -> Self {
        Self {
            kind: TriggerKind::Screenshot(event_type),
            payload: None,
        }
    }

    /// Attach a payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Starts one extraction task per trigger.
#[derive(Debug)]
pub struct EventDispatcher {
    ctx: Arc<RecorderContext>,
    permits: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
}

impl EventDispatcher {
    /// Create a dispatcher running at most `max_concurrent` extractions at
    /// once. Further triggers queue for a slot.
    #[must_use]
    pub fn new(ctx: Arc<RecorderContext>, max_concurrent: usize) -> Self {
        Self {
            ctx,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// The shared context.
    #[must_use]
    pub fn context(&self) -> &Arc<RecorderContext> {
        &self.ctx
    }

    /// Tasks not yet finished.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.len()
    }

    /// Start handling `trigger` and return its request immediately.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn dispatch(&self, trigger: Trigger) -> ClipRequest {
        let event_type = trigger.kind.event_type();
        let window = match trigger.kind {
            TriggerKind::Clip(_) => self.ctx.events.window(event_type),
            TriggerKind::Screenshot(_) => ClipWindow::new(0, 0),
        };
        let request = ClipRequest::now(event_type, window);
        info!(
            event = %event_type,
            before = request.seconds_before,
            after = request.seconds_after,
            "Trigger received"
        );

        let ctx = Arc::clone(&self.ctx);
        let permits = Arc::clone(&self.permits);
        let task_request = request.clone();
        self.spawn_tracked(run_trigger(ctx, permits, trigger, task_request));
        request
    }

    /// Reap finished tasks, then track `task`.
    fn spawn_tracked<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    /// Update location, forward telemetry, and dispatch one clip per event
    /// flagged in `record`.
    pub fn handle_record(&self, record: &SensorRecord) -> Vec<ClipRequest> {
        self.ctx.location.update(record.location());

        let payload = record.to_payload();
        if self.ctx.forward_telemetry {
            let ctx = Arc::clone(&self.ctx);
            let payload = payload.clone();
            self.spawn_tracked(async move {
                if let Err(e) = ctx.uploader.register_event(SENSOR_DATA_EVENT, &payload).await {
                    debug!(error = %e, "telemetry not forwarded");
                }
            });
        }

        record
            .triggered_events()
            .into_iter()
            .map(|event_type| self.dispatch(Trigger::clip(event_type).with_payload(payload.clone())))
            .collect()
    }

    /// Parse and handle one line from the sensor link. Returns the number of
    /// clips requested; a malformed line requests none.
    pub fn handle_line(&self, line: &str) -> usize {
        SensorRecord::parse_line(line).map_or(0, |record| self.handle_record(&record).len())
    }

    /// Wait up to `grace` for every task to finish, then abandon the rest.
    ///
    /// Call after signalling stop. Returns `true` if nothing was abandoned.
    /// Abandoned writes leave only hidden partial files, which the next
    /// startup removes.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        if tasks.is_empty() {
            return true;
        }

        info!(pending = tasks.len(), "Waiting for in-flight extractions");
        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await
        .is_ok();

        if !drained {
            warn!(abandoned = tasks.len(), "Shutdown grace expired, abandoning extractions");
            tasks.shutdown().await;
        }
        drained
    }
}

async fn run_trigger(
    ctx: Arc<RecorderContext>,
    permits: Arc<Semaphore>,
    trigger: Trigger,
    request: ClipRequest,
) {
    let _permit = tokio::select! {
        biased;
        () = ctx.stop.stopped() => {
            let err = Error::ExtractionCancelled {
                state: ExtractorState::Idle.to_string(),
            };
            warn!(event = %request.event_type, error = %err, "trigger dropped");
            return;
        }
        permit = Arc::clone(&permits).acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return,
        },
    };

    let mut extractor = ClipExtractor::new(Arc::clone(&ctx));
    let result = match trigger.kind {
        TriggerKind::Clip(_) => extractor.extract(&request).await,
        TriggerKind::Screenshot(event_type) => extractor.screenshot(event_type).await,
    };
    // Failures were logged by the extractor.
    let Ok(clip) = result else {
        return;
    };

    let upload = ClipUpload::new(&clip, ctx.location.current());
    if let Err(e) = ctx.uploader.register_clip(&upload).await {
        warn!(path = %clip.file_path.display(), error = %e, "clip not registered");
    }
    if let Some(payload) = trigger.payload {
        let kind = request.event_type.as_str();
        if let Err(e) = ctx.uploader.register_event(kind, &payload).await {
            warn!(kind, error = %e, "event not registered");
        }
    }
}
