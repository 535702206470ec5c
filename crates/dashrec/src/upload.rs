//! Upload collaborator.
//!
//! Finished clips and sensor events are reported to a fleet server. Every
//! call is a single attempt; a failure is returned to the caller, which logs
//! it and moves on.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::clip::{Clip, MediaType};
use crate::context::Location;
use crate::error::{Error, Result};

/// Event kind used for forwarded telemetry.
pub const SENSOR_DATA_EVENT: &str = "sensor_data";

/// Clip metadata as registered with the server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClipUpload {
    /// Degrees north, 0 without a fix.
    pub latitude: f64,
    /// Degrees east, 0 without a fix.
    pub longitude: f64,
    /// Video clip or screenshot.
    pub media_type: MediaType,
    /// Path of the clip on the recorder.
    pub file_path: String,
    /// Clip length in seconds.
    pub duration_seconds: f64,
    /// What triggered the clip.
    pub event_type: String,
    /// File size in bytes.
    pub file_size_bytes: u64,
}

impl ClipUpload {
    /// Describe `clip` at `location`.
    #[must_use]
    pub fn new(clip: &Clip, location: Option<Location>) -> Self {
        let location = location.unwrap_or(Location {
            latitude: 0.0,
            longitude: 0.0,
        });
        Self {
            latitude: location.latitude,
            longitude: location.longitude,
            media_type: clip.media_type,
            file_path: clip.file_path.display().to_string(),
            duration_seconds: clip.duration.as_secs_f64(),
            event_type: clip.event_type.to_string(),
            file_size_bytes: clip.size_bytes,
        }
    }
}

/// Reports clips and events.
#[async_trait]
pub trait Uploader: Send + Sync + std::fmt::Debug {
    /// Register a finished clip.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CollaboratorUnavailable`] if the server could not be
    /// reached or refused the clip.
    async fn register_clip(&self, clip: &ClipUpload) -> Result<()>;

    /// Register an event of `kind` with an arbitrary JSON payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CollaboratorUnavailable`] if the server could not be
    /// reached or refused the event.
    async fn register_event(&self, kind: &str, payload: &Value) -> Result<()>;
}

/// Uploader used when uploads are disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUploader;

#[async_trait]
impl Uploader for NoopUploader {
    async fn register_clip(&self, _clip: &ClipUpload) -> Result<()> {
        Ok(())
    }

    async fn register_event(&self, _kind: &str, _payload: &Value) -> Result<()> {
        Ok(())
    }
}

/// Posts JSON to the fleet server's REST API.
#[derive(Debug, Clone)]
pub struct HttpUploader {
    client: reqwest::Client,
    base_url: String,
}

impl HttpUploader {
    /// Create an uploader for `base_url` with a per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CollaboratorUnavailable`] if the HTTP client cannot
    /// be built.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let builder = reqwest::Client::builder().timeout(timeout);
        // Tests talk to a loopback server; keep proxy env vars out of it.
        #[cfg(test)]
        let builder = builder.no_proxy();
        let client = builder
            .build()
            .map_err(|e| Error::collaborator("upload", e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// API path for an event kind.
    #[must_use]
    pub fn event_path(kind: &str) -> &'static str {
        match kind {
            "harsh_braking" => "/api/harsh-braking",
            "follow_distance" => "/api/follow-distance",
            SENSOR_DATA_EVENT => "/api/arduino/sensor-data",
            _ => "/api/events",
        }
    }

    async fn post<T: Serialize + Sync + ?Sized>(&self, path: &str, body: &T) -> Result<StatusCode> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::collaborator("upload", format!("POST {url}: {e}")))?;
        Ok(response.status())
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn register_clip(&self, clip: &ClipUpload) -> Result<()> {
        let status = self.post("/api/media-clips", clip).await?;
        if status != StatusCode::CREATED {
            return Err(Error::collaborator(
                "upload",
                format!("clip registration returned {status}"),
            ));
        }
        debug!(path = %clip.file_path, "clip registered");
        Ok(())
    }

    async fn register_event(&self, kind: &str, payload: &Value) -> Result<()> {
        let status = self.post(Self::event_path(kind), payload).await?;
        if !status.is_success() {
            return Err(Error::collaborator(
                "upload",
                format!("{kind} event returned {status}"),
            ));
        }
        debug!(kind, "event registered");
        Ok(())
    }
}
