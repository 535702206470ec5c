//! Sensor telemetry.
//!
//! The sensor board writes one JSON object per line over a serial link.
//! Boot banners, partial lines and records missing a required field are
//! dropped here, so callers only ever see well-formed [`SensorRecord`]s.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::debug;

use crate::clip::EventType;
use crate::context::Location;
use crate::error::{Error, Result};

/// One telemetry record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorRecord {
    /// Degrees north.
    pub latitude: f64,
    /// Degrees east.
    pub longitude: f64,
    /// Hard deceleration detected.
    pub harsh_braking_detected: bool,
    /// Following distance below threshold.
    pub follow_distance_violation: bool,
    /// Over the speed limit. Older firmware omits it.
    #[serde(default)]
    pub speeding_detected: bool,
    /// Any other fields the board reports, passed through to uploads.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SensorRecord {
    /// Parse one line, returning `None` for anything that is not a complete
    /// record.
    #[must_use]
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if !line.starts_with('{') {
            return None;
        }
        match serde_json::from_str::<Self>(line) {
            Ok(record) => Some(record),
            Err(e) => {
                debug!(error = %e, "discarding malformed sensor record");
                None
            }
        }
    }

    /// The GPS fix in this record.
    #[must_use]
    pub fn location(&self) -> Location {
        Location {
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }

    /// Event types flagged by this record, in a fixed order.
    #[must_use]
    pub fn triggered_events(&self) -> Vec<EventType> {
        let mut events = Vec::new();
        if self.harsh_braking_detected {
            events.push(EventType::HarshBraking);
        }
        if self.follow_distance_violation {
            events.push(EventType::FollowDistance);
        }
        if self.speeding_detected {
            events.push(EventType::Speeding);
        }
        events
    }

    /// The record as a JSON payload for event uploads.
    #[must_use]
    pub fn to_payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Reads sensor records from a line-oriented stream.
#[derive(Debug)]
pub struct SensorReader<R> {
    reader: R,
    buf: Vec<u8>,
}

impl SensorReader<BufReader<File>> {
    /// Open a serial device node.
    ///
    /// The line discipline (baud rate etc.) must already be configured.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CollaboratorUnavailable`] if the device cannot be
    /// opened.
    pub async fn open_serial(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .await
            .map_err(|e| Error::collaborator("sensor", format!("{}: {e}", path.display())))?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: AsyncBufRead + Unpin> SensorReader<R> {
    /// Wrap a buffered reader.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::with_capacity(256),
        }
    }

    /// Next raw line with the line ending stripped, or `None` at end of
    /// stream. Invalid UTF-8 is replaced rather than rejected.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        self.buf.clear();
        let n = self.reader.read_until(b'\n', &mut self.buf).await?;
        if n == 0 {
            return Ok(None);
        }
        let line = String::from_utf8_lossy(&self.buf);
        Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
    }
}
