//! Clip requests, clip records, and the on-disk naming scheme.
//!
//! Clip files live in one flat directory and are named
//! `{event_type}_{YYYYMMDD_HHMMSS}[_{n}].{ext}`. The optional `_{n}`
//! disambiguates clips whose timestamps share a second.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDateTime, Utc};
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::ClipWindow;
use crate::error::{Error, Result};

/// Timestamp layout used in clip file names.
const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Prefix and suffix of in-progress writes.
const PARTIAL_PREFIX: &str = ".";
const PARTIAL_SUFFIX: &str = ".part";

/// What triggered a clip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Hard deceleration reported by the sensor link.
    HarshBraking,
    /// Following the vehicle ahead too closely.
    FollowDistance,
    /// Over the speed limit.
    Speeding,
    /// Operator request.
    Manual,
}

impl EventType {
    /// Every event type.
    pub const ALL: [Self; 4] = [
        Self::HarshBraking,
        Self::FollowDistance,
        Self::Speeding,
        Self::Manual,
    ];

    /// The snake_case name used in file names and uploads.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HarshBraking => "harsh_braking",
            Self::FollowDistance => "follow_distance",
            Self::Speeding => "speeding",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::InvalidClipName(format!("unknown event type '{s}'")))
    }
}

/// A request to cut a clip around an event.
#[derive(Debug, Clone, PartialEq)]
pub struct ClipRequest {
    /// What happened.
    pub event_type: EventType,
    /// Seconds of footage before the event.
    pub seconds_before: u32,
    /// Seconds of footage after the event.
    pub seconds_after: u32,
    /// Monotonic event time; anchors the window.
    pub requested_at: Instant,
    /// Wall-clock event time; used for the file name.
    pub requested_wall: DateTime<Local>,
}

impl ClipRequest {
    /// A request for `event_type` happening now.
    #[must_use]
    pub fn now(event_type: EventType, window: ClipWindow) -> Self {
        Self {
            event_type,
            seconds_before: window.seconds_before,
            seconds_after: window.seconds_after,
            requested_at: Instant::now(),
            requested_wall: Local::now(),
        }
    }

    /// Pre-roll as a Duration.
    #[must_use]
    pub fn pre_roll(&self) -> Duration {
        Duration::from_secs(u64::from(self.seconds_before))
    }

    /// Post-roll as a Duration.
    #[must_use]
    pub fn post_roll(&self) -> Duration {
        Duration::from_secs(u64::from(self.seconds_after))
    }

    /// Most frames a clip for this request may hold at `frame_rate`.
    ///
    /// Never less than one, so a zero-length window still yields the frame
    /// at the event.
    #[must_use]
    pub fn max_frames(&self, frame_rate: u32) -> usize {
        (self.seconds_before.saturating_add(self.seconds_after) as usize)
            .saturating_mul(frame_rate as usize)
            .max(1)
    }
}

/// Kind of media artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    /// A multi-frame video clip.
    VideoClip,
    /// A single still frame.
    Screenshot,
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VideoClip => write!(f, "video_clip"),
            Self::Screenshot => write!(f, "screenshot"),
        }
    }
}

/// A completed clip on disk. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clip {
    /// Final location of the file.
    pub file_path: PathBuf,
    /// What triggered the clip.
    pub event_type: EventType,
    /// Video clip or screenshot.
    pub media_type: MediaType,
    /// When the write completed.
    pub created_at: DateTime<Utc>,
    /// File size in bytes.
    pub size_bytes: u64,
    /// Frames in the clip.
    pub frame_count: usize,
    /// Time between first and last frame.
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// A parsed clip file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClipName {
    /// Event type prefix.
    pub event_type: EventType,
    /// Second-resolution timestamp.
    pub stamp: NaiveDateTime,
    /// Suffix separating clips from the same second.
    pub disambiguator: Option<u32>,
    /// File extension without the dot.
    pub extension: String,
}

fn clip_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^(harsh_braking|follow_distance|speeding|manual)_(\d{8}_\d{6})(?:_(\d+))?\.([A-Za-z0-9]+)$",
        )
        .expect("clip name pattern is valid")
    })
}

impl ClipName {
    /// Build a name for a clip recorded at `at`.
    #[must_use]
    pub fn new(event_type: EventType, at: DateTime<Local>, extension: &str) -> Self {
        Self {
            event_type,
            stamp: at.naive_local(),
            disambiguator: None,
            extension: extension.to_string(),
        }
    }

    /// Same name with the given disambiguator.
    #[must_use]
    pub fn with_disambiguator(mut self, n: u32) -> Self {
        self.disambiguator = (n > 0).then_some(n);
        self
    }

    /// Name of the hidden file used while this clip is being written.
    #[must_use]
    pub fn partial_file_name(&self) -> String {
        format!("{PARTIAL_PREFIX}{self}{PARTIAL_SUFFIX}")
    }

    /// Whether `file_name` is an in-progress write.
    #[must_use]
    pub fn is_partial(file_name: &str) -> bool {
        file_name.starts_with(PARTIAL_PREFIX) && file_name.ends_with(PARTIAL_SUFFIX)
    }
}

impl fmt::Display for ClipName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.event_type, self.stamp.format(STAMP_FORMAT))?;
        if let Some(n) = self.disambiguator {
            write!(f, "_{n}")?;
        }
        write!(f, ".{}", self.extension)
    }
}

impl FromStr for ClipName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let caps = clip_name_pattern()
            .captures(s)
            .ok_or_else(|| Error::InvalidClipName(s.to_string()))?;

        let event_type = caps[1].parse()?;
        let stamp = NaiveDateTime::parse_from_str(&caps[2], STAMP_FORMAT)
            .map_err(|_| Error::InvalidClipName(s.to_string()))?;
        let disambiguator = caps
            .get(3)
            .map(|m| m.as_str().parse::<u32>())
            .transpose()
            .map_err(|_| Error::InvalidClipName(s.to_string()))?;

        Ok(Self {
            event_type,
            stamp,
            disambiguator,
            extension: caps[4].to_string(),
        })
    }
}

/// Hands out unique clip paths in the clip directory.
///
/// A name is unique if no file by that name exists and no in-flight
/// extraction holds it. Names are held by a [`Reservation`] until it drops.
#[derive(Debug, Clone)]
pub struct ClipNamer {
    dir: PathBuf,
    reserved: Arc<Mutex<HashSet<PathBuf>>>,
}

impl ClipNamer {
    /// Create a namer for `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            reserved: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// The clip directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reserve the first free name for a clip of `event_type` at `at`.
    #[must_use]
    pub fn reserve(&self, event_type: EventType, at: DateTime<Local>, extension: &str) -> Reservation {
        let base = ClipName::new(event_type, at, extension);
        let mut reserved = self.reserved.lock();
        let mut n = 0;
        loop {
            let name = base.clone().with_disambiguator(n);
            let path = self.dir.join(name.to_string());
            if !reserved.contains(&path) && !path.exists() {
                reserved.insert(path.clone());
                return Reservation {
                    name,
                    path,
                    reserved: Arc::clone(&self.reserved),
                };
            }
            n += 1;
        }
    }

    /// Names currently held.
    #[must_use]
    pub fn reserved_count(&self) -> usize {
        self.reserved.lock().len()
    }
}

/// A name held for one in-flight write.
#[derive(Debug)]
pub struct Reservation {
    name: ClipName,
    path: PathBuf,
    reserved: Arc<Mutex<HashSet<PathBuf>>>,
}

impl Reservation {
    /// The reserved name.
    #[must_use]
    pub fn name(&self) -> &ClipName {
        &self.name
    }

    /// Final path of the clip.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hidden path to write to before the final rename.
    #[must_use]
    pub fn partial_path(&self) -> PathBuf {
        self.path.with_file_name(self.name.partial_file_name())
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.reserved.lock().remove(&self.path);
    }
}
