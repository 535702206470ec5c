//! Error types for dashrec.
//!
//! A single error enum covers the recorder core and its collaborators. Only
//! [`Error::CameraAcquire`] is fatal; everything else degrades the recording
//! (a skipped frame, a missed clip, a delayed eviction) without stopping
//! ingestion.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for dashrec operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Capture Errors ===
    /// The capture device could not be acquired at startup.
    #[error("failed to acquire camera '{backend}': {message}")]
    CameraAcquire {
        /// Backend that was being opened.
        backend: &'static str,
        /// Description of what went wrong.
        message: String,
    },

    /// A single frame capture failed; the next tick retries.
    #[error("transient capture error from '{camera}': {message}")]
    TransientCapture {
        /// Name of the camera backend.
        camera: &'static str,
        /// Description of what went wrong.
        message: String,
    },

    /// A frame capture did not complete within the capture timeout.
    #[error("capture from '{camera}' stalled for {timeout_ms}ms")]
    CaptureStalled {
        /// Name of the camera backend.
        camera: &'static str,
        /// The timeout that elapsed.
        timeout_ms: u64,
    },

    // === Extraction Errors ===
    /// The encode-and-write step failed.
    #[error("failed to write clip {path}: {message}")]
    Encode {
        /// Destination of the failed write.
        path: PathBuf,
        /// Description of what went wrong.
        message: String,
    },

    /// The buffer held no frames for the requested window.
    #[error("no frames available for {what}")]
    NoFrames {
        /// What was being extracted.
        what: String,
    },

    /// The extraction was abandoned because the recorder is shutting down.
    #[error("extraction cancelled during {state}")]
    ExtractionCancelled {
        /// Extractor state at cancellation.
        state: String,
    },

    /// A file name in the clip directory does not follow the naming scheme.
    #[error("invalid clip name: {0}")]
    InvalidClipName(String),

    // === Storage Errors ===
    /// A clip file could not be inspected or deleted.
    #[error("storage I/O error on {path}: {source}")]
    StorageIo {
        /// Path that failed.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to create a required directory.
    #[error("failed to create directory {path}: {source}")]
    DirectoryCreate {
        /// Path that couldn't be created.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    // === Collaborator Errors ===
    /// The sensor link or the upload server could not be reached.
    #[error("{collaborator} unavailable: {message}")]
    CollaboratorUnavailable {
        /// Which collaborator failed.
        collaborator: &'static str,
        /// Description of what went wrong.
        message: String,
    },

    // === Configuration Errors ===
    /// Failed to load configuration.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    // === I/O Errors ===
    /// File system operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Serialization Errors ===
    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A specialized Result type for dashrec operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl Error {
    /// Create a camera acquisition error.
    #[must_use]
    pub fn camera_acquire(backend: &'static str, message: impl Into<String>) -> Self {
        Self::CameraAcquire {
            backend,
            message: message.into(),
        }
    }

    /// Create a transient capture error.
    #[must_use]
    pub fn transient_capture(camera: &'static str, message: impl Into<String>) -> Self {
        Self::TransientCapture {
            camera,
            message: message.into(),
        }
    }

    /// Create an encode error for the given destination.
    #[must_use]
    pub fn encode(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Encode {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a "no data" error.
    #[must_use]
    pub fn no_frames(what: impl Into<String>) -> Self {
        Self::NoFrames { what: what.into() }
    }

    /// Create a collaborator-unavailable error.
    #[must_use]
    pub fn collaborator(collaborator: &'static str, message: impl Into<String>) -> Self {
        Self::CollaboratorUnavailable {
            collaborator,
            message: message.into(),
        }
    }

    /// Create a configuration validation error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }

    /// Whether the failure only affects the current frame tick.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TransientCapture { .. } | Self::CaptureStalled { .. }
        )
    }

    /// Whether the failure must abort startup.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::CameraAcquire { .. })
    }

    /// Whether this is the "no data" outcome of an extraction.
    #[must_use]
    pub fn is_no_data(&self) -> bool {
        matches!(self, Self::NoFrames { .. })
    }
}
