//! `dashrec` - An on-vehicle dashcam recorder
//!
//! This library keeps the most recent seconds of camera frames in memory and
//! cuts clips and stills around events reported by a sensor link or an
//! operator, keeping the clip directory under a disk quota.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod buffer;
pub mod camera;
pub mod capture;
pub mod cli;
pub mod clip;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod encoder;
pub mod error;
pub mod extractor;
pub mod frame;
pub mod logging;
pub mod recorder;
pub mod sensor;
pub mod storage;
pub mod upload;

pub use buffer::{FrameBuffer, FrameRange, FrameSnapshot};
pub use camera::{Camera, CameraBackend};
pub use clip::{Clip, ClipRequest, EventType, MediaType};
pub use config::Config;
pub use context::{RecorderContext, StopHandle};
pub use dispatcher::{EventDispatcher, Trigger};
pub use error::{Error, Result};
pub use extractor::ClipExtractor;
pub use frame::Frame;
pub use logging::init_logging;
pub use recorder::{Recorder, RecorderOptions};
pub use storage::{StorageManager, StorageStats};
