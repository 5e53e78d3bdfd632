//! Camera frame sources.
//!
//! - `FrameSource`: one open camera handle. Blocking `read_frame`.
//! - `CameraOpener`: how a session acquires its handle on start.
//! - `V4l2Source`: V4L2 devices (feature: ingest-v4l2) and `stub://` synthetic
//!   cameras.
//!
//! A source is opened on the capture thread and never leaves it, so sources do
//! not need to be `Send`. Dropping the source releases the device.

mod normalize;
pub mod v4l2;

use anyhow::Result;

use crate::config::CameraSettings;
use crate::error::{StreamError, StreamResult};
use crate::frame::Frame;

pub use v4l2::{V4l2Source, V4l2Stats};

/// An open camera.
pub trait FrameSource {
    /// Human-readable name for logs.
    fn describe(&self) -> String;

    /// Block until the next raw frame is available.
    fn read_frame(&mut self) -> Result<Frame>;
}

/// Acquires a camera handle.
pub trait CameraOpener: Send + Sync {
    fn open(&self) -> StreamResult<Box<dyn FrameSource>>;
}

impl<F> CameraOpener for F
where
    F: Fn() -> StreamResult<Box<dyn FrameSource>> + Send + Sync,
{
    fn open(&self) -> StreamResult<Box<dyn FrameSource>> {
        self()
    }
}

/// Opens the V4L2 (or synthetic) device named in [`CameraSettings`].
pub struct V4l2Opener {
    settings: CameraSettings,
}

impl V4l2Opener {
    pub fn new(settings: CameraSettings) -> Self {
        Self { settings }
    }
}

impl CameraOpener for V4l2Opener {
    fn open(&self) -> StreamResult<Box<dyn FrameSource>> {
        let mut source = V4l2Source::new(self.settings.clone())
            .map_err(|e| StreamError::device(format!("{:#}", e)))?;
        source
            .connect()
            .map_err(|e| StreamError::device(format!("{:#}", e)))?;
        Ok(Box::new(source))
    }
}
