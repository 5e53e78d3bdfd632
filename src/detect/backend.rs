use std::sync::{Arc, Mutex};

use anyhow::Result;

use crate::detect::result::Detection;
use crate::frame::Frame;

/// Detector backend trait.
///
/// Backends are treated as stateless per call by the pipeline: one frame in,
/// a list of labelled boxes out. Calls may be slow and may fail; failures are
/// absorbed by the annotator and never stop the stream.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame. Box coordinates are in the frame's pixel space.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;

    /// Optional warm-up hook, run once after loading.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Backend shared between the session (which loads it once) and the capture
/// loop of whichever session run is active.
///
/// Wrapped in `Mutex` because `DetectorBackend::detect` takes `&mut self`.
pub type SharedDetector = Arc<Mutex<dyn DetectorBackend>>;

pub fn share<B: DetectorBackend + 'static>(backend: B) -> SharedDetector {
    Arc::new(Mutex::new(backend))
}
