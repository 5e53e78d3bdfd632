//! Object detection.
//!
//! The pipeline only depends on [`DetectorBackend`]; which backend runs is a
//! configuration choice resolved by [`DetectorLoader`] when a session starts.

mod backend;
mod backends;
pub mod labels;
mod result;

pub use backend::{share, DetectorBackend, SharedDetector};
pub use backends::{NullBackend, StubBackend};
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use result::{non_max_suppression, Detection};

use crate::config::{DetectorKind, DetectorSettings};
use crate::error::{StreamError, StreamResult};

/// Produces the detector for a session. Called with the session lock held, at
/// most once per successful start.
pub trait DetectorLoader: Send + Sync {
    fn load(&self) -> StreamResult<SharedDetector>;
}

impl<F> DetectorLoader for F
where
    F: Fn() -> StreamResult<SharedDetector> + Send + Sync,
{
    fn load(&self) -> StreamResult<SharedDetector> {
        self()
    }
}

/// Loads the backend named by [`DetectorSettings`].
pub struct BackendLoader {
    settings: DetectorSettings,
}

impl BackendLoader {
    pub fn new(settings: DetectorSettings) -> Self {
        Self { settings }
    }
}

impl DetectorLoader for BackendLoader {
    fn load(&self) -> StreamResult<SharedDetector> {
        load_backend(&self.settings)
    }
}

/// Build and warm up a detector backend.
///
/// A missing or unloadable model is reported as `ModelUnavailable` so the
/// caller can fail `start()` instead of the process.
pub fn load_backend(settings: &DetectorSettings) -> StreamResult<SharedDetector> {
    let detector = match settings.kind {
        DetectorKind::None => share(NullBackend),
        DetectorKind::Stub => share(StubBackend::new()),
        DetectorKind::Tract => load_tract(settings)?,
    };
    {
        let mut guard = detector
            .lock()
            .map_err(|_| StreamError::model("detector lock poisoned"))?;
        guard.warm_up().map_err(|e| StreamError::model(format!("{:#}", e)))?;
        log::info!("detector backend '{}' ready", guard.name());
    }
    Ok(detector)
}

#[cfg(feature = "backend-tract")]
fn load_tract(settings: &DetectorSettings) -> StreamResult<SharedDetector> {
    if !settings.model_path.exists() {
        return Err(StreamError::model(format!(
            "model file {} not found",
            settings.model_path.display()
        )));
    }
    log::info!("loading detection model {}", settings.model_path.display());
    let backend = TractBackend::new(&settings.model_path, settings.input_size)
        .map_err(|e| StreamError::model(format!("{:#}", e)))?
        .with_thresholds(settings.confidence_threshold, settings.iou_threshold)
        .with_max_detections(settings.max_detections);
    Ok(share(backend))
}

#[cfg(not(feature = "backend-tract"))]
fn load_tract(_settings: &DetectorSettings) -> StreamResult<SharedDetector> {
    Err(StreamError::model(
        "tract backend requested but camwatch was built without the backend-tract feature",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;

    fn settings(kind: DetectorKind) -> DetectorSettings {
        DetectorSettings {
            kind,
            ..DetectorSettings::default()
        }
    }

    #[test]
    fn loads_stub_backend() {
        let detector = load_backend(&settings(DetectorKind::Stub)).unwrap();
        let mut guard = detector.lock().unwrap();
        assert_eq!(guard.name(), "stub");
        let dets = guard.detect(&Frame::filled(10, 10, [0, 0, 0])).unwrap();
        assert_eq!(dets.len(), 1);
    }

    #[test]
    fn loads_null_backend() {
        let detector = load_backend(&settings(DetectorKind::None)).unwrap();
        assert_eq!(detector.lock().unwrap().name(), "none");
    }

    #[test]
    fn missing_model_is_model_unavailable() {
        let mut cfg = settings(DetectorKind::Tract);
        cfg.model_path = "/nonexistent/yolov5s.onnx".into();
        let err = load_backend(&cfg).err().expect("load must fail");
        assert!(matches!(err, StreamError::ModelUnavailable(_)));
    }
}
