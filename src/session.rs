//! Session controller: start/stop/toggle/status over one capture loop.
//!
//! The session owns the frame slot, the detection flag and, while running,
//! the [`CaptureHandle`]. "Running" means exactly "a capture handle is held";
//! there is no separate state flag that could drift from it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::annotate::Annotator;
use crate::capture::{CaptureExit, CaptureHandle, CaptureLoop, ReadRetryPolicy};
use crate::config::CamwatchConfig;
use crate::detect::{BackendLoader, DetectorLoader, SharedDetector};
use crate::error::{StreamError, StreamResult};
use crate::frame::FrameSlot;
use crate::ingest::{CameraOpener, V4l2Opener};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    NotRunning,
}

/// Point-in-time view of the session, serialized as the `/status` body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub camera_running: bool,
    pub detection_enabled: bool,
    pub server_ip: String,
    pub frames_published: u64,
}

/// Where the service is reachable, as shown to viewers.
#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub server_ip: String,
    pub port: u16,
    pub retry: ReadRetryPolicy,
}

impl SessionOptions {
    pub fn new(server_ip: impl Into<String>, port: u16) -> Self {
        Self {
            server_ip: server_ip.into(),
            port,
            retry: ReadRetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: ReadRetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn server_address(&self) -> String {
        format!("{}:{}", self.server_ip, self.port)
    }
}

#[derive(Default)]
struct SessionInner {
    capture: Option<CaptureHandle>,
    /// Loaded on the first successful start and reused afterwards.
    detector: Option<SharedDetector>,
}

pub struct Session {
    opener: Arc<dyn CameraOpener>,
    loader: Box<dyn DetectorLoader>,
    options: SessionOptions,
    slot: Arc<FrameSlot>,
    detection_enabled: Arc<AtomicBool>,
    starting: Mutex<()>,
    inner: Mutex<SessionInner>,
}

impl Session {
    pub fn new(
        opener: Arc<dyn CameraOpener>,
        loader: impl DetectorLoader + 'static,
        options: SessionOptions,
    ) -> Self {
        Self {
            opener,
            loader: Box::new(loader),
            options,
            slot: Arc::new(FrameSlot::new()),
            detection_enabled: Arc::new(AtomicBool::new(false)),
            starting: Mutex::new(()),
            inner: Mutex::new(SessionInner::default()),
        }
    }

    /// Session backed by the configured V4L2 device and detector backend.
    pub fn from_config(cfg: &CamwatchConfig, server_ip: impl Into<String>, port: u16) -> Self {
        let retry = ReadRetryPolicy {
            max_consecutive_failures: cfg.camera.max_read_failures,
            ..ReadRetryPolicy::default()
        };
        Self::new(
            Arc::new(V4l2Opener::new(cfg.camera.clone())),
            BackendLoader::new(cfg.detector.clone()),
            SessionOptions::new(server_ip, port).with_retry(retry),
        )
    }

    /// The slot viewers read from.
    pub fn slot(&self) -> Arc<FrameSlot> {
        self.slot.clone()
    }

    /// Load the detector (first start only), then open the camera and spawn
    /// the capture loop.
    ///
    /// Starts are serialized with each other, but the state lock is only held
    /// for the running check and the final hand-off, so `status` and `stop`
    /// stay responsive while a model loads or a camera opens.
    pub fn start(&self, detection_enabled: bool) -> StreamResult<StartOutcome> {
        let _starting = self.starting.lock().unwrap_or_else(PoisonError::into_inner);
        let cached = {
            let mut inner = self.lock();
            self.reap_finished(&mut inner);
            if inner.capture.is_some() {
                return Ok(StartOutcome::AlreadyRunning);
            }
            inner.detector.clone()
        };

        let detector = match cached {
            Some(detector) => detector,
            None => {
                let detector = self.loader.load()?;
                self.lock().detector = Some(detector.clone());
                detector
            }
        };

        self.detection_enabled
            .store(detection_enabled, Ordering::SeqCst);
        let capture = CaptureLoop {
            annotator: Annotator::new(Some(detector), &self.options.server_address()),
            slot: self.slot.clone(),
            detection_enabled: self.detection_enabled.clone(),
            retry: self.options.retry,
        };
        let handle = match capture.spawn(self.opener.clone()) {
            Ok(handle) => handle,
            Err(err) => {
                self.detection_enabled.store(false, Ordering::SeqCst);
                log::warn!("camera start failed: {}", err);
                return Err(err);
            }
        };

        log::info!(
            "camera started on {} (detection {})",
            handle.source(),
            if detection_enabled { "on" } else { "off" }
        );
        self.lock().capture = Some(handle);
        Ok(StartOutcome::Started)
    }

    pub fn stop(&self) -> StopOutcome {
        let mut inner = self.lock();
        self.reap_finished(&mut inner);
        let Some(handle) = inner.capture.take() else {
            return StopOutcome::NotRunning;
        };

        let published = handle.frames_published();
        let exit = handle.stop();
        self.detection_enabled.store(false, Ordering::SeqCst);
        self.slot.clear();
        log::info!(
            "camera stopped after {} frames ({:?})",
            published,
            exit
        );
        StopOutcome::Stopped
    }

    /// Flip the detection flag. Returns the new value.
    pub fn toggle_detection(&self) -> StreamResult<bool> {
        let mut inner = self.lock();
        self.reap_finished(&mut inner);
        if inner.capture.is_none() {
            return Err(StreamError::InvalidStateTransition("camera is not running"));
        }
        let enabled = !self.detection_enabled.fetch_xor(true, Ordering::SeqCst);
        log::info!("detection {}", if enabled { "enabled" } else { "disabled" });
        Ok(enabled)
    }

    pub fn status(&self) -> SessionStatus {
        let inner = self.lock();
        let running = inner
            .capture
            .as_ref()
            .filter(|handle| !handle.is_finished());
        SessionStatus {
            camera_running: running.is_some(),
            detection_enabled: running.is_some()
                && self.detection_enabled.load(Ordering::SeqCst),
            server_ip: self.options.server_ip.clone(),
            frames_published: running.map_or(0, |handle| handle.frames_published()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.status().camera_running
    }

    // A capture loop that gave up on its device is dropped here so the session
    // reads as stopped and can be started again.
    fn reap_finished(&self, inner: &mut SessionInner) {
        let finished = inner
            .capture
            .as_ref()
            .is_some_and(|handle| handle.is_finished());
        if !finished {
            return;
        }
        if let Some(handle) = inner.capture.take() {
            let exit = handle.stop();
            self.detection_enabled.store(false, Ordering::SeqCst);
            self.slot.clear();
            if exit != CaptureExit::Cancelled {
                log::warn!("capture loop ended on its own ({:?}); session stopped", exit);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.stop() == StopOutcome::Stopped {
            log::info!("session dropped while running; camera released");
        }
    }
}
