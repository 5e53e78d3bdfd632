//! camwatch: live camera streaming with object-detection overlays
//!
//! One local camera is captured on a background thread, optionally run
//! through an object detector, annotated, and fanned out as MJPEG to any
//! number of browsers on the LAN. A small JSON control surface starts and
//! stops the camera and toggles detection at runtime.
//!
//! # Data flow
//!
//! ```text
//! camera -> capture loop -> annotator (-> detector) -> frame slot
//!                                                        |
//!                              +-------------+-----------+
//!                              v             v
//!                         viewer 1 ...   viewer N   (one stream generator each)
//! ```
//!
//! The frame slot holds exactly one frame. Viewers never queue; each one
//! sends the newest frame it has not sent yet, at its own pace.
//!
//! # Module Structure
//!
//! - `frame`: Frame and the single-slot handoff (FrameSlot)
//! - `ingest`: Camera sources (V4L2, synthetic `stub://`)
//! - `detect`: Detector backends and Detection results
//! - `annotate`: Boxes, labels and status text burned into frames
//! - `capture`: The capture thread and its cancellation
//! - `stream`: Per-viewer multipart MJPEG writer
//! - `session`: start/stop/toggle/status
//! - `api`: HTTP server and control page
//! - `config`, `net`, `error`: configuration, LAN address, error taxonomy

pub mod annotate;
pub mod api;
pub mod capture;
pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod net;
pub mod session;
pub mod stream;

pub use annotate::Annotator;
pub use api::{ApiConfig, ApiHandle, ApiServer};
pub use capture::{CancelToken, CaptureExit, CaptureHandle, CaptureLoop, CaptureState, ReadRetryPolicy};
pub use config::{CameraSettings, CamwatchConfig, DetectorKind, DetectorSettings, StreamSettings};
pub use detect::{Detection, DetectorBackend, DetectorLoader, SharedDetector};
pub use error::{StreamError, StreamResult};
pub use frame::{Frame, FrameSlot, SlotCursor, SlotView};
pub use ingest::{CameraOpener, FrameSource, V4l2Opener, V4l2Source};
pub use session::{Session, SessionOptions, SessionStatus, StartOutcome, StopOutcome};
pub use stream::{StreamEnd, StreamGenerator};
