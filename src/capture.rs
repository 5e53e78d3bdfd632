//! Capture loop: camera → annotator → frame slot.
//!
//! One capture thread runs per running session. It owns the camera handle
//! from open to close; the session only keeps a [`CaptureHandle`] with the
//! cancel token and join handle.
//!
//! State machine: `Idle → Opening → Streaming → Closed`. An open failure goes
//! straight from `Opening` to `Closed`.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::annotate::Annotator;
use crate::error::{StreamError, StreamResult};
use crate::frame::FrameSlot;
use crate::ingest::{CameraOpener, FrameSource};

const PROGRESS_LOG_EVERY: u64 = 100;

// ----------------------------------------------------------------------------
// Cancellation
// ----------------------------------------------------------------------------

/// Cancellation flag that can also interrupt a sleep.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, cv) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cv.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for up to `timeout`. Returns true if cancelled meanwhile.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, cv) = &*self.inner;
        let guard = flag.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = cv
            .wait_timeout_while(guard, timeout, |cancelled| !*cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

// ----------------------------------------------------------------------------
// Policy and state
// ----------------------------------------------------------------------------

/// Backoff for camera read failures while streaming.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadRetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Consecutive failures after which the device is considered gone.
    pub max_consecutive_failures: u32,
}

impl Default for ReadRetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
            max_consecutive_failures: 100,
        }
    }
}

impl ReadRetryPolicy {
    fn next_backoff(&self, current: Duration) -> Duration {
        (current * 2).min(self.max_backoff)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CaptureState {
    #[default]
    Idle,
    Opening,
    Streaming,
    Closed,
}

impl fmt::Display for CaptureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CaptureState::Idle => "idle",
            CaptureState::Opening => "opening",
            CaptureState::Streaming => "streaming",
            CaptureState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why a capture loop returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureExit {
    /// Stopped through the cancel token.
    Cancelled,
    /// Too many consecutive read failures.
    DeviceLost,
    /// The capture thread panicked.
    Panicked,
}

#[derive(Default)]
struct CaptureShared {
    state: Mutex<CaptureState>,
    frames_published: AtomicU64,
}

impl CaptureShared {
    fn set_state(&self, next: CaptureState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        log::debug!("capture state {} -> {}", *state, next);
        *state = next;
    }

    fn state(&self) -> CaptureState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ----------------------------------------------------------------------------
// Handle
// ----------------------------------------------------------------------------

/// Session-side handle to a running capture thread.
pub struct CaptureHandle {
    cancel: CancelToken,
    shared: Arc<CaptureShared>,
    join: Option<JoinHandle<CaptureExit>>,
    source: String,
}

impl CaptureHandle {
    pub fn state(&self) -> CaptureState {
        self.shared.state()
    }

    pub fn frames_published(&self) -> u64 {
        self.shared.frames_published.load(Ordering::Relaxed)
    }

    /// Name of the camera the loop is reading from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// True once the capture thread has returned on its own or after cancel.
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, |join| join.is_finished())
    }

    /// Cancel the loop and wait for it to release the camera.
    pub fn stop(mut self) -> CaptureExit {
        self.cancel.cancel();
        self.join_thread()
    }

    fn join_thread(&mut self) -> CaptureExit {
        match self.join.take() {
            Some(join) => join.join().unwrap_or_else(|_| {
                log::error!("capture thread panicked");
                CaptureExit::Panicked
            }),
            None => CaptureExit::Cancelled,
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        if self.join.is_some() {
            self.cancel.cancel();
            self.join_thread();
        }
    }
}

// ----------------------------------------------------------------------------
// Loop
// ----------------------------------------------------------------------------

/// Everything the capture thread needs besides the camera itself.
pub struct CaptureLoop {
    pub annotator: Annotator,
    pub slot: Arc<FrameSlot>,
    pub detection_enabled: Arc<AtomicBool>,
    pub retry: ReadRetryPolicy,
}

impl CaptureLoop {
    /// Open the camera on a new capture thread and start streaming.
    ///
    /// Returns once the camera is open (or failed to open). On failure the
    /// thread has already exited and no handle exists.
    pub fn spawn(self, opener: Arc<dyn CameraOpener>) -> StreamResult<CaptureHandle> {
        let cancel = CancelToken::new();
        let shared = Arc::new(CaptureShared::default());
        let (opened_tx, opened_rx) = mpsc::channel::<StreamResult<String>>();

        let thread_cancel = cancel.clone();
        let thread_shared = shared.clone();
        let join = std::thread::Builder::new()
            .name("camwatch-capture".to_string())
            .spawn(move || {
                thread_shared.set_state(CaptureState::Opening);
                let source = match opener.open() {
                    Ok(source) => source,
                    Err(err) => {
                        thread_shared.set_state(CaptureState::Closed);
                        let _ = opened_tx.send(Err(err));
                        return CaptureExit::Cancelled;
                    }
                };
                let _ = opened_tx.send(Ok(source.describe()));
                self.run(source, &thread_cancel, &thread_shared)
            })
            .map_err(|e| StreamError::device(format!("spawn capture thread: {}", e)))?;

        match opened_rx.recv() {
            Ok(Ok(source)) => Ok(CaptureHandle {
                cancel,
                shared,
                join: Some(join),
                source,
            }),
            Ok(Err(err)) => {
                let _ = join.join();
                Err(err)
            }
            Err(_) => {
                let _ = join.join();
                Err(StreamError::device("capture thread exited while opening camera"))
            }
        }
    }

    fn run(
        mut self,
        mut source: Box<dyn FrameSource>,
        cancel: &CancelToken,
        shared: &CaptureShared,
    ) -> CaptureExit {
        shared.set_state(CaptureState::Streaming);
        let name = source.describe();
        log::info!("starting frame capture loop on {}", name);

        let mut failures: u32 = 0;
        let mut backoff = self.retry.initial_backoff;
        let exit = loop {
            if cancel.is_cancelled() {
                break CaptureExit::Cancelled;
            }

            let raw = match source.read_frame() {
                Ok(raw) => raw,
                Err(err) => {
                    failures += 1;
                    if failures >= self.retry.max_consecutive_failures {
                        log::error!(
                            "giving up on {} after {} consecutive read failures: {:#}",
                            name,
                            failures,
                            err
                        );
                        break CaptureExit::DeviceLost;
                    }
                    log::warn!(
                        "failed to read frame from {} ({}/{}), retrying in {:?}: {:#}",
                        name,
                        failures,
                        self.retry.max_consecutive_failures,
                        backoff,
                        err
                    );
                    if cancel.wait_timeout(backoff) {
                        break CaptureExit::Cancelled;
                    }
                    backoff = self.retry.next_backoff(backoff);
                    continue;
                }
            };
            if failures > 0 {
                log::info!("{} recovered after {} failed reads", name, failures);
                failures = 0;
                backoff = self.retry.initial_backoff;
            }

            // Read fresh every frame so a toggle shows up on the next frame.
            let enabled = self.detection_enabled.load(Ordering::SeqCst);
            let frame = self.annotator.annotate(raw, enabled);
            if cancel.is_cancelled() {
                break CaptureExit::Cancelled;
            }
            self.slot.publish(frame);

            let published = shared.frames_published.fetch_add(1, Ordering::Relaxed) + 1;
            if published % PROGRESS_LOG_EVERY == 0 {
                log::info!("processed {} frames", published);
            }
        };

        self.slot.clear();
        drop(source);
        shared.set_state(CaptureState::Closed);
        log::info!("capture loop on {} exited ({:?})", name, exit);
        exit
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use anyhow::anyhow;
    use std::time::Instant;

    struct ScriptedSource {
        reads: u64,
        fail_after: Option<u64>,
    }

    impl FrameSource for ScriptedSource {
        fn describe(&self) -> String {
            "scripted".to_string()
        }

        fn read_frame(&mut self) -> anyhow::Result<Frame> {
            self.reads += 1;
            std::thread::sleep(Duration::from_millis(2));
            match self.fail_after {
                Some(limit) if self.reads > limit => Err(anyhow!("device unplugged")),
                _ => Ok(Frame::filled(32, 24, [0, 0, 0])),
            }
        }
    }

    fn opener(fail_after: Option<u64>) -> Arc<dyn CameraOpener> {
        Arc::new(move || -> StreamResult<Box<dyn FrameSource>> {
            Ok(Box::new(ScriptedSource {
                reads: 0,
                fail_after,
            }))
        })
    }

    fn capture_loop(slot: Arc<FrameSlot>, retry: ReadRetryPolicy) -> CaptureLoop {
        CaptureLoop {
            annotator: Annotator::new(None, "127.0.0.1:5000"),
            slot,
            detection_enabled: Arc::new(AtomicBool::new(false)),
            retry,
        }
    }

    fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let started = Instant::now();
        while started.elapsed() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn cancel_token_interrupts_wait() {
        let token = CancelToken::new();
        let waker = token.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            waker.cancel();
        });
        let started = Instant::now();
        assert!(token.wait_timeout(Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_secs(5));
        t.join().unwrap();
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let policy = ReadRetryPolicy::default();
        assert_eq!(
            policy.next_backoff(Duration::from_millis(50)),
            Duration::from_millis(100)
        );
        assert_eq!(
            policy.next_backoff(Duration::from_millis(800)),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn publishes_until_stopped_then_clears() {
        let slot = Arc::new(FrameSlot::new());
        let handle = capture_loop(slot.clone(), ReadRetryPolicy::default())
            .spawn(opener(None))
            .expect("spawn");

        assert!(wait_until(Duration::from_secs(5), || slot.snapshot().is_some()));
        assert_eq!(handle.state(), CaptureState::Streaming);
        assert_eq!(handle.source(), "scripted");

        assert_eq!(handle.stop(), CaptureExit::Cancelled);
        assert!(slot.snapshot().is_none());
    }

    #[test]
    fn open_failure_reports_error() {
        let slot = Arc::new(FrameSlot::new());
        let failing: Arc<dyn CameraOpener> =
            Arc::new(|| -> StreamResult<Box<dyn FrameSource>> {
                Err(StreamError::device("no camera"))
            });
        let err = capture_loop(slot.clone(), ReadRetryPolicy::default())
            .spawn(failing)
            .err()
            .expect("spawn must fail");

        assert!(matches!(err, StreamError::DeviceUnavailable(_)));
        assert!(slot.snapshot().is_none());
    }

    #[test]
    fn gives_up_after_consecutive_failures() {
        let slot = Arc::new(FrameSlot::new());
        let retry = ReadRetryPolicy {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            max_consecutive_failures: 3,
        };
        let handle = capture_loop(slot.clone(), retry)
            .spawn(opener(Some(2)))
            .expect("spawn");

        assert!(wait_until(Duration::from_secs(5), || handle.is_finished()));
        assert_eq!(handle.state(), CaptureState::Closed);
        assert_eq!(handle.frames_published(), 2);
        assert!(slot.snapshot().is_none());
        assert_eq!(handle.stop(), CaptureExit::DeviceLost);
    }
}
