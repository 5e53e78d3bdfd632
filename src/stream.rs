//! Per-viewer MJPEG stream generator.
//!
//! Each `/video_feed` request runs one [`StreamGenerator`] on its own
//! connection thread. Generators only read the frame slot; a slow or dead
//! viewer ends its own stream and never holds up capture or other viewers.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use image::codecs::jpeg::JpegEncoder;

use crate::config::StreamSettings;
use crate::error::{StreamError, StreamResult};
use crate::frame::{Frame, FrameSlot};

pub const MULTIPART_BOUNDARY: &str = "frame";
pub const MULTIPART_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// Why a viewer's stream ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamEnd {
    /// Write or flush failed, including a write timeout on a slow client.
    ClientDisconnected,
    /// The session stopped (the slot was cleared) after the stream began.
    SessionStopped,
    /// No frame showed up while the slot stayed empty.
    IdleTimeout,
    /// The server is shutting down.
    Shutdown,
}

/// Encode a frame as baseline JPEG.
pub fn encode_jpeg(frame: &Frame, quality: u8) -> StreamResult<Vec<u8>> {
    if frame.width() == 0 || frame.height() == 0 {
        return Err(StreamError::EncodingFailure(format!(
            "cannot encode empty {}x{} frame",
            frame.width(),
            frame.height()
        )));
    }
    let mut out = Vec::with_capacity((frame.width() * frame.height()) as usize / 4);
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode_image(frame.image())
        .map_err(|e| StreamError::EncodingFailure(e.to_string()))?;
    Ok(out)
}

/// Write one multipart part and flush it to the client.
///
/// Any I/O failure, a write timeout included, means the viewer is gone.
pub fn write_part<W: Write>(out: &mut W, jpeg: &[u8]) -> StreamResult<()> {
    write_part_bytes(out, jpeg).map_err(StreamError::ClientDisconnected)
}

fn write_part_bytes<W: Write>(out: &mut W, jpeg: &[u8]) -> io::Result<()> {
    write!(
        out,
        "--{}\r\nContent-Type: image/jpeg\r\n\r\n",
        MULTIPART_BOUNDARY
    )?;
    out.write_all(jpeg)?;
    out.write_all(b"\r\n")?;
    out.flush()
}

pub struct StreamGenerator {
    slot: Arc<FrameSlot>,
    settings: StreamSettings,
    shutdown: Option<Arc<AtomicBool>>,
}

impl StreamGenerator {
    pub fn new(slot: Arc<FrameSlot>, settings: StreamSettings) -> Self {
        Self {
            slot,
            settings,
            shutdown: None,
        }
    }

    /// End the stream once `flag` is set.
    pub fn with_shutdown(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = Some(flag);
        self
    }

    /// Write frames to `out` until one of the [`StreamEnd`] conditions holds.
    ///
    /// Each published frame is sent at most once; frames published while this
    /// viewer was still writing are skipped in favour of the newest one.
    pub fn run<W: Write>(&self, out: &mut W) -> StreamEnd {
        let mut view = self.slot.view();
        let started_epoch = view.cursor.epoch;
        let mut last_sent: Option<u64> = None;
        let mut frames_sent: u64 = 0;
        let mut empty_since = Instant::now();

        let end = loop {
            if self.is_shutting_down() {
                break StreamEnd::Shutdown;
            }
            if view.cursor.epoch != started_epoch {
                break StreamEnd::SessionStopped;
            }

            match &view.frame {
                Some(frame) => {
                    empty_since = Instant::now();
                    if last_sent != Some(view.cursor.sequence) {
                        last_sent = Some(view.cursor.sequence);
                        match encode_jpeg(frame, self.settings.jpeg_quality) {
                            Ok(jpeg) => {
                                if let Err(err) = write_part(out, &jpeg) {
                                    log::debug!("{}", err);
                                    break StreamEnd::ClientDisconnected;
                                }
                                frames_sent += 1;
                            }
                            Err(err) => log::warn!("skipping frame {}: {}", view.cursor.sequence, err),
                        }
                    }
                }
                None => {
                    if empty_since.elapsed() >= self.settings.idle_timeout {
                        break StreamEnd::IdleTimeout;
                    }
                }
            }

            view = self
                .slot
                .wait_for_update(view.cursor, self.settings.poll_interval);
        };

        log::debug!("viewer stream ended ({:?}) after {} frames", end, frames_sent);
        end
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }
}
