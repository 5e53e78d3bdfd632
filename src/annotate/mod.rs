//! Frame annotation: detection boxes, labels and status text.

mod font;

use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

use crate::detect::{Detection, SharedDetector};
use crate::frame::Frame;

pub const BOX_COLOR: [u8; 3] = [0, 255, 0];
pub const STATUS_COLOR: [u8; 3] = [255, 0, 0];
pub const ADDRESS_COLOR: [u8; 3] = [255, 255, 255];

const MARGIN: i32 = 10;
const STATUS_BASELINE: i32 = 30;
const STATUS_SCALE: u32 = 2;
const ADDRESS_SCALE: u32 = 1;
const LABEL_SCALE: u32 = 1;
const LABEL_GAP: i32 = 10;
const BOX_THICKNESS: u32 = 2;

pub fn status_text(detection_enabled: bool) -> &'static str {
    if detection_enabled {
        "Detection: ON"
    } else {
        "Detection: OFF"
    }
}

/// Burns detection results and session status into frames.
///
/// Owned by the capture loop. Detector errors never escape `annotate`: the
/// frame is returned with status overlays only, and the next frame tries the
/// detector again.
pub struct Annotator {
    detector: Option<SharedDetector>,
    address_line: String,
    failure_streak: u64,
}

impl Annotator {
    pub fn new(detector: Option<SharedDetector>, server_address: &str) -> Self {
        Self {
            detector,
            address_line: format!("Access: http://{}", server_address),
            failure_streak: 0,
        }
    }

    /// Consecutive frames on which the detector has failed.
    pub fn failure_streak(&self) -> u64 {
        self.failure_streak
    }

    /// Annotate a freshly captured frame. The input has not been published, so
    /// drawing into it never touches a frame a viewer can see.
    pub fn annotate(&mut self, mut frame: Frame, detection_enabled: bool) -> Frame {
        if detection_enabled {
            if let Some(detections) = self.run_detector(&frame) {
                draw_detections(frame.image_mut(), &detections);
            }
        }
        draw_status(frame.image_mut(), detection_enabled);
        draw_address(frame.image_mut(), &self.address_line);
        frame
    }

    fn run_detector(&mut self, frame: &Frame) -> Option<Vec<Detection>> {
        let detector = self.detector.as_ref()?;
        let result = match detector.lock() {
            Ok(mut guard) => guard.detect(frame),
            Err(_) => Err(anyhow::anyhow!("detector lock poisoned")),
        };
        match result {
            Ok(detections) => {
                if self.failure_streak > 0 {
                    log::info!(
                        "detector recovered after {} failed frames",
                        self.failure_streak
                    );
                    self.failure_streak = 0;
                }
                Some(detections)
            }
            Err(err) => {
                self.failure_streak += 1;
                if self.failure_streak == 1 {
                    log::warn!("detection error: {:#}", err);
                } else {
                    log::debug!(
                        "detection error ({} consecutive): {:#}",
                        self.failure_streak,
                        err
                    );
                }
                None
            }
        }
    }
}

/// Draw boxes and `label confidence` captions.
pub fn draw_detections(image: &mut RgbImage, detections: &[Detection]) {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return;
    }
    let max_x = width as f32 - 1.0;
    let max_y = height as f32 - 1.0;

    for det in detections {
        let x1 = det.left.clamp(0.0, max_x) as i32;
        let y1 = det.top.clamp(0.0, max_y) as i32;
        let x2 = det.right.clamp(0.0, max_x) as i32;
        let y2 = det.bottom.clamp(0.0, max_y) as i32;
        if x2 <= x1 || y2 <= y1 {
            continue;
        }

        for inset in 0..BOX_THICKNESS as i32 {
            let w = x2 - x1 + 1 - 2 * inset;
            let h = y2 - y1 + 1 - 2 * inset;
            if w <= 0 || h <= 0 {
                break;
            }
            let rect = Rect::at(x1 + inset, y1 + inset).of_size(w as u32, h as u32);
            draw_hollow_rect_mut(image, rect, Rgb(BOX_COLOR));
        }

        let caption = det.caption();
        let text_h = (font::GLYPH_HEIGHT * LABEL_SCALE) as i32;
        let label_y = (y1 - LABEL_GAP - text_h).max(0);
        font::draw_text(image, x1, label_y, &caption, LABEL_SCALE, BOX_COLOR);
    }
}

/// Draw `Detection: ON|OFF` in the top-left corner, baseline at y = 30.
pub fn draw_status(image: &mut RgbImage, detection_enabled: bool) {
    let text_h = (font::GLYPH_HEIGHT * STATUS_SCALE) as i32;
    font::draw_text(
        image,
        MARGIN,
        STATUS_BASELINE - text_h,
        status_text(detection_enabled),
        STATUS_SCALE,
        STATUS_COLOR,
    );
}

fn draw_address(image: &mut RgbImage, line: &str) {
    let text_h = (font::GLYPH_HEIGHT * ADDRESS_SCALE) as i32;
    let y = image.height() as i32 - MARGIN - text_h;
    font::draw_text(image, MARGIN, y.max(0), line, ADDRESS_SCALE, ADDRESS_COLOR);
}
