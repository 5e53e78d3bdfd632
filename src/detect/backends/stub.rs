use anyhow::Result;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;
use crate::frame::Frame;

/// Stub backend for development and tests.
///
/// Always reports a single `object` box covering the middle half of the frame.
#[derive(Default)]
pub struct StubBackend {
    calls: u64,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        self.calls += 1;
        let w = frame.width() as f32;
        let h = frame.height() as f32;
        Ok(vec![Detection::new(
            [w * 0.25, h * 0.25, w * 0.75, h * 0.75],
            "object",
            0.9,
        )])
    }
}

/// Backend used when no detector is configured. Finds nothing.
#[derive(Default)]
pub struct NullBackend;

impl DetectorBackend for NullBackend {
    fn name(&self) -> &'static str {
        "none"
    }

    fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
        Ok(Vec::new())
    }
}
