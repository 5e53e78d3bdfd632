//! V4L2 frame source.
//!
//! `V4l2Source` reads frames from a local V4L2 device node (e.g. /dev/video0)
//! and converts each buffer to an RGB [`Frame`]. Device paths starting with
//! `stub://` select a synthetic source that paces itself to the configured
//! frame rate, so the whole pipeline runs on machines without a camera.
//!
//! Real devices require the `ingest-v4l2` feature.

use anyhow::Result;
#[cfg(feature = "ingest-v4l2")]
use anyhow::{anyhow, Context};
#[cfg(feature = "ingest-v4l2")]
use ouroboros::self_referencing;
use std::time::{Duration, Instant};

use super::normalize::{normalize_to_frame, PixelFormat};
use super::FrameSource;
use crate::config::CameraSettings;
use crate::frame::Frame;

/// V4L2 frame source.
pub struct V4l2Source {
    backend: V4l2Backend,
}

enum V4l2Backend {
    Synthetic(SyntheticV4l2Source),
    #[cfg(feature = "ingest-v4l2")]
    Device(DeviceV4l2Source),
}

impl V4l2Source {
    pub fn new(settings: CameraSettings) -> Result<Self> {
        if settings.device.starts_with("stub://") {
            return Ok(Self {
                backend: V4l2Backend::Synthetic(SyntheticV4l2Source::new(settings)),
            });
        }
        Self::device(settings)
    }

    #[cfg(feature = "ingest-v4l2")]
    fn device(settings: CameraSettings) -> Result<Self> {
        Ok(Self {
            backend: V4l2Backend::Device(DeviceV4l2Source::new(settings)),
        })
    }

    #[cfg(not(feature = "ingest-v4l2"))]
    fn device(settings: CameraSettings) -> Result<Self> {
        Err(anyhow::anyhow!(
            "cannot open {}: camwatch was built without the ingest-v4l2 feature (use stub:// for a synthetic camera)",
            settings.device
        ))
    }

    /// Open the device and start streaming.
    pub fn connect(&mut self) -> Result<()> {
        match &mut self.backend {
            V4l2Backend::Synthetic(source) => source.connect(),
            #[cfg(feature = "ingest-v4l2")]
            V4l2Backend::Device(source) => source.connect(),
        }
    }

    /// Capture the next frame.
    pub fn next_frame(&mut self) -> Result<Frame> {
        match &mut self.backend {
            V4l2Backend::Synthetic(source) => source.next_frame(),
            #[cfg(feature = "ingest-v4l2")]
            V4l2Backend::Device(source) => source.next_frame(),
        }
    }

    /// Get frame statistics.
    pub fn stats(&self) -> V4l2Stats {
        match &self.backend {
            V4l2Backend::Synthetic(source) => source.stats(),
            #[cfg(feature = "ingest-v4l2")]
            V4l2Backend::Device(source) => source.stats(),
        }
    }
}

impl FrameSource for V4l2Source {
    fn describe(&self) -> String {
        self.stats().device
    }

    fn read_frame(&mut self) -> Result<Frame> {
        self.next_frame()
    }
}

/// Statistics for a V4L2 source.
#[derive(Clone, Debug)]
pub struct V4l2Stats {
    pub frames_captured: u64,
    pub device: String,
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://)
// ----------------------------------------------------------------------------

struct SyntheticV4l2Source {
    settings: CameraSettings,
    frame_count: u64,
    next_due: Option<Instant>,
}

impl SyntheticV4l2Source {
    fn new(settings: CameraSettings) -> Self {
        Self {
            settings,
            frame_count: 0,
            next_due: None,
        }
    }

    /// Synthetic sources are always "connected".
    fn connect(&mut self) -> Result<()> {
        log::info!(
            "V4l2Source: connected to {} (synthetic {}x{} @ {} fps)",
            self.settings.device,
            self.settings.width,
            self.settings.height,
            self.settings.fps
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        self.pace();
        self.frame_count += 1;
        let pixels = self.generate_synthetic_pixels();
        normalize_to_frame(
            &pixels,
            self.settings.width,
            self.settings.height,
            PixelFormat::Rgb24,
        )
    }

    /// Sleep until the next frame is due, like a camera delivering at its
    /// native rate.
    fn pace(&mut self) {
        if self.settings.fps == 0 {
            return;
        }
        let interval = Duration::from_secs(1) / self.settings.fps;
        let now = Instant::now();
        let due = self.next_due.unwrap_or(now);
        if due > now {
            std::thread::sleep(due - now);
        }
        self.next_due = Some(due.max(now) + interval);
    }

    /// Diagonal gradient that scrolls one pixel per frame.
    fn generate_synthetic_pixels(&self) -> Vec<u8> {
        let w = self.settings.width as usize;
        let h = self.settings.height as usize;
        let shift = self.frame_count as usize;
        let mut pixels = vec![0u8; w * h * 3];
        for y in 0..h {
            for x in 0..w {
                let offset = (y * w + x) * 3;
                pixels[offset] = ((x + shift) % 256) as u8;
                pixels[offset + 1] = ((y + shift / 2) % 256) as u8;
                pixels[offset + 2] = ((x + y) % 256) as u8;
            }
        }
        pixels
    }

    fn stats(&self) -> V4l2Stats {
        V4l2Stats {
            frames_captured: self.frame_count,
            device: self.settings.device.clone(),
        }
    }
}

// ----------------------------------------------------------------------------
// Production V4L2 source using libv4l
// ----------------------------------------------------------------------------

#[cfg(feature = "ingest-v4l2")]
struct DeviceV4l2Source {
    settings: CameraSettings,
    state: Option<DeviceV4l2State>,
    frame_count: u64,
    active_width: u32,
    active_height: u32,
    active_format: PixelFormat,
}

#[cfg(feature = "ingest-v4l2")]
#[self_referencing]
struct DeviceV4l2State {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

#[cfg(feature = "ingest-v4l2")]
impl DeviceV4l2Source {
    fn new(settings: CameraSettings) -> Self {
        Self {
            active_width: settings.width,
            active_height: settings.height,
            active_format: PixelFormat::Rgb24,
            settings,
            state: None,
            frame_count: 0,
        }
    }

    fn connect(&mut self) -> Result<()> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device = v4l::Device::with_path(&self.settings.device)
            .with_context(|| format!("open v4l2 device {}", self.settings.device))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = self.settings.width;
        format.height = self.settings.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2Source: failed to set format on {}: {}",
                    self.settings.device,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };

        let pixel_format = PixelFormat::from_fourcc(&format.fourcc.repr).ok_or_else(|| {
            anyhow!(
                "v4l2 device {} negotiated unsupported pixel format {}",
                self.settings.device,
                format.fourcc
            )
        })?;

        if self.settings.fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.settings.fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!(
                    "V4l2Source: failed to set fps on {}: {}",
                    self.settings.device,
                    err
                );
            }
        }

        self.active_width = format.width;
        self.active_height = format.height;
        self.active_format = pixel_format;

        let state = DeviceV4l2StateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;
        self.state = Some(state);

        log::info!(
            "V4l2Source: connected to {} ({}x{} {:?})",
            self.settings.device,
            self.active_width,
            self.active_height,
            self.active_format
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        use v4l::io::traits::CaptureStream;

        let (width, height, format) = (self.active_width, self.active_height, self.active_format);
        let state = self.state.as_mut().context("v4l2 device not connected")?;
        let frame = state.with_mut(|fields| -> Result<Frame> {
            let (buf, meta) = fields
                .stream
                .next()
                .map_err(|err| anyhow::Error::new(err).context("capture v4l2 frame"))?;
            let used = (meta.bytesused as usize).min(buf.len());
            let used = if used == 0 { buf.len() } else { used };
            normalize_to_frame(&buf[..used], width, height, format)
        })?;

        self.frame_count += 1;
        Ok(frame)
    }

    fn stats(&self) -> V4l2Stats {
        V4l2Stats {
            frames_captured: self.frame_count,
            device: self.settings.device.clone(),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
