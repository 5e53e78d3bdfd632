use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:5000";
const DEFAULT_DEVICE: &str = "/dev/video0";
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_FPS: u32 = 30;
const DEFAULT_MODEL_PATH: &str = "yolov5s.onnx";
const DEFAULT_MODEL_INPUT: u32 = 640;
const DEFAULT_CONFIDENCE: f32 = 0.45;
const DEFAULT_IOU: f32 = 0.45;
const DEFAULT_MAX_DETECTIONS: usize = 50;
const DEFAULT_JPEG_QUALITY: u8 = 80;
const DEFAULT_POLL_MS: u64 = 250;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 5;
const DEFAULT_MAX_READ_FAILURES: u32 = 100;

#[derive(Debug, Deserialize, Default)]
struct CamwatchConfigFile {
    addr: Option<String>,
    advertise_ip: Option<String>,
    camera: Option<CameraConfigFile>,
    detector: Option<DetectorConfigFile>,
    stream: Option<StreamConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    device: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
    max_read_failures: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    input_size: Option<u32>,
    confidence_threshold: Option<f32>,
    iou_threshold: Option<f32>,
    max_detections: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    jpeg_quality: Option<u8>,
    poll_interval_ms: Option<u64>,
    idle_timeout_secs: Option<u64>,
    write_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct CamwatchConfig {
    pub addr: String,
    /// Address shown in overlays and `/status`; discovered when unset.
    pub advertise_ip: Option<String>,
    pub camera: CameraSettings,
    pub detector: DetectorSettings,
    pub stream: StreamSettings,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    /// Device path, or `stub://name` for the synthetic source.
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Consecutive read failures tolerated before the capture loop gives up.
    pub max_read_failures: u32,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            device: DEFAULT_DEVICE.to_string(),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            fps: DEFAULT_FPS,
            max_read_failures: DEFAULT_MAX_READ_FAILURES,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectorKind {
    None,
    Stub,
    Tract,
}

impl DetectorKind {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "none" | "off" => Ok(DetectorKind::None),
            "stub" => Ok(DetectorKind::Stub),
            "tract" | "onnx" => Ok(DetectorKind::Tract),
            other => Err(anyhow!(
                "unknown detector backend '{}'; expected none, stub or tract",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub kind: DetectorKind,
    pub model_path: PathBuf,
    pub input_size: u32,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            kind: DetectorKind::Tract,
            model_path: PathBuf::from(DEFAULT_MODEL_PATH),
            input_size: DEFAULT_MODEL_INPUT,
            confidence_threshold: DEFAULT_CONFIDENCE,
            iou_threshold: DEFAULT_IOU,
            max_detections: DEFAULT_MAX_DETECTIONS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub jpeg_quality: u8,
    /// Upper bound on a single wait for a new frame.
    pub poll_interval: Duration,
    /// How long a viewer waits for a first frame before the stream ends.
    pub idle_timeout: Duration,
    /// Socket write timeout; a viewer slower than this is dropped.
    pub write_timeout: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            poll_interval: Duration::from_millis(DEFAULT_POLL_MS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            write_timeout: Duration::from_secs(DEFAULT_WRITE_TIMEOUT_SECS),
        }
    }
}

impl Default for CamwatchConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_BIND_ADDR.to_string(),
            advertise_ip: None,
            camera: CameraSettings::default(),
            detector: DetectorSettings::default(),
            stream: StreamSettings::default(),
        }
    }
}

impl CamwatchConfig {
    /// Load from `CAMWATCH_CONFIG` (if set), then apply env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CAMWATCH_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Load from an explicit file (if any), then apply env overrides.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CamwatchConfigFile) -> Result<Self> {
        let defaults = CamwatchConfig::default();
        let camera = file.camera.unwrap_or_default();
        let detector = file.detector.unwrap_or_default();
        let stream = file.stream.unwrap_or_default();

        let kind = match detector.backend.as_deref() {
            Some(name) => DetectorKind::parse(name)?,
            None => defaults.detector.kind,
        };

        Ok(Self {
            addr: file.addr.unwrap_or(defaults.addr),
            advertise_ip: file.advertise_ip,
            camera: CameraSettings {
                device: camera.device.unwrap_or(defaults.camera.device),
                width: camera.width.unwrap_or(defaults.camera.width),
                height: camera.height.unwrap_or(defaults.camera.height),
                fps: camera.fps.unwrap_or(defaults.camera.fps),
                max_read_failures: camera
                    .max_read_failures
                    .unwrap_or(defaults.camera.max_read_failures),
            },
            detector: DetectorSettings {
                kind,
                model_path: detector.model_path.unwrap_or(defaults.detector.model_path),
                input_size: detector.input_size.unwrap_or(defaults.detector.input_size),
                confidence_threshold: detector
                    .confidence_threshold
                    .unwrap_or(defaults.detector.confidence_threshold),
                iou_threshold: detector
                    .iou_threshold
                    .unwrap_or(defaults.detector.iou_threshold),
                max_detections: detector
                    .max_detections
                    .unwrap_or(defaults.detector.max_detections),
            },
            stream: StreamSettings {
                jpeg_quality: stream.jpeg_quality.unwrap_or(defaults.stream.jpeg_quality),
                poll_interval: stream
                    .poll_interval_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.stream.poll_interval),
                idle_timeout: stream
                    .idle_timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.stream.idle_timeout),
                write_timeout: stream
                    .write_timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.stream.write_timeout),
            },
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("CAMWATCH_ADDR") {
            if !addr.trim().is_empty() {
                self.addr = addr;
            }
        }
        if let Ok(ip) = std::env::var("CAMWATCH_ADVERTISE_IP") {
            if !ip.trim().is_empty() {
                self.advertise_ip = Some(ip.trim().to_string());
            }
        }
        if let Ok(device) = std::env::var("CAMWATCH_DEVICE") {
            if !device.trim().is_empty() {
                self.camera.device = device;
            }
        }
        if let Ok(backend) = std::env::var("CAMWATCH_DETECTOR") {
            if !backend.trim().is_empty() {
                self.detector.kind = DetectorKind::parse(&backend)?;
            }
        }
        if let Ok(path) = std::env::var("CAMWATCH_MODEL_PATH") {
            if !path.trim().is_empty() {
                self.detector.model_path = PathBuf::from(path);
            }
        }
        if let Ok(quality) = std::env::var("CAMWATCH_JPEG_QUALITY") {
            self.stream.jpeg_quality = quality
                .trim()
                .parse()
                .map_err(|_| anyhow!("CAMWATCH_JPEG_QUALITY must be an integer between 1 and 100"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(anyhow!("camera width and height must be greater than zero"));
        }
        if !(1..=100).contains(&self.stream.jpeg_quality) {
            return Err(anyhow!("jpeg_quality must be between 1 and 100"));
        }
        for (name, value) in [
            ("confidence_threshold", self.detector.confidence_threshold),
            ("iou_threshold", self.detector.iou_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("{} must be between 0 and 1", name));
            }
        }
        if self.detector.max_detections == 0 {
            return Err(anyhow!("max_detections must be greater than zero"));
        }
        if self.camera.max_read_failures == 0 {
            return Err(anyhow!("max_read_failures must be greater than zero"));
        }
        if self.stream.poll_interval.is_zero() {
            return Err(anyhow!("poll_interval_ms must be greater than zero"));
        }
        if self.stream.write_timeout.is_zero() {
            return Err(anyhow!("write_timeout_secs must be greater than zero"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<CamwatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_a_typical_webcam() {
        let cfg = CamwatchConfig::default();
        assert_eq!(cfg.addr, "0.0.0.0:5000");
        assert_eq!(cfg.detector.confidence_threshold, 0.45);
        assert_eq!(cfg.detector.iou_threshold, 0.45);
        assert_eq!(cfg.detector.max_detections, 50);
        assert_eq!(cfg.camera.device, "/dev/video0");
        assert_eq!(cfg.detector.kind, DetectorKind::Tract);
    }

    #[test]
    fn detector_kind_parses_aliases() {
        assert_eq!(DetectorKind::parse("ONNX").unwrap(), DetectorKind::Tract);
        assert_eq!(DetectorKind::parse(" off ").unwrap(), DetectorKind::None);
        assert!(DetectorKind::parse("gpu").is_err());
    }

    #[test]
    fn validate_rejects_bad_quality() {
        let mut cfg = CamwatchConfig::default();
        cfg.stream.jpeg_quality = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_write_timeout() {
        let mut cfg = CamwatchConfig::default();
        cfg.stream.write_timeout = Duration::ZERO;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("write_timeout_secs"));
    }
}
