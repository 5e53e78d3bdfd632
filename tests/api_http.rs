use anyhow::Result;
use serde_json::Value;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use camwatch::api::{ApiConfig, ApiHandle, ApiServer};
use camwatch::detect::{share, NullBackend};
use camwatch::{
    CameraSettings, CamwatchConfig, DetectorKind, DetectorSettings, Frame, FrameSource, Session,
    SessionOptions, SharedDetector, StreamResult, StreamSettings,
};

const PART_HEADER: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";

fn test_config() -> CamwatchConfig {
    CamwatchConfig {
        addr: "127.0.0.1:0".to_string(),
        camera: CameraSettings {
            device: "stub://api-test".to_string(),
            width: 64,
            height: 48,
            fps: 30,
            ..CameraSettings::default()
        },
        detector: DetectorSettings {
            kind: DetectorKind::Stub,
            ..DetectorSettings::default()
        },
        stream: StreamSettings {
            poll_interval: Duration::from_millis(20),
            idle_timeout: Duration::from_millis(500),
            ..StreamSettings::default()
        },
        ..CamwatchConfig::default()
    }
}

struct TestApi {
    session: Arc<Session>,
    api_handle: Option<ApiHandle>,
}

impl TestApi {
    fn new() -> Result<Self> {
        Self::with_config(test_config())
    }

    fn with_config(cfg: CamwatchConfig) -> Result<Self> {
        let session = Arc::new(Session::from_config(&cfg, "127.0.0.1", 0));
        Self::with_session(session, cfg.stream)
    }

    fn with_session(session: Arc<Session>, stream: StreamSettings) -> Result<Self> {
        let api_config = ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            stream,
        };
        let api_handle = ApiServer::new(api_config, session.clone()).spawn()?;
        Ok(Self {
            session,
            api_handle: Some(api_handle),
        })
    }

    fn handle(&self) -> &ApiHandle {
        self.api_handle
            .as_ref()
            .expect("test API handle should be initialized")
    }

    fn request(&self, method: &str, path: &str, body: Option<&str>) -> Result<(String, String)> {
        let mut stream = TcpStream::connect(self.handle().addr)?;
        stream.set_read_timeout(Some(Duration::from_secs(10)))?;
        let request = match body {
            Some(body) => format!(
                "{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
                body.len()
            ),
            None => format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\n\r\n"),
        };
        stream.write_all(request.as_bytes())?;
        read_response(&mut stream)
    }

    fn json(&self, method: &str, path: &str, body: Option<&str>) -> Result<Value> {
        let (headers, body) = self.request(method, path, body)?;
        assert!(headers.contains("200 OK"), "unexpected response: {}", headers);
        Ok(serde_json::from_str(&body)?)
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        self.session.stop();
        if let Some(handle) = self.api_handle.take() {
            handle.stop().expect("failed to stop API server");
        }
    }
}

fn read_response(stream: &mut TcpStream) -> Result<(String, String)> {
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    let mut parts = response.splitn(2, "\r\n\r\n");
    let headers = parts.next().unwrap_or("").to_string();
    let body = parts.next().unwrap_or("").to_string();
    Ok((headers, body))
}

fn count_parts(data: &[u8]) -> usize {
    data.windows(PART_HEADER.len())
        .filter(|w| *w == PART_HEADER)
        .count()
}

fn open_viewer(api: &TestApi) -> Result<TcpStream> {
    let mut viewer = TcpStream::connect(api.handle().addr)?;
    viewer.set_read_timeout(Some(Duration::from_secs(10)))?;
    viewer.write_all(b"GET /video_feed HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
    Ok(viewer)
}

/// Read until `parts` more multipart parts have arrived.
fn read_parts(viewer: &mut TcpStream, parts: usize) -> Result<()> {
    let mut received = Vec::new();
    let mut buf = [0u8; 64 * 1024];
    while count_parts(&received) < parts {
        let n = viewer.read(&mut buf)?;
        assert!(n > 0, "stream closed early");
        received.extend_from_slice(&buf[..n]);
    }
    Ok(())
}

/// Camera producing incompressible frames, so every JPEG part is large.
struct NoiseCamera {
    state: u64,
}

impl FrameSource for NoiseCamera {
    fn describe(&self) -> String {
        "noise://camera".to_string()
    }

    fn read_frame(&mut self) -> anyhow::Result<Frame> {
        std::thread::sleep(Duration::from_millis(20));
        let (width, height) = (320, 240);
        let mut pixels = Vec::with_capacity((width * height * 3) as usize);
        for _ in 0..width * height * 3 {
            self.state ^= self.state << 13;
            self.state ^= self.state >> 7;
            self.state ^= self.state << 17;
            pixels.push(self.state as u8);
        }
        Frame::from_rgb(width, height, pixels).ok_or_else(|| anyhow::anyhow!("bad frame buffer"))
    }
}

#[test]
fn health_and_index_are_served() -> Result<()> {
    let api = TestApi::new()?;

    let value = api.json("GET", "/health", None)?;
    assert_eq!(value["status"], "ok");

    let (headers, body) = api.request("GET", "/", None)?;
    assert!(headers.contains("200 OK"));
    assert!(headers.contains("text/html"));
    assert!(body.contains("/video_feed"));
    assert!(body.contains("http://127.0.0.1:"));

    Ok(())
}

#[test]
fn unknown_path_and_wrong_method_are_rejected() -> Result<()> {
    let api = TestApi::new()?;

    let (headers, body) = api.request("GET", "/events", None)?;
    assert!(headers.contains("404 Not Found"));
    assert!(body.contains(r#""error":"not_found""#));

    let (headers, _) = api.request("GET", "/start_camera", None)?;
    assert!(headers.contains("405 Method Not Allowed"));

    let (headers, _) = api.request("POST", "/start_camera", Some("{not json"))?;
    assert!(headers.contains("400 Bad Request"));
    assert!(!api.session.is_running());

    Ok(())
}

#[test]
fn control_endpoints_follow_session_state() -> Result<()> {
    let api = TestApi::new()?;

    let status = api.json("GET", "/status", None)?;
    assert_eq!(status["camera_running"], false);
    assert_eq!(status["detection_enabled"], false);
    assert_eq!(status["server_ip"], "127.0.0.1");

    let toggled = api.json("POST", "/toggle_detection", None)?;
    assert_eq!(toggled["success"], false);
    assert_eq!(toggled["status"], "Camera is not running");

    let started = api.json("POST", "/start_camera", Some(r#"{"detection": false}"#))?;
    assert_eq!(started["success"], true);
    assert_eq!(started["status"], "Camera started successfully");

    let again = api.json("POST", "/start_camera", None)?;
    assert_eq!(again["success"], false);
    assert_eq!(again["status"], "Camera is already running");

    let status = api.json("GET", "/status", None)?;
    assert_eq!(status["camera_running"], true);
    assert_eq!(status["detection_enabled"], false);

    let toggled = api.json("POST", "/toggle_detection", None)?;
    assert_eq!(toggled["success"], true);
    assert_eq!(toggled["detection_enabled"], true);
    assert_eq!(toggled["status"], "Detection toggled successfully");

    let stopped = api.json("POST", "/stop_camera", None)?;
    assert_eq!(stopped["success"], true);
    assert_eq!(stopped["status"], "Camera stopped successfully");

    let stopped = api.json("POST", "/stop_camera", None)?;
    assert_eq!(stopped["success"], false);
    assert_eq!(stopped["status"], "Camera is not running");

    let status = api.json("GET", "/status", None)?;
    assert_eq!(status["camera_running"], false);
    assert_eq!(status["detection_enabled"], false);
    assert_eq!(status["frames_published"], 0);

    Ok(())
}

#[test]
fn video_feed_streams_until_camera_stops() -> Result<()> {
    let api = TestApi::new()?;
    let started = api.json("POST", "/start_camera", None)?;
    assert_eq!(started["success"], true);

    let mut viewer = TcpStream::connect(api.handle().addr)?;
    viewer.set_read_timeout(Some(Duration::from_secs(10)))?;
    viewer.write_all(b"GET /video_feed HTTP/1.1\r\nHost: localhost\r\n\r\n")?;

    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    let deadline = Instant::now() + Duration::from_secs(10);
    while count_parts(&received) < 3 && Instant::now() < deadline {
        let n = viewer.read(&mut buf)?;
        assert!(n > 0, "stream closed early");
        received.extend_from_slice(&buf[..n]);
    }
    let head = String::from_utf8_lossy(&received[..received.len().min(256)]).to_string();
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains("multipart/x-mixed-replace; boundary=frame"));
    assert!(count_parts(&received) >= 3);
    assert_eq!(api.handle().active_viewers(), 1);

    let stopped = api.json("POST", "/stop_camera", None)?;
    assert_eq!(stopped["success"], true);

    // The server ends the response once the session stops.
    let stop_seen = Instant::now();
    loop {
        let n = viewer.read(&mut buf)?;
        if n == 0 {
            break;
        }
    }
    assert!(stop_seen.elapsed() < Duration::from_secs(5));

    Ok(())
}

#[test]
fn missing_model_fails_start_with_default_detector() -> Result<()> {
    let mut cfg = test_config();
    cfg.detector = DetectorSettings {
        model_path: "/nonexistent/yolov5s.onnx".into(),
        ..DetectorSettings::default()
    };
    let api = TestApi::with_config(cfg)?;

    let started = api.json("POST", "/start_camera", None)?;
    assert_eq!(started["success"], false);
    let status = started["status"].as_str().unwrap_or_default();
    assert!(status.starts_with("Detection model unavailable"), "{}", status);
    assert!(!api.session.is_running());

    Ok(())
}

#[test]
fn stalled_viewer_is_dropped_without_stalling_others() -> Result<()> {
    let session = Arc::new(Session::new(
        Arc::new(|| -> StreamResult<Box<dyn FrameSource>> {
            Ok(Box::new(NoiseCamera {
                state: 0x9E37_79B9_7F4A_7C15,
            }))
        }),
        || -> StreamResult<SharedDetector> { Ok(share(NullBackend)) },
        SessionOptions::new("127.0.0.1", 0),
    ));
    let stream = StreamSettings {
        jpeg_quality: 100,
        poll_interval: Duration::from_millis(20),
        idle_timeout: Duration::from_secs(2),
        write_timeout: Duration::from_millis(200),
    };
    let api = TestApi::with_session(session, stream)?;
    api.json("POST", "/start_camera", Some(r#"{"detection": false}"#))?;

    // Sends its request, then never reads.
    let stalled = open_viewer(&api)?;
    let mut active = open_viewer(&api)?;
    read_parts(&mut active, 2)?;
    assert_eq!(api.handle().active_viewers(), 2);

    // Keep draining the live viewer until the stalled one is dropped.
    let deadline = Instant::now() + Duration::from_secs(20);
    while api.handle().active_viewers() > 1 && Instant::now() < deadline {
        read_parts(&mut active, 1)?;
    }
    assert_eq!(api.handle().active_viewers(), 1);

    read_parts(&mut active, 3)?;
    assert!(api.session.status().camera_running);
    drop(stalled);

    Ok(())
}

#[test]
fn viewer_joining_while_stopped_times_out() -> Result<()> {
    let api = TestApi::new()?;
    let started = Instant::now();
    let (headers, body) = api.request("GET", "/video_feed", None)?;

    assert!(headers.contains("200 OK"));
    assert!(body.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(500));
    Ok(())
}

#[test]
fn several_viewers_receive_frames_independently() -> Result<()> {
    let api = TestApi::new()?;
    api.json("POST", "/start_camera", Some(r#"{"detection": true}"#))?;

    let mut viewers = Vec::new();
    for _ in 0..3 {
        let mut viewer = TcpStream::connect(api.handle().addr)?;
        viewer.set_read_timeout(Some(Duration::from_secs(10)))?;
        viewer.write_all(b"GET /video_feed HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
        viewers.push(viewer);
    }

    let mut buf = [0u8; 4096];
    for viewer in viewers.iter_mut() {
        let mut received = Vec::new();
        while count_parts(&received) < 2 {
            let n = viewer.read(&mut buf)?;
            assert!(n > 0, "stream closed early");
            received.extend_from_slice(&buf[..n]);
        }
    }

    // Dropping one viewer leaves the others streaming.
    drop(viewers.pop());
    let mut received = Vec::new();
    while count_parts(&received) < 2 {
        let n = viewers[0].read(&mut buf)?;
        assert!(n > 0, "stream closed early");
        received.extend_from_slice(&buf[..n]);
    }

    Ok(())
}
