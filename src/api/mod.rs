//! HTTP surface: control page, MJPEG feed and the JSON control endpoints.
//!
//! A plain `TcpListener` accept loop; every connection gets its own thread so
//! long-lived `/video_feed` responses never block the control endpoints.

mod page;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::StreamSettings;
use crate::error::StreamError;
use crate::session::{Session, StartOutcome, StopOutcome};
use crate::stream::{StreamEnd, StreamGenerator, MULTIPART_CONTENT_TYPE};

pub use page::render_index;

const MAX_HEADER_BYTES: usize = 8192;
const MAX_BODY_BYTES: usize = 4096;
const READ_TIMEOUT: Duration = Duration::from_secs(2);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub stream: StreamSettings,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:5000".to_string(),
            stream: StreamSettings::default(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    viewers: Arc<AtomicUsize>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    /// Number of `/video_feed` responses currently being written.
    pub fn active_viewers(&self) -> usize {
        self.viewers.load(Ordering::SeqCst)
    }

    /// Stop accepting, end every open stream and wait for connection threads.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    session: Arc<Session>,
}

struct ApiContext {
    session: Arc<Session>,
    stream: StreamSettings,
    shutdown: Arc<AtomicBool>,
    viewers: Arc<AtomicUsize>,
    port: u16,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, session: Arc<Session>) -> Self {
        Self { cfg, session }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .with_context(|| format!("invalid bind address '{}'", self.cfg.addr))?;
        let listener = TcpListener::bind(configured_addr)
            .with_context(|| format!("bind {}", configured_addr))?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let viewers = Arc::new(AtomicUsize::new(0));
        let ctx = Arc::new(ApiContext {
            session: self.session,
            stream: self.cfg.stream,
            shutdown: shutdown.clone(),
            viewers: viewers.clone(),
            port: addr.port(),
        });
        let join = std::thread::Builder::new()
            .name("camwatch-api".to_string())
            .spawn(move || run_api(listener, ctx))
            .context("spawn api thread")?;

        log::info!("http server listening on {}", addr);
        Ok(ApiHandle {
            addr,
            shutdown,
            viewers,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, ctx: Arc<ApiContext>) {
    let mut workers: Vec<JoinHandle<()>> = Vec::new();
    loop {
        if ctx.shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                workers.retain(|worker| !worker.is_finished());
                let conn_ctx = ctx.clone();
                let spawned = std::thread::Builder::new()
                    .name("camwatch-conn".to_string())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, peer, &conn_ctx) {
                            log::debug!("request from {} failed: {:#}", peer, err);
                        }
                    });
                match spawned {
                    Ok(worker) => workers.push(worker),
                    Err(err) => log::warn!("failed to spawn connection thread: {}", err),
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_BACKOFF);
            }
            Err(err) => {
                log::warn!("accept failed: {}", err);
                std::thread::sleep(ACCEPT_BACKOFF);
            }
        }
    }
    for worker in workers {
        let _ = worker.join();
    }
    log::info!("http server stopped");
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Route {
    Index,
    VideoFeed,
    StartCamera,
    StopCamera,
    ToggleDetection,
    Status,
    Health,
}

impl Route {
    fn lookup(path: &str) -> Option<Self> {
        let route = match path {
            "/" => Route::Index,
            "/video_feed" => Route::VideoFeed,
            "/start_camera" => Route::StartCamera,
            "/stop_camera" => Route::StopCamera,
            "/toggle_detection" => Route::ToggleDetection,
            "/status" => Route::Status,
            "/health" => Route::Health,
            _ => return None,
        };
        Some(route)
    }

    fn method(self) -> &'static str {
        match self {
            Route::StartCamera | Route::StopCamera | Route::ToggleDetection => "POST",
            Route::Index | Route::VideoFeed | Route::Status | Route::Health => "GET",
        }
    }
}

#[derive(Debug, Deserialize)]
struct StartRequest {
    #[serde(default = "default_detection")]
    detection: bool,
}

fn default_detection() -> bool {
    true
}

fn handle_connection(mut stream: TcpStream, peer: SocketAddr, ctx: &ApiContext) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;

    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            write_json_response(&mut stream, 400, &json!({"error": "bad_request"}))?;
            return Err(err);
        }
    };

    let Some(route) = Route::lookup(&request.path) else {
        write_json_response(&mut stream, 404, &json!({"error": "not_found"}))?;
        return Ok(());
    };
    if request.method != route.method() {
        write_json_response(&mut stream, 405, &json!({"error": "method_not_allowed"}))?;
        return Ok(());
    }

    match route {
        Route::Index => {
            let status = ctx.session.status();
            let page = render_index(&format!("{}:{}", status.server_ip, ctx.port));
            write_response(&mut stream, 200, "text/html; charset=utf-8", page.as_bytes())
        }
        Route::Health => write_json_response(&mut stream, 200, &json!({"status": "ok"})),
        Route::Status => {
            let body = serde_json::to_vec(&ctx.session.status())?;
            write_response(&mut stream, 200, "application/json", &body)
        }
        Route::StartCamera => {
            let start = match parse_start_request(&request.body) {
                Ok(start) => start,
                Err(err) => {
                    write_json_response(&mut stream, 400, &json!({"error": "invalid_json"}))?;
                    return Err(err);
                }
            };
            let body = start_camera(&ctx.session, start.detection);
            write_json_response(&mut stream, 200, &body)
        }
        Route::StopCamera => {
            let body = match ctx.session.stop() {
                StopOutcome::Stopped => {
                    json!({"status": "Camera stopped successfully", "success": true})
                }
                StopOutcome::NotRunning => {
                    json!({"status": "Camera is not running", "success": false})
                }
            };
            write_json_response(&mut stream, 200, &body)
        }
        Route::ToggleDetection => {
            let body = match ctx.session.toggle_detection() {
                Ok(enabled) => json!({
                    "status": "Detection toggled successfully",
                    "detection_enabled": enabled,
                    "success": true,
                }),
                Err(_) => json!({
                    "status": "Camera is not running",
                    "detection_enabled": false,
                    "success": false,
                }),
            };
            write_json_response(&mut stream, 200, &body)
        }
        Route::VideoFeed => serve_video_feed(stream, peer, ctx),
    }
}

fn parse_start_request(body: &[u8]) -> Result<StartRequest> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(StartRequest {
            detection: default_detection(),
        });
    }
    serde_json::from_slice(body).context("parse start_camera body")
}

fn start_camera(session: &Session, detection: bool) -> serde_json::Value {
    match session.start(detection) {
        Ok(StartOutcome::Started) => {
            json!({"status": "Camera started successfully", "success": true})
        }
        Ok(StartOutcome::AlreadyRunning) => {
            json!({"status": "Camera is already running", "success": false})
        }
        Err(StreamError::DeviceUnavailable(msg)) => {
            json!({"status": format!("Failed to open camera: {}", msg), "success": false})
        }
        Err(StreamError::ModelUnavailable(msg)) => {
            json!({"status": format!("Detection model unavailable: {}", msg), "success": false})
        }
        Err(err) => json!({"status": format!("Error: {}", err), "success": false}),
    }
}

struct ViewerGuard<'a> {
    viewers: &'a AtomicUsize,
}

impl<'a> ViewerGuard<'a> {
    fn enter(viewers: &'a AtomicUsize) -> (Self, usize) {
        let active = viewers.fetch_add(1, Ordering::SeqCst) + 1;
        (Self { viewers }, active)
    }
}

impl Drop for ViewerGuard<'_> {
    fn drop(&mut self) {
        self.viewers.fetch_sub(1, Ordering::SeqCst);
    }
}

fn serve_video_feed(mut stream: TcpStream, peer: SocketAddr, ctx: &ApiContext) -> Result<()> {
    stream.set_write_timeout(Some(ctx.stream.write_timeout))?;
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nCache-Control: no-cache, no-store\r\nPragma: no-cache\r\nConnection: close\r\n\r\n",
        MULTIPART_CONTENT_TYPE
    );
    stream.write_all(header.as_bytes())?;

    let (_guard, active) = ViewerGuard::enter(&ctx.viewers);
    log::info!("viewer {} connected ({} active)", peer, active);
    let end = StreamGenerator::new(ctx.session.slot(), ctx.stream.clone())
        .with_shutdown(ctx.shutdown.clone())
        .run(&mut stream);
    match end {
        StreamEnd::ClientDisconnected => log::info!("viewer {} disconnected", peer),
        other => log::info!("viewer {} stream ended: {:?}", peer, other),
    }
    Ok(())
}

fn read_request<R: Read>(stream: &mut R) -> Result<HttpRequest> {
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of headers"));
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_HEADER_BYTES + MAX_BODY_BYTES {
            return Err(anyhow!("request too large"));
        }
    };
    if header_end > MAX_HEADER_BYTES {
        return Err(anyhow!("request headers too large"));
    }

    let text = String::from_utf8_lossy(&data[..header_end]).into_owned();
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid content-length '{}'", value))?,
        None => 0,
    };
    if content_length > MAX_BODY_BYTES {
        return Err(anyhow!("request body too large"));
    }
    let mut body = data.split_off(header_end + 4);
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of body"));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        body,
    })
}

fn write_json_response<W: Write>(stream: &mut W, status: u16, body: &serde_json::Value) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    write_response(stream, status, "application/json", &payload)
}

fn write_response<W: Write>(
    stream: &mut W,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    body: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn parses_request_with_body() {
        let raw = b"POST /start_camera HTTP/1.1\r\nHost: x\r\nContent-Type: application/json\r\nContent-Length: 19\r\n\r\n{\"detection\":false}";
        let request = read_request(&mut Cursor::new(&raw[..])).unwrap();
        assert_eq!(request.method, "POST");
        assert_eq!(request.path, "/start_camera");
        assert!(!parse_start_request(&request.body).unwrap().detection);
    }

    // Body bytes that arrive in a later read than the headers.
    struct Chunked(Vec<&'static [u8]>);

    impl Read for Chunked {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.0.is_empty() {
                return Ok(0);
            }
            let chunk = self.0.remove(0);
            buf[..chunk.len()].copy_from_slice(chunk);
            Ok(chunk.len())
        }
    }

    #[test]
    fn body_split_across_reads_is_collected() {
        let mut stream = Chunked(vec![
            b"POST /start_camera HTTP/1.1\r\nContent-Length: 18\r\n\r\n{\"detec",
            b"tion\": true}",
        ]);
        let request = read_request(&mut stream).unwrap();
        assert_eq!(request.method, "POST");
        assert_eq!(request.body, b"{\"detection\": true}");
        assert!(parse_start_request(&request.body).unwrap().detection);
    }

    #[test]
    fn strips_query_string() {
        let raw = b"GET /video_feed?1712345 HTTP/1.1\r\n\r\n";
        let request = read_request(&mut Cursor::new(&raw[..])).unwrap();
        assert_eq!(request.path, "/video_feed");
        assert!(request.body.is_empty());
    }

    #[test]
    fn truncated_body_is_an_error() {
        let raw = b"POST /start_camera HTTP/1.1\r\nContent-Length: 50\r\n\r\n{}";
        assert!(read_request(&mut Cursor::new(&raw[..])).is_err());
    }

    #[test]
    fn start_body_defaults_to_detection_on() {
        assert!(parse_start_request(b"").unwrap().detection);
        assert!(parse_start_request(b"{}").unwrap().detection);
        assert!(parse_start_request(b"not json").is_err());
    }

    #[test]
    fn routes_know_their_methods() {
        assert_eq!(Route::lookup("/start_camera").map(Route::method), Some("POST"));
        assert_eq!(Route::lookup("/status").map(Route::method), Some("GET"));
        assert_eq!(Route::lookup("/events"), None);
    }

    #[test]
    fn response_carries_length_and_close() {
        let mut out = Vec::new();
        write_json_response(&mut out, 404, &json!({"error": "not_found"})).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("Content-Length: 21\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("{\"error\":\"not_found\"}"));
    }
}
