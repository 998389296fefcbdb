use crate::pipeline::CameraService;
use crate::stream::{EncodedFrame, StreamReader};
use anyhow::{anyhow, Result};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_REQUEST_BYTES: usize = 8192;
const BOUNDARY: &str = "frame";
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:5000".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    /// Stop accepting connections. Open video streams end within one poll
    /// interval, including viewers still waiting for a camera's first frame.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("camera api thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    service: CameraService,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, service: CameraService) -> Self {
        Self { cfg, service }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .map_err(|e| anyhow!("invalid api addr '{}': {}", self.cfg.addr, e))?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let service = self.service;
        let join = std::thread::Builder::new()
            .name("camera-api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, service, shutdown_thread) {
                    log::error!("camera api stopped: {}", err);
                }
            })?;
        log::info!("camera api listening on {}", addr);

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, service: CameraService, shutdown: Arc<AtomicBool>) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let service = service.clone();
                let shutdown = shutdown.clone();
                let spawned = std::thread::Builder::new()
                    .name("camera-api-conn".to_string())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &service, &shutdown) {
                            log::warn!("camera api request from {} failed: {}", peer, err);
                        }
                    });
                if let Err(err) = spawned {
                    log::warn!("camera api could not spawn connection thread: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum Route {
    Health,
    CameraCount,
    Cameras,
    Video(usize),
    Snapshot(usize),
    Detections(usize),
    Stats(usize),
}

impl Route {
    fn parse(path: &str) -> Option<Self> {
        let path = path.trim_end_matches('/');
        match path {
            "/health" => return Some(Self::Health),
            "/camera_count" => return Some(Self::CameraCount),
            "/cameras" => return Some(Self::Cameras),
            _ => {}
        }
        let (prefix, index) = path.rsplit_once('/')?;
        let index: usize = index.parse().ok()?;
        match prefix {
            "/video" => Some(Self::Video(index)),
            "/snapshot" => Some(Self::Snapshot(index)),
            "/detections" => Some(Self::Detections(index)),
            "/stats" => Some(Self::Stats(index)),
            _ => None,
        }
    }
}

fn handle_connection(
    mut stream: TcpStream,
    service: &CameraService,
    shutdown: &AtomicBool,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
    let request = read_request(&mut stream)?;
    if request.method != "GET" {
        write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)?;
        return Ok(());
    }
    let route = match Route::parse(&request.path) {
        Some(route) => route,
        None => return write_not_found(&mut stream),
    };

    match route {
        Route::Health => write_json_response(&mut stream, 200, r#"{"status":"ok"}"#),
        Route::CameraCount => {
            let payload = serde_json::to_vec(&service.camera_count())?;
            write_response(&mut stream, 200, "application/json", &payload)
        }
        Route::Cameras => {
            let payload = serde_json::to_vec(&service.list_cameras())?;
            write_response(&mut stream, 200, "application/json", &payload)
        }
        Route::Detections(index) => match service.get_detections(index) {
            Ok(detections) => {
                let payload = serde_json::to_vec(&*detections)?;
                write_response(&mut stream, 200, "application/json", &payload)
            }
            Err(_) => write_not_found(&mut stream),
        },
        Route::Stats(index) => match service.camera_stats(index) {
            Ok(stats) => {
                let payload = serde_json::to_vec(&stats)?;
                write_response(&mut stream, 200, "application/json", &payload)
            }
            Err(_) => write_not_found(&mut stream),
        },
        Route::Snapshot(index) => {
            let reader = match service.open_stream(index) {
                Ok(reader) => reader,
                Err(_) => return write_not_found(&mut stream),
            };
            match reader.try_snapshot_frame()? {
                Some(frame) => write_response(&mut stream, 200, frame.content_type, &frame.bytes),
                None => write_json_response(&mut stream, 404, r#"{"error":"no_frame"}"#),
            }
        }
        Route::Video(index) => match service.open_stream(index) {
            Ok(reader) => stream_video(&mut stream, reader, shutdown),
            Err(_) => write_not_found(&mut stream),
        },
    }
}

fn stream_video(stream: &mut TcpStream, mut reader: StreamReader, shutdown: &AtomicBool) -> Result<()> {
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary={BOUNDARY}\r\nCache-Control: no-cache\r\nAccess-Control-Allow-Origin: *\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(header.as_bytes())?;
    log::debug!("camera api: viewer attached to camera {}", reader.camera_index());

    let mut sent = 0u64;
    loop {
        let viewer = &*stream;
        let frame = reader.next_frame_while(|| {
            !shutdown.load(Ordering::SeqCst) && client_connected(viewer)
        })?;
        let Some(frame) = frame else {
            log::debug!(
                "camera api: viewer of camera {} released after {} frame(s)",
                reader.camera_index(),
                sent
            );
            break;
        };
        if let Err(err) = stream
            .write_all(&multipart_part(&frame))
            .and_then(|_| stream.flush())
        {
            log::debug!(
                "camera api: viewer left camera {} after {} frame(s): {}",
                reader.camera_index(),
                sent,
                err
            );
            break;
        }
        sent += 1;
    }
    Ok(())
}

/// Non-blocking check for a closed viewer socket. Pending request bytes
/// count as connected.
fn client_connected(stream: &TcpStream) -> bool {
    if stream.set_nonblocking(true).is_err() {
        return false;
    }
    let mut byte = [0u8; 1];
    let connected = match stream.peek(&mut byte) {
        Ok(0) => false,
        Ok(_) => true,
        Err(err) => err.kind() == std::io::ErrorKind::WouldBlock,
    };
    stream.set_nonblocking(false).is_ok() && connected
}

fn multipart_part(frame: &EncodedFrame) -> Vec<u8> {
    let head = format!(
        "--{BOUNDARY}\r\nContent-Type: {}\r\n\r\n",
        frame.content_type
    );
    let mut part = Vec::with_capacity(head.len() + frame.bytes.len() + 2);
    part.extend_from_slice(head.as_bytes());
    part.extend_from_slice(&frame.bytes);
    part.extend_from_slice(b"\r\n");
    part
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let request_line = text
        .split("\r\n")
        .next()
        .ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
    })
}

fn write_not_found(stream: &mut TcpStream) -> Result<()> {
    write_json_response(stream, 404, r#"{"error":"not_found"}"#)
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nAccess-Control-Allow-Origin: *\r\nConnection: close\r\n\r\n",
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
}
