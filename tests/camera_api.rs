//! HTTP transport tests against a running pipeline on synthetic cameras.

mod support;

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use camwatch::api::{ApiConfig, ApiHandle, ApiServer};
use camwatch::{DeviceListDiscovery, Pipeline};
use support::{settings, wait_for, FixedDetector};

fn start() -> (Pipeline, ApiHandle) {
    let discovery = DeviceListDiscovery::new(
        vec![
            "stub://front?fps=100".to_string(),
            "stub://back?fps=100".to_string(),
        ],
        3,
    );
    let pipeline =
        Pipeline::start_with(settings(2, 1), &discovery, Arc::new(FixedDetector::new())).unwrap();
    let api = ApiServer::new(
        ApiConfig {
            addr: "127.0.0.1:0".to_string(),
        },
        pipeline.service(),
    )
    .spawn()
    .unwrap();
    (pipeline, api)
}

fn get(addr: SocketAddr, path: &str) -> (String, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    write!(stream, "GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n").unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).unwrap();
    split_response(&raw)
}

fn split_response(raw: &[u8]) -> (String, Vec<u8>) {
    let end = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("header terminator");
    let head = String::from_utf8_lossy(&raw[..end]).into_owned();
    (head, raw[end + 4..].to_vec())
}

fn json(body: &[u8]) -> serde_json::Value {
    serde_json::from_slice(body).unwrap()
}

#[test]
fn query_routes_answer_json() {
    let (pipeline, api) = start();

    let (head, body) = get(api.addr, "/camera_count");
    assert!(head.starts_with("HTTP/1.1 200"));
    assert!(head.contains("Access-Control-Allow-Origin: *"));
    assert_eq!(json(&body), serde_json::json!(2));

    let (_, body) = get(api.addr, "/cameras");
    assert_eq!(
        json(&body),
        serde_json::json!([
            {"index": 0, "label": "stub://front?fps=100"},
            {"index": 1, "label": "stub://back?fps=100"}
        ])
    );

    let (head, body) = get(api.addr, "/health");
    assert!(head.starts_with("HTTP/1.1 200"));
    assert_eq!(json(&body), serde_json::json!({"status": "ok"}));

    let service = pipeline.service();
    wait_for("detections on camera 0", || {
        !service.get_detections(0).unwrap().is_empty()
    });
    let (head, body) = get(api.addr, "/detections/0");
    assert!(head.starts_with("HTTP/1.1 200"));
    assert_eq!(
        json(&body),
        serde_json::json!([
            {"class": 7, "confidence": 0.9, "bbox": [2.0, 3.0, 20.0, 18.0]}
        ])
    );

    let (head, body) = get(api.addr, "/stats/1");
    assert!(head.starts_with("HTTP/1.1 200"));
    assert_eq!(json(&body)["index"], serde_json::json!(1));

    api.stop().unwrap();
    pipeline.shutdown().unwrap();
}

#[test]
fn unknown_cameras_and_routes_are_not_found() {
    let (pipeline, api) = start();

    for path in ["/detections/5", "/video/5", "/snapshot/9", "/stats/2", "/video/front", "/nope"] {
        let (head, body) = get(api.addr, path);
        assert!(head.starts_with("HTTP/1.1 404"), "{path}: {head}");
        assert_eq!(json(&body), serde_json::json!({"error": "not_found"}));
    }

    let mut stream = TcpStream::connect(api.addr).unwrap();
    write!(stream, "POST /camera_count HTTP/1.1\r\nHost: localhost\r\n\r\n").unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).unwrap();
    assert!(split_response(&raw).0.starts_with("HTTP/1.1 405"));

    api.stop().unwrap();
    pipeline.shutdown().unwrap();
}

#[test]
fn snapshot_returns_single_jpeg() {
    let (pipeline, api) = start();
    let service = pipeline.service();
    wait_for("a frame on camera 1", || {
        service.camera_stats(1).unwrap().latest_frame_id.is_some()
    });

    let (head, body) = get(api.addr, "/snapshot/1");
    assert!(head.starts_with("HTTP/1.1 200"));
    assert!(head.contains("Content-Type: image/jpeg"));
    assert_eq!(&body[..2], &[0xFF, 0xD8]);

    api.stop().unwrap();
    pipeline.shutdown().unwrap();
}

#[test]
fn video_streams_multipart_jpeg_parts() {
    let (pipeline, api) = start();

    let mut stream = TcpStream::connect(api.addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    write!(stream, "GET /video/0 HTTP/1.1\r\nHost: localhost\r\n\r\n").unwrap();

    let marker = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\xFF\xD8";
    let mut raw = Vec::new();
    let mut buf = [0u8; 4096];
    while raw.windows(marker.len()).filter(|w| *w == marker).count() < 3 {
        let n = stream.read(&mut buf).unwrap();
        assert!(n > 0, "stream closed early");
        raw.extend_from_slice(&buf[..n]);
    }
    let (head, _) = split_response(&raw);
    assert!(head.starts_with("HTTP/1.1 200"));
    assert!(head.contains("Content-Type: multipart/x-mixed-replace; boundary=frame"));
    drop(stream);

    api.stop().unwrap();
    pipeline.shutdown().unwrap();
}

#[test]
fn stop_releases_viewer_of_camera_without_frames() {
    let discovery = DeviceListDiscovery::new(vec!["stub://dead?fail=reads&fps=0".to_string()], 3);
    let pipeline =
        Pipeline::start_with(settings(2, 1), &discovery, Arc::new(FixedDetector::new())).unwrap();
    let api = ApiServer::new(
        ApiConfig {
            addr: "127.0.0.1:0".to_string(),
        },
        pipeline.service(),
    )
    .spawn()
    .unwrap();

    let mut stream = TcpStream::connect(api.addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    write!(stream, "GET /video/0 HTTP/1.1\r\nHost: localhost\r\n\r\n").unwrap();
    let mut raw = Vec::new();
    let mut buf = [0u8; 1024];
    while !raw.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buf).unwrap();
        assert!(n > 0, "stream closed before the header");
        raw.extend_from_slice(&buf[..n]);
    }
    assert!(split_response(&raw).0.starts_with("HTTP/1.1 200"));

    api.stop().unwrap();
    // The connection thread gives up waiting and closes the socket.
    let mut rest = Vec::new();
    stream
        .read_to_end(&mut rest)
        .expect("viewer connection should close after stop");
    assert!(rest.is_empty());
    pipeline.shutdown().unwrap();
}
