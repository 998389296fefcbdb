//! Per-viewer encoded frame streams.
//!
//! A `StreamReader` polls its camera's `FrameSlot` and yields the latest frame,
//! optionally resized and annotated with the latest detections, encoded by an
//! `Encoder`. Readers share nothing with each other: every viewer gets its own
//! reader and reading never consumes a frame.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

use crate::frame::{DetectionSet, Frame, Resolution};
use crate::registry::Camera;
use crate::slot::Snapshot;

pub const DEFAULT_STREAM_FPS: u32 = 30;
pub const DEFAULT_JPEG_QUALITY: u8 = 75;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Image encoding capability.
pub trait Encoder: Send + Sync {
    fn encode(&self, image: &RgbImage) -> Result<Vec<u8>>;

    /// MIME type of the encoded bytes.
    fn content_type(&self) -> &'static str;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JpegEncoder {
    quality: u8,
}

impl JpegEncoder {
    /// Quality is clamped to 1..=100.
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }
}

impl Default for JpegEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_JPEG_QUALITY)
    }
}

impl Encoder for JpegEncoder {
    fn encode(&self, image: &RgbImage) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(image.as_raw().len() / 8);
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, self.quality)
            .encode_image(image)
            .context("encode jpeg frame")?;
        Ok(out)
    }

    fn content_type(&self) -> &'static str {
        "image/jpeg"
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamSettings {
    /// Output size. `None` streams at capture size.
    pub resolution: Option<Resolution>,
    /// Maximum frames per second per reader (0 = unpaced).
    pub fps: u32,
    /// Draw detection boxes onto the frame.
    pub annotate: bool,
    /// Wait between polls while the camera has no frame yet.
    pub poll_interval: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            resolution: None,
            fps: DEFAULT_STREAM_FPS,
            annotate: true,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// One encoded image plus the ids it was built from.
#[derive(Clone, Debug)]
pub struct EncodedFrame {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
    pub frame_id: u64,
    pub detection_frame_id: Option<u64>,
    pub detection_count: usize,
}

pub struct StreamReader {
    camera: Arc<Camera>,
    encoder: Arc<dyn Encoder>,
    settings: StreamSettings,
    last_yield: Option<Instant>,
}

impl StreamReader {
    pub fn new(camera: Arc<Camera>, encoder: Arc<dyn Encoder>, settings: StreamSettings) -> Self {
        Self {
            camera,
            encoder,
            settings,
            last_yield: None,
        }
    }

    pub fn camera_index(&self) -> usize {
        self.camera.index()
    }

    pub fn content_type(&self) -> &'static str {
        self.encoder.content_type()
    }

    /// Block until the camera has a frame, then encode the latest one.
    pub fn next_frame(&mut self) -> Result<EncodedFrame> {
        loop {
            if let Some(encoded) = self.next_frame_while(|| true)? {
                return Ok(encoded);
            }
        }
    }

    /// Like `next_frame`, but gives up with `None` once `stop` is set.
    pub fn next_frame_until(&mut self, stop: &AtomicBool) -> Result<Option<EncodedFrame>> {
        self.next_frame_while(|| !stop.load(Ordering::Acquire))
    }

    /// Wait for a frame while `keep_waiting` holds. It is checked before
    /// every poll, so a camera that never delivers costs at most one poll
    /// interval after the caller gives up.
    pub fn next_frame_while(
        &mut self,
        mut keep_waiting: impl FnMut() -> bool,
    ) -> Result<Option<EncodedFrame>> {
        self.pace();
        loop {
            if !keep_waiting() {
                return Ok(None);
            }
            let snapshot = self.camera.slot().snapshot();
            if let Some(frame) = &snapshot.frame {
                let encoded = self.render(frame, &snapshot)?;
                self.last_yield = Some(Instant::now());
                return Ok(Some(encoded));
            }
            thread::sleep(self.settings.poll_interval);
        }
    }

    /// Encode the current frame once, without waiting. `None` if the camera
    /// has not produced a frame yet.
    pub fn try_snapshot_frame(&self) -> Result<Option<EncodedFrame>> {
        let snapshot = self.camera.slot().snapshot();
        match &snapshot.frame {
            Some(frame) => self.render(frame, &snapshot).map(Some),
            None => Ok(None),
        }
    }

    fn pace(&self) {
        if self.settings.fps == 0 {
            return;
        }
        if let Some(last) = self.last_yield {
            let interval = Duration::from_secs_f64(1.0 / self.settings.fps as f64);
            let elapsed = last.elapsed();
            if elapsed < interval {
                thread::sleep(interval - elapsed);
            }
        }
    }

    fn render(&self, frame: &Frame, snapshot: &Snapshot) -> Result<EncodedFrame> {
        let source = frame.resolution();
        let target = self.settings.resolution.unwrap_or(source);
        let annotate = self.settings.annotate && !snapshot.detections.is_empty();

        let bytes = if target == source && !annotate {
            self.encoder.encode(frame.image())?
        } else {
            let mut image = if target == source {
                frame.image().clone()
            } else {
                imageops::resize(frame.image(), target.width, target.height, FilterType::Triangle)
            };
            if annotate {
                draw_detections(&mut image, &snapshot.detections, source);
            }
            self.encoder.encode(&image)?
        };

        Ok(EncodedFrame {
            bytes,
            content_type: self.encoder.content_type(),
            frame_id: frame.id,
            detection_frame_id: snapshot.detection_frame_id,
            detection_count: snapshot.detections.len(),
        })
    }
}

impl Iterator for StreamReader {
    type Item = Result<EncodedFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_frame())
    }
}

const PALETTE: [Rgb<u8>; 6] = [
    Rgb([0, 255, 0]),
    Rgb([255, 64, 64]),
    Rgb([64, 160, 255]),
    Rgb([255, 200, 0]),
    Rgb([255, 0, 255]),
    Rgb([0, 255, 255]),
];

fn class_color(class_id: u32) -> Rgb<u8> {
    PALETTE[class_id as usize % PALETTE.len()]
}

/// Draw two-pixel boxes. Boxes are in `source` coordinates and get scaled to
/// the image's size.
fn draw_detections(image: &mut RgbImage, detections: &DetectionSet, source: Resolution) {
    let target = Resolution::new(image.width(), image.height());
    for det in detections.iter() {
        let bbox = det.bbox.scaled(source, target).clamped(target);
        let width = bbox.width().round() as u32;
        let height = bbox.height().round() as u32;
        if width == 0 || height == 0 {
            continue;
        }
        let color = class_color(det.class_id);
        let (x, y) = (bbox.x1.round() as i32, bbox.y1.round() as i32);
        draw_hollow_rect_mut(image, Rect::at(x, y).of_size(width, height), color);
        if width > 2 && height > 2 {
            draw_hollow_rect_mut(
                image,
                Rect::at(x + 1, y + 1).of_size(width - 2, height - 2),
                color,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{BoundingBox, Detection};
    use crate::ingest::{SyntheticConfig, SyntheticSource};
    use crate::registry::{CameraRegistry, WarmupPolicy};

    fn camera() -> Arc<Camera> {
        let mut config = SyntheticConfig::new("view");
        config.native_fps = 0;
        CameraRegistry::new(WarmupPolicy::default())
            .register(Box::new(SyntheticSource::new(config)), 32, 24)
            .unwrap()
    }

    fn fast() -> StreamSettings {
        StreamSettings {
            fps: 0,
            poll_interval: Duration::from_millis(1),
            ..StreamSettings::default()
        }
    }

    fn reader(camera: &Arc<Camera>, settings: StreamSettings) -> StreamReader {
        StreamReader::new(camera.clone(), Arc::new(JpegEncoder::default()), settings)
    }

    fn decode(frame: &EncodedFrame) -> RgbImage {
        image::load_from_memory_with_format(&frame.bytes, image::ImageFormat::Jpeg)
            .unwrap()
            .to_rgb8()
    }

    #[test]
    fn snapshot_is_none_before_first_frame() {
        let camera = camera();
        assert!(reader(&camera, fast()).try_snapshot_frame().unwrap().is_none());
    }

    #[test]
    fn reader_waits_for_first_frame() {
        let camera = camera();
        let publisher = camera.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            publisher
                .slot()
                .publish_frame(Frame::new(1, RgbImage::new(32, 24)));
        });
        let encoded = reader(&camera, fast()).next_frame().unwrap();
        handle.join().unwrap();
        assert_eq!(encoded.frame_id, 1);
        assert_eq!(encoded.content_type, "image/jpeg");
        assert_eq!(&encoded.bytes[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn stop_flag_ends_wait_on_frameless_camera() {
        let camera = camera();
        let stop = Arc::new(AtomicBool::new(false));
        let setter = stop.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            setter.store(true, Ordering::Release);
        });
        let started = Instant::now();
        let got = reader(&camera, fast()).next_frame_until(&stop).unwrap();
        handle.join().unwrap();
        assert!(got.is_none());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn stop_flag_is_ignored_once_a_frame_exists() {
        let camera = camera();
        camera
            .slot()
            .publish_frame(Frame::new(4, RgbImage::new(32, 24)));
        let stop = AtomicBool::new(false);
        let got = reader(&camera, fast()).next_frame_until(&stop).unwrap();
        assert_eq!(got.map(|f| f.frame_id), Some(4));
    }

    #[test]
    fn readers_do_not_consume_frames() {
        let camera = camera();
        camera
            .slot()
            .publish_frame(Frame::new(7, RgbImage::new(32, 24)));
        let mut a = reader(&camera, fast());
        let mut b = reader(&camera, fast());
        for _ in 0..3 {
            assert_eq!(a.next().unwrap().unwrap().frame_id, 7);
        }
        assert_eq!(b.next().unwrap().unwrap().frame_id, 7);
    }

    #[test]
    fn output_is_resized_to_stream_resolution() {
        let camera = camera();
        camera
            .slot()
            .publish_frame(Frame::new(1, RgbImage::new(32, 24)));
        let settings = StreamSettings {
            resolution: Some(Resolution::new(16, 12)),
            ..fast()
        };
        let encoded = reader(&camera, settings).next_frame().unwrap();
        assert_eq!(decode(&encoded).dimensions(), (16, 12));
    }

    #[test]
    fn detections_are_drawn_and_reported() {
        let camera = camera();
        camera
            .slot()
            .publish_frame(Frame::new(5, RgbImage::new(32, 24)));
        camera.slot().publish_detections(
            DetectionSet::new(vec![Detection::new(
                0,
                0.9,
                BoundingBox::new(4.0, 4.0, 28.0, 20.0),
            )]),
            3,
        );

        let plain = reader(
            &camera,
            StreamSettings {
                annotate: false,
                ..fast()
            },
        )
        .next_frame()
        .unwrap();
        let annotated = reader(&camera, fast()).next_frame().unwrap();

        assert_eq!(annotated.detection_count, 1);
        assert_eq!(annotated.detection_frame_id, Some(3));
        assert_ne!(plain.bytes, annotated.bytes);
        let edge = decode(&annotated).get_pixel(4, 12).0;
        let background = decode(&plain).get_pixel(4, 12).0;
        assert!(edge[1] > background[1] + 60, "expected box edge, got {edge:?}");
    }

    #[test]
    fn boxes_are_drawn_directly_into_an_image() {
        let mut image = RgbImage::new(20, 20);
        let set = DetectionSet::new(vec![Detection::new(
            1,
            0.5,
            BoundingBox::new(10.0, 10.0, 30.0, 30.0),
        )]);
        draw_detections(&mut image, &set, Resolution::new(40, 40));
        assert_eq!(image.get_pixel(5, 5), &class_color(1));
        assert_eq!(image.get_pixel(10, 10), &Rgb([0, 0, 0]));
    }

    #[test]
    fn jpeg_quality_is_clamped() {
        assert_eq!(JpegEncoder::new(0).quality(), 1);
        assert_eq!(JpegEncoder::new(200).quality(), 100);
        assert_eq!(JpegEncoder::default().quality(), 75);
    }
}
