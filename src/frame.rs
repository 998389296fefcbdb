//! Captured frames and detection results.
//!
//! - `Frame`: an immutable captured image tagged with its per-camera frame id.
//! - `DetectionSet`: ordered detections computed from one frame.
//!
//! A `Frame` is cheap to clone (the pixel buffer sits behind an `Arc`) and is
//! never mutated after capture, so handing a clone to the inference pool cannot
//! expose later writes.

use std::ops::Deref;
use std::sync::Arc;
use std::time::Instant;

use image::RgbImage;
use serde::ser::SerializeTuple;
use serde::{Deserialize, Serialize, Serializer};

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Clone, Debug)]
pub struct Frame {
    /// Value of the camera's frame counter when this frame was read (1-based).
    pub id: u64,
    image: Arc<RgbImage>,
    /// Monotonic capture instant.
    pub captured_at: Instant,
}

impl Frame {
    pub fn new(id: u64, image: RgbImage) -> Self {
        Self {
            id,
            image: Arc::new(image),
            captured_at: Instant::now(),
        }
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.image.width(), self.image.height())
    }

    /// True when both frames share the same pixel buffer.
    pub fn same_image(&self, other: &Frame) -> bool {
        Arc::ptr_eq(&self.image, &other.image)
    }
}

// ----------------------------------------------------------------------------
// Detections
// ----------------------------------------------------------------------------

/// Axis-aligned box in pixel coordinates of the frame it was computed from.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
#[serde(from = "[f32; 4]")]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x1: x1.min(x2),
            y1: y1.min(y2),
            x2: x1.max(x2),
            y2: y1.max(y2),
        }
    }

    /// Build from a center point and size (the layout most detector heads emit).
    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self::new(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0)
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let l = self.x1.max(other.x1);
        let r = self.x2.min(other.x2);
        let t = self.y1.max(other.y1);
        let b = self.y2.min(other.y2);
        let inter = (r - l).max(0.0) * (b - t).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    /// Scale from one resolution to another.
    pub fn scaled(&self, from: Resolution, to: Resolution) -> Self {
        if from == to || from.width == 0 || from.height == 0 {
            return *self;
        }
        let sx = to.width as f32 / from.width as f32;
        let sy = to.height as f32 / from.height as f32;
        Self::new(self.x1 * sx, self.y1 * sy, self.x2 * sx, self.y2 * sy)
    }

    pub fn clamped(&self, bounds: Resolution) -> Self {
        let w = bounds.width as f32;
        let h = bounds.height as f32;
        Self::new(
            self.x1.clamp(0.0, w),
            self.y1.clamp(0.0, h),
            self.x2.clamp(0.0, w),
            self.y2.clamp(0.0, h),
        )
    }
}

impl From<[f32; 4]> for BoundingBox {
    fn from(v: [f32; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

impl Serialize for BoundingBox {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tup = serializer.serialize_tuple(4)?;
        tup.serialize_element(&self.x1)?;
        tup.serialize_element(&self.y1)?;
        tup.serialize_element(&self.x2)?;
        tup.serialize_element(&self.y2)?;
        tup.end()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(rename = "class")]
    pub class_id: u32,
    /// Always within `[0, 1]`.
    pub confidence: f32,
    pub bbox: BoundingBox,
}

impl Detection {
    pub fn new(class_id: u32, confidence: f32, bbox: BoundingBox) -> Self {
        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            class_id,
            confidence,
            bbox,
        }
    }
}

/// Ordered detections for one frame.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DetectionSet(Vec<Detection>);

impl DetectionSet {
    pub fn new(detections: Vec<Detection>) -> Self {
        Self(detections)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn into_vec(self) -> Vec<Detection> {
        self.0
    }
}

impl Deref for DetectionSet {
    type Target = [Detection];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Vec<Detection>> for DetectionSet {
    fn from(v: Vec<Detection>) -> Self {
        Self(v)
    }
}

impl FromIterator<Detection> for DetectionSet {
    fn from_iter<I: IntoIterator<Item = Detection>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
