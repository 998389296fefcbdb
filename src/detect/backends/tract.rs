#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use tract_onnx::prelude::*;

use crate::detect::backend::Detector;
use crate::detect::nms::non_max_suppression;
use crate::frame::{BoundingBox, Detection, DetectionSet, Frame};

const CXCYWH: usize = 4;
const PAD_VALUE: u8 = 114;

/// Tract-based backend for YOLOv8-style ONNX detection models.
///
/// Expects a square `[1, 3, size, size]` float input and a
/// `[1, 4 + classes, anchors]` output (center x/y, width, height, class scores).
/// It performs no network I/O and writes nothing to disk.
pub struct TractDetector {
    model: TypedRunnableModel<TypedModel>,
    input_size: u32,
    confidence_threshold: f32,
    iou_threshold: f32,
}

impl TractDetector {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let size = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            input_size,
            confidence_threshold: 0.25,
            iou_threshold: 0.45,
        })
    }

    pub fn with_thresholds(mut self, confidence: f32, iou: f32) -> Self {
        self.confidence_threshold = confidence;
        self.iou_threshold = iou;
        self
    }

    /// Letterbox the frame into the model input. Returns the tensor and the
    /// scale applied to the frame.
    fn build_input(&self, image: &RgbImage) -> Result<(Tensor, f32)> {
        let (w0, h0) = image.dimensions();
        if w0 == 0 || h0 == 0 {
            return Err(anyhow!("frame has zero size"));
        }
        let size = self.input_size;
        let ratio = (size as f32 / w0 as f32).min(size as f32 / h0 as f32);
        let w1 = ((w0 as f32 * ratio).round() as u32).clamp(1, size);
        let h1 = ((h0 as f32 * ratio).round() as u32).clamp(1, size);
        let resized = imageops::resize(image, w1, h1, FilterType::Triangle);

        let mut canvas = RgbImage::from_pixel(size, size, Rgb([PAD_VALUE; 3]));
        imageops::replace(&mut canvas, &resized, 0, 0);

        let side = size as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
            canvas.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
        });
        Ok((input.into_tensor(), ratio))
    }

    fn decode(&self, outputs: TVec<TValue>, ratio: f32, frame: &Frame) -> Result<DetectionSet> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let preds = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = preds.shape().to_vec();
        if shape.len() != 3 || shape[1] <= CXCYWH {
            return Err(anyhow!("unexpected model output shape {:?}", shape));
        }
        let preds = preds
            .into_dimensionality::<tract_ndarray::Ix3>()
            .context("model output is not rank 3")?;
        let classes = shape[1] - CXCYWH;
        let anchors = shape[2];
        let bounds = frame.resolution();

        let mut detections = Vec::new();
        for a in 0..anchors {
            let (class_id, confidence) = (0..classes)
                .map(|c| (c, preds[[0, CXCYWH + c, a]]))
                .fold((0, f32::NEG_INFINITY), |best, x| if x.1 > best.1 { x } else { best });
            if confidence < self.confidence_threshold {
                continue;
            }
            let bbox = BoundingBox::from_center(
                preds[[0, 0, a]] / ratio,
                preds[[0, 1, a]] / ratio,
                preds[[0, 2, a]] / ratio,
                preds[[0, 3, a]] / ratio,
            )
            .clamped(bounds);
            detections.push(Detection::new(class_id as u32, confidence, bbox));
        }

        non_max_suppression(&mut detections, self.iou_threshold);
        Ok(DetectionSet::new(detections))
    }
}

impl Detector for TractDetector {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&self, frame: &Frame) -> Result<DetectionSet> {
        let (input, ratio) = self.build_input(frame.image())?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs, ratio, frame)
    }

    fn warm_up(&self) -> Result<()> {
        let blank = Frame::new(0, RgbImage::new(self.input_size, self.input_size));
        self.detect(&blank).map(|_| ())
    }
}
