#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{Detection, Region};
use crate::frame::{CaptureTime, Frame};

/// COCO class names in model output order.
const COCO_LABELS: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich",
    "orange", "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch",
    "potted plant", "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote",
    "keyboard", "cell phone", "microwave", "oven", "toaster", "sink", "refrigerator", "book",
    "clock", "vase", "scissors", "teddy bear", "hair drier", "toothbrush",
];

/// Candidates below this score are never reported; the gateway threshold applies on top.
const MIN_REPORTED_SCORE: f32 = 0.25;

/// Tract-based backend for YOLOv8-style ONNX detectors.
///
/// Expects a single `[1, 3, S, S]` float input and a `[1, 4 + classes, anchors]`
/// output (`cx, cy, w, h` in input pixels followed by per-class scores).
/// Frames are resized to the model input with nearest-neighbour sampling.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    input_size: u32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let side = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, side, side)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self { model, input_size })
    }

    fn build_input(&self, frame: &Frame) -> Result<Tensor> {
        let (width, height) = frame.dimensions();
        let expected_len = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        let pixels = frame.pixels();
        if pixels.len() != expected_len || expected_len == 0 {
            return Err(anyhow!(
                "expected {} RGB bytes, received {}",
                expected_len,
                pixels.len()
            ));
        }

        let side = self.input_size as usize;
        let (src_w, src_h) = (width as usize, height as usize);
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
            let sx = x * src_w / side;
            let sy = y * src_h / side;
            pixels[(sy * src_w + sx) * 3 + c] as f32 / 255.0
        });

        Ok(input.into_tensor())
    }

    fn decode(&self, outputs: TVec<TValue>) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?
            .into_dimensionality::<tract_ndarray::Ix3>()
            .context("model output is not [1, 4 + classes, anchors]")?;

        let (_, rows, anchors) = view.dim();
        if rows <= 4 {
            return Err(anyhow!("model output has no class rows"));
        }
        let side = self.input_size as f32;

        let mut detections = Vec::new();
        for anchor in 0..anchors {
            let (class_idx, score) = (4..rows)
                .map(|row| (row - 4, view[(0, row, anchor)]))
                .fold((0, f32::NEG_INFINITY), |best, cur| {
                    if cur.1 > best.1 {
                        cur
                    } else {
                        best
                    }
                });
            if !score.is_finite() || score < MIN_REPORTED_SCORE {
                continue;
            }

            let (cx, cy) = (view[(0, 0, anchor)], view[(0, 1, anchor)]);
            let (w, h) = (view[(0, 2, anchor)], view[(0, 3, anchor)]);
            let label = COCO_LABELS
                .get(class_idx)
                .map(|label| label.to_string())
                .unwrap_or_else(|| format!("class_{}", class_idx));
            let region = Region {
                x: ((cx - w / 2.0) / side).clamp(0.0, 1.0),
                y: ((cy - h / 2.0) / side).clamp(0.0, 1.0),
                w: (w / side).clamp(0.0, 1.0),
                h: (h / side).clamp(0.0, 1.0),
            };
            detections.push(Detection::new(label, score.min(1.0), region));
        }

        detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        Ok(detections)
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let input = self.build_input(frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs)
    }

    /// One inference on a black frame, so a model whose output does not decode
    /// fails at startup instead of on every sampled frame.
    fn warm_up(&mut self) -> Result<()> {
        let side = self.input_size;
        let blank = Frame::new(
            0,
            CaptureTime::now(),
            side,
            side,
            vec![0u8; (side * side * 3) as usize],
        );
        let started = std::time::Instant::now();
        self.detect(&blank).context("warm-up inference failed")?;
        log::info!(
            "tract detector warmed up in {} ms",
            started.elapsed().as_millis()
        );
        Ok(())
    }
}
