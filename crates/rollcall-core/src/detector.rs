//! SCRFD face detector via ONNX Runtime.
//!
//! Runs the pre-trained SCRFD detection model (anchor-free, three stride
//! levels) and decodes its raw outputs into frame-space bounding boxes with
//! five-point landmarks. The same detector serves the live camera loop and
//! the training pass over registration images.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const DET_INPUT_SIZE: u32 = 640;
const DET_MEAN: f32 = 127.5;
const DET_STD: f32 = 128.0;
const DET_SCORE_THRESHOLD: f32 = 0.5;
const DET_NMS_IOU: f32 = 0.4;
const DET_STRIDES: [usize; 3] = [8, 16, 32];
const DET_ANCHORS_PER_CELL: usize = 2;
/// 3 strides × (scores, boxes, landmarks).
const DET_OUTPUT_COUNT: usize = 9;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} — download det_10g.onnx from insightface")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Maps letterboxed tensor coordinates back to source-frame pixels.
struct Letterbox {
    scale: f32,
    dx: f32,
    dy: f32,
}

impl Letterbox {
    fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.dx) / self.scale, (y - self.dy) / self.scale)
    }
}

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> =
            session.outputs().iter().map(|o| o.name().to_string()).collect();
        let num_outputs = output_names.len();
        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        // Standard SCRFD export order: [0-2] scores, [3-5] boxes, [6-8]
        // landmarks, each for strides 8/16/32.
        if num_outputs != DET_OUTPUT_COUNT {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model must have {DET_OUTPUT_COUNT} outputs, got {num_outputs}"
            )));
        }

        Ok(Self { session })
    }

    /// Detect faces in a grayscale frame.
    ///
    /// Returns bounding boxes in source-frame pixel coordinates, sorted by
    /// confidence descending. An empty result is not an error.
    pub fn detect(&mut self, frame: &GrayImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let (input, letterbox) = preprocess(frame);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut detections = Vec::new();
        for (level, &stride) in DET_STRIDES.iter().enumerate() {
            let (_, scores) = outputs[level]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, boxes) = outputs[level + 3]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("boxes stride {stride}: {e}")))?;
            let (_, landmarks) = outputs[level + 6]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("landmarks stride {stride}: {e}")))?;

            decode_level(scores, boxes, landmarks, stride, &letterbox, &mut detections);
        }

        let mut kept = suppress(detections, DET_NMS_IOU);
        kept.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(kept)
    }
}

/// Letterbox a grayscale frame into the 640×640 NCHW input tensor.
///
/// The frame is scaled to fit, centered, and normalized; the padding stays at
/// 0.0, which is exactly the normalized value of the model's mean pixel.
fn preprocess(frame: &GrayImage) -> (Array4<f32>, Letterbox) {
    let (w, h) = frame.dimensions();
    let scale = (DET_INPUT_SIZE as f32 / w as f32).min(DET_INPUT_SIZE as f32 / h as f32);
    let new_w = ((w as f32 * scale).round() as u32).max(1);
    let new_h = ((h as f32 * scale).round() as u32).max(1);
    let dx = (DET_INPUT_SIZE - new_w) / 2;
    let dy = (DET_INPUT_SIZE - new_h) / 2;

    let resized = imageops::resize(frame, new_w, new_h, FilterType::Triangle);

    let size = DET_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let normalized = (pixel.0[0] as f32 - DET_MEAN) / DET_STD;
        let (tx, ty) = ((x + dx) as usize, (y + dy) as usize);
        // Grayscale replicated across the three input channels.
        tensor[[0, 0, ty, tx]] = normalized;
        tensor[[0, 1, ty, tx]] = normalized;
        tensor[[0, 2, ty, tx]] = normalized;
    }

    (
        tensor,
        Letterbox {
            scale,
            dx: dx as f32,
            dy: dy as f32,
        },
    )
}

/// Decode one stride level of raw SCRFD outputs into frame-space detections.
fn decode_level(
    scores: &[f32],
    boxes: &[f32],
    landmarks: &[f32],
    stride: usize,
    letterbox: &Letterbox,
    out: &mut Vec<BoundingBox>,
) {
    let grid_w = DET_INPUT_SIZE as usize / stride;
    let grid_h = DET_INPUT_SIZE as usize / stride;
    let anchors = grid_w * grid_h * DET_ANCHORS_PER_CELL;

    for (idx, bb) in boxes.chunks_exact(4).enumerate().take(anchors) {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= DET_SCORE_THRESHOLD {
            continue;
        }

        let cell = idx / DET_ANCHORS_PER_CELL;
        let anchor_x = ((cell % grid_w) * stride) as f32;
        let anchor_y = ((cell / grid_w) * stride) as f32;
        let s = stride as f32;

        // Box offsets are distances from the anchor center, in stride units.
        let (x0, y0) = letterbox.to_frame(anchor_x - bb[0] * s, anchor_y - bb[1] * s);
        let (x1, y1) = letterbox.to_frame(anchor_x + bb[2] * s, anchor_y + bb[3] * s);

        let points = landmarks.get(idx * 10..idx * 10 + 10).map(|lm| {
            std::array::from_fn(|i| {
                letterbox.to_frame(anchor_x + lm[i * 2] * s, anchor_y + lm[i * 2 + 1] * s)
            })
        });

        out.push(BoundingBox {
            x: x0,
            y: y0,
            width: x1 - x0,
            height: y1 - y0,
            confidence: score,
            landmarks: points,
        });
    }
}

/// Non-maximum suppression: greedily keep the strongest detection and drop
/// anything overlapping it beyond the IoU limit.
fn suppress(mut detections: Vec<BoundingBox>, iou_limit: f32) -> Vec<BoundingBox> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut kept: Vec<BoundingBox> = Vec::new();
    'candidates: for det in detections {
        for k in &kept {
            if iou(k, &det) > iou_limit {
                continue 'candidates;
            }
        }
        kept.push(det);
    }
    kept
}

/// Intersection-over-union of two boxes.
fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let x0 = a.x.max(b.x);
    let y0 = a.y.max(b.y);
    let x1 = (a.x + a.width).min(b.x + b.width);
    let y1 = (a.y + a.height).min(b.y + b.height);

    let inter = (x1 - x0).max(0.0) * (y1 - y0).max(0.0);
    let union = a.width * a.height + b.width * b.height - inter;

    if union > 0.0 { inter / union } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: f32, y: f32, w: f32, h: f32, conf: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence: conf, landmarks: None }
    }

    #[test]
    fn iou_identical() {
        let a = bbox(0.0, 0.0, 100.0, 100.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_disjoint() {
        let a = bbox(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = bbox(20.0, 20.0, 10.0, 10.0, 1.0);
        assert!(iou(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn iou_half_overlap() {
        let a = bbox(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = bbox(5.0, 0.0, 10.0, 10.0, 1.0);
        // intersection 50, union 150
        assert!((iou(&a, &b) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn suppress_drops_overlapping() {
        let dets = vec![
            bbox(0.0, 0.0, 100.0, 100.0, 0.9),
            bbox(5.0, 5.0, 100.0, 100.0, 0.8),
            bbox(200.0, 200.0, 50.0, 50.0, 0.7),
        ];
        let kept = suppress(dets, 0.4);
        assert_eq!(kept.len(), 2);
        assert!((kept[0].confidence - 0.9).abs() < 1e-6);
        assert!((kept[1].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn suppress_keeps_distant_faces() {
        // Two people side by side must both survive.
        let dets = vec![
            bbox(0.0, 0.0, 80.0, 80.0, 0.95),
            bbox(300.0, 0.0, 80.0, 80.0, 0.85),
        ];
        assert_eq!(suppress(dets, 0.4).len(), 2);
    }

    #[test]
    fn suppress_empty() {
        assert!(suppress(vec![], 0.4).is_empty());
    }

    #[test]
    fn letterbox_roundtrip() {
        // 320×240 frame letterboxed into 640×640: scale 2, vertical padding.
        let frame = GrayImage::from_pixel(320, 240, image::Luma([127]));
        let (_, lb) = preprocess(&frame);

        assert!((lb.scale - 2.0).abs() < 1e-6);
        let (fx, fy) = lb.to_frame(100.0 * lb.scale + lb.dx, 50.0 * lb.scale + lb.dy);
        assert!((fx - 100.0).abs() < 0.1);
        assert!((fy - 50.0).abs() < 0.1);
    }

    #[test]
    fn preprocess_tensor_shape_and_padding() {
        let frame = GrayImage::from_pixel(320, 240, image::Luma([128]));
        let (tensor, _) = preprocess(&frame);

        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        // Top-left corner is letterbox padding and must stay at the
        // normalized mean (0.0 within rounding of the mean pixel).
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        // Center lands inside the frame content.
        let center = tensor[[0, 0, 320, 320]];
        assert!((center - (128.0 - DET_MEAN) / DET_STD).abs() < 0.05);
    }

    #[test]
    fn decode_level_maps_anchor_offsets() {
        // One confident anchor at cell (1, 1) of the stride-32 grid with
        // symmetric one-stride offsets: a 64×64 box centered on the anchor.
        let grid = 640 / 32;
        let anchors = grid * grid * DET_ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; anchors];
        let mut boxes = vec![0.0f32; anchors * 4];
        let landmarks = vec![0.0f32; anchors * 10];

        let idx = (grid + 1) * DET_ANCHORS_PER_CELL; // cell (x=1, y=1), anchor 0
        scores[idx] = 0.9;
        boxes[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);

        let lb = Letterbox { scale: 1.0, dx: 0.0, dy: 0.0 };
        let mut out = Vec::new();
        decode_level(&scores, &boxes, &landmarks, 32, &lb, &mut out);

        assert_eq!(out.len(), 1);
        let det = &out[0];
        assert!((det.x - 0.0).abs() < 1e-4);
        assert!((det.y - 0.0).abs() < 1e-4);
        assert!((det.width - 64.0).abs() < 1e-4);
        assert!((det.height - 64.0).abs() < 1e-4);
        assert!(det.landmarks.is_some());
    }

    #[test]
    fn decode_level_skips_low_scores() {
        let grid = 640 / 32;
        let anchors = grid * grid * DET_ANCHORS_PER_CELL;
        let scores = vec![0.1f32; anchors];
        let boxes = vec![1.0f32; anchors * 4];
        let landmarks = vec![0.0f32; anchors * 10];

        let lb = Letterbox { scale: 1.0, dx: 0.0, dy: 0.0 };
        let mut out = Vec::new();
        decode_level(&scores, &boxes, &landmarks, 32, &lb, &mut out);
        assert!(out.is_empty());
    }
}
