//! SCRFD face detector via ONNX Runtime.
//!
//! Letterboxes an RGB photo to 640×640, decodes the three anchor-free
//! stride heads (8/16/32) into boxes with five landmarks, then applies NMS.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} (download the insightface model pack into the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Scale and padding applied when fitting the photo into the square input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: u32,
    pad_y: u32,
}

impl Letterbox {
    fn fit(width: u32, height: u32) -> (Self, u32, u32) {
        let side = SCRFD_INPUT_SIZE as f32;
        let scale = (side / width as f32).min(side / height as f32);
        let new_w = ((width as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
        let new_h = ((height as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
        let letterbox = Self {
            scale,
            pad_x: (SCRFD_INPUT_SIZE - new_w) / 2,
            pad_y: (SCRFD_INPUT_SIZE - new_h) / 2,
        };
        (letterbox, new_w, new_h)
    }

    /// Map a point from letterboxed input space back to photo space.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad_x as f32) / self.scale,
            (y - self.pad_y as f32) / self.scale,
        )
    }
}

/// Output tensor indices for one stride: (score, bbox, kps).
type StrideOutputs = (usize, usize, usize);

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    stride_outputs: [StrideOutputs; 3],
}

impl FaceDetector {
    /// Load an SCRFD ONNX model (det_10g, det_500m, ...) from the given path.
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model needs 9 outputs (score/bbox/kps per stride), got {}",
                output_names.len()
            )));
        }

        let stride_outputs = map_outputs(&output_names);
        tracing::info!(
            path = %model_path.display(),
            outputs = ?output_names,
            ?stride_outputs,
            "loaded SCRFD model"
        );

        Ok(Self { session, stride_outputs })
    }

    /// Detect faces, highest confidence first.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let (input, letterbox) = preprocess(image);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.stride_outputs[slot];
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let heads = StrideHeads {
                scores: extract(score_idx, "scores")?,
                bboxes: extract(bbox_idx, "bboxes")?,
                kps: extract(kps_idx, "kps")?,
            };
            candidates.extend(heads.decode(stride, &letterbox, SCRFD_CONFIDENCE_THRESHOLD));
        }

        Ok(nms(candidates, SCRFD_NMS_THRESHOLD))
    }
}

/// Letterbox into a 1×3×640×640 RGB tensor normalized to the SCRFD input range.
fn preprocess(image: &RgbImage) -> (Array4<f32>, Letterbox) {
    let (letterbox, new_w, new_h) = Letterbox::fit(image.width(), image.height());
    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

    let side = SCRFD_INPUT_SIZE as usize;
    // Padding is left at 0.0, i.e. SCRFD_MEAN before normalization.
    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let tx = (x + letterbox.pad_x) as usize;
        let ty = (y + letterbox.pad_y) as usize;
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }
    (tensor, letterbox)
}

/// Pick output tensors per stride by name ("score_8", "bbox_16", ...).
///
/// Exports with numeric tensor names fall back to the standard positional
/// layout: [0-2] scores, [3-5] bboxes, [6-8] kps.
fn map_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let find = |head: &str, stride: usize| {
        let wanted = format!("{head}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let named: Option<Vec<StrideOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&s| Some((find("score", s)?, find("bbox", s)?, find("kps", s)?)))
        .collect();

    match named {
        Some(v) => [v[0], v[1], v[2]],
        None => {
            tracing::debug!(?names, "SCRFD output names not recognized, using positional mapping");
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

/// Raw head outputs for one stride.
struct StrideHeads<'a> {
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: &'a [f32],
}

impl StrideHeads<'_> {
    fn decode(&self, stride: usize, letterbox: &Letterbox, threshold: f32) -> Vec<BoundingBox> {
        let grid = SCRFD_INPUT_SIZE as usize / stride;
        let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
        let s = stride as f32;

        (0..anchors)
            .filter_map(|idx| {
                let score = *self.scores.get(idx)?;
                if score <= threshold {
                    return None;
                }
                let cell = idx / SCRFD_ANCHORS_PER_CELL;
                let ax = (cell % grid) as f32 * s;
                let ay = (cell / grid) as f32 * s;

                let b = self.bboxes.get(idx * 4..idx * 4 + 4)?;
                let (x1, y1) = letterbox.unmap(ax - b[0] * s, ay - b[1] * s);
                let (x2, y2) = letterbox.unmap(ax + b[2] * s, ay + b[3] * s);

                let landmarks = self.kps.get(idx * 10..idx * 10 + 10).map(|k| {
                    std::array::from_fn(|i| letterbox.unmap(ax + k[i * 2] * s, ay + k[i * 2 + 1] * s))
                });

                Some(BoundingBox {
                    x: x1,
                    y: y1,
                    width: x2 - x1,
                    height: y2 - y1,
                    confidence: score,
                    landmarks,
                })
            })
            .collect()
    }
}

/// Greedy non-maximum suppression; output is sorted by confidence, descending.
fn nms(mut boxes: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut keep: Vec<BoundingBox> = Vec::new();
    for candidate in boxes {
        if keep.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

/// Intersection-over-Union between two bounding boxes.
fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let inter_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let inter_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = inter_w * inter_h;
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 { inter / union } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn bbox(x: f32, y: f32, w: f32, h: f32, conf: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence: conf, landmarks: None }
    }

    #[test]
    fn test_iou_identical() {
        let a = bbox(0.0, 0.0, 100.0, 100.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_no_overlap() {
        let a = bbox(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = bbox(20.0, 20.0, 10.0, 10.0, 1.0);
        assert_eq!(iou(&a, &b), 0.0);
    }

    #[test]
    fn test_iou_partial() {
        let a = bbox(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = bbox(5.0, 0.0, 10.0, 10.0, 1.0);
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let result = nms(
            vec![
                bbox(5.0, 5.0, 100.0, 100.0, 0.8),
                bbox(200.0, 200.0, 50.0, 50.0, 0.7),
                bbox(0.0, 0.0, 100.0, 100.0, 0.9),
            ],
            0.4,
        );
        let confs: Vec<f32> = result.iter().map(|b| b.confidence).collect();
        assert_eq!(confs, [0.9, 0.7]);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_letterbox_unmap_roundtrip() {
        let (lb, new_w, new_h) = Letterbox::fit(320, 240);
        assert_eq!((new_w, new_h), (640, 480));
        assert_eq!((lb.pad_x, lb.pad_y), (0, 80));

        let (x, y) = (100.0f32, 50.0f32);
        let (rx, ry) = lb.unmap(x * lb.scale + lb.pad_x as f32, y * lb.scale + lb.pad_y as f32);
        assert!((rx - x).abs() < 0.01 && (ry - y).abs() < 0.01);
    }

    #[test]
    fn test_letterbox_tiny_image() {
        let (_, new_w, new_h) = Letterbox::fit(1, 1000);
        assert!(new_w >= 1 && new_h == 640);
    }

    #[test]
    fn test_preprocess_shape_and_padding() {
        let img = RgbImage::from_pixel(320, 160, Rgb([255, 0, 128]));
        let (tensor, lb) = preprocess(&img);
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        // Top padding row is neutral.
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        // Inside the image: channels keep RGB order.
        let y = lb.pad_y as usize + 10;
        assert!((tensor[[0, 0, y, 10]] - (255.0 - SCRFD_MEAN) / SCRFD_STD).abs() < 1e-3);
        assert!((tensor[[0, 1, y, 10]] - (0.0 - SCRFD_MEAN) / SCRFD_STD).abs() < 1e-3);
    }

    #[test]
    fn test_map_outputs_named_shuffled() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8",
            "bbox_16", "kps_16", "score_16",
            "bbox_32", "kps_32", "score_32",
        ].iter().map(|s| s.to_string()).collect();
        assert_eq!(map_outputs(&names), [(2, 0, 1), (5, 3, 4), (8, 6, 7)]);
    }

    #[test]
    fn test_map_outputs_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| (428 + i).to_string()).collect();
        assert_eq!(map_outputs(&names), [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }

    #[test]
    fn test_decode_single_anchor() {
        // stride 32 → 20×20 grid, 800 anchors. Fire anchor for cell (x=2, y=1).
        let grid = 20;
        let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
        let idx = (grid + 2) * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; anchors];
        scores[idx] = 0.9;
        let mut bboxes = vec![0.0f32; anchors * 4];
        bboxes[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);
        let kps = vec![0.0f32; anchors * 10];

        let heads = StrideHeads { scores: &scores, bboxes: &bboxes, kps: &kps };
        let lb = Letterbox { scale: 1.0, pad_x: 0, pad_y: 0 };
        let dets = heads.decode(32, &lb, 0.5);

        assert_eq!(dets.len(), 1);
        let d = &dets[0];
        assert_eq!((d.x, d.y, d.width, d.height), (32.0, 0.0, 64.0, 64.0));
        assert_eq!(d.landmarks.unwrap()[0], (64.0, 32.0));
    }
}
