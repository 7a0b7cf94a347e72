//! Face detection seam and the SCRFD backend.
//!
//! [`FaceDetector`] is what the pipeline consumes; [`ScrfdDetector`] runs the
//! SCRFD model through ONNX Runtime with 3-stride anchor decoding and NMS.

use crate::config::DetectorModel;
use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_BASE_INPUT: usize = 320;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_SCORE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_IOU: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Anything that can locate faces in an RGB image.
///
/// Implementations return every detection, best first. Deciding how many
/// faces are acceptable is the caller's job.
pub trait FaceDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError>;
}

/// Scale and padding applied when fitting the image into the square input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    /// Network-input coordinates back to image coordinates.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor positions for one stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrideOutputs {
    score: usize,
    bbox: usize,
    kps: usize,
}

/// Raw SCRFD tensors for one stride level.
struct StrideTensors<'a> {
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: &'a [f32],
}

pub struct ScrfdDetector {
    session: Session,
    input_size: usize,
    outputs: [StrideOutputs; 3],
}

impl ScrfdDetector {
    /// Load `model` from `model_dir`, with the network input side set to
    /// `320 << upsample`.
    pub fn load(model_dir: &Path, model: DetectorModel, upsample: u32) -> Result<Self, DetectorError> {
        let model_path = model_dir.join(model.file_name());
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(&model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD needs score/bbox/kps outputs for 3 strides, model has {}",
                names.len()
            )));
        }

        let input_size = input_size_for(upsample);
        let outputs = locate_outputs(&names);
        tracing::info!(path = %model_path.display(), input_size, ?model, "loaded SCRFD model");

        Ok(Self {
            session,
            input_size,
            outputs,
        })
    }

    /// Letterbox `image` into a normalized NCHW tensor.
    fn to_tensor(&self, image: &RgbImage) -> (Array4<f32>, Letterbox) {
        let side = self.input_size;
        let (w, h) = (image.width() as f32, image.height() as f32);
        let scale = (side as f32 / w).min(side as f32 / h);
        let fit_w = ((w * scale).round() as usize).clamp(1, side);
        let fit_h = ((h * scale).round() as usize).clamp(1, side);
        let off_x = (side - fit_w) / 2;
        let off_y = (side - fit_h) / 2;

        let fitted = imageops::resize(image, fit_w as u32, fit_h as u32, FilterType::Triangle);
        // Padding stays 0.0, i.e. SCRFD_MEAN after normalization.
        let tensor = Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
            let (fx, fy) = (x.wrapping_sub(off_x), y.wrapping_sub(off_y));
            if fx < fit_w && fy < fit_h {
                (fitted.get_pixel(fx as u32, fy as u32)[c] as f32 - SCRFD_MEAN) / SCRFD_STD
            } else {
                0.0
            }
        });

        let letterbox = Letterbox {
            scale,
            pad_x: off_x as f32,
            pad_y: off_y as f32,
        };
        (tensor, letterbox)
    }
}

impl FaceDetector for ScrfdDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }
        let (input, letterbox) = self.to_tensor(image);
        let results = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let extract = |idx: usize, what: &str, stride: usize| {
            results[idx]
                .try_extract_tensor::<f32>()
                .map(|(_, data)| data)
                .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
        };

        let mut candidates = Vec::new();
        for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let at = self.outputs[slot];
            let tensors = StrideTensors {
                scores: extract(at.score, "scores", stride)?,
                bboxes: extract(at.bbox, "bboxes", stride)?,
                kps: extract(at.kps, "kps", stride)?,
            };
            candidates.extend(decode_stride(&tensors, stride, self.input_size, &letterbox, SCRFD_SCORE_THRESHOLD));
        }

        let faces = nms(candidates, SCRFD_NMS_IOU);
        tracing::trace!(faces = faces.len(), "SCRFD detections");
        Ok(faces)
    }
}

fn input_size_for(upsample: u32) -> usize {
    SCRFD_BASE_INPUT << upsample
}

/// Map outputs by name (`score_8`, `bbox_16`, ...). Exports without those
/// names use the conventional order: scores, then bboxes, then kps.
fn locate_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let position = |kind: &str, stride: usize| {
        let wanted = format!("{kind}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let named: Option<Vec<StrideOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| {
            Some(StrideOutputs {
                score: position("score", stride)?,
                bbox: position("bbox", stride)?,
                kps: position("kps", stride)?,
            })
        })
        .collect();

    match named {
        Some(found) => [found[0], found[1], found[2]],
        None => {
            tracing::debug!(?names, "unnamed SCRFD outputs, assuming positional order");
            std::array::from_fn(|i| StrideOutputs {
                score: i,
                bbox: i + 3,
                kps: i + 6,
            })
        }
    }
}

/// Anchor-relative boxes and landmarks above `threshold` for one stride.
fn decode_stride(
    tensors: &StrideTensors<'_>,
    stride: usize,
    input_size: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<BoundingBox> {
    let cells = input_size / stride;
    let anchors = cells * cells * SCRFD_ANCHORS_PER_CELL;
    let step = stride as f32;

    (0..anchors.min(tensors.scores.len()))
        .filter(|&a| tensors.scores[a] > threshold)
        .filter_map(|a| {
            let cell = a / SCRFD_ANCHORS_PER_CELL;
            let cx = ((cell % cells) * stride) as f32;
            let cy = ((cell / cells) * stride) as f32;

            let d = tensors.bboxes.get(a * 4..a * 4 + 4)?;
            let (x1, y1) = letterbox.unmap(cx - d[0] * step, cy - d[1] * step);
            let (x2, y2) = letterbox.unmap(cx + d[2] * step, cy + d[3] * step);

            let landmarks = tensors.kps.get(a * 10..a * 10 + 10).map(|k| {
                std::array::from_fn(|p| letterbox.unmap(cx + k[2 * p] * step, cy + k[2 * p + 1] * step))
            });

            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: tensors.scores[a],
                landmarks,
            })
        })
        .collect()
}

/// Greedy suppression, highest confidence first. Output is sorted by confidence.
fn nms(mut boxes: Vec<BoundingBox>, max_iou: f32) -> Vec<BoundingBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<BoundingBox> = Vec::with_capacity(boxes.len());
    for candidate in boxes {
        if !kept.iter().any(|k| iou(k, &candidate) > max_iou) {
            kept.push(candidate);
        }
    }
    kept
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let overlap_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let overlap_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let overlap = overlap_w * overlap_h;
    let union = a.width * a.height + b.width * b.height - overlap;
    if union <= 0.0 {
        return 0.0;
    }
    overlap / union
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x: f32, y: f32, side: f32, confidence: f32) -> BoundingBox {
        BoundingBox {
            x,
            y,
            width: side,
            height: side,
            confidence,
            landmarks: None,
        }
    }

    #[test]
    fn test_iou_values() {
        let a = face(0.0, 0.0, 10.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
        let shifted = face(5.0, 0.0, 10.0, 1.0);
        assert!((iou(&a, &shifted) - 50.0 / 150.0).abs() < 1e-6);
        assert_eq!(iou(&a, &face(20.0, 20.0, 5.0, 1.0)), 0.0);
    }

    #[test]
    fn test_nms_keeps_best_of_overlapping_pair() {
        let kept = nms(
            vec![
                face(4.0, 4.0, 90.0, 0.8),
                face(300.0, 0.0, 40.0, 0.6),
                face(0.0, 0.0, 90.0, 0.95),
            ],
            SCRFD_NMS_IOU,
        );
        let confidences: Vec<f32> = kept.iter().map(|b| b.confidence).collect();
        assert_eq!(confidences, [0.95, 0.6]);
        assert!(nms(Vec::new(), SCRFD_NMS_IOU).is_empty());
    }

    #[test]
    fn test_upsample_doubles_input_side() {
        assert_eq!(input_size_for(0), 320);
        assert_eq!(input_size_for(1), 640);
        assert_eq!(input_size_for(3), 2560);
    }

    #[test]
    fn test_outputs_located_by_name() {
        let names: Vec<String> = ["kps_8", "score_8", "bbox_8", "kps_16", "score_16", "bbox_16", "kps_32", "score_32", "bbox_32"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let found = locate_outputs(&names);
        assert_eq!(found[0], StrideOutputs { score: 1, bbox: 2, kps: 0 });
        assert_eq!(found[2], StrideOutputs { score: 7, bbox: 8, kps: 6 });
    }

    #[test]
    fn test_outputs_positional_when_unnamed() {
        let names: Vec<String> = (0..9).map(|i| format!("out{i}")).collect();
        let found = locate_outputs(&names);
        assert_eq!(found[1], StrideOutputs { score: 1, bbox: 4, kps: 7 });
    }

    #[test]
    fn test_decode_stride_undoes_letterbox() {
        // 64px input, stride 32: a 2x2 grid. Fire the second anchor of cell (1, 1).
        let letterbox = Letterbox { scale: 0.5, pad_x: 0.0, pad_y: 16.0 };
        let anchors = 2 * 2 * SCRFD_ANCHORS_PER_CELL;
        let hit = 3 * SCRFD_ANCHORS_PER_CELL + 1;
        let mut scores = vec![0.1f32; anchors];
        scores[hit] = 0.9;
        let mut bboxes = vec![0.0f32; anchors * 4];
        bboxes[hit * 4..hit * 4 + 4].copy_from_slice(&[0.5; 4]);
        let kps = vec![0.0f32; anchors * 10];

        let tensors = StrideTensors { scores: &scores, bboxes: &bboxes, kps: &kps };
        let found = decode_stride(&tensors, 32, 64, &letterbox, 0.5);
        assert_eq!(found.len(), 1);
        let b = &found[0];
        // anchor center (32, 32) ± 16 in input space
        assert!((b.x - 32.0).abs() < 1e-4, "x = {}", b.x);
        assert!(b.y.abs() < 1e-4, "y = {}", b.y);
        assert!((b.width - 64.0).abs() < 1e-4);
        assert!((b.height - 64.0).abs() < 1e-4);
        let eye = b.landmarks.unwrap()[0];
        assert!((eye.0 - 64.0).abs() < 1e-4 && (eye.1 - 32.0).abs() < 1e-4);
    }

    #[test]
    fn test_decode_stride_tolerates_short_tensors() {
        let letterbox = Letterbox { scale: 1.0, pad_x: 0.0, pad_y: 0.0 };
        let scores = vec![0.9f32; 8];
        let bboxes = vec![0.0f32; 4];
        let tensors = StrideTensors { scores: &scores, bboxes: &bboxes, kps: &[] };
        let found = decode_stride(&tensors, 32, 64, &letterbox, 0.5);
        assert_eq!(found.len(), 1);
        assert!(found[0].landmarks.is_none());
    }
}
