//! ONNX text reader: DB-style text detection followed by CTC recognition.
//!
//! Model directory layout:
//! - `det.onnx` text detector producing a `[1, 1, H, W]` probability map
//! - `rec_<lang>.onnx` CTC recognizer per language, `[1, T, C]` output
//! - `rec_<lang>.txt` recognizer dictionary, one symbol per line; class 0 is the CTC blank

use crate::config::{Device, OcrConfig};
use crate::ocr::{OcrDetection, OcrError, TextReader};
use image::{imageops, GrayImage, Luma};
use imageproc::region_labelling::{connected_components, Connectivity};
use ndarray::Array4;
use ort::execution_providers::CUDAExecutionProvider;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;

pub const DETECTOR_MODEL_FILE: &str = "det.onnx";

const DET_MAX_SIDE: u32 = 960;
const DET_ALIGN: u32 = 32;
const DET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const DET_STD: [f32; 3] = [0.229, 0.224, 0.225];
const DET_THRESHOLD: f32 = 0.3;
const DET_BOX_THRESHOLD: f32 = 0.6;
const DET_UNCLIP_RATIO: f32 = 1.5;
const DET_MIN_SIDE: u32 = 3;

const REC_HEIGHT: u32 = 48;
const REC_MAX_WIDTH: u32 = 320;

/// Axis-aligned text region in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
struct TextBox {
    x0: f32,
    y0: f32,
    x1: f32,
    y1: f32,
}

impl TextBox {
    fn quad(&self) -> [(f32, f32); 4] {
        [(self.x0, self.y0), (self.x1, self.y0), (self.x1, self.y1), (self.x0, self.y1)]
    }
}

struct Recognizer {
    language: String,
    session: Mutex<Session>,
    /// Symbol for class `i + 1`.
    charset: Vec<char>,
}

/// Detection plus one recognizer per configured language.
pub struct OnnxTextReader {
    detector: Mutex<Session>,
    recognizers: Vec<Recognizer>,
}

fn build_session(path: &Path, device: Device) -> Result<Session, OcrError> {
    if !path.exists() {
        return Err(OcrError::ModelNotFound(path.display().to_string()));
    }
    let mut builder = Session::builder()?.with_intra_threads(2)?;
    if device == Device::Cuda {
        builder = builder.with_execution_providers([CUDAExecutionProvider::default().build()])?;
    }
    Ok(builder.commit_from_file(path)?)
}

fn load_charset(path: &Path) -> Result<Vec<char>, OcrError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| OcrError::Dictionary(format!("{}: {e}", path.display())))?;
    let charset: Vec<char> = text
        .lines()
        .filter_map(|line| line.trim_end_matches('\r').chars().next())
        .collect();
    if charset.is_empty() {
        return Err(OcrError::Dictionary(format!("{} is empty", path.display())));
    }
    Ok(charset)
}

impl OnnxTextReader {
    pub fn load(model_dir: &Path, config: &OcrConfig) -> Result<Self, OcrError> {
        let det_path = model_dir.join(DETECTOR_MODEL_FILE);
        let detector = build_session(&det_path, config.device)?;
        tracing::info!(path = %det_path.display(), device = ?config.device, "loaded text detector");

        let mut recognizers = Vec::new();
        for language in config.languages.iter().map(|l| l.trim()).filter(|l| !l.is_empty()) {
            let rec_path = model_dir.join(format!("rec_{language}.onnx"));
            let dict_path = model_dir.join(format!("rec_{language}.txt"));
            let session = build_session(&rec_path, config.device)?;
            let charset = load_charset(&dict_path)?;
            tracing::info!(
                path = %rec_path.display(),
                language,
                classes = charset.len() + 1,
                "loaded text recognizer"
            );
            recognizers.push(Recognizer {
                language: language.to_string(),
                session: Mutex::new(session),
                charset,
            });
        }
        if recognizers.is_empty() {
            return Err(OcrError::ModelNotFound("no recognizer language configured".into()));
        }

        Ok(Self {
            detector: Mutex::new(detector),
            recognizers,
        })
    }

    fn detect_regions(&self, image: &GrayImage) -> Result<Vec<TextBox>, OcrError> {
        let (w, h) = image.dimensions();
        let (in_w, in_h) = detector_input_size(w, h);
        let resized = imageops::resize(image, in_w, in_h, imageops::FilterType::Triangle);

        let mut input = Array4::<f32>::zeros((1, 3, in_h as usize, in_w as usize));
        for (x, y, p) in resized.enumerate_pixels() {
            let v = p[0] as f32 / 255.0;
            for c in 0..3 {
                input[[0, c, y as usize, x as usize]] = (v - DET_MEAN[c]) / DET_STD[c];
            }
        }

        let mut session = self.detector.lock().map_err(|_| OcrError::LockPoisoned)?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (shape, probs) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| OcrError::InferenceFailed(format!("detector output: {e}")))?;
        let (map_h, map_w) = match shape.len() {
            4 => (shape[2] as usize, shape[3] as usize),
            3 => (shape[1] as usize, shape[2] as usize),
            _ => {
                return Err(OcrError::InferenceFailed(format!(
                    "unexpected detector output rank {}",
                    shape.len()
                )))
            }
        };
        if probs.len() < map_w * map_h {
            return Err(OcrError::InferenceFailed("detector output truncated".into()));
        }

        let sx = w as f32 / map_w as f32;
        let sy = h as f32 / map_h as f32;
        let boxes = regions_from_probability_map(&probs[..map_w * map_h], map_w, map_h)
            .into_iter()
            .map(|b| TextBox {
                x0: (b.x0 * sx).clamp(0.0, w as f32),
                y0: (b.y0 * sy).clamp(0.0, h as f32),
                x1: (b.x1 * sx).clamp(0.0, w as f32),
                y1: (b.y1 * sy).clamp(0.0, h as f32),
            })
            .filter(|b| b.x1 - b.x0 >= 1.0 && b.y1 - b.y0 >= 1.0)
            .collect::<Vec<_>>();
        tracing::trace!(regions = boxes.len(), "text regions");
        Ok(boxes)
    }

    fn recognize_region(
        &self,
        recognizer: &Recognizer,
        image: &GrayImage,
        region: &TextBox,
        allowlist: &str,
    ) -> Result<Option<(String, f64)>, OcrError> {
        let x = region.x0.floor() as u32;
        let y = region.y0.floor() as u32;
        let cw = (region.x1.ceil() as u32).min(image.width()).saturating_sub(x);
        let ch = (region.y1.ceil() as u32).min(image.height()).saturating_sub(y);
        if cw == 0 || ch == 0 {
            return Ok(None);
        }
        let crop = imageops::crop_imm(image, x, y, cw, ch).to_image();
        let rec_w = ((cw as f32 * REC_HEIGHT as f32 / ch as f32).round() as u32).clamp(1, REC_MAX_WIDTH);
        let line = imageops::resize(&crop, rec_w, REC_HEIGHT, imageops::FilterType::Triangle);

        let mut input = Array4::<f32>::zeros((1, 3, REC_HEIGHT as usize, rec_w as usize));
        for (px, py, p) in line.enumerate_pixels() {
            let v = (p[0] as f32 / 255.0 - 0.5) / 0.5;
            for c in 0..3 {
                input[[0, c, py as usize, px as usize]] = v;
            }
        }

        let mut session = recognizer.session.lock().map_err(|_| OcrError::LockPoisoned)?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (shape, probs) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| OcrError::InferenceFailed(format!("recognizer output: {e}")))?;
        if shape.len() != 3 {
            return Err(OcrError::InferenceFailed(format!(
                "unexpected recognizer output rank {}",
                shape.len()
            )));
        }
        let steps = shape[1] as usize;
        let classes = shape[2] as usize;
        Ok(ctc_decode(probs, steps, classes, &recognizer.charset, allowlist))
    }
}

impl TextReader for OnnxTextReader {
    fn read_text(&self, image: &GrayImage, allowlist: &str) -> Result<Vec<OcrDetection>, OcrError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }
        let regions = self.detect_regions(image)?;

        let mut detections = Vec::with_capacity(regions.len());
        for region in &regions {
            let mut best: Option<(String, f64)> = None;
            for recognizer in &self.recognizers {
                let Some((text, confidence)) = self.recognize_region(recognizer, image, region, allowlist)? else {
                    continue;
                };
                tracing::trace!(language = %recognizer.language, %text, confidence, "region reading");
                if best.as_ref().map_or(true, |(_, c)| confidence > *c) {
                    best = Some((text, confidence));
                }
            }
            if let Some((text, confidence)) = best {
                detections.push(OcrDetection {
                    quad: region.quad(),
                    text,
                    confidence,
                });
            }
        }
        Ok(detections)
    }
}

/// Detector input: longest side capped, both sides rounded to a multiple of 32.
fn detector_input_size(w: u32, h: u32) -> (u32, u32) {
    let longest = w.max(h).max(1);
    let scale = if longest > DET_MAX_SIDE {
        DET_MAX_SIDE as f32 / longest as f32
    } else {
        1.0
    };
    let align = |v: u32| -> u32 {
        let scaled = (v as f32 * scale).round() as u32;
        (((scaled + DET_ALIGN / 2) / DET_ALIGN) * DET_ALIGN).max(DET_ALIGN)
    };
    (align(w), align(h))
}

/// Threshold the probability map, label 8-connected text blobs, keep those whose
/// mean probability clears the box threshold and grow each by the unclip distance.
/// Coordinates are in map pixels; regions come back top-to-bottom, left-to-right.
fn regions_from_probability_map(probs: &[f32], width: usize, height: usize) -> Vec<TextBox> {
    let mask = GrayImage::from_fn(width as u32, height as u32, |x, y| {
        let p = probs[y as usize * width + x as usize];
        Luma([if p > DET_THRESHOLD { 255 } else { 0 }])
    });
    let labels = connected_components(&mask, Connectivity::Eight, Luma([0u8]));

    struct Blob {
        min_x: u32,
        min_y: u32,
        max_x: u32,
        max_y: u32,
        prob_sum: f32,
        pixels: u32,
    }

    let mut blobs: Vec<Option<Blob>> = Vec::new();
    for (x, y, label) in labels.enumerate_pixels() {
        let id = label[0] as usize;
        if id == 0 {
            continue;
        }
        if blobs.len() < id {
            blobs.resize_with(id, || None);
        }
        let p = probs[y as usize * width + x as usize];
        match blobs[id - 1].as_mut() {
            Some(b) => {
                b.min_x = b.min_x.min(x);
                b.min_y = b.min_y.min(y);
                b.max_x = b.max_x.max(x);
                b.max_y = b.max_y.max(y);
                b.prob_sum += p;
                b.pixels += 1;
            }
            None => {
                blobs[id - 1] = Some(Blob {
                    min_x: x,
                    min_y: y,
                    max_x: x,
                    max_y: y,
                    prob_sum: p,
                    pixels: 1,
                });
            }
        }
    }

    let mut boxes: Vec<TextBox> = blobs
        .into_iter()
        .flatten()
        .filter_map(|b| {
            let bw = b.max_x - b.min_x + 1;
            let bh = b.max_y - b.min_y + 1;
            if bw.min(bh) < DET_MIN_SIDE {
                return None;
            }
            let score = b.prob_sum / b.pixels as f32;
            if score < DET_BOX_THRESHOLD {
                return None;
            }
            let d = unclip_distance(bw as f32, bh as f32, DET_UNCLIP_RATIO);
            Some(TextBox {
                x0: (b.min_x as f32 - d).max(0.0),
                y0: (b.min_y as f32 - d).max(0.0),
                x1: ((b.max_x + 1) as f32 + d).min(width as f32),
                y1: ((b.max_y + 1) as f32 + d).min(height as f32),
            })
        })
        .collect();
    boxes.sort_by(|a, b| a.y0.total_cmp(&b.y0).then(a.x0.total_cmp(&b.x0)));
    boxes
}

/// Outward offset that grows a shrunk text kernel back to the full text extent.
fn unclip_distance(width: f32, height: f32, ratio: f32) -> f32 {
    let perimeter = 2.0 * (width + height);
    if perimeter <= 0.0 {
        return 0.0;
    }
    width * height * ratio / perimeter
}

/// Greedy CTC decoding over a `[steps, classes]` probability matrix.
///
/// Classes whose symbol is not in `allowlist` are never chosen. Repeats are
/// collapsed and blanks dropped; confidence is the mean probability of the
/// emitted symbols. Returns `None` when nothing is emitted.
fn ctc_decode(
    probs: &[f32],
    steps: usize,
    classes: usize,
    charset: &[char],
    allowlist: &str,
) -> Option<(String, f64)> {
    let allowed: Vec<bool> = (0..classes)
        .map(|class| {
            class == 0
                || charset
                    .get(class - 1)
                    .is_some_and(|c| allowlist.contains(*c))
        })
        .collect();

    let mut text = String::new();
    let mut conf_sum = 0.0f64;
    let mut previous = 0usize;
    for t in 0..steps {
        let Some(row) = probs.get(t * classes..(t + 1) * classes) else {
            break;
        };
        let (class, p) = row
            .iter()
            .enumerate()
            .filter(|(class, _)| allowed[*class])
            .fold((0usize, f32::MIN), |best, (class, &p)| if p > best.1 { (class, p) } else { best });
        if class != 0 && class != previous {
            text.push(charset[class - 1]);
            conf_sum += f64::from(p);
        }
        previous = class;
    }

    let emitted = text.chars().count();
    if emitted == 0 {
        return None;
    }
    Some((text, (conf_sum / emitted as f64).clamp(0.0, 1.0)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHARSET: [char; 4] = ['A', 'B', '1', '-'];

    /// One-hot-ish row: `hot` gets 0.9, everything else shares the rest.
    fn row(hot: usize, classes: usize) -> Vec<f32> {
        let rest = 0.1 / (classes - 1) as f32;
        (0..classes).map(|c| if c == hot { 0.9 } else { rest }).collect()
    }

    fn matrix(path: &[usize]) -> Vec<f32> {
        path.iter().flat_map(|&c| row(c, CHARSET.len() + 1)).collect()
    }

    #[test]
    fn test_ctc_collapses_repeats_and_blanks() {
        // A A _ B B _ B 1
        let probs = matrix(&[1, 1, 0, 2, 2, 0, 2, 3]);
        let (text, conf) = ctc_decode(&probs, 8, 5, &CHARSET, "AB1").unwrap();
        assert_eq!(text, "ABB1");
        assert!((conf - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_ctc_masks_disallowed_symbols() {
        // '-' is the argmax at step 1 but outside the allowlist
        let mut probs = matrix(&[1, 4, 3]);
        probs[5 + 3] = 0.05;
        probs[5 + 1] = 0.04;
        let (text, _) = ctc_decode(&probs, 3, 5, &CHARSET, "AB1").unwrap();
        assert!(!text.contains('-'));
        assert_eq!(text, "A1");
    }

    #[test]
    fn test_ctc_all_blank_is_none() {
        let probs = matrix(&[0, 0, 0]);
        assert_eq!(ctc_decode(&probs, 3, 5, &CHARSET, "AB1"), None);
    }

    #[test]
    fn test_ctc_tolerates_short_output() {
        let probs = matrix(&[1, 2]);
        let (text, _) = ctc_decode(&probs, 4, 5, &CHARSET, "AB1").unwrap();
        assert_eq!(text, "AB");
    }

    #[test]
    fn test_detector_input_aligned_and_capped() {
        assert_eq!(detector_input_size(640, 480), (640, 480));
        assert_eq!(detector_input_size(100, 50), (96, 64));
        let (w, h) = detector_input_size(1920, 1080);
        assert_eq!(w, 960);
        assert_eq!(w % 32, 0);
        assert_eq!(h % 32, 0);
        assert_eq!(detector_input_size(5, 5), (32, 32));
    }

    #[test]
    fn test_unclip_distance() {
        assert!((unclip_distance(40.0, 10.0, 1.5) - 6.0).abs() < 1e-6);
        assert_eq!(unclip_distance(0.0, 0.0, 1.5), 0.0);
    }

    #[test]
    fn test_regions_from_probability_map() {
        let (w, h) = (64usize, 32usize);
        let mut probs = vec![0.0f32; w * h];
        // strong blob
        for y in 4..10 {
            for x in 8..30 {
                probs[y * w + x] = 0.9;
            }
        }
        // weak blob: above binarization, below box threshold
        for y in 20..26 {
            for x in 40..60 {
                probs[y * w + x] = 0.4;
            }
        }
        // speck
        probs[30 * w + 2] = 0.95;

        let regions = regions_from_probability_map(&probs, w, h);
        assert_eq!(regions.len(), 1);
        let r = regions[0];
        assert!(r.x0 < 8.0 && r.y0 < 4.0);
        assert!(r.x1 > 30.0 && r.y1 > 10.0);
        assert!(r.x0 >= 0.0 && r.x1 <= w as f32 && r.y1 <= h as f32);
    }

    #[test]
    fn test_regions_ordered_top_to_bottom() {
        let (w, h) = (64usize, 64usize);
        let mut probs = vec![0.0f32; w * h];
        for (y0, x0) in [(40usize, 4usize), (4, 30)] {
            for y in y0..y0 + 6 {
                for x in x0..x0 + 20 {
                    probs[y * w + x] = 0.9;
                }
            }
        }
        let regions = regions_from_probability_map(&probs, w, h);
        assert_eq!(regions.len(), 2);
        assert!(regions[0].y0 < regions[1].y0);
    }

    #[test]
    fn test_missing_models_reported() {
        let dir = std::env::temp_dir().join("weighgate-no-models");
        let err = OnnxTextReader::load(&dir, &OcrConfig::default()).err().unwrap();
        assert!(matches!(err, OcrError::ModelNotFound(_)));
    }
}
