//! Plate candidate scoring.
//!
//! `score = conf * (0.4 + 0.3 * aspect + 0.3 * min(1, 5 * area_fraction))`,
//! boosted by 15% when the corrected text matches the plate grammar.

use crate::grammar::{correct_ambiguities, normalize_plate, PlateGrammar};
use crate::ocr::OcrDetection;
use serde::Serialize;

/// Plates are roughly four times wider than tall.
pub const IDEAL_ASPECT: f64 = 4.0;
const ASPECT_TOLERANCE: f64 = 3.0;
const BASE_WEIGHT: f64 = 0.4;
const ASPECT_WEIGHT: f64 = 0.3;
const AREA_WEIGHT: f64 = 0.3;
/// Area fraction at which the area term saturates is `1 / AREA_GAIN`.
const AREA_GAIN: f64 = 5.0;
pub const GRAMMAR_BOOST: f64 = 1.15;

/// 1.0 at a 4:1 aspect ratio, falling linearly to 0 at 1:1 and 7:1.
pub fn aspect_score(width: f64, height: f64) -> f64 {
    if height <= 0.0 {
        return 0.0;
    }
    let ratio = width / height;
    (1.0 - (ratio - IDEAL_ASPECT).abs() / ASPECT_TOLERANCE).max(0.0)
}

pub fn composite_score(ocr_confidence: f64, area_fraction: f64, aspect: f64, grammar_ok: bool) -> f64 {
    let area_term = (area_fraction * AREA_GAIN).min(1.0);
    let score = ocr_confidence * (BASE_WEIGHT + ASPECT_WEIGHT * aspect + AREA_WEIGHT * area_term);
    if grammar_ok {
        score * GRAMMAR_BOOST
    } else {
        score
    }
}

/// One scored OCR reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlateCandidate {
    pub raw_text: String,
    pub corrected_text: String,
    pub ocr_confidence: f64,
    pub width: f64,
    pub height: f64,
    pub area_fraction: f64,
    pub aspect_score: f64,
    pub regex_valid: bool,
    pub score: f64,
}

impl PlateCandidate {
    /// Score `detection` from an image of `image_width` x `image_height` pixels.
    pub fn score(detection: &OcrDetection, image_width: u32, image_height: u32, grammar: &PlateGrammar) -> Self {
        let (width, height) = detection.extent();
        let image_area = f64::from(image_width) * f64::from(image_height);
        let area_fraction = if image_area > 0.0 { width * height / image_area } else { 0.0 };
        let aspect = aspect_score(width, height);

        let corrected_text = correct_ambiguities(&normalize_plate(&detection.text));
        let regex_valid = grammar.is_valid(&corrected_text);
        let ocr_confidence = detection.confidence.clamp(0.0, 1.0);
        let score = composite_score(ocr_confidence, area_fraction, aspect, regex_valid);

        Self {
            raw_text: detection.text.clone(),
            corrected_text,
            ocr_confidence,
            width,
            height,
            area_fraction,
            aspect_score: aspect,
            regex_valid,
            score,
        }
    }
}
