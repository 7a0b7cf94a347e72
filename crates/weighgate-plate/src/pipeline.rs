//! Plate recognition over one image or a burst of frames of the same vehicle.

use crate::aggregate::majority_vote;
use crate::config::{ConfigError, PlateConfig};
use crate::grammar::PlateGrammar;
use crate::ocr::{OcrError, TextReader, ALLOWLIST};
use crate::preprocess::preprocess;
use crate::scorer::PlateCandidate;
use image::RgbImage;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlateError {
    #[error("OCR failed: {0}")]
    Ocr(#[from] OcrError),
}

/// Per-image plate recognition plus multi-frame voting.
///
/// Holds a shared handle to the OCR reader; cloning the recognizer shares it.
#[derive(Clone)]
pub struct PlateRecognizer {
    reader: Arc<dyn TextReader>,
    grammar: PlateGrammar,
    max_width: u32,
}

impl PlateRecognizer {
    pub fn new(reader: Arc<dyn TextReader>, config: &PlateConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            reader,
            grammar: PlateGrammar::new(&config.pattern)?,
            max_width: config.max_width,
        })
    }

    pub fn grammar(&self) -> &PlateGrammar {
        &self.grammar
    }

    /// Every OCR reading in `image`, scored, best first.
    ///
    /// Equal scores keep the reader's output order.
    pub fn rank(&self, image: &RgbImage) -> Result<Vec<PlateCandidate>, PlateError> {
        let gray = preprocess(image, self.max_width);
        let (width, height) = gray.dimensions();
        let detections = self.reader.read_text(&gray, ALLOWLIST)?;

        let mut candidates: Vec<PlateCandidate> = detections
            .iter()
            .map(|det| PlateCandidate::score(det, width, height, &self.grammar))
            .collect();
        for cand in &candidates {
            tracing::debug!(
                raw = %cand.raw_text,
                corrected = %cand.corrected_text,
                conf = cand.ocr_confidence,
                aspect = cand.aspect_score,
                area = cand.area_fraction,
                valid = cand.regex_valid,
                score = cand.score,
                "plate candidate"
            );
        }
        candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
        Ok(candidates)
    }

    /// Best-scoring candidate, or `None` when no reading has text and a positive score.
    pub fn recognize(&self, image: &RgbImage) -> Result<Option<PlateCandidate>, PlateError> {
        let best = self
            .rank(image)?
            .into_iter()
            .find(|c| c.score > 0.0 && !c.corrected_text.is_empty());
        match &best {
            Some(c) => tracing::info!(plate = %c.corrected_text, score = c.score, "plate recognized"),
            None => tracing::debug!("no plate candidate"),
        }
        Ok(best)
    }

    /// Recognize each frame independently and return the majority reading.
    ///
    /// Frames without a candidate do not vote.
    pub fn recognize_frames(&self, frames: &[RgbImage]) -> Result<Option<String>, PlateError> {
        let mut readings = Vec::with_capacity(frames.len());
        for (i, frame) in frames.iter().enumerate() {
            match self.recognize(frame)? {
                Some(c) => readings.push(c.corrected_text),
                None => tracing::debug!(frame = i, "frame yielded no plate"),
            }
        }
        let winner = majority_vote(&readings);
        tracing::info!(frames = frames.len(), votes = readings.len(), plate = ?winner, "multi-frame vote");
        Ok(winner)
    }
}
