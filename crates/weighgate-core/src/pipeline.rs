//! Face pipeline: detect exactly one face → align → quality gate → embed → match.
//!
//! Recognition misses (no face, several faces, poor quality, no embedding,
//! corrupt reference) come back as [`FaceOutcome::Rejected`], never as errors.
//! Errors are reserved for failures of the recognition primitives themselves.

use crate::alignment;
use crate::config::FaceConfig;
use crate::detector::{DetectorError, FaceDetector};
use crate::matcher::{EuclideanMatcher, GalleryEntry, MatchResult, Matcher, Verification};
use crate::quality::{QualityGate, QualityReport};
use crate::recognizer::{EmbeddingExtractor, RecognizerError};
use crate::types::{Embedding, FaceCrop};
use image::RgbImage;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FaceError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Why an image did not yield a usable face.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FaceMiss {
    NoFace,
    MultipleFaces { count: usize },
    EmptyRegion,
    Quality { report: QualityReport },
    NoEmbedding,
    CorruptReference,
}

impl fmt::Display for FaceMiss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaceMiss::NoFace => f.write_str("no face detected"),
            FaceMiss::MultipleFaces { count } => write!(f, "expected exactly one face, found {count}"),
            FaceMiss::EmptyRegion => f.write_str("face region is empty"),
            FaceMiss::Quality { report } => write!(f, "insufficient quality: {}", report.summary()),
            FaceMiss::NoEmbedding => f.write_str("no embedding could be extracted"),
            FaceMiss::CorruptReference => f.write_str("stored reference embedding is invalid"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum FaceOutcome<T> {
    Accepted(T),
    Rejected(FaceMiss),
}

impl<T> FaceOutcome<T> {
    pub fn accepted(self) -> Option<T> {
        match self {
            FaceOutcome::Accepted(v) => Some(v),
            FaceOutcome::Rejected(_) => None,
        }
    }

    pub fn miss(&self) -> Option<&FaceMiss> {
        match self {
            FaceOutcome::Accepted(_) => None,
            FaceOutcome::Rejected(m) => Some(m),
        }
    }
}

/// An embedding together with the quality measurements of its crop.
#[derive(Debug, Clone)]
pub struct ExtractedFace {
    pub embedding: Embedding,
    pub quality: QualityReport,
}

pub struct FacePipeline<D, E> {
    detector: D,
    extractor: E,
    gate: QualityGate,
    matcher: EuclideanMatcher,
}

impl<D: FaceDetector, E: EmbeddingExtractor> FacePipeline<D, E> {
    pub fn new(detector: D, extractor: E, config: &FaceConfig) -> Self {
        Self {
            detector,
            extractor,
            gate: QualityGate::new(config.quality.clone()),
            matcher: EuclideanMatcher::new(config.matching.clone()),
        }
    }

    pub fn matcher(&self) -> &EuclideanMatcher {
        &self.matcher
    }

    /// Run detection, alignment and the quality gate without encoding.
    pub fn assess(&mut self, image: &RgbImage) -> Result<FaceOutcome<QualityReport>, FaceError> {
        Ok(match self.prepare(image)? {
            Ok((_, report)) => FaceOutcome::Accepted(report),
            Err(miss) => FaceOutcome::Rejected(miss),
        })
    }

    /// Produce the embedding of the single face in `image`.
    pub fn extract(&mut self, image: &RgbImage) -> Result<FaceOutcome<ExtractedFace>, FaceError> {
        let (crop, quality) = match self.prepare(image)? {
            Ok(prepared) => prepared,
            Err(miss) => return Ok(FaceOutcome::Rejected(miss)),
        };

        match self.extractor.extract(&crop)? {
            Some(embedding) => Ok(FaceOutcome::Accepted(ExtractedFace { embedding, quality })),
            None => {
                tracing::debug!("extractor produced no embedding");
                Ok(FaceOutcome::Rejected(FaceMiss::NoEmbedding))
            }
        }
    }

    /// 1:1 check of `image` against a stored reference record.
    pub fn verify_stored(
        &mut self,
        image: &RgbImage,
        reference: &[u8],
    ) -> Result<FaceOutcome<Verification>, FaceError> {
        let Some(reference) = Embedding::decode(reference) else {
            tracing::warn!(len = reference.len(), "reference embedding has invalid length");
            return Ok(FaceOutcome::Rejected(FaceMiss::CorruptReference));
        };
        Ok(match self.extract(image)? {
            FaceOutcome::Accepted(face) => {
                FaceOutcome::Accepted(self.matcher.verify(&face.embedding, &reference))
            }
            FaceOutcome::Rejected(miss) => FaceOutcome::Rejected(miss),
        })
    }

    /// 1:N search of `image` over a gallery snapshot.
    pub fn identify<'g, H>(
        &mut self,
        image: &RgbImage,
        gallery: &'g [GalleryEntry<H>],
    ) -> Result<FaceOutcome<MatchResult<&'g H>>, FaceError> {
        Ok(match self.extract(image)? {
            FaceOutcome::Accepted(face) => {
                FaceOutcome::Accepted(self.matcher.identify(&face.embedding, gallery))
            }
            FaceOutcome::Rejected(miss) => FaceOutcome::Rejected(miss),
        })
    }

    /// Detect exactly one face, align it and gate it.
    fn prepare(&mut self, image: &RgbImage) -> Result<Result<(FaceCrop, QualityReport), FaceMiss>, FaceError> {
        let faces = self.detector.detect(image)?;
        let face = match faces.as_slice() {
            [] => return Ok(Err(miss(FaceMiss::NoFace))),
            [face] => face,
            many => return Ok(Err(miss(FaceMiss::MultipleFaces { count: many.len() }))),
        };

        let Some(aligned) = alignment::align(&mut self.detector, image, face)? else {
            return Ok(Err(miss(FaceMiss::EmptyRegion)));
        };

        let report = self.gate.check(&aligned.crop);
        if !report.passed {
            return Ok(Err(miss(FaceMiss::Quality { report })));
        }
        Ok(Ok((aligned.crop, report)))
    }
}

fn miss(reason: FaceMiss) -> FaceMiss {
    tracing::debug!(%reason, "face rejected");
    reason
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::QualityFailure;
    use crate::types::{BoundingBox, Precision, EMBEDDING_DIM};
    use image::Rgb;

    struct FakeDetector {
        boxes: Vec<BoundingBox>,
        calls: usize,
    }

    impl FaceDetector for FakeDetector {
        fn detect(&mut self, _image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
            self.calls += 1;
            Ok(self.boxes.clone())
        }
    }

    /// Encodes the top-left red value of the crop into the first component.
    struct FakeExtractor {
        crop_sizes: Vec<(u32, u32)>,
        fail: bool,
    }

    impl EmbeddingExtractor for FakeExtractor {
        fn extract(&mut self, crop: &FaceCrop) -> Result<Option<Embedding>, RecognizerError> {
            self.crop_sizes.push((crop.width(), crop.height()));
            if self.fail {
                return Ok(None);
            }
            let mut values = vec![0.0; EMBEDDING_DIM];
            values[0] = crop.image().get_pixel(0, 0)[0] as f64 / 255.0;
            Ok(Embedding::from_values(values))
        }
    }

    fn face_box(x: f32, y: f32, size: f32) -> BoundingBox {
        BoundingBox { x, y, width: size, height: size, confidence: 0.95, landmarks: None }
    }

    fn textured(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            let v = if (x / 4 + y / 4) % 2 == 0 { 60 } else { 180 };
            Rgb([v, v, v])
        })
    }

    fn pipeline(boxes: Vec<BoundingBox>) -> FacePipeline<FakeDetector, FakeExtractor> {
        FacePipeline::new(
            FakeDetector { boxes, calls: 0 },
            FakeExtractor { crop_sizes: vec![], fail: false },
            &FaceConfig::default(),
        )
    }

    #[test]
    fn test_no_face_is_a_miss() {
        let mut p = pipeline(vec![]);
        let outcome = p.extract(&textured(200, 200)).unwrap();
        assert_eq!(outcome.miss(), Some(&FaceMiss::NoFace));
    }

    #[test]
    fn test_multiple_faces_is_a_miss() {
        let mut p = pipeline(vec![face_box(0.0, 0.0, 90.0), face_box(100.0, 100.0, 90.0)]);
        let outcome = p.extract(&textured(200, 200)).unwrap();
        assert_eq!(outcome.miss(), Some(&FaceMiss::MultipleFaces { count: 2 }));
        assert!(p.extractor.crop_sizes.is_empty());
    }

    #[test]
    fn test_small_face_rejected_by_gate() {
        let mut p = pipeline(vec![face_box(10.0, 10.0, 40.0)]);
        let outcome = p.assess(&textured(200, 200)).unwrap();
        match outcome.miss() {
            Some(FaceMiss::Quality { report }) => {
                assert_eq!(report.failure, Some(QualityFailure::SizeInsufficient));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_extract_hands_whole_crop_to_extractor_once() {
        let mut p = pipeline(vec![face_box(20.0, 30.0, 100.0)]);
        let face = p.extract(&textured(200, 200)).unwrap().accepted().unwrap();
        assert!(face.quality.passed);
        assert_eq!(p.extractor.crop_sizes, vec![(100, 100)]);
        // No landmarks: a single detection pass, no re-detection.
        assert_eq!(p.detector.calls, 1);
    }

    #[test]
    fn test_landmarks_trigger_one_redetection() {
        let mut with_landmarks = face_box(20.0, 30.0, 100.0);
        with_landmarks.landmarks = Some([(50.0, 60.0), (90.0, 64.0), (70.0, 80.0), (55.0, 100.0), (85.0, 102.0)]);
        let mut p = pipeline(vec![with_landmarks]);
        let outcome = p.extract(&textured(200, 200)).unwrap();
        assert!(outcome.accepted().is_some());
        assert_eq!(p.detector.calls, 2);
        assert_eq!(p.extractor.crop_sizes.len(), 1);
    }

    #[test]
    fn test_no_embedding_is_a_miss() {
        let mut p = FacePipeline::new(
            FakeDetector { boxes: vec![face_box(0.0, 0.0, 100.0)], calls: 0 },
            FakeExtractor { crop_sizes: vec![], fail: true },
            &FaceConfig::default(),
        );
        let outcome = p.extract(&textured(150, 150)).unwrap();
        assert_eq!(outcome.miss(), Some(&FaceMiss::NoEmbedding));
    }

    #[test]
    fn test_verify_stored_rejects_corrupt_reference() {
        let mut p = pipeline(vec![face_box(0.0, 0.0, 100.0)]);
        let outcome = p.verify_stored(&textured(150, 150), &[0u8; 10]).unwrap();
        assert_eq!(outcome.miss(), Some(&FaceMiss::CorruptReference));
        assert_eq!(p.detector.calls, 0);

        let outcome = p.verify_stored(&textured(150, 150), &[0xFF; 512]).unwrap();
        assert_eq!(outcome.miss(), Some(&FaceMiss::CorruptReference));
    }

    #[test]
    fn test_verify_stored_accepts_own_embedding() {
        let image = textured(150, 150);
        let mut p = pipeline(vec![face_box(0.0, 0.0, 100.0)]);
        let enrolled = p.extract(&image).unwrap().accepted().unwrap();
        let stored = enrolled.embedding.encode(Precision::F32);
        let v = p.verify_stored(&image, &stored).unwrap().accepted().unwrap();
        assert!(v.accepted);
        assert!(v.confidence >= 0.5);
    }

    #[test]
    fn test_identify_over_gallery() {
        let image = textured(150, 150);
        let mut p = pipeline(vec![face_box(0.0, 0.0, 100.0)]);
        let probe = p.extract(&image).unwrap().accepted().unwrap().embedding;

        let mut other = probe.values().to_vec();
        other[1] = 2.0;
        let other = Embedding::from_values(other).unwrap();

        let gallery = vec![
            GalleryEntry { identity: 7u32, embedding: other.encode(Precision::F64) },
            GalleryEntry { identity: 9u32, embedding: probe.encode(Precision::F64) },
        ];
        let result = p.identify(&image, &gallery).unwrap().accepted().unwrap();
        assert_eq!(result.identity, Some(&9));
    }
}
