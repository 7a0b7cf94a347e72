//! Embedding extraction from normalized face crops.
//!
//! The crop handed in is already known to hold exactly one face; its full
//! bounds are the face location, so nothing here searches for faces again.

use crate::types::{Embedding, FaceCrop, EMBEDDING_DIM};
use image::{imageops, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::Path;
use thiserror::Error;

pub const ENCODER_MODEL_FILE: &str = "face_encoder_128.onnx";

const ENCODER_INPUT_SIZE: u32 = 150;
const ENCODER_MEAN: f32 = 127.5;
const ENCODER_STD: f32 = 128.0;

// Jitter perturbation ranges.
const JITTER_SCALE: f32 = 0.05;
const JITTER_SHIFT: f32 = 0.05;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Turns one normalized face crop into a 128-component embedding.
///
/// `Ok(None)` means no embedding could be produced for this crop.
pub trait EmbeddingExtractor {
    fn extract(&mut self, crop: &FaceCrop) -> Result<Option<Embedding>, RecognizerError>;
}

/// ONNX face encoder producing 128-dimensional embeddings, with jitter averaging.
pub struct OnnxEncoder {
    session: Session,
    jitters: u32,
    rng: StdRng,
}

impl OnnxEncoder {
    pub fn load(model_dir: &Path, jitters: u32) -> Result<Self, RecognizerError> {
        let model_path = model_dir.join(ENCODER_MODEL_FILE);
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(&model_path)?;

        tracing::info!(
            path = %model_path.display(),
            jitters,
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            "loaded face encoder"
        );

        Ok(Self {
            session,
            jitters,
            rng: StdRng::from_entropy(),
        })
    }

    fn run(&mut self, image: &RgbImage) -> Result<Option<Vec<f64>>, RecognizerError> {
        let input = preprocess(image);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != EMBEDDING_DIM {
            tracing::warn!(
                expected = EMBEDDING_DIM,
                got = raw.len(),
                "encoder returned unexpected embedding size"
            );
            return Ok(None);
        }
        Ok(Some(raw.iter().map(|&v| v as f64).collect()))
    }
}

impl EmbeddingExtractor for OnnxEncoder {
    fn extract(&mut self, crop: &FaceCrop) -> Result<Option<Embedding>, RecognizerError> {
        if crop.width() == 0 || crop.height() == 0 {
            return Ok(None);
        }

        if self.jitters <= 1 {
            return Ok(self.run(crop.image())?.and_then(Embedding::from_values));
        }

        let mut passes = Vec::with_capacity(self.jitters as usize);
        for _ in 0..self.jitters {
            let perturbed = jitter_crop(crop.image(), &mut self.rng);
            match self.run(&perturbed)? {
                Some(values) => passes.push(values),
                None => return Ok(None),
            }
        }
        Ok(average(&passes).and_then(Embedding::from_values))
    }
}

/// Resize to the encoder input and lay out as normalized NCHW.
fn preprocess(image: &RgbImage) -> Array4<f32> {
    let size = ENCODER_INPUT_SIZE as usize;
    let resized = imageops::resize(image, ENCODER_INPUT_SIZE, ENCODER_INPUT_SIZE, imageops::FilterType::Triangle);
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - ENCODER_MEAN) / ENCODER_STD;
        }
    }
    tensor
}

/// Randomly mirror, scale and shift a crop, keeping its size.
fn jitter_crop<R: Rng>(image: &RgbImage, rng: &mut R) -> RgbImage {
    let (w, h) = image.dimensions();
    let scale = 1.0 + rng.gen_range(-JITTER_SCALE..=JITTER_SCALE);
    let tx = rng.gen_range(-JITTER_SHIFT..=JITTER_SHIFT) * w as f32;
    let ty = rng.gen_range(-JITTER_SHIFT..=JITTER_SHIFT) * h as f32;
    let mirror = rng.gen_bool(0.5);

    let cx = (w as f32 - 1.0) / 2.0;
    let cy = (h as f32 - 1.0) / 2.0;
    let max_x = w.saturating_sub(1) as f32;
    let max_y = h.saturating_sub(1) as f32;

    RgbImage::from_fn(w, h, |x, y| {
        let u = if mirror { max_x - x as f32 } else { x as f32 };
        let sx = ((u - cx) / scale + cx - tx).clamp(0.0, max_x);
        let sy = ((y as f32 - cy) / scale + cy - ty).clamp(0.0, max_y);
        *image.get_pixel(sx.round() as u32, sy.round() as u32)
    })
}

/// Component-wise mean of equally sized passes.
fn average(passes: &[Vec<f64>]) -> Option<Vec<f64>> {
    let first = passes.first()?;
    let mut sum = vec![0.0f64; first.len()];
    for pass in passes {
        if pass.len() != sum.len() {
            return None;
        }
        for (acc, v) in sum.iter_mut().zip(pass) {
            *acc += v;
        }
    }
    let n = passes.len() as f64;
    Some(sum.into_iter().map(|v| v / n).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_preprocess_output_shape() {
        let crop = RgbImage::from_pixel(90, 120, Rgb([128, 128, 128]));
        let tensor = preprocess(&crop);
        assert_eq!(tensor.shape(), &[1, 3, 150, 150]);
    }

    #[test]
    fn test_preprocess_normalization_per_channel() {
        let crop = RgbImage::from_pixel(150, 150, Rgb([0, 128, 255]));
        let tensor = preprocess(&crop);
        assert!((tensor[[0, 0, 10, 10]] - (0.0 - ENCODER_MEAN) / ENCODER_STD).abs() < 1e-6);
        assert!((tensor[[0, 1, 10, 10]] - (128.0 - ENCODER_MEAN) / ENCODER_STD).abs() < 1e-6);
        assert!((tensor[[0, 2, 10, 10]] - (255.0 - ENCODER_MEAN) / ENCODER_STD).abs() < 1e-6);
    }

    #[test]
    fn test_jitter_preserves_size() {
        let crop = RgbImage::from_fn(97, 101, |x, y| Rgb([x as u8, y as u8, 0]));
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..5 {
            assert_eq!(jitter_crop(&crop, &mut rng).dimensions(), (97, 101));
        }
    }

    #[test]
    fn test_jitter_uniform_crop_stays_uniform() {
        let crop = RgbImage::from_pixel(64, 64, Rgb([90, 91, 92]));
        let mut rng = StdRng::seed_from_u64(42);
        let out = jitter_crop(&crop, &mut rng);
        assert!(out.pixels().all(|p| *p == Rgb([90, 91, 92])));
    }

    #[test]
    fn test_jitter_is_deterministic_for_seed() {
        let crop = RgbImage::from_fn(40, 40, |x, y| Rgb([(x * 6) as u8, (y * 6) as u8, 3]));
        let a = jitter_crop(&crop, &mut StdRng::seed_from_u64(3));
        let b = jitter_crop(&crop, &mut StdRng::seed_from_u64(3));
        assert_eq!(a, b);
    }

    #[test]
    fn test_average_passes() {
        let passes = vec![vec![1.0, 2.0], vec![3.0, 6.0]];
        assert_eq!(average(&passes), Some(vec![2.0, 4.0]));
        assert_eq!(average(&[]), None);
        assert_eq!(average(&[vec![1.0], vec![1.0, 2.0]]), None);
    }
}
