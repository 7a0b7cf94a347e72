//! In-plane face alignment by eye line.
//!
//! Embedding quality is rotation-sensitive. The full image is rotated about
//! its center until the line between the eye centroids is horizontal, then
//! the face is detected once more on the rotated image for a tighter crop.

use crate::detector::{DetectorError, FaceDetector};
use crate::imaging;
use crate::types::{BoundingBox, FaceCrop};
use image::RgbImage;

/// Eye landmark clusters in image coordinates.
#[derive(Debug, Clone, Default)]
pub struct EyeLandmarks {
    pub left: Vec<(f32, f32)>,
    pub right: Vec<(f32, f32)>,
}

impl EyeLandmarks {
    /// Eye clusters from a five-point landmark set (one point per eye).
    pub fn from_five_point(landmarks: &[(f32, f32); 5]) -> Self {
        Self {
            left: vec![landmarks[0]],
            right: vec![landmarks[1]],
        }
    }

    /// Angle of the left→right eye-centroid line, radians, y axis down.
    ///
    /// `None` when either cluster is empty.
    pub fn roll_angle(&self) -> Option<f32> {
        let (lx, ly) = centroid(&self.left)?;
        let (rx, ry) = centroid(&self.right)?;
        Some((ry - ly).atan2(rx - lx))
    }
}

fn centroid(points: &[(f32, f32)]) -> Option<(f32, f32)> {
    if points.is_empty() {
        return None;
    }
    let n = points.len() as f32;
    let (sx, sy) = points
        .iter()
        .fold((0.0f32, 0.0f32), |(ax, ay), &(x, y)| (ax + x, ay + y));
    Some((sx / n, sy / n))
}

/// Result of alignment: the crop to encode and how it was obtained.
#[derive(Debug)]
pub struct AlignedFace {
    pub crop: FaceCrop,
    /// Roll angle that was removed, radians. `None` when passed through unaligned.
    pub corrected_angle: Option<f32>,
}

/// Crop `face` out of `image`, leveling the eyes first when landmarks exist.
///
/// Without landmarks, or when re-detection on the rotated image finds
/// nothing, the unaligned crop is used. Returns `None` only when the face
/// region is empty after clipping.
pub fn align<D: FaceDetector + ?Sized>(
    detector: &mut D,
    image: &RgbImage,
    face: &BoundingBox,
) -> Result<Option<AlignedFace>, DetectorError> {
    let Some(unaligned) = imaging::crop(image, face) else {
        return Ok(None);
    };

    let Some(angle) = face
        .landmarks
        .as_ref()
        .and_then(|lms| EyeLandmarks::from_five_point(lms).roll_angle())
    else {
        tracing::debug!("no eye landmarks; using unaligned crop");
        return Ok(Some(AlignedFace { crop: FaceCrop::new(unaligned), corrected_angle: None }));
    };

    let rotated = imaging::rotate_about_center(image, -angle);
    let redetected = detector.detect(&rotated)?;
    let tighter = redetected.first().and_then(|b| imaging::crop(&rotated, b));

    match tighter {
        Some(crop) => {
            tracing::debug!(angle_deg = angle.to_degrees(), "face aligned by eye line");
            Ok(Some(AlignedFace { crop: FaceCrop::new(crop), corrected_angle: Some(angle) }))
        }
        None => {
            tracing::debug!("no face after rotation; using unaligned crop");
            Ok(Some(AlignedFace { crop: FaceCrop::new(unaligned), corrected_angle: None }))
        }
    }
}
