//! Quality gate for face crops: size, focus and exposure.

use crate::config::QualityThresholds;
use crate::imaging;
use crate::types::FaceCrop;
use image::GrayImage;
use serde::Serialize;
use std::fmt;

/// Why a crop was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityFailure {
    /// Smaller side below the minimum face size ("Tamanho insuficiente").
    SizeInsufficient,
    /// Laplacian variance below the minimum.
    TooBlurry,
    /// Mean brightness outside the accepted band.
    BadExposure,
}

impl fmt::Display for QualityFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            QualityFailure::SizeInsufficient => "size insufficient",
            QualityFailure::TooBlurry => "too blurry",
            QualityFailure::BadExposure => "bad exposure",
        };
        f.write_str(text)
    }
}

/// Diagnostic measurements of a face crop. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityReport {
    pub width: u32,
    pub height: u32,
    pub focus_variance: f64,
    pub mean_brightness: f64,
    pub passed: bool,
    pub failure: Option<QualityFailure>,
}

impl QualityReport {
    /// One-line summary suitable for an operator-facing message.
    pub fn summary(&self) -> String {
        let verdict = match self.failure {
            None => "ok".to_string(),
            Some(reason) => reason.to_string(),
        };
        format!(
            "{verdict} (focus={:.1}, brightness={:.1}, size={}x{})",
            self.focus_variance, self.mean_brightness, self.width, self.height
        )
    }
}

pub struct QualityGate {
    thresholds: QualityThresholds,
}

impl QualityGate {
    pub fn new(thresholds: QualityThresholds) -> Self {
        Self { thresholds }
    }

    pub fn check(&self, crop: &FaceCrop) -> QualityReport {
        let t = &self.thresholds;
        let (width, height) = (crop.width(), crop.height());

        // Size short-circuits: focus and brightness are not measured.
        if width.min(height) < t.min_face_size_px {
            return QualityReport {
                width,
                height,
                focus_variance: 0.0,
                mean_brightness: 0.0,
                passed: false,
                failure: Some(QualityFailure::SizeInsufficient),
            };
        }

        let gray = imaging::to_gray(crop.image());
        let focus_variance = laplacian_variance(&gray);
        let mean_brightness = mean_brightness(&gray);

        let failure = if focus_variance < t.min_focus_variance {
            Some(QualityFailure::TooBlurry)
        } else if !(t.min_brightness..=t.max_brightness).contains(&mean_brightness) {
            Some(QualityFailure::BadExposure)
        } else {
            None
        };

        QualityReport {
            width,
            height,
            focus_variance,
            mean_brightness,
            passed: failure.is_none(),
            failure,
        }
    }
}

/// Variance of the 4-neighbour Laplacian response over every pixel.
pub fn laplacian_variance(gray: &GrayImage) -> f64 {
    let response = imageproc::filter::laplacian_filter(gray);
    let n = response.as_raw().len();
    if n == 0 {
        return 0.0;
    }
    let mean = response.as_raw().iter().map(|&v| v as f64).sum::<f64>() / n as f64;
    response
        .as_raw()
        .iter()
        .map(|&v| (v as f64 - mean).powi(2))
        .sum::<f64>()
        / n as f64
}

pub fn mean_brightness(gray: &GrayImage) -> f64 {
    let n = gray.as_raw().len();
    if n == 0 {
        return 0.0;
    }
    gray.as_raw().iter().map(|&b| b as f64).sum::<f64>() / n as f64
}
