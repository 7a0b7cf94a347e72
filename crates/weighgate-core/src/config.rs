//! Face pipeline configuration.
//!
//! Every threshold the pipeline uses comes from here; nothing in the
//! algorithms is hard-coded. Invalid combinations are rejected once at
//! startup by [`FaceConfig::validate`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("invalid face configuration: {0}")]
    Invalid(String),
}

/// Which SCRFD export to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorModel {
    /// `det_10g.onnx`: accurate, slower.
    Scrfd10g,
    /// `det_500m.onnx`: light, for small CPUs.
    Scrfd500m,
}

impl DetectorModel {
    pub fn file_name(self) -> &'static str {
        match self {
            DetectorModel::Scrfd10g => "det_10g.onnx",
            DetectorModel::Scrfd500m => "det_500m.onnx",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "scrfd_10g" | "10g" => Some(DetectorModel::Scrfd10g),
            "scrfd_500m" | "500m" => Some(DetectorModel::Scrfd500m),
            _ => None,
        }
    }
}

/// Acceptance thresholds applied to a face crop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityThresholds {
    /// Minimum of crop width and height, in pixels.
    pub min_face_size_px: u32,
    /// Minimum variance of the Laplacian response.
    pub min_focus_variance: f64,
    /// Mean grayscale brightness band, inclusive.
    pub min_brightness: f64,
    pub max_brightness: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            min_face_size_px: 80,
            min_focus_variance: 60.0,
            min_brightness: 40.0,
            max_brightness: 200.0,
        }
    }
}

/// Distance threshold and confidence curve for matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    /// Maximum Euclidean distance accepted as the same person.
    pub tolerance: f64,
    /// Steepness of the logistic distance→confidence curve.
    pub steepness: f64,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            tolerance: 0.6,
            steepness: 20.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FaceConfig {
    pub detector: DetectorModel,
    /// Each step doubles the detector input resolution (base 320px).
    pub upsample: u32,
    /// Number of perturbed passes averaged per embedding.
    pub jitters: u32,
    pub quality: QualityThresholds,
    pub matching: MatchConfig,
}

impl Default for FaceConfig {
    fn default() -> Self {
        Self {
            detector: DetectorModel::Scrfd10g,
            upsample: 1,
            jitters: 3,
            quality: QualityThresholds::default(),
            matching: MatchConfig::default(),
        }
    }
}

pub const MAX_UPSAMPLE: u32 = 3;

impl FaceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let q = &self.quality;
        let m = &self.matching;

        if q.min_face_size_px == 0 {
            return Err(invalid("min_face_size_px must be positive"));
        }
        if !q.min_focus_variance.is_finite() || q.min_focus_variance < 0.0 {
            return Err(invalid(format!(
                "min_focus_variance must be a non-negative number, got {}",
                q.min_focus_variance
            )));
        }
        for (name, v) in [("min_brightness", q.min_brightness), ("max_brightness", q.max_brightness)] {
            if !(0.0..=255.0).contains(&v) {
                return Err(invalid(format!("{name} must be within [0, 255], got {v}")));
            }
        }
        if q.min_brightness > q.max_brightness {
            return Err(invalid(format!(
                "brightness band is empty: min {} > max {}",
                q.min_brightness, q.max_brightness
            )));
        }
        if !m.tolerance.is_finite() || m.tolerance < 0.0 {
            return Err(invalid(format!("tolerance must be >= 0, got {}", m.tolerance)));
        }
        if !m.steepness.is_finite() || m.steepness <= 0.0 {
            return Err(invalid(format!("steepness must be > 0, got {}", m.steepness)));
        }
        if self.jitters == 0 {
            return Err(invalid("jitters must be at least 1"));
        }
        if self.upsample > MAX_UPSAMPLE {
            return Err(invalid(format!(
                "upsample must be <= {MAX_UPSAMPLE}, got {}",
                self.upsample
            )));
        }
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}
