//! Plate pipeline settings: width cap, plate pattern and OCR reader options.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_PLATE_PATTERN: &str = r"^[A-Z]{3}[0-9][A-Z0-9][0-9]{2}$";

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("invalid plate configuration: {0}")]
    Invalid(String),
}

/// Where the OCR networks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cpu,
    Cuda,
}

impl Device {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "cpu" | "false" => Some(Device::Cpu),
            "cuda" | "gpu" | "true" => Some(Device::Cuda),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrConfig {
    /// Recognizer languages, in preference order (e.g. `["pt"]`).
    pub languages: Vec<String>,
    pub device: Device,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            languages: vec!["pt".to_string()],
            device: Device::Cpu,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlateConfig {
    /// Images wider than this are downscaled before OCR.
    pub max_width: u32,
    /// Full-match grammar for a valid plate.
    pub pattern: String,
    pub ocr: OcrConfig,
}

impl Default for PlateConfig {
    fn default() -> Self {
        Self {
            max_width: 1280,
            pattern: DEFAULT_PLATE_PATTERN.to_string(),
            ocr: OcrConfig::default(),
        }
    }
}

pub const MIN_MAX_WIDTH: u32 = 32;

impl PlateConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_width < MIN_MAX_WIDTH {
            return Err(ConfigError::Invalid(format!(
                "max_width must be >= {MIN_MAX_WIDTH}, got {}",
                self.max_width
            )));
        }
        if let Err(e) = regex::Regex::new(&self.pattern) {
            return Err(ConfigError::Invalid(format!("plate pattern does not compile: {e}")));
        }
        if self.ocr.languages.iter().all(|l| l.trim().is_empty()) {
            return Err(ConfigError::Invalid("at least one OCR language is required".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert_eq!(PlateConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_bad_pattern_rejected() {
        let cfg = PlateConfig { pattern: "[A-Z".into(), ..PlateConfig::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_empty_languages_rejected() {
        let mut cfg = PlateConfig::default();
        cfg.ocr.languages = vec![" ".into()];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_tiny_width_cap_rejected() {
        let cfg = PlateConfig { max_width: 8, ..PlateConfig::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_device_parse() {
        assert_eq!(Device::parse("CUDA"), Some(Device::Cuda));
        assert_eq!(Device::parse("false"), Some(Device::Cpu));
        assert_eq!(Device::parse("tpu"), None);
    }
}
