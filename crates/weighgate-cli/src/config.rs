use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use weighgate_core::{DetectorModel, FaceConfig};
use weighgate_plate::{Device, PlateConfig};

/// Engine configuration: defaults, then an optional TOML file, then
/// `WEIGHGATE_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    pub face: FaceConfig,
    pub plate: PlateConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_dir: default_model_dir(),
            face: FaceConfig::default(),
            plate: PlateConfig::default(),
        }
    }
}

/// `$XDG_DATA_HOME/weighgate/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("weighgate/models")
}

impl Config {
    /// Load and validate. Any invalid value is fatal.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                toml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))?
            }
            None => Config::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        tracing::debug!(?config, "configuration loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.face.validate()?;
        self.plate.validate()?;
        Ok(())
    }

    /// Overlay environment overrides read through `lookup`.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let lookup = &lookup;
        if let Some(dir) = lookup("WEIGHGATE_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }

        if let Some(name) = lookup("WEIGHGATE_FACE_DETECTOR") {
            self.face.detector = DetectorModel::parse(&name)
                .with_context(|| format!("WEIGHGATE_FACE_DETECTOR: unknown detector model {name:?}"))?;
        }
        override_with(lookup, "WEIGHGATE_FACE_UPSAMPLE", &mut self.face.upsample)?;
        override_with(lookup, "WEIGHGATE_FACE_JITTERS", &mut self.face.jitters)?;
        override_with(lookup, "WEIGHGATE_FACE_TOLERANCE", &mut self.face.matching.tolerance)?;
        override_with(lookup, "WEIGHGATE_FACE_CONF_STEEPNESS", &mut self.face.matching.steepness)?;
        override_with(lookup, "WEIGHGATE_FACE_MIN_FOCUS_VAR", &mut self.face.quality.min_focus_variance)?;
        override_with(lookup, "WEIGHGATE_FACE_MIN_BRIGHTNESS", &mut self.face.quality.min_brightness)?;
        override_with(lookup, "WEIGHGATE_FACE_MAX_BRIGHTNESS", &mut self.face.quality.max_brightness)?;
        override_with(lookup, "WEIGHGATE_FACE_MIN_SIZE_PX", &mut self.face.quality.min_face_size_px)?;

        if let Some(langs) = lookup("WEIGHGATE_OCR_LANGS") {
            self.plate.ocr.languages = langs
                .split(',')
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(name) = lookup("WEIGHGATE_OCR_DEVICE") {
            self.plate.ocr.device = Device::parse(&name)
                .with_context(|| format!("WEIGHGATE_OCR_DEVICE: unknown device {name:?}"))?;
        }
        override_with(lookup, "WEIGHGATE_PLATE_MAX_WIDTH", &mut self.plate.max_width)?;
        if let Some(pattern) = lookup("WEIGHGATE_PLATE_PATTERN") {
            self.plate.pattern = pattern;
        }
        Ok(())
    }
}

fn override_with<T>(lookup: &dyn Fn(&str) -> Option<String>, key: &str, slot: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return Ok(());
    };
    match raw.trim().parse() {
        Ok(value) => {
            *slot = value;
            Ok(())
        }
        Err(e) => bail!("{key}: cannot parse {raw:?}: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(config.model_dir.ends_with("weighgate/models"));
        assert_eq!(config.face.matching.tolerance, 0.6);
        assert_eq!(config.plate.max_width, 1280);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env(env(&[
                ("WEIGHGATE_MODEL_DIR", "/opt/models"),
                ("WEIGHGATE_FACE_DETECTOR", "scrfd_500m"),
                ("WEIGHGATE_FACE_UPSAMPLE", "2"),
                ("WEIGHGATE_FACE_JITTERS", "10"),
                ("WEIGHGATE_FACE_TOLERANCE", "0.5"),
                ("WEIGHGATE_FACE_MIN_SIZE_PX", "100"),
                ("WEIGHGATE_OCR_LANGS", "pt, en ,"),
                ("WEIGHGATE_OCR_DEVICE", "cuda"),
                ("WEIGHGATE_PLATE_MAX_WIDTH", "960"),
            ]))
            .unwrap();
        assert_eq!(config.model_dir, PathBuf::from("/opt/models"));
        assert_eq!(config.face.detector, DetectorModel::Scrfd500m);
        assert_eq!(config.face.upsample, 2);
        assert_eq!(config.face.jitters, 10);
        assert_eq!(config.face.matching.tolerance, 0.5);
        assert_eq!(config.face.quality.min_face_size_px, 100);
        assert_eq!(config.plate.ocr.languages, vec!["pt".to_string(), "en".to_string()]);
        assert_eq!(config.plate.ocr.device, Device::Cuda);
        assert_eq!(config.plate.max_width, 960);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unparseable_env_is_fatal() {
        let mut config = Config::default();
        let err = config.apply_env(env(&[("WEIGHGATE_FACE_TOLERANCE", "close")])).unwrap_err();
        assert!(err.to_string().contains("WEIGHGATE_FACE_TOLERANCE"));
        assert!(config.apply_env(env(&[("WEIGHGATE_FACE_DETECTOR", "yolo")])).is_err());
    }

    #[test]
    fn test_inverted_brightness_band_rejected() {
        let mut config = Config::default();
        config
            .apply_env(env(&[
                ("WEIGHGATE_FACE_MIN_BRIGHTNESS", "180"),
                ("WEIGHGATE_FACE_MAX_BRIGHTNESS", "90"),
            ]))
            .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_file_layered_under_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weighgate.toml");
        std::fs::write(
            &path,
            r#"
model_dir = "/srv/models"

[face]
jitters = 5

[face.matching]
tolerance = 0.45

[plate]
pattern = "^[A-Z]{3}[0-9]{4}$"
"#,
        )
        .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let mut config: Config = toml::from_str(&text).unwrap();
        assert_eq!(config.model_dir, PathBuf::from("/srv/models"));
        assert_eq!(config.face.jitters, 5);
        assert_eq!(config.face.matching.tolerance, 0.45);
        assert_eq!(config.face.matching.steepness, 20.0);
        assert_eq!(config.plate.max_width, 1280);

        config.apply_env(env(&[("WEIGHGATE_FACE_JITTERS", "1")])).unwrap();
        assert_eq!(config.face.jitters, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_config_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(Some(&dir.path().join("absent.toml"))).is_err());
    }
}
