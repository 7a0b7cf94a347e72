//! Filesystem adapters for the Identity Gallery and the Vehicle Registry.
//!
//! Gallery: a directory of `<handle>.bin` files, each one stored embedding.
//! Registry: a JSON object mapping plate text to a vehicle handle.

use anyhow::{bail, Context, Result};
use image::RgbImage;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use weighgate_core::{decode_rgb, Embedding, GalleryEntry, Precision};
use weighgate_plate::{normalize_plate, PlateGrammar};

const EMBEDDING_EXT: &str = "bin";

/// Read and decode an image file.
pub fn load_image(path: &Path) -> Result<RgbImage> {
    let bytes = std::fs::read(path).with_context(|| format!("reading image {}", path.display()))?;
    let image = decode_rgb(&bytes).with_context(|| format!("decoding image {}", path.display()))?;
    Ok(image)
}

/// Snapshot every stored embedding in `dir`, ordered by handle.
///
/// Records with an invalid byte length are still returned; the matcher skips them.
pub fn load_gallery(dir: &Path) -> Result<Vec<GalleryEntry<String>>> {
    let mut entries = Vec::new();
    let listing = std::fs::read_dir(dir).with_context(|| format!("reading gallery {}", dir.display()))?;
    for item in listing {
        let path = item?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(EMBEDDING_EXT) {
            continue;
        }
        let Some(handle) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let embedding = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        entries.push(GalleryEntry {
            identity: handle.to_string(),
            embedding,
        });
    }
    entries.sort_by(|a, b| a.identity.cmp(&b.identity));
    tracing::debug!(dir = %dir.display(), entries = entries.len(), "gallery loaded");
    Ok(entries)
}

fn check_handle(handle: &str) -> Result<()> {
    if handle.is_empty()
        || handle.starts_with('.')
        || handle.contains(|c: char| c == '/' || c == '\\' || c.is_control())
    {
        bail!("invalid identity handle {handle:?}");
    }
    Ok(())
}

/// Write `embedding` as `<dir>/<handle>.bin`, replacing any previous record.
pub fn save_embedding(dir: &Path, handle: &str, embedding: &Embedding, precision: Precision) -> Result<PathBuf> {
    check_handle(handle)?;
    std::fs::create_dir_all(dir).with_context(|| format!("creating gallery {}", dir.display()))?;
    let path = dir.join(format!("{handle}.{EMBEDDING_EXT}"));
    std::fs::write(&path, embedding.encode(precision)).with_context(|| format!("writing {}", path.display()))?;
    tracing::info!(handle, path = %path.display(), ?precision, "embedding stored");
    Ok(path)
}

/// Read one stored record.
pub fn load_record(dir: &Path, handle: &str) -> Result<Vec<u8>> {
    check_handle(handle)?;
    let path = dir.join(format!("{handle}.{EMBEDDING_EXT}"));
    std::fs::read(&path).with_context(|| format!("no stored embedding for {handle} at {}", path.display()))
}

/// Plate text → vehicle handle, keyed by normalized plate.
#[derive(Debug, Clone, Default)]
pub struct VehicleRegistry {
    vehicles: HashMap<String, String>,
}

impl VehicleRegistry {
    /// Load a JSON object of `plate: vehicle` pairs. Plates that do not fit
    /// `grammar` after normalization are skipped.
    pub fn load(path: &Path, grammar: &PlateGrammar) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading registry {}", path.display()))?;
        let raw: HashMap<String, String> =
            serde_json::from_str(&text).with_context(|| format!("parsing registry {}", path.display()))?;

        let mut registry = Self::default();
        for (plate, vehicle) in raw {
            if !registry.insert(&plate, vehicle, grammar) {
                tracing::warn!(%plate, "registry plate does not match the plate grammar; skipped");
            }
        }
        tracing::debug!(path = %path.display(), vehicles = registry.len(), "registry loaded");
        Ok(registry)
    }

    /// Register a vehicle. Returns `false` when the plate is not valid.
    pub fn insert(&mut self, plate: &str, vehicle: String, grammar: &PlateGrammar) -> bool {
        let key = normalize_plate(plate);
        if !grammar.is_valid(&key) {
            return false;
        }
        self.vehicles.insert(key, vehicle);
        true
    }

    pub fn lookup(&self, plate: &str) -> Option<&str> {
        self.vehicles.get(&normalize_plate(plate)).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.vehicles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vehicles.is_empty()
    }
}
