use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Number of components in a face embedding.
pub const EMBEDDING_DIM: usize = 128;

/// Stored size of an embedding written with 32-bit components.
pub const F32_RECORD_LEN: usize = EMBEDDING_DIM * 4;

/// Stored size of an embedding written with 64-bit components.
pub const F64_RECORD_LEN: usize = EMBEDDING_DIM * 8;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Component width used when persisting an embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    F32,
    F64,
}

/// A stored embedding record, classified purely by its byte length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoredEmbedding<'a> {
    Float32x128(&'a [u8]),
    Float64x128(&'a [u8]),
    Invalid,
}

impl<'a> StoredEmbedding<'a> {
    pub fn classify(bytes: &'a [u8]) -> Self {
        match bytes.len() {
            F32_RECORD_LEN => StoredEmbedding::Float32x128(bytes),
            F64_RECORD_LEN => StoredEmbedding::Float64x128(bytes),
            _ => StoredEmbedding::Invalid,
        }
    }
}

/// 128-component face embedding. Euclidean distance approximates dissimilarity.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    values: Vec<f64>,
}

impl Embedding {
    /// Wrap raw components. Returns `None` unless exactly [`EMBEDDING_DIM`] are given.
    pub fn from_values(values: Vec<f64>) -> Option<Self> {
        if values.len() != EMBEDDING_DIM {
            return None;
        }
        Some(Self { values })
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Decode a persisted record (little-endian, 512 or 1024 bytes).
    ///
    /// Any other length, or any NaN or infinite component, decodes to `None`.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let values: Vec<f64> = match StoredEmbedding::classify(bytes) {
            StoredEmbedding::Float32x128(raw) => raw
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64)
                .collect(),
            StoredEmbedding::Float64x128(raw) => raw
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect(),
            StoredEmbedding::Invalid => return None,
        };
        if !values.iter().all(|v| v.is_finite()) {
            return None;
        }
        Self::from_values(values)
    }

    /// Encode for persistence at the requested component width.
    pub fn encode(&self, precision: Precision) -> Vec<u8> {
        match precision {
            Precision::F32 => self
                .values
                .iter()
                .flat_map(|v| (*v as f32).to_le_bytes())
                .collect(),
            Precision::F64 => self.values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f64 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f64>()
            .sqrt()
    }
}

/// Normalized face region: 3-channel, 8-bit, contiguous.
///
/// Owned by a single extraction; deliberately not `Clone`.
#[derive(Debug)]
pub struct FaceCrop {
    image: RgbImage,
}

impl FaceCrop {
    pub fn new(image: RgbImage) -> Self {
        Self { image }
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}
