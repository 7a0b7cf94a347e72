//! weighgate-core — Operator face recognition engine.
//!
//! Single-face detection (SCRFD), quality gating, eye-line alignment,
//! 128-d embedding extraction and Euclidean matching with a logistic
//! confidence curve. Detection and embedding run via ONNX Runtime.

pub mod alignment;
pub mod config;
pub mod detector;
pub mod imaging;
pub mod matcher;
pub mod pipeline;
pub mod quality;
pub mod recognizer;
pub mod types;

pub use config::{ConfigError, DetectorModel, FaceConfig, MatchConfig, QualityThresholds};
pub use detector::{FaceDetector, ScrfdDetector};
pub use imaging::{decode_rgb, InputError};
pub use matcher::{distance_to_confidence, EuclideanMatcher, GalleryEntry, MatchResult, Matcher, Verification};
pub use pipeline::{ExtractedFace, FaceError, FaceMiss, FaceOutcome, FacePipeline};
pub use quality::{QualityFailure, QualityGate, QualityReport};
pub use recognizer::{EmbeddingExtractor, OnnxEncoder};
pub use types::{BoundingBox, Embedding, FaceCrop, Precision, StoredEmbedding, EMBEDDING_DIM};
