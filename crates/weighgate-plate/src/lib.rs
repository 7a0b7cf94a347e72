//! weighgate-plate — Vehicle plate recognition engine.
//!
//! In-memory preprocessing, OCR through a lazily built shared reader,
//! positional ambiguity correction against the Brazilian plate grammar,
//! geometric candidate scoring and multi-frame majority voting.

pub mod aggregate;
pub mod config;
pub mod grammar;
pub mod ocr;
pub mod onnx_reader;
pub mod pipeline;
pub mod preprocess;
pub mod scorer;

pub use aggregate::majority_vote;
pub use config::{ConfigError, Device, OcrConfig, PlateConfig, DEFAULT_PLATE_PATTERN};
pub use grammar::{correct_ambiguities, normalize_plate, PlateGrammar, PLATE_LEN};
pub use ocr::{LazyReader, OcrDetection, OcrError, TextReader, ALLOWLIST};
pub use onnx_reader::OnnxTextReader;
pub use pipeline::{PlateError, PlateRecognizer};
pub use preprocess::preprocess;
pub use scorer::{aspect_score, composite_score, PlateCandidate};
