//! Biometric matching: 1:1 verification and 1:N identification.
//!
//! Both share one rule: Euclidean distance against a tolerance, reported as a
//! logistic confidence centered on the tolerance.

use crate::config::MatchConfig;
use crate::types::Embedding;
use serde::Serialize;

/// Map a distance to a confidence in [0, 1].
///
/// `1 / (1 + e^(k·(distance − tolerance)))`: 0.5 at the tolerance, rising
/// toward 1 as distance → 0, falling toward 0 beyond it.
pub fn distance_to_confidence(distance: f64, tolerance: f64, steepness: f64) -> f64 {
    if distance.is_nan() {
        return 0.0;
    }
    let conf = 1.0 / (1.0 + (steepness * (distance - tolerance)).exp());
    conf.clamp(0.0, 1.0)
}

/// One enrolled identity as supplied by the gallery: a handle plus the raw
/// stored embedding bytes.
#[derive(Debug, Clone)]
pub struct GalleryEntry<H> {
    pub identity: H,
    pub embedding: Vec<u8>,
}

/// Outcome of a 1:1 comparison.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Verification {
    pub accepted: bool,
    pub confidence: f64,
    pub distance: f64,
}

/// Outcome of a 1:N search.
///
/// `identity` is set only when the best distance is within tolerance;
/// `confidence` and `distance` always describe the best candidate found,
/// for auditing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult<H> {
    pub identity: Option<H>,
    pub confidence: f64,
    pub distance: Option<f64>,
}

impl<H> MatchResult<H> {
    pub fn none() -> Self {
        Self { identity: None, confidence: 0.0, distance: None }
    }

    pub fn map<T>(self, f: impl FnOnce(H) -> T) -> MatchResult<T> {
        MatchResult {
            identity: self.identity.map(f),
            confidence: self.confidence,
            distance: self.distance,
        }
    }
}

/// Strategy for searching a gallery.
///
/// The linear scan is the reference; an approximate nearest-neighbour index
/// can replace it behind this trait as long as it keeps the same contract.
pub trait Matcher {
    fn verify(&self, probe: &Embedding, reference: &Embedding) -> Verification;

    fn identify<'g, H>(&self, probe: &Embedding, gallery: &'g [GalleryEntry<H>]) -> MatchResult<&'g H>;
}

/// Exhaustive Euclidean matcher.
pub struct EuclideanMatcher {
    config: MatchConfig,
}

impl EuclideanMatcher {
    pub fn new(config: MatchConfig) -> Self {
        Self { config }
    }

    pub fn tolerance(&self) -> f64 {
        self.config.tolerance
    }

    fn confidence(&self, distance: f64) -> f64 {
        distance_to_confidence(distance, self.config.tolerance, self.config.steepness)
    }
}

impl Matcher for EuclideanMatcher {
    fn verify(&self, probe: &Embedding, reference: &Embedding) -> Verification {
        let distance = probe.euclidean_distance(reference);
        Verification {
            accepted: distance <= self.config.tolerance,
            confidence: self.confidence(distance),
            distance,
        }
    }

    /// Ties on the minimum distance go to the first entry encountered.
    fn identify<'g, H>(&self, probe: &Embedding, gallery: &'g [GalleryEntry<H>]) -> MatchResult<&'g H> {
        let mut best: Option<(&'g H, f64)> = None;
        let mut skipped = 0usize;

        for entry in gallery {
            let Some(stored) = Embedding::decode(&entry.embedding) else {
                skipped += 1;
                continue;
            };
            let distance = probe.euclidean_distance(&stored);
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((&entry.identity, distance));
            }
        }

        if skipped > 0 {
            tracing::warn!(skipped, total = gallery.len(), "skipped undecodable gallery embeddings");
        }

        let Some((identity, distance)) = best else {
            tracing::debug!("identify: no comparable gallery entries");
            return MatchResult::none();
        };

        let confidence = self.confidence(distance);
        let accepted = distance <= self.config.tolerance;
        tracing::debug!(distance, confidence, accepted, "identify: best candidate");

        MatchResult {
            identity: accepted.then_some(identity),
            confidence,
            distance: Some(distance),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Precision, EMBEDDING_DIM};

    fn embedding_at(offset: f64) -> Embedding {
        let mut values = vec![0.0; EMBEDDING_DIM];
        values[0] = offset;
        Embedding::from_values(values).unwrap()
    }

    fn entry(name: &str, e: &Embedding, precision: Precision) -> GalleryEntry<String> {
        GalleryEntry { identity: name.to_string(), embedding: e.encode(precision) }
    }

    fn matcher() -> EuclideanMatcher {
        EuclideanMatcher::new(MatchConfig::default())
    }

    #[test]
    fn test_confidence_is_half_at_tolerance() {
        assert!((distance_to_confidence(0.6, 0.6, 20.0) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_confidence_is_monotonic_non_increasing() {
        let mut prev = f64::INFINITY;
        for i in 0..=300 {
            let d = i as f64 * 0.01;
            let c = distance_to_confidence(d, 0.6, 20.0);
            assert!((0.0..=1.0).contains(&c));
            assert!(c <= prev, "confidence rose at distance {d}");
            prev = c;
        }
    }

    #[test]
    fn test_confidence_extremes_stay_in_range() {
        assert_eq!(distance_to_confidence(1e6, 0.6, 20.0), 0.0);
        assert!(distance_to_confidence(0.0, 0.6, 1e6) <= 1.0);
    }

    #[test]
    fn test_verify_self_match() {
        let e = embedding_at(0.3);
        for tolerance in [0.0, 0.1, 0.6, 5.0] {
            let m = EuclideanMatcher::new(MatchConfig { tolerance, steepness: 20.0 });
            let v = m.verify(&e, &e);
            assert!(v.accepted);
            assert!(v.confidence >= 0.5, "tolerance {tolerance}: {}", v.confidence);
        }
    }

    #[test]
    fn test_verify_rejects_beyond_tolerance() {
        let v = matcher().verify(&embedding_at(0.0), &embedding_at(0.9));
        assert!(!v.accepted);
        assert!(v.confidence < 0.5);
        assert!((v.distance - 0.9).abs() < 1e-12);
    }

    #[test]
    fn test_identify_empty_gallery() {
        let gallery: Vec<GalleryEntry<String>> = vec![];
        let result = matcher().identify(&embedding_at(0.0), &gallery);
        assert_eq!(result, MatchResult::none());
    }

    #[test]
    fn test_identify_picks_global_minimum() {
        let gallery = vec![
            entry("far", &embedding_at(0.5), Precision::F64),
            entry("near", &embedding_at(0.1), Precision::F32),
            entry("mid", &embedding_at(0.3), Precision::F64),
        ];
        let result = matcher().identify(&embedding_at(0.0), &gallery);
        assert_eq!(result.identity.map(String::as_str), Some("near"));
        assert!(result.confidence > 0.99);
    }

    #[test]
    fn test_identify_returns_best_confidence_when_rejected() {
        let gallery = vec![entry("stranger", &embedding_at(0.8), Precision::F64)];
        let result = matcher().identify(&embedding_at(0.0), &gallery);
        assert!(result.identity.is_none());
        assert!(result.confidence > 0.0 && result.confidence < 0.5);
        assert!((result.distance.unwrap() - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_identify_skips_corrupt_entries() {
        let gallery = vec![
            GalleryEntry { identity: "corrupt".to_string(), embedding: vec![0u8; 100] },
            entry("ok", &embedding_at(0.2), Precision::F64),
        ];
        let result = matcher().identify(&embedding_at(0.0), &gallery);
        assert_eq!(result.identity.map(String::as_str), Some("ok"));
    }

    #[test]
    fn test_identify_skips_non_finite_record_ahead_of_match() {
        let query = embedding_at(0.0);
        let gallery = vec![
            GalleryEntry { identity: "garbage".to_string(), embedding: vec![0xFF; 512] },
            entry("genuine", &query, Precision::F64),
        ];
        let result = matcher().identify(&query, &gallery);
        assert_eq!(result.identity.map(String::as_str), Some("genuine"));
        assert!((0.0..=1.0).contains(&result.confidence));
        assert_eq!(result.distance, Some(0.0));
    }

    #[test]
    fn test_confidence_of_nan_distance_is_zero() {
        assert_eq!(distance_to_confidence(f64::NAN, 0.6, 20.0), 0.0);
    }

    #[test]
    fn test_identify_all_corrupt_is_none() {
        let gallery = vec![GalleryEntry { identity: 1u32, embedding: vec![1u8; 3] }];
        assert_eq!(matcher().identify(&embedding_at(0.0), &gallery), MatchResult::none());
    }

    #[test]
    fn test_identify_tie_goes_to_first() {
        let gallery = vec![
            entry("first", &embedding_at(0.2), Precision::F64),
            entry("second", &embedding_at(-0.2), Precision::F64),
        ];
        let result = matcher().identify(&embedding_at(0.0), &gallery);
        assert_eq!(result.identity.map(String::as_str), Some("first"));
    }
}
