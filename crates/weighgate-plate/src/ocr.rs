//! OCR backend seam and the lazily built shared reader.

use image::GrayImage;
use std::sync::{Mutex, OnceLock};
use thiserror::Error;

/// Characters a plate can contain.
pub const ALLOWLIST: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

#[derive(Error, Debug)]
pub enum OcrError {
    #[error("OCR model not found: {0}")]
    ModelNotFound(String),
    #[error("OCR inference failed: {0}")]
    InferenceFailed(String),
    #[error("invalid character dictionary: {0}")]
    Dictionary(String),
    #[error("OCR reader lock poisoned")]
    LockPoisoned,
    #[error("ONNX Runtime error: {0}")]
    Ort(#[from] ort::Error),
}

/// One text region found by the reader.
#[derive(Debug, Clone, PartialEq)]
pub struct OcrDetection {
    /// Corners clockwise from top-left, in image pixels.
    pub quad: [(f32, f32); 4],
    pub text: String,
    /// Recognition confidence in [0, 1].
    pub confidence: f64,
}

impl OcrDetection {
    /// Width and height spanned by the top-left and bottom-right corners.
    pub fn extent(&self) -> (f64, f64) {
        let (x0, y0) = self.quad[0];
        let (x2, y2) = self.quad[2];
        (f64::from((x2 - x0).abs()), f64::from((y2 - y0).abs()))
    }
}

/// Text detection plus recognition over a grayscale image.
///
/// Implementations must be shareable across threads; a single reader serves
/// every plate request in the process.
pub trait TextReader: Send + Sync {
    /// Read every text region, restricting recognized characters to `allowlist`.
    fn read_text(&self, image: &GrayImage, allowlist: &str) -> Result<Vec<OcrDetection>, OcrError>;
}

type ReaderFactory = Box<dyn Fn() -> Result<Box<dyn TextReader>, OcrError> + Send + Sync>;

/// Builds the wrapped reader on first use, exactly once.
///
/// Concurrent first calls block on the init lock; the loser of the race sees
/// the finished reader. A failed build is not cached and is retried on the
/// next call.
pub struct LazyReader {
    factory: ReaderFactory,
    reader: OnceLock<Box<dyn TextReader>>,
    init: Mutex<()>,
}

impl LazyReader {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Result<Box<dyn TextReader>, OcrError> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            reader: OnceLock::new(),
            init: Mutex::new(()),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.reader.get().is_some()
    }

    fn get(&self) -> Result<&dyn TextReader, OcrError> {
        if let Some(reader) = self.reader.get() {
            return Ok(reader.as_ref());
        }

        let _guard = self.init.lock().map_err(|_| OcrError::LockPoisoned)?;
        if let Some(reader) = self.reader.get() {
            return Ok(reader.as_ref());
        }

        tracing::info!("initialising OCR reader");
        let built = (self.factory)()?;
        let reader = self.reader.get_or_init(|| built);
        Ok(reader.as_ref())
    }
}

impl TextReader for LazyReader {
    fn read_text(&self, image: &GrayImage, allowlist: &str) -> Result<Vec<OcrDetection>, OcrError> {
        self.get()?.read_text(image, allowlist)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Echo(&'static str);

    impl TextReader for Echo {
        fn read_text(&self, _image: &GrayImage, _allowlist: &str) -> Result<Vec<OcrDetection>, OcrError> {
            Ok(vec![OcrDetection {
                quad: [(0.0, 0.0), (40.0, 0.0), (40.0, 10.0), (0.0, 10.0)],
                text: self.0.to_string(),
                confidence: 0.9,
            }])
        }
    }

    #[test]
    fn test_extent_uses_opposite_corners() {
        let det = OcrDetection {
            quad: [(10.0, 5.0), (50.0, 5.0), (50.0, 15.0), (10.0, 15.0)],
            text: String::new(),
            confidence: 1.0,
        };
        assert_eq!(det.extent(), (40.0, 10.0));
    }

    #[test]
    fn test_lazy_reader_not_built_until_used() {
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&builds);
        let reader = LazyReader::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(Echo("ABC1234")) as Box<dyn TextReader>)
        });
        assert!(!reader.is_initialized());
        assert_eq!(builds.load(Ordering::SeqCst), 0);

        let out = reader.read_text(&GrayImage::new(4, 4), ALLOWLIST).unwrap();
        assert_eq!(out[0].text, "ABC1234");
        assert!(reader.is_initialized());
    }

    #[test]
    fn test_lazy_reader_built_once_under_concurrency() {
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&builds);
        let reader = LazyReader::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(20));
            Ok(Box::new(Echo("XYZ9A99")) as Box<dyn TextReader>)
        });
        let image = GrayImage::new(4, 4);

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    let out = reader.read_text(&image, ALLOWLIST).unwrap();
                    assert_eq!(out.len(), 1);
                });
            }
        });
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_build_is_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let reader = LazyReader::new(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(OcrError::ModelNotFound("det.onnx".into()))
            } else {
                Ok(Box::new(Echo("ABC1234")) as Box<dyn TextReader>)
            }
        });
        let image = GrayImage::new(4, 4);
        assert!(reader.read_text(&image, ALLOWLIST).is_err());
        assert!(!reader.is_initialized());
        assert!(reader.read_text(&image, ALLOWLIST).is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
