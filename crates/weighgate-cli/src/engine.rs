use crate::config::Config;
use crate::gallery::VehicleRegistry;
use image::RgbImage;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use weighgate_core::detector::DetectorError;
use weighgate_core::recognizer::RecognizerError;
use weighgate_core::{
    EmbeddingExtractor, ExtractedFace, FaceDetector, FaceError, FaceMiss, FaceOutcome, FacePipeline, GalleryEntry,
    MatchResult, OnnxEncoder, QualityReport, ScrfdDetector, Verification,
};
use weighgate_plate::{majority_vote, LazyReader, OnnxTextReader, PlateCandidate, PlateError, PlateRecognizer, TextReader};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("configuration error: {0}")]
    Config(#[from] weighgate_plate::ConfigError),
    #[error("face pipeline error: {0}")]
    Face(#[from] FaceError),
    #[error("plate pipeline error: {0}")]
    Plate(#[from] PlateError),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Per-frame plate winners and their vote.
#[derive(Debug, Clone, Serialize)]
pub struct PlateReport {
    pub plate: Option<String>,
    pub frames: Vec<Option<PlateCandidate>>,
}

/// Combined operator and vehicle recognition.
#[derive(Debug, Clone, Serialize)]
pub struct Recognition {
    pub identity: Option<String>,
    pub face_confidence: f64,
    pub face_distance: Option<f64>,
    /// Set when the face image was rejected before matching.
    pub face_miss: Option<FaceMiss>,
    pub plate: Option<String>,
    pub vehicle: Option<String>,
}

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

/// Messages sent from the command handlers to the engine thread.
enum EngineRequest {
    Assess {
        image: RgbImage,
        reply: Reply<FaceOutcome<QualityReport>>,
    },
    Extract {
        image: RgbImage,
        reply: Reply<FaceOutcome<ExtractedFace>>,
    },
    Verify {
        image: RgbImage,
        reference: Vec<u8>,
        reply: Reply<FaceOutcome<Verification>>,
    },
    Identify {
        image: RgbImage,
        gallery: Vec<GalleryEntry<String>>,
        reply: Reply<FaceOutcome<MatchResult<String>>>,
    },
    Plate {
        frames: Vec<RgbImage>,
        reply: Reply<PlateReport>,
    },
    Recognize {
        face: RgbImage,
        frames: Vec<RgbImage>,
        gallery: Vec<GalleryEntry<String>>,
        registry: Arc<VehicleRegistry>,
        reply: Reply<Recognition>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn call<T>(&self, build: impl FnOnce(Reply<T>) -> EngineRequest) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Detection, alignment and quality gate only.
    pub async fn assess(&self, image: RgbImage) -> Result<FaceOutcome<QualityReport>, EngineError> {
        self.call(|reply| EngineRequest::Assess { image, reply }).await
    }

    /// Full face pipeline up to the embedding, for enrollment.
    pub async fn extract(&self, image: RgbImage) -> Result<FaceOutcome<ExtractedFace>, EngineError> {
        self.call(|reply| EngineRequest::Extract { image, reply }).await
    }

    pub async fn verify(&self, image: RgbImage, reference: Vec<u8>) -> Result<FaceOutcome<Verification>, EngineError> {
        self.call(|reply| EngineRequest::Verify { image, reference, reply }).await
    }

    pub async fn identify(
        &self,
        image: RgbImage,
        gallery: Vec<GalleryEntry<String>>,
    ) -> Result<FaceOutcome<MatchResult<String>>, EngineError> {
        self.call(|reply| EngineRequest::Identify { image, gallery, reply }).await
    }

    pub async fn plate(&self, frames: Vec<RgbImage>) -> Result<PlateReport, EngineError> {
        self.call(|reply| EngineRequest::Plate { frames, reply }).await
    }

    /// Identify the operator and read the plate in one request.
    pub async fn recognize(
        &self,
        face: RgbImage,
        frames: Vec<RgbImage>,
        gallery: Vec<GalleryEntry<String>>,
        registry: Arc<VehicleRegistry>,
    ) -> Result<Recognition, EngineError> {
        self.call(|reply| EngineRequest::Recognize {
            face,
            frames,
            gallery,
            registry,
            reply,
        })
        .await
    }
}

/// Load the face models and prepare the lazily built OCR reader, then
/// start the engine thread. Fails fast if a face model is unavailable.
pub fn spawn_engine(config: &Config) -> Result<EngineHandle, EngineError> {
    let detector = ScrfdDetector::load(&config.model_dir, config.face.detector, config.face.upsample)?;
    let encoder = OnnxEncoder::load(&config.model_dir, config.face.jitters)?;
    let pipeline = FacePipeline::new(detector, encoder, &config.face);

    let model_dir = config.model_dir.clone();
    let ocr = config.plate.ocr.clone();
    let reader = LazyReader::new(move || {
        let reader = OnnxTextReader::load(&model_dir, &ocr)?;
        Ok(Box::new(reader) as Box<dyn TextReader>)
    });
    let plates = PlateRecognizer::new(Arc::new(reader), &config.plate)?;

    Ok(start(pipeline, plates))
}

/// Run `pipeline` and `plates` on a dedicated OS thread.
pub fn start<D, E>(mut pipeline: FacePipeline<D, E>, plates: PlateRecognizer) -> EngineHandle
where
    D: FaceDetector + Send + 'static,
    E: EmbeddingExtractor + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("weighgate-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Assess { image, reply } => {
                        let _ = reply.send(pipeline.assess(&image).map_err(Into::into));
                    }
                    EngineRequest::Extract { image, reply } => {
                        let _ = reply.send(pipeline.extract(&image).map_err(Into::into));
                    }
                    EngineRequest::Verify {
                        image,
                        reference,
                        reply,
                    } => {
                        let _ = reply.send(pipeline.verify_stored(&image, &reference).map_err(Into::into));
                    }
                    EngineRequest::Identify {
                        image,
                        gallery,
                        reply,
                    } => {
                        let _ = reply.send(run_identify(&mut pipeline, &image, &gallery));
                    }
                    EngineRequest::Plate { frames, reply } => {
                        let _ = reply.send(run_plate(&plates, &frames));
                    }
                    EngineRequest::Recognize {
                        face,
                        frames,
                        gallery,
                        registry,
                        reply,
                    } => {
                        let result = run_recognize(&mut pipeline, &plates, &face, &frames, &gallery, &registry);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    EngineHandle { tx }
}

fn run_identify<D: FaceDetector, E: EmbeddingExtractor>(
    pipeline: &mut FacePipeline<D, E>,
    image: &RgbImage,
    gallery: &[GalleryEntry<String>],
) -> Result<FaceOutcome<MatchResult<String>>, EngineError> {
    Ok(match pipeline.identify(image, gallery)? {
        FaceOutcome::Accepted(result) => FaceOutcome::Accepted(result.map(Clone::clone)),
        FaceOutcome::Rejected(miss) => FaceOutcome::Rejected(miss),
    })
}

/// Best candidate per frame, then the majority vote over frames that had one.
fn run_plate(plates: &PlateRecognizer, frames: &[RgbImage]) -> Result<PlateReport, EngineError> {
    let mut winners = Vec::with_capacity(frames.len());
    for frame in frames {
        winners.push(plates.recognize(frame)?);
    }
    let plate = majority_vote(winners.iter().flatten().map(|c| c.corrected_text.as_str()));
    Ok(PlateReport { plate, frames: winners })
}

fn run_recognize<D: FaceDetector, E: EmbeddingExtractor>(
    pipeline: &mut FacePipeline<D, E>,
    plates: &PlateRecognizer,
    face: &RgbImage,
    frames: &[RgbImage],
    gallery: &[GalleryEntry<String>],
    registry: &VehicleRegistry,
) -> Result<Recognition, EngineError> {
    let (matched, face_miss) = match run_identify(pipeline, face, gallery)? {
        FaceOutcome::Accepted(result) => (result, None),
        FaceOutcome::Rejected(miss) => (MatchResult::none(), Some(miss)),
    };

    let plate = plates.recognize_frames(frames)?;
    let vehicle = plate
        .as_deref()
        .and_then(|p| registry.lookup(p))
        .map(String::from);
    if plate.is_some() && vehicle.is_none() {
        tracing::info!(plate = ?plate, "plate not in vehicle registry");
    }

    tracing::info!(
        identity = ?matched.identity,
        confidence = matched.confidence,
        plate = ?plate,
        vehicle = ?vehicle,
        "recognition complete"
    );
    Ok(Recognition {
        identity: matched.identity,
        face_confidence: matched.confidence,
        face_distance: matched.distance,
        face_miss,
        plate,
        vehicle,
    })
}
