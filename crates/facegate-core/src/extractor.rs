//! Feature extraction boundary and its adapters.
//!
//! The matcher and service only see [`FeatureExtractor`]; which adapter backs
//! it is a configuration choice made once at startup by [`build_extractor`].

use crate::config::{Config, ModelKind};
use crate::detector::{DetectorError, FaceDetector};
use crate::error::FaceError;
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::Embedding;
use image::DynamicImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::Path;

/// Produces embeddings from raster images.
///
/// Implementations may hold inference sessions that need `&mut self`;
/// callers run them on a dedicated thread rather than an async executor.
pub trait FeatureExtractor: Send {
    /// Identifies the configuration embeddings are comparable under.
    fn descriptor(&self) -> &str;

    /// Embed the best face in `image`.
    ///
    /// Fails with [`FaceError::NoFaceDetected`] when there is no usable face.
    fn extract(&mut self, image: &DynamicImage) -> Result<Embedding, FaceError>;
}

impl From<DetectorError> for FaceError {
    fn from(e: DetectorError) -> Self {
        FaceError::ExtractionBackend(format!("detector: {e}"))
    }
}

impl From<RecognizerError> for FaceError {
    fn from(e: RecognizerError) -> Self {
        match e {
            // A box without landmarks cannot be aligned, so it is not a usable face.
            RecognizerError::NoLandmarks => FaceError::NoFaceDetected,
            other => FaceError::ExtractionBackend(format!("recognizer: {other}")),
        }
    }
}

/// SCRFD detection + ArcFace recognition over ONNX Runtime.
pub struct OnnxExtractor {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
    descriptor: String,
}

impl OnnxExtractor {
    pub fn load(
        detector_path: &Path,
        recognizer_path: &Path,
        descriptor: impl Into<String>,
    ) -> Result<Self, FaceError> {
        let detector = FaceDetector::load(detector_path)?;
        let recognizer = FaceRecognizer::load(recognizer_path)?;
        Ok(Self {
            detector,
            recognizer,
            descriptor: descriptor.into(),
        })
    }
}

impl FeatureExtractor for OnnxExtractor {
    fn descriptor(&self) -> &str {
        &self.descriptor
    }

    fn extract(&mut self, image: &DynamicImage) -> Result<Embedding, FaceError> {
        let rgb = image.to_rgb8();
        let faces = self.detector.detect(&rgb)?;
        // Highest confidence first; additional faces are ignored.
        let face = faces.first().ok_or(FaceError::NoFaceDetected)?;
        tracing::debug!(faces = faces.len(), confidence = face.confidence, "face selected");

        let mut embedding = self.recognizer.extract(&rgb, face)?;
        embedding.model_version = Some(self.descriptor.clone());
        Ok(embedding)
    }
}

const STUB_GRID: u32 = 8;
/// Below this spread (in normalized luma) the image is treated as faceless.
const STUB_MIN_SPREAD: f32 = 0.02;

/// Deterministic extractor: the mean luma of each cell of an 8×8 grid,
/// centered on zero.
///
/// The same picture, including after JPEG re-encoding, yields (nearly) the
/// same vector. A picture with no luma variation reports no face.
#[derive(Debug, Default, Clone, Copy)]
pub struct StubExtractor;

impl FeatureExtractor for StubExtractor {
    fn descriptor(&self) -> &str {
        "stub"
    }

    fn extract(&mut self, image: &DynamicImage) -> Result<Embedding, FaceError> {
        let gray = image.to_luma8();
        let (w, h) = gray.dimensions();
        if w == 0 || h == 0 {
            return Err(FaceError::NoFaceDetected);
        }

        let bounds = |i: u32, len: u32| {
            let start = (i * len / STUB_GRID).min(len - 1);
            let end = ((i + 1) * len / STUB_GRID).max(start + 1).min(len);
            start..end
        };

        let mut values = Vec::with_capacity((STUB_GRID * STUB_GRID) as usize);
        for gy in 0..STUB_GRID {
            for gx in 0..STUB_GRID {
                let (xs, ys) = (bounds(gx, w), bounds(gy, h));
                let count = (xs.len() * ys.len()) as f32;
                let sum: f32 = ys
                    .flat_map(|y| xs.clone().map(move |x| (x, y)))
                    .map(|(x, y)| gray.get_pixel(x, y)[0] as f32)
                    .sum();
                values.push(sum / count / 255.0 - 0.5);
            }
        }

        let (lo, hi) = values
            .iter()
            .fold((f32::MAX, f32::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        if hi - lo < STUB_MIN_SPREAD {
            return Err(FaceError::NoFaceDetected);
        }

        Ok(Embedding {
            values,
            model_version: Some(self.descriptor().to_string()),
        })
    }
}

const SIMULATED_DIM: usize = 128;

/// Random 128-d vectors regardless of input.
///
/// A stand-in for wiring demos when no models are installed; it cannot
/// recognize anyone and self-matches will fail.
pub struct SimulatedExtractor {
    rng: StdRng,
}

impl SimulatedExtractor {
    pub fn new() -> Self {
        Self { rng: StdRng::from_entropy() }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self { rng: StdRng::seed_from_u64(seed) }
    }
}

impl Default for SimulatedExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl FeatureExtractor for SimulatedExtractor {
    fn descriptor(&self) -> &str {
        "simulated"
    }

    fn extract(&mut self, _image: &DynamicImage) -> Result<Embedding, FaceError> {
        let values = (0..SIMULATED_DIM).map(|_| self.rng.gen::<f32>()).collect();
        Ok(Embedding {
            values,
            model_version: Some(self.descriptor().to_string()),
        })
    }
}

/// Construct the extractor selected by `config`, loading model files if needed.
pub fn build_extractor(config: &Config) -> Result<Box<dyn FeatureExtractor>, FaceError> {
    let descriptor = config.descriptor();
    let extractor: Box<dyn FeatureExtractor> = match config.model {
        ModelKind::Stub => Box::new(StubExtractor),
        ModelKind::Simulated => {
            tracing::warn!("simulated extractor active: matches are random and meaningless");
            Box::new(SimulatedExtractor::new())
        }
        ModelKind::ArcfaceR50 | ModelKind::ArcfaceMbf => {
            let recognizer_path = config.recognizer_model_path().ok_or_else(|| {
                FaceError::Config(format!("model {} has no recognizer file", config.model))
            })?;
            Box::new(OnnxExtractor::load(
                &config.detector_model_path(),
                &recognizer_path,
                descriptor.clone(),
            )?)
        }
    };
    tracing::info!(extractor = %descriptor, "feature extractor ready");
    Ok(extractor)
}
