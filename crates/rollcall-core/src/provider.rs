//! Embedding provider contract.
//!
//! The identification pipeline only talks to faces through this trait: detect
//! boxes, encode them into embeddings, and measure distance. Every embedding a
//! session compares must come from the same provider, which is why the gallery
//! remembers [`EmbeddingProvider::version`].

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError, ARCFACE_MODEL_VERSION};
use crate::types::{BoundingBox, Embedding, GalleryEntry};
use std::path::Path;
use thiserror::Error;

/// Euclidean distance between L2-normalized ArcFace embeddings at which two
/// faces are considered the same person. Equivalent to cosine similarity ≈ 0.40.
pub const ARCFACE_DEFAULT_TOLERANCE: f32 = 1.10;

pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("provider returned {embeddings} embeddings for {boxes} faces")]
    Misaligned { boxes: usize, embeddings: usize },
    #[error("{0}")]
    Other(String),
}

pub trait EmbeddingProvider {
    /// Identifier of the model pair; embeddings with different versions are
    /// never compared.
    fn version(&self) -> &str;

    /// Locate faces in a luma frame, best candidate first.
    fn detect(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<BoundingBox>, ProviderError>;

    /// Encode the given faces. The result is positionally aligned with `boxes`.
    fn encode(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
        boxes: &[BoundingBox],
    ) -> Result<Vec<Embedding>, ProviderError>;

    /// Calibrated match threshold for [`distance`](Self::distance).
    fn default_tolerance(&self) -> f32;

    /// Lower = more similar.
    fn distance(&self, a: &Embedding, b: &Embedding) -> f32 {
        a.euclidean_distance(b)
    }

    /// Per gallery entry: is `candidate` within `tolerance` of it?
    fn compare(
        &self,
        gallery: &[GalleryEntry],
        candidate: &Embedding,
        tolerance: f32,
    ) -> Vec<bool> {
        gallery
            .iter()
            .map(|entry| self.distance(&entry.embedding, candidate) <= tolerance)
            .collect()
    }
}

impl<P: EmbeddingProvider + ?Sized> EmbeddingProvider for Box<P> {
    fn version(&self) -> &str {
        (**self).version()
    }

    fn detect(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<BoundingBox>, ProviderError> {
        (**self).detect(frame, width, height)
    }

    fn encode(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
        boxes: &[BoundingBox],
    ) -> Result<Vec<Embedding>, ProviderError> {
        (**self).encode(frame, width, height, boxes)
    }

    fn default_tolerance(&self) -> f32 {
        (**self).default_tolerance()
    }

    fn distance(&self, a: &Embedding, b: &Embedding) -> f32 {
        (**self).distance(a, b)
    }

    fn compare(
        &self,
        gallery: &[GalleryEntry],
        candidate: &Embedding,
        tolerance: f32,
    ) -> Vec<bool> {
        (**self).compare(gallery, candidate, tolerance)
    }
}

/// SCRFD detection + ArcFace embeddings over ONNX Runtime.
pub struct ArcFaceProvider {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl ArcFaceProvider {
    /// Load both models from `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self, ProviderError> {
        let scrfd = model_dir.join(SCRFD_MODEL_FILE);
        let arcface = model_dir.join(ARCFACE_MODEL_FILE);

        let detector = FaceDetector::load(&scrfd.to_string_lossy())?;
        let recognizer = FaceRecognizer::load(&arcface.to_string_lossy())?;

        Ok(Self { detector, recognizer })
    }
}

impl EmbeddingProvider for ArcFaceProvider {
    fn version(&self) -> &str {
        ARCFACE_MODEL_VERSION
    }

    fn detect(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<BoundingBox>, ProviderError> {
        Ok(self.detector.detect(frame, width, height)?)
    }

    fn encode(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
        boxes: &[BoundingBox],
    ) -> Result<Vec<Embedding>, ProviderError> {
        Ok(self.recognizer.extract_all(frame, width, height, boxes)?)
    }

    fn default_tolerance(&self) -> f32 {
        ARCFACE_DEFAULT_TOLERANCE
    }
}
