//! rollcall-core — face identification for attendance self check-in.
//!
//! A pluggable [`EmbeddingProvider`] turns frames into face embeddings; the
//! shipped [`ArcFaceProvider`] runs SCRFD detection and ArcFace recognition
//! on ONNX Runtime. [`Gallery`] holds the enrolled reference faces and
//! [`matcher::identify`] resolves a query embedding to the nearest enrolled
//! identity.

pub mod alignment;
pub mod detector;
pub mod gallery;
pub mod matcher;
pub mod provider;
pub mod recognizer;
pub mod types;

pub use gallery::{EnrollmentError, Gallery, GalleryError, GalleryReport};
pub use provider::{ArcFaceProvider, EmbeddingProvider, ProviderError};
pub use types::{
    AdmissionNumber, BoundingBox, DetectedFace, Embedding, GalleryEntry, Identity, MatchResult,
};

use std::path::PathBuf;

/// System-wide model directory used when none is configured.
pub fn default_model_dir() -> PathBuf {
    PathBuf::from("/usr/share/rollcall/models")
}
