//! Enrollment gallery: one reference embedding per `<admission_no>.<ext>` image.

use crate::provider::{EmbeddingProvider, ProviderError};
use crate::types::{AdmissionNumber, Embedding, GalleryEntry};
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Fatal: the session cannot start without its enrollment directory.
#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("enrollment directory {path} unreadable: {source}")]
    EnrollmentDirUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Per-file failures. The file is skipped and the build continues.
#[derive(Error, Debug)]
pub enum EnrollmentError {
    #[error("enrollment image unreadable: {0}")]
    EnrollmentImageUnreadable(String),
    #[error("no face in enrollment image")]
    NoFaceInEnrollmentImage,
    #[error("embedding provider failed: {0}")]
    Provider(#[from] ProviderError),
}

/// An enrollment file left out of the gallery, kept for diagnostics.
#[derive(Debug)]
pub struct SkippedEnrollment {
    pub path: PathBuf,
    pub reason: EnrollmentError,
}

/// Ordered, read-only reference set for one identification session.
#[derive(Debug)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
    provider_version: String,
    skipped: Vec<SkippedEnrollment>,
}

/// Serializable summary of a gallery build.
#[derive(Debug, Serialize)]
pub struct GalleryReport {
    pub provider_version: String,
    pub identities: Vec<String>,
    pub skipped: Vec<SkippedReport>,
}

#[derive(Debug, Serialize)]
pub struct SkippedReport {
    pub file: String,
    pub reason: String,
}

impl Gallery {
    /// Scan `dir` (non-recursively, in file-name order) and embed each image.
    ///
    /// Unreadable or faceless images are skipped with a warning; only an
    /// unreadable directory is an error.
    pub fn build<P: EmbeddingProvider + ?Sized>(
        dir: &Path,
        provider: &mut P,
    ) -> Result<Self, GalleryError> {
        let dir_err = |source| GalleryError::EnrollmentDirUnreadable {
            path: dir.to_path_buf(),
            source,
        };

        let mut files: Vec<PathBuf> = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(dir_err)? {
            match entry {
                Ok(entry) if entry.path().is_file() => files.push(entry.path()),
                Ok(_) => {}
                Err(e) => tracing::warn!(
                    dir = %dir.display(),
                    error = %e,
                    "skipping unreadable directory entry"
                ),
            }
        }
        files.sort();

        let mut gallery = Self {
            entries: Vec::with_capacity(files.len()),
            provider_version: provider.version().to_string(),
            skipped: Vec::new(),
        };

        for path in files {
            let Some(identity) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(AdmissionNumber::from_file_name)
            else {
                tracing::debug!(
                    file = %path.display(),
                    "no admission number in file name, ignoring"
                );
                continue;
            };

            match embed_enrollment_image(&path, provider) {
                Ok(embedding) => {
                    if gallery.entries.iter().any(|e| e.identity == identity) {
                        tracing::warn!(
                            %identity,
                            file = %path.display(),
                            "duplicate admission number in gallery"
                        );
                    }
                    gallery.entries.push(GalleryEntry { identity, embedding });
                }
                Err(reason) => {
                    tracing::warn!(file = %path.display(), %reason, "skipping enrollment image");
                    gallery.skipped.push(SkippedEnrollment { path, reason });
                }
            }
        }

        tracing::info!(
            dir = %dir.display(),
            entries = gallery.entries.len(),
            skipped = gallery.skipped.len(),
            "gallery built"
        );
        Ok(gallery)
    }

    /// Assemble a gallery from already-computed entries.
    pub fn from_entries(provider_version: impl Into<String>, entries: Vec<GalleryEntry>) -> Self {
        Self { entries, provider_version: provider_version.into(), skipped: Vec::new() }
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn provider_version(&self) -> &str {
        &self.provider_version
    }

    pub fn skipped(&self) -> &[SkippedEnrollment] {
        &self.skipped
    }

    pub fn report(&self) -> GalleryReport {
        GalleryReport {
            provider_version: self.provider_version.clone(),
            identities: self.entries.iter().map(|e| e.identity.to_string()).collect(),
            skipped: self
                .skipped
                .iter()
                .map(|s| SkippedReport {
                    file: s.path.display().to_string(),
                    reason: s.reason.to_string(),
                })
                .collect(),
        }
    }
}

/// Decode one enrollment image and embed its most confident face.
fn embed_enrollment_image<P: EmbeddingProvider + ?Sized>(
    path: &Path,
    provider: &mut P,
) -> Result<Embedding, EnrollmentError> {
    let image = image::open(path)
        .map_err(|e| EnrollmentError::EnrollmentImageUnreadable(e.to_string()))?
        .to_luma8();
    let (width, height) = image.dimensions();

    let faces = provider.detect(image.as_raw(), width, height)?;
    let face = faces.into_iter().next().ok_or(EnrollmentError::NoFaceInEnrollmentImage)?;

    let mut embeddings =
        provider.encode(image.as_raw(), width, height, std::slice::from_ref(&face))?;
    if embeddings.len() != 1 {
        return Err(ProviderError::Misaligned { boxes: 1, embeddings: embeddings.len() }.into());
    }
    Ok(embeddings.remove(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoundingBox;
    use image::{GrayImage, Luma};

    /// Sees a face in any non-black image; the embedding is the mean luma.
    struct MeanLuma;

    impl EmbeddingProvider for MeanLuma {
        fn version(&self) -> &str {
            "mean-luma"
        }

        fn detect(
            &mut self,
            frame: &[u8],
            width: u32,
            height: u32,
        ) -> Result<Vec<BoundingBox>, ProviderError> {
            if frame.iter().all(|&p| p == 0) {
                return Ok(vec![]);
            }
            Ok(vec![BoundingBox {
                x: 0.0,
                y: 0.0,
                width: width as f32,
                height: height as f32,
                confidence: 0.9,
                landmarks: None,
            }])
        }

        fn encode(
            &mut self,
            frame: &[u8],
            _: u32,
            _: u32,
            boxes: &[BoundingBox],
        ) -> Result<Vec<Embedding>, ProviderError> {
            let mean = frame.iter().map(|&p| p as f32).sum::<f32>() / frame.len() as f32;
            Ok(boxes.iter().map(|_| Embedding::new(vec![mean])).collect())
        }

        fn default_tolerance(&self) -> f32 {
            1.0
        }
    }

    fn write_png(dir: &Path, name: &str, luma: u8) {
        GrayImage::from_pixel(8, 8, Luma([luma])).save(dir.join(name)).unwrap();
    }

    #[test]
    fn test_corrupt_image_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "A123.png", 200);
        std::fs::write(dir.path().join("B456.jpg"), b"definitely not a jpeg").unwrap();

        let gallery = Gallery::build(dir.path(), &mut MeanLuma).unwrap();

        assert_eq!(gallery.len(), 1);
        assert_eq!(gallery.entries()[0].identity.as_str(), "A123");
        assert_eq!(gallery.skipped().len(), 1);
        assert!(matches!(
            gallery.skipped()[0].reason,
            EnrollmentError::EnrollmentImageUnreadable(_)
        ));
    }

    #[test]
    fn test_faceless_image_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "A1.png", 0);
        write_png(dir.path(), "A2.png", 90);

        let gallery = Gallery::build(dir.path(), &mut MeanLuma).unwrap();

        assert_eq!(gallery.report().identities, vec!["A2".to_string()]);
        assert!(matches!(gallery.skipped()[0].reason, EnrollmentError::NoFaceInEnrollmentImage));
    }

    #[test]
    fn test_order_is_by_file_name_and_subdirs_ignored() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "C3.png", 30);
        write_png(dir.path(), "A1.png", 10);
        write_png(dir.path(), "B2.png", 20);
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        write_png(&dir.path().join("nested"), "Z9.png", 40);

        let gallery = Gallery::build(dir.path(), &mut MeanLuma).unwrap();

        let ids: Vec<&str> = gallery.entries().iter().map(|e| e.identity.as_str()).collect();
        assert_eq!(ids, ["A1", "B2", "C3"]);
        assert_eq!(gallery.provider_version(), "mean-luma");
        assert!((gallery.entries()[1].embedding.values[0] - 20.0).abs() < 1e-3);
    }

    #[test]
    fn test_duplicate_admission_numbers_are_kept_in_order() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "A1.front.png", 10);
        write_png(dir.path(), "A1.png", 20);

        let gallery = Gallery::build(dir.path(), &mut MeanLuma).unwrap();
        assert_eq!(gallery.len(), 2);
        assert!(gallery.entries().iter().all(|e| e.identity.as_str() == "A1"));
    }

    #[test]
    fn test_missing_directory_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = Gallery::build(&dir.path().join("absent"), &mut MeanLuma).unwrap_err();
        assert!(matches!(err, GalleryError::EnrollmentDirUnreadable { .. }));
    }

    #[test]
    fn test_empty_directory_builds_empty_gallery() {
        let dir = tempfile::tempdir().unwrap();
        let gallery = Gallery::build(dir.path(), &mut MeanLuma).unwrap();
        assert!(gallery.is_empty());
    }
}
