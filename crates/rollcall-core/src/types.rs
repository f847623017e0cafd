use serde::{Deserialize, Serialize};
use std::fmt;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection-over-Union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - inter;

        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Euclidean distance. Lower = more similar.
    ///
    /// Embeddings of different dimension are never close: the distance is
    /// `f32::INFINITY`.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return f32::INFINITY;
        }
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// A student's admission number, the identity key shared by the gallery
/// and the attendance store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AdmissionNumber(String);

impl AdmissionNumber {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Derive an admission number from an enrollment file name
    /// (`<admission_no>.<ext>`): everything before the first `.`.
    ///
    /// Returns `None` when nothing precedes the delimiter (e.g. `.hidden`).
    pub fn from_file_name(file_name: &str) -> Option<Self> {
        let stem = file_name.split('.').next().unwrap_or_default().trim();
        if stem.is_empty() {
            None
        } else {
            Some(Self(stem.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AdmissionNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AdmissionNumber {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// One enrolled reference face.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub identity: AdmissionNumber,
    pub embedding: Embedding,
}

/// A face found on a processed frame. Discarded after that frame's matching pass.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub location: BoundingBox,
    pub embedding: Embedding,
}

/// Identity resolved for one detected face.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "admission_no")]
pub enum Identity {
    Matched(AdmissionNumber),
    Unmatched,
}

impl Identity {
    pub fn admission_no(&self) -> Option<&AdmissionNumber> {
        match self {
            Identity::Matched(id) => Some(id),
            Identity::Unmatched => None,
        }
    }
}

/// Result of matching one query embedding against the whole gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub identity: Identity,
    /// Distance to the selected entry, or to the nearest entry when unmatched.
    /// `f32::INFINITY` for an empty gallery.
    pub distance: f32,
    /// Gallery position of the selected entry.
    pub index: Option<usize>,
}

impl MatchResult {
    pub fn unmatched(distance: f32) -> Self {
        Self { identity: Identity::Unmatched, distance, index: None }
    }

    pub fn is_match(&self) -> bool {
        matches!(self.identity, Identity::Matched(_))
    }
}
