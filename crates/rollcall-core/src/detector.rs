//! SCRFD face detector via ONNX Runtime.
//!
//! Anchor-free decoding over three strides followed by NMS. Input frames are
//! 8-bit luma, letterboxed into the square model input.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} (place the insightface model in the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("frame buffer is {actual} bytes, expected {expected} for {width}x{height}")]
    BadFrame { width: u32, height: u32, expected: usize, actual: usize },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Placement of the resized frame inside the model input.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
    new_w: u32,
    new_h: u32,
}

impl Letterbox {
    fn fit(width: u32, height: u32, target: u32) -> Self {
        let scale = (target as f32 / width as f32).min(target as f32 / height as f32);
        let new_w = ((width as f32 * scale).round() as u32).clamp(1, target);
        let new_h = ((height as f32 * scale).round() as u32).clamp(1, target);
        Self {
            scale,
            pad_x: (target - new_w) as f32 / 2.0,
            pad_y: (target - new_h) as f32 / 2.0,
            new_w,
            new_h,
        }
    }

    /// Map a point from model-input space back to frame space.
    fn unmap(&self, (x, y): (f32, f32)) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor indices for one stride: (score, bbox, kps).
type StrideOutputs = (usize, usize, usize);

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    /// Per-stride output indices for strides [8, 16, 32].
    layout: [StrideOutputs; 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();
        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {}",
                output_names.len()
            )));
        }

        let layout = output_layout(&output_names);
        tracing::info!(path = model_path, outputs = ?output_names, ?layout, "loaded SCRFD model");

        Ok(Self { session, layout })
    }

    /// Detect faces in a luma frame, highest confidence first.
    pub fn detect(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<BoundingBox>, DetectorError> {
        let (input, letterbox) = preprocess(frame, width, height)?;

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (&stride, &(score_idx, bbox_idx, kps_idx)) in SCRFD_STRIDES.iter().zip(&self.layout) {
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| {
                        DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}"))
                    })
            };
            let head = StrideHead {
                stride,
                scores: extract(score_idx, "scores")?,
                bboxes: extract(bbox_idx, "bboxes")?,
                kps: extract(kps_idx, "kps")?,
            };
            candidates.extend(head.decode(&letterbox, SCRFD_CONFIDENCE_THRESHOLD));
        }

        Ok(nms(candidates, SCRFD_NMS_THRESHOLD))
    }
}

/// Resize a luma frame into the letterboxed NCHW tensor SCRFD expects.
fn preprocess(
    frame: &[u8],
    width: u32,
    height: u32,
) -> Result<(Array4<f32>, Letterbox), DetectorError> {
    let expected = (width as usize) * (height as usize);
    let image = GrayImage::from_raw(width, height, frame.get(..expected).unwrap_or(frame).to_vec())
        .filter(|_| width > 0 && height > 0)
        .ok_or(DetectorError::BadFrame { width, height, expected, actual: frame.len() })?;

    let letterbox = Letterbox::fit(width, height, SCRFD_INPUT_SIZE);
    let resized = imageops::resize(&image, letterbox.new_w, letterbox.new_h, FilterType::Triangle);

    let size = SCRFD_INPUT_SIZE as usize;
    // Padding uses the mean so it normalizes to 0.0.
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    let (x0, y0) = (letterbox.pad_x.floor() as u32, letterbox.pad_y.floor() as u32);

    for y in 0..SCRFD_INPUT_SIZE {
        for x in 0..SCRFD_INPUT_SIZE {
            let inside = x >= x0 && y >= y0 && x < x0 + letterbox.new_w && y < y0 + letterbox.new_h;
            let pixel = if inside {
                resized.get_pixel(x - x0, y - y0).0[0] as f32
            } else {
                SCRFD_MEAN
            };
            let normalized = (pixel - SCRFD_MEAN) / SCRFD_STD;
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] = normalized;
            }
        }
    }

    Ok((tensor, letterbox))
}

/// Map output tensors to stride slots.
///
/// Exports either name tensors `score_8`, `bbox_16`, `kps_32`, ... or use
/// numeric names, in which case the conventional positional order applies:
/// `[0-2]` scores, `[3-5]` bboxes, `[6-8]` keypoints.
fn output_layout(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let named: Option<Vec<StrideOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&s| Some((find("score", s)?, find("bbox", s)?, find("kps", s)?)))
        .collect();

    match named.as_deref() {
        Some(&[s8, s16, s32]) => [s8, s16, s32],
        _ => {
            tracing::debug!(?names, "SCRFD output names not recognized, using positional mapping");
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

/// Raw outputs of one stride level.
struct StrideHead<'a> {
    stride: usize,
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: &'a [f32],
}

impl StrideHead<'_> {
    fn decode(&self, letterbox: &Letterbox, threshold: f32) -> Vec<BoundingBox> {
        let grid_w = SCRFD_INPUT_SIZE as usize / self.stride;
        let grid_h = SCRFD_INPUT_SIZE as usize / self.stride;
        let stride = self.stride as f32;

        (0..grid_w * grid_h * SCRFD_ANCHORS_PER_CELL)
            .filter_map(|idx| {
                let score = *self.scores.get(idx)?;
                if score <= threshold {
                    return None;
                }

                let cell = idx / SCRFD_ANCHORS_PER_CELL;
                let anchor = ((cell % grid_w) as f32 * stride, (cell / grid_w) as f32 * stride);

                let d = self.bboxes.get(idx * 4..idx * 4 + 4)?;
                let offset = |dx: f32, dy: f32| (anchor.0 + dx * stride, anchor.1 + dy * stride);
                let (x1, y1) = letterbox.unmap(offset(-d[0], -d[1]));
                let (x2, y2) = letterbox.unmap(offset(d[2], d[3]));

                let landmarks = self.kps.get(idx * 10..idx * 10 + 10).map(|k| {
                    std::array::from_fn(|i| letterbox.unmap(offset(k[i * 2], k[i * 2 + 1])))
                });

                Some(BoundingBox {
                    x: x1,
                    y: y1,
                    width: x2 - x1,
                    height: y2 - y1,
                    confidence: score,
                    landmarks,
                })
            })
            .collect()
    }
}

/// Non-maximum suppression. Output is sorted by confidence, highest first.
fn nms(mut detections: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<BoundingBox> = Vec::new();
    for candidate in detections {
        if keep.iter().all(|kept| kept.iou(&candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}
