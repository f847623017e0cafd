//! Operator feedback: boxes, labels and the session status line.
//!
//! Nothing here feeds back into matching or recording. A sink that fails to
//! render only costs the operator a preview frame.

use image::{DynamicImage, GrayImage, Rgb, RgbImage};
use imageproc::drawing::{draw_cross_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;
use rollcall_core::{BoundingBox, Identity};
use rollcall_hw::Frame;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

const AUTHORIZED: Rgb<u8> = Rgb([0, 200, 0]);
const UNKNOWN: Rgb<u8> = Rgb([220, 0, 0]);
const OTHER_STUDENT: Rgb<u8> = Rgb([230, 200, 0]);

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("frame buffer does not match {width}x{height}")]
    BadFrame { width: u32, height: u32 },
    #[error("image encode failed: {0}")]
    Image(#[from] image::ImageError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// One face as last seen on a processed frame.
#[derive(Debug, Clone, Serialize)]
pub struct FaceLabel {
    pub location: BoundingBox,
    pub identity: Identity,
    pub distance: f32,
    /// The face belongs to the student the session acts for.
    pub authorized: bool,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusLine {
    Scanning,
    Marked,
    AlreadyMarked,
}

impl StatusLine {
    pub fn text(self) -> &'static str {
        match self {
            StatusLine::Scanning => "Look at the camera. Press 'q' to quit.",
            StatusLine::Marked => "Marked! Press 'q' to quit.",
            StatusLine::AlreadyMarked => "Already marked today. Press 'q' to quit.",
        }
    }
}

/// What the loop wants drawn over the current frame.
#[derive(Debug, Serialize)]
pub struct FrameView<'a> {
    pub sequence: u32,
    /// Whether this frame went through detection, or is reusing labels.
    pub processed: bool,
    pub faces: &'a [FaceLabel],
    pub status: StatusLine,
    pub status_text: &'static str,
}

pub trait PresentationSink {
    fn render(&mut self, frame: &Frame, view: &FrameView<'_>) -> Result<(), RenderError>;

    /// Polled once per rendered frame; `true` ends the session.
    fn poll_stop(&mut self) -> bool {
        false
    }
}

impl<K: PresentationSink + ?Sized> PresentationSink for Box<K> {
    fn render(&mut self, frame: &Frame, view: &FrameView<'_>) -> Result<(), RenderError> {
        (**self).render(frame, view)
    }

    fn poll_stop(&mut self) -> bool {
        (**self).poll_stop()
    }
}

/// Headless sessions.
pub struct NullSink;

impl PresentationSink for NullSink {
    fn render(&mut self, _: &Frame, _: &FrameView<'_>) -> Result<(), RenderError> {
        Ok(())
    }
}

/// Writes the latest annotated frame to `<dir>/latest.jpg` with the labels
/// and status line alongside in `<dir>/latest.json`.
pub struct PreviewSink {
    dir: PathBuf,
}

impl PreviewSink {
    pub fn new(dir: &Path) -> Result<Self, RenderError> {
        std::fs::create_dir_all(dir)?;
        Ok(Self { dir: dir.to_path_buf() })
    }

    pub fn image_path(&self) -> PathBuf {
        self.dir.join("latest.jpg")
    }

    pub fn sidecar_path(&self) -> PathBuf {
        self.dir.join("latest.json")
    }
}

impl PresentationSink for PreviewSink {
    fn render(&mut self, frame: &Frame, view: &FrameView<'_>) -> Result<(), RenderError> {
        let image = annotate(frame, view.faces)?;

        // Readers poll these files; replace them whole.
        let tmp_image = self.dir.join("latest.jpg.tmp");
        image.save_with_format(&tmp_image, image::ImageFormat::Jpeg)?;
        std::fs::rename(&tmp_image, self.image_path())?;

        let tmp_sidecar = self.dir.join("latest.json.tmp");
        std::fs::write(&tmp_sidecar, serde_json::to_vec_pretty(view)?)?;
        std::fs::rename(&tmp_sidecar, self.sidecar_path())?;
        Ok(())
    }
}

/// Luma frame to RGB with one box per face, plus landmark crosses when the
/// detector supplied them.
pub fn annotate(frame: &Frame, faces: &[FaceLabel]) -> Result<RgbImage, RenderError> {
    let gray = GrayImage::from_raw(frame.width, frame.height, frame.data.clone())
        .ok_or(RenderError::BadFrame { width: frame.width, height: frame.height })?;
    let mut image = DynamicImage::ImageLuma8(gray).to_rgb8();

    for face in faces {
        let color = match (&face.identity, face.authorized) {
            (_, true) => AUTHORIZED,
            (Identity::Matched(_), false) => OTHER_STUDENT,
            (Identity::Unmatched, false) => UNKNOWN,
        };
        let b = &face.location;
        let (x, y) = (b.x.round() as i32, b.y.round() as i32);
        let (w, h) = (b.width.round().max(1.0) as u32, b.height.round().max(1.0) as u32);
        // Two pixels wide.
        draw_hollow_rect_mut(&mut image, Rect::at(x, y).of_size(w, h), color);
        if w > 2 && h > 2 {
            draw_hollow_rect_mut(&mut image, Rect::at(x + 1, y + 1).of_size(w - 2, h - 2), color);
        }
        for &(lx, ly) in b.landmarks.iter().flatten() {
            draw_cross_mut(&mut image, color, lx as i32, ly as i32);
        }
    }

    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::AdmissionNumber;

    fn frame(width: u32, height: u32) -> Frame {
        Frame::from_luma(vec![128; (width * height) as usize], width, height, 7)
    }

    fn label(identity: Identity, authorized: bool) -> FaceLabel {
        FaceLabel {
            location: BoundingBox {
                x: 2.0,
                y: 2.0,
                width: 10.0,
                height: 10.0,
                confidence: 0.9,
                landmarks: None,
            },
            identity,
            distance: 0.25,
            authorized,
            text: "Ada Obi".into(),
        }
    }

    #[test]
    fn test_annotate_colors_by_authorization() {
        let faces = [label(Identity::Matched(AdmissionNumber::new("A123")), true)];
        let image = annotate(&frame(32, 24), &faces).unwrap();
        assert_eq!(image.dimensions(), (32, 24));
        assert_eq!(*image.get_pixel(2, 2), AUTHORIZED);
        assert_eq!(*image.get_pixel(20, 20), Rgb([128, 128, 128]));

        let faces = [label(Identity::Unmatched, false)];
        let image = annotate(&frame(32, 24), &faces).unwrap();
        assert_eq!(*image.get_pixel(2, 2), UNKNOWN);
    }

    #[test]
    fn test_annotate_rejects_short_buffer() {
        let mut bad = frame(8, 8);
        bad.data.truncate(10);
        assert!(matches!(annotate(&bad, &[]), Err(RenderError::BadFrame { .. })));
    }

    #[test]
    fn test_preview_sink_writes_image_and_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = PreviewSink::new(&dir.path().join("preview")).unwrap();
        let faces = [label(Identity::Matched(AdmissionNumber::new("A123")), true)];
        let view = FrameView {
            sequence: 7,
            processed: true,
            faces: &faces,
            status: StatusLine::Marked,
            status_text: StatusLine::Marked.text(),
        };

        sink.render(&frame(32, 24), &view).unwrap();

        assert!(sink.image_path().exists());
        let sidecar: serde_json::Value =
            serde_json::from_slice(&std::fs::read(sink.sidecar_path()).unwrap()).unwrap();
        assert_eq!(sidecar["status"], "marked");
        assert_eq!(sidecar["faces"][0]["identity"]["admission_no"], "A123");
        assert_eq!(sidecar["faces"][0]["authorized"], true);
    }
}
