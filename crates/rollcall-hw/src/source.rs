//! Frame source abstraction with scoped release.

use crate::camera::CameraError;
use crate::frame::Frame;
use std::ops::{Deref, DerefMut};

/// Something that yields frames until released.
pub trait FrameSource {
    /// Block until the next frame is available or the device fails.
    fn read(&mut self) -> Result<Frame, CameraError>;

    /// Stop streaming and give the device back. Must be idempotent.
    fn release(&mut self);
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn read(&mut self) -> Result<Frame, CameraError> {
        (**self).read()
    }

    fn release(&mut self) {
        (**self).release()
    }
}

/// Owns a source and releases it when dropped, on every exit path.
pub struct SourceGuard<S: FrameSource> {
    source: S,
}

impl<S: FrameSource> SourceGuard<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }
}

impl<S: FrameSource> Deref for SourceGuard<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.source
    }
}

impl<S: FrameSource> DerefMut for SourceGuard<S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut self.source
    }
}

impl<S: FrameSource> Drop for SourceGuard<S> {
    fn drop(&mut self) {
        self.source.release();
        tracing::debug!("frame source released");
    }
}
