//! rollcall-hw — camera capture for the identification loop.
//!
//! Provides V4L2-based camera access behind the [`FrameSource`] trait and
//! luma frame conversion.

pub mod camera;
pub mod frame;
pub mod source;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::Frame;
pub use source::{FrameSource, SourceGuard};
