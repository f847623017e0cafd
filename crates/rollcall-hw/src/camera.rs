//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame};
use crate::source::FrameSource;
use std::io;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const CAPTURE_WIDTH: u32 = 640;
const CAPTURE_HEIGHT: u32 = 480;
const STREAM_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("camera device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("device busy: {0}")]
    DeviceBusy(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported by {0}")]
    StreamingNotSupported(String),
    #[error("frame read failed: {0}")]
    FrameReadFailure(String),
    #[error("no frame within {0:?}")]
    ReadTimeout(Duration),
    #[error("camera already released")]
    Released,
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub index: usize,
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel, extract Y channel).
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale.
    Y16,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"GREY" => Some(Self::Grey),
            b"Y16 " | b"Y16\0" => Some(Self::Y16),
            _ => None,
        }
    }
}

/// Path of the V4L2 node for a device index.
pub fn device_path(index: usize) -> String {
    format!("/dev/video{index}")
}

/// Streaming V4L2 camera. The mmap stream is started on the first read and
/// torn down by [`FrameSource::release`].
pub struct Camera {
    device: Device,
    stream: Option<MmapStream<'static>>,
    released: bool,
    read_timeout: Option<Duration>,
    pub index: usize,
    pub width: u32,
    pub height: u32,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open the camera at `/dev/video{index}` and negotiate a capture format.
    pub fn open(index: usize) -> Result<Self, CameraError> {
        let path = device_path(index);
        if !Path::new(&path).exists() {
            return Err(CameraError::DeviceUnavailable(format!("{path}: no such device")));
        }

        let device = Device::with_path(&path).map_err(|e| match e.raw_os_error() {
            // EBUSY
            Some(16) => CameraError::DeviceBusy(path.clone()),
            _ => CameraError::DeviceUnavailable(format!("{path}: {e}")),
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::DeviceUnavailable(format!("{path}: failed to query capabilities: {e}"))
        })?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported(path));
        }

        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = CAPTURE_WIDTH;
        fmt.height = CAPTURE_HEIGHT;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;
        let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {:?} (need YUYV, GREY, or Y16)",
                negotiated.fourcc
            ))
        })?;

        tracing::info!(
            device = %path,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?negotiated.fourcc,
            "opened camera"
        );

        Ok(Self {
            device,
            stream: None,
            released: false,
            read_timeout: None,
            index,
            width: negotiated.width,
            height: negotiated.height,
            fourcc: negotiated.fourcc,
            pixel_format,
        })
    }

    /// Bound every blocking read; a read that times out fails the session.
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Read and drop `count` frames so auto-exposure can settle.
    pub fn discard(&mut self, count: usize) -> Result<(), CameraError> {
        for _ in 0..count {
            self.read()?;
        }
        Ok(())
    }

    fn stream(&mut self) -> Result<&mut MmapStream<'static>, CameraError> {
        if self.released {
            return Err(CameraError::Released);
        }
        if self.stream.is_none() {
            let mut stream =
                MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
                    .map_err(|e| {
                        CameraError::FrameReadFailure(format!("failed to create mmap stream: {e}"))
                    })?;
            if let Some(timeout) = self.read_timeout {
                stream.set_timeout(timeout);
            }
            self.stream = Some(stream);
        }
        self.stream.as_mut().ok_or(CameraError::Released)
    }

    fn to_luma(&self, buf: &[u8]) -> Result<Vec<u8>, CameraError> {
        let pixels = (self.width * self.height) as usize;
        let converted = match self.pixel_format {
            PixelFormat::Grey if buf.len() >= pixels => Ok(buf[..pixels].to_vec()),
            PixelFormat::Grey => Err(frame::FrameError::InvalidLength {
                expected: pixels,
                actual: buf.len(),
            }),
            PixelFormat::Y16 => frame::y16_to_grayscale(buf, self.width, self.height),
            PixelFormat::Yuyv => frame::yuyv_to_grayscale(buf, self.width, self.height),
        };
        converted.map_err(|e| {
            CameraError::FrameReadFailure(format!("{:?} conversion: {e}", self.pixel_format))
        })
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..16)
            .filter_map(|index| {
                let path = device_path(index);
                if !Path::new(&path).exists() {
                    return None;
                }
                let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
                caps.capabilities
                    .contains(v4l::capability::Flags::VIDEO_CAPTURE)
                    .then(|| DeviceInfo {
                        index,
                        path,
                        name: caps.card.clone(),
                        driver: caps.driver.clone(),
                        bus: caps.bus.clone(),
                    })
            })
            .collect()
    }
}

impl FrameSource for Camera {
    fn read(&mut self) -> Result<Frame, CameraError> {
        let timeout = self.read_timeout;
        let (buf, sequence) = match self.stream()?.next() {
            Ok((buf, meta)) => (buf.to_vec(), meta.sequence),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                return Err(CameraError::ReadTimeout(timeout.unwrap_or_default()));
            }
            Err(e) => {
                return Err(CameraError::FrameReadFailure(format!(
                    "failed to dequeue buffer: {e}"
                )));
            }
        };

        let luma = self.to_luma(&buf)?;
        Ok(Frame::from_luma(luma, self.width, self.height, sequence))
    }

    fn release(&mut self) {
        if !self.released {
            self.stream = None;
            self.released = true;
            tracing::info!(device = %device_path(self.index), "camera released");
        }
    }
}
