//! Frame type and pixel conversion — YUYV/Y16 to luma, dark detection.

/// Fraction of near-black pixels above which a frame is considered dark.
pub const DARK_FRAME_THRESHOLD: f32 = 0.95;

/// A captured 8-bit luma camera frame.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Luma pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub sequence: u32,
    pub is_dark: bool,
}

impl Frame {
    /// Wrap an already-converted luma buffer.
    pub fn from_luma(data: Vec<u8>, width: u32, height: u32, sequence: u32) -> Self {
        let is_dark = is_dark_frame(&data, DARK_FRAME_THRESHOLD);
        Self { data, width, height, sequence, is_dark }
    }

    /// Average pixel brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&b| b as f32).sum::<f32>() / self.data.len() as f32
    }
}

/// Convert packed YUYV (4:2:2) to luma: `[Y0, U, Y1, V]` → every even byte.
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength { expected, actual: yuyv.len() });
    }
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

/// 16-bit little-endian luma downscaled to 8 bits (high byte).
pub fn y16_to_grayscale(y16: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if y16.len() < expected {
        return Err(FrameError::InvalidLength { expected, actual: y16.len() });
    }
    Ok(y16[..expected].chunks_exact(2).map(|px| px[1]).collect())
}

/// True if more than `threshold_pct` of pixels are near black (< 32).
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark_count = gray.iter().filter(|&&p| p < 32).count();
    (dark_count as f32 / gray.len() as f32) > threshold_pct
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}
