//! Grayscale frame type and raw pixel-format conversion.

/// A captured 8-bit grayscale camera frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Row-major pixels, `width * height` bytes.
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Driver sequence number.
    pub sequence: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("buffer too short: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

fn check_len(buf: &[u8], expected: usize) -> Result<(), FrameError> {
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// Packed YUYV 4:2:2 (`[Y0, U, Y1, V]`) to grayscale: keep the luma bytes.
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = width as usize * height as usize * 2;
    check_len(yuyv, expected)?;
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

/// 16-bit little-endian grayscale to 8-bit, keeping the high byte.
pub fn y16_to_grayscale(y16: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = width as usize * height as usize * 2;
    check_len(y16, expected)?;
    Ok(y16[..expected].chunks_exact(2).map(|px| px[1]).collect())
}

/// 8-bit grayscale, trimmed to exactly one frame.
pub fn grey_to_grayscale(grey: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = width as usize * height as usize;
    check_len(grey, expected)?;
    Ok(grey[..expected].to_vec())
}
