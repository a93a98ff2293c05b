//! Frame type and raw-buffer to grayscale conversion.

use image::{GrayImage, ImageFormat};

/// A captured grayscale camera frame.
#[derive(Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
}

impl Frame {
    /// Average pixel brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&b| b as f32).sum::<f32>() / self.data.len() as f32
    }

    pub fn into_image(self) -> Result<GrayImage, FrameError> {
        let actual = self.data.len();
        GrayImage::from_raw(self.width, self.height, self.data).ok_or(FrameError::InvalidLength {
            expected: (self.width * self.height) as usize,
            actual,
        })
    }
}

/// Convert packed YUYV (4:2:2) to grayscale by extracting the Y channel.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
/// Grayscale = every even-indexed byte.
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

/// Take the first `width * height` bytes of an 8-bit grayscale buffer.
pub fn grey_to_grayscale(buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height) as usize;
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: buf.len(),
        });
    }
    Ok(buf[..expected].to_vec())
}

/// Downscale 16-bit little-endian grayscale to 8-bit by keeping the high byte.
pub fn y16_to_grayscale(buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let pixels = (width * height) as usize;
    let expected = pixels * 2;
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: buf.len(),
        });
    }
    Ok(buf[..expected].chunks_exact(2).map(|px| px[1]).collect())
}

/// Decode a Motion-JPEG frame to grayscale.
///
/// Returns the decoded pixels with their dimensions, which need not match
/// the negotiated format.
pub fn mjpeg_to_grayscale(buf: &[u8]) -> Result<(Vec<u8>, u32, u32), FrameError> {
    let decoded = image::load_from_memory_with_format(buf, ImageFormat::Jpeg)
        .map_err(|e| FrameError::Decode(e.to_string()))?
        .to_luma8();
    let (width, height) = decoded.dimensions();
    Ok((decoded.into_raw(), width, height))
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("failed to decode frame: {0}")]
    Decode(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, Luma};
    use std::io::Cursor;

    #[test]
    fn test_yuyv_to_grayscale() {
        // 2x1 image: [Y0=100, U=128, Y1=200, V=128]
        let yuyv = vec![100, 128, 200, 128];
        let gray = yuyv_to_grayscale(&yuyv, 2, 1).unwrap();
        assert_eq!(gray, vec![100, 200]);
    }

    #[test]
    fn test_yuyv_to_grayscale_4x2() {
        let yuyv: Vec<u8> = (0..16).collect();
        let gray = yuyv_to_grayscale(&yuyv, 4, 2).unwrap();
        assert_eq!(gray, vec![0, 2, 4, 6, 8, 10, 12, 14]);
    }

    #[test]
    fn test_yuyv_invalid_length() {
        let yuyv = vec![100, 128]; // too short for 2x1
        assert!(matches!(
            yuyv_to_grayscale(&yuyv, 2, 1),
            Err(FrameError::InvalidLength { expected: 4, actual: 2 })
        ));
    }

    #[test]
    fn test_grey_truncates_padding() {
        let buf = vec![1, 2, 3, 4, 99, 99];
        assert_eq!(grey_to_grayscale(&buf, 2, 2).unwrap(), vec![1, 2, 3, 4]);
        assert!(grey_to_grayscale(&buf, 3, 3).is_err());
    }

    #[test]
    fn test_y16_keeps_high_byte() {
        // 0x1234 and 0xFF00, little-endian.
        let buf = vec![0x34, 0x12, 0x00, 0xFF];
        assert_eq!(y16_to_grayscale(&buf, 2, 1).unwrap(), vec![0x12, 0xFF]);
        assert!(y16_to_grayscale(&buf[..3], 2, 1).is_err());
    }

    #[test]
    fn test_mjpeg_decode() {
        let source = GrayImage::from_pixel(16, 8, Luma([128]));
        let mut jpeg = Vec::new();
        DynamicImage::ImageLuma8(source)
            .write_to(&mut Cursor::new(&mut jpeg), ImageFormat::Jpeg)
            .unwrap();

        let (gray, width, height) = mjpeg_to_grayscale(&jpeg).unwrap();
        assert_eq!((width, height), (16, 8));
        assert_eq!(gray.len(), 16 * 8);
        assert!(gray.iter().all(|&p| (p as i32 - 128).abs() <= 2));
    }

    #[test]
    fn test_mjpeg_garbage_is_decode_error() {
        assert!(matches!(mjpeg_to_grayscale(&[0, 1, 2, 3]), Err(FrameError::Decode(_))));
    }

    #[test]
    fn test_frame_into_image() {
        let frame = Frame {
            data: vec![7; 6],
            width: 3,
            height: 2,
            timestamp: std::time::Instant::now(),
            sequence: 0,
        };
        assert!((frame.avg_brightness() - 7.0).abs() < 1e-6);
        let image = frame.into_image().unwrap();
        assert_eq!(image.dimensions(), (3, 2));
    }

    #[test]
    fn test_frame_into_image_short_buffer() {
        let frame = Frame {
            data: vec![7; 5],
            width: 3,
            height: 2,
            timestamp: std::time::Instant::now(),
            sequence: 0,
        };
        assert!(matches!(frame.into_image(), Err(FrameError::InvalidLength { expected: 6, actual: 5 })));
    }
}
