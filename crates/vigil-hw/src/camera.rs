//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame, FrameError};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

// --- Named constants ---
/// Device indices tried, in order, when no device is configured.
const AUTO_PROBE_INDICES: [u32; 3] = [0, 1, 2];
const MMAP_BUFFER_COUNT: u32 = 4;
const MAX_LISTED_DEVICES: u32 = 16;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("no working camera found (tried /dev/video0 to /dev/video2)")]
    NoCamera,
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("camera not responding: {0}")]
    NotResponding(String),
    #[error("invalid frame: {0}")]
    Frame(#[from] FrameError),
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
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
    /// 8-bit grayscale (1 byte/pixel).
    Grey,
    /// 16-bit little-endian grayscale (2 bytes/pixel).
    Y16,
    /// Motion-JPEG, decoded per frame.
    Mjpeg,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        if fourcc == FourCC::new(b"GREY") {
            Some(Self::Grey)
        } else if fourcc == FourCC::new(b"YUYV") {
            Some(Self::Yuyv)
        } else if fourcc == FourCC::new(b"Y16 ") || fourcc == FourCC::new(b"Y16\0") {
            Some(Self::Y16)
        } else if fourcc == FourCC::new(b"MJPG") {
            Some(Self::Mjpeg)
        } else {
            None
        }
    }
}

/// Formats asked for, in order of preference.
const PREFERRED_FOURCCS: [&[u8; 4]; 3] = [b"YUYV", b"MJPG", b"GREY"];

/// Ask for each preferred format at `width`x`height` and keep the first answer
/// we can decode. Drivers may substitute their own format or size.
fn negotiate_format(
    device: &Device,
    width: u32,
    height: u32,
) -> Result<(v4l::Format, PixelFormat), CameraError> {
    let mut last = None;
    for wanted in PREFERRED_FOURCCS {
        let mut request = device
            .format()
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("cannot read format: {e}")))?;
        request.fourcc = FourCC::new(wanted);
        request.width = width;
        request.height = height;

        let answer = device
            .set_format(&request)
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("cannot set format: {e}")))?;
        if let Some(pixel_format) = PixelFormat::from_fourcc(answer.fourcc) {
            return Ok((answer, pixel_format));
        }
        tracing::debug!(requested = ?FourCC::new(wanted), got = ?answer.fourcc, "format not usable");
        last = Some(answer.fourcc);
    }
    Err(CameraError::FormatNegotiationFailed(format!(
        "unsupported pixel format {last:?} (need YUYV, MJPG, GREY or Y16)"
    )))
}

/// V4L2 camera device handle.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    /// Negotiated pixel format.
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 camera device by path (e.g., "/dev/video0") and ask for
    /// the given resolution.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        let (negotiated, pixel_format) = negotiate_format(&device, width, height)?;
        let fourcc = negotiated.fourcc;
        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "negotiated format"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc,
            pixel_format,
        })
    }

    /// Start streaming. Waits `warmup`, then requires one test frame.
    pub fn into_stream(self, warmup: Duration) -> Result<CameraStream, CameraError> {
        let stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, MMAP_BUFFER_COUNT)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;

        let mut stream = CameraStream { stream, camera: self };

        std::thread::sleep(warmup);
        let test = stream
            .next_frame()
            .map_err(|e| CameraError::NotResponding(format!("{}: {e}", stream.camera.device_path)))?;
        tracing::info!(
            device = %stream.camera.device_path,
            brightness = test.avg_brightness(),
            "camera responding"
        );
        Ok(stream)
    }

    /// Convert a raw buffer to a grayscale frame based on the negotiated format.
    fn buf_to_frame(&self, buf: &[u8], sequence: u32) -> Result<Frame, CameraError> {
        let (data, width, height) = match self.pixel_format {
            PixelFormat::Grey => (frame::grey_to_grayscale(buf, self.width, self.height)?, self.width, self.height),
            PixelFormat::Y16 => (frame::y16_to_grayscale(buf, self.width, self.height)?, self.width, self.height),
            PixelFormat::Yuyv => (frame::yuyv_to_grayscale(buf, self.width, self.height)?, self.width, self.height),
            PixelFormat::Mjpeg => frame::mjpeg_to_grayscale(buf)?,
        };
        Ok(Frame {
            data,
            width,
            height,
            timestamp: std::time::Instant::now(),
            sequence,
        })
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..MAX_LISTED_DEVICES {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

/// Open the first working camera among `/dev/video0..2`.
pub fn open_auto(width: u32, height: u32, warmup: Duration) -> Result<CameraStream, CameraError> {
    for index in AUTO_PROBE_INDICES {
        let path = format!("/dev/video{index}");
        match Camera::open(&path, width, height).and_then(|c| c.into_stream(warmup)) {
            Ok(stream) => return Ok(stream),
            Err(e) => tracing::debug!(device = %path, error = %e, "camera probe failed"),
        }
    }
    Err(CameraError::NoCamera)
}

/// A streaming camera. Dropping it stops the stream and closes the device.
pub struct CameraStream {
    // Declared first so the buffers are released before the device.
    stream: MmapStream<'static>,
    camera: Camera,
}

impl CameraStream {
    /// Block until the next frame is dequeued.
    pub fn next_frame(&mut self) -> Result<Frame, CameraError> {
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;
        self.camera.buf_to_frame(buf, meta.sequence)
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_format_from_fourcc() {
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"YUYV")), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"GREY")), Some(PixelFormat::Grey));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"Y16 ")), Some(PixelFormat::Y16));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"MJPG")), Some(PixelFormat::Mjpeg));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"NV12")), None);
    }

    #[test]
    fn test_open_missing_device() {
        let result = Camera::open("/dev/video-does-not-exist", 1280, 720);
        assert!(matches!(result, Err(CameraError::DeviceNotFound(_))));
    }
}
