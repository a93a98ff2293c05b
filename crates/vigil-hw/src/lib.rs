//! vigil-hw: hardware abstraction for camera capture.
//!
//! Provides V4L2-based camera access and conversion of raw capture buffers
//! to grayscale frames.

pub mod camera;
pub mod frame;

pub use camera::{open_auto, Camera, CameraError, CameraStream, DeviceInfo, PixelFormat};
pub use frame::{Frame, FrameError};
