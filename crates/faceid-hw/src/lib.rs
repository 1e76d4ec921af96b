//! faceid-hw — V4L2 camera capture for faceid.
//!
//! Opens a capture device, negotiates a grayscale-convertible format and
//! streams frames one at a time.

pub mod camera;
pub mod frame;

pub use camera::{device_path, Camera, CameraError, FrameStream, PixelFormat};
pub use frame::Frame;
