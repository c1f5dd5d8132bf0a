//! rollcall-hw — Camera capture for the attendance kiosk.
//!
//! V4L2-based webcam access producing grayscale frames ready for the
//! detection pipeline.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::Frame;
