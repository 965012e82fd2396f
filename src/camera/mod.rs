#[cfg(feature = "desktop")]
pub mod capture;
pub mod frame;

#[cfg(feature = "desktop")]
pub use capture::{spawn_capture, OpenCvCamera};
pub use frame::Frame;
