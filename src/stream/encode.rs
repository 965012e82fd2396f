use anyhow::Result;
use base64::Engine as _;

use crate::camera::Frame;

/// Turns a frame into the text carried in the `frame` field.
pub trait FrameEncoder: Send + Sync {
    fn encode(&self, frame: &Frame) -> Result<String>;
}

pub fn to_base64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// JPEG → base64
#[cfg(feature = "desktop")]
pub struct JpegEncoder {
    quality: i32,
}

#[cfg(feature = "desktop")]
impl JpegEncoder {
    pub fn new(quality: i32) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }
}

#[cfg(feature = "desktop")]
impl FrameEncoder for JpegEncoder {
    fn encode(&self, frame: &Frame) -> Result<String> {
        use anyhow::Context;
        use opencv::core::Vector;
        use opencv::imgcodecs;

        let mat = frame.to_mat()?;
        let params = Vector::from_iter([imgcodecs::IMWRITE_JPEG_QUALITY, self.quality]);
        let mut buf: Vector<u8> = Vector::new();
        imgcodecs::imencode(".jpg", &mat, &mut buf, &params).context("jpeg encode failed")?;
        Ok(to_base64(buf.as_slice()))
    }
}
