use anyhow::{bail, Result};

#[cfg(feature = "desktop")]
use opencv::{
    core::{Mat, Scalar, CV_8UC3},
    imgproc,
    prelude::*,
};

/// Placeholder pixel value (mid gray) used when no camera is available.
const PLACEHOLDER_LEVEL: u8 = 48;

/// 1枚のカメラフレーム（BGR 8bit、行優先・パディングなし）
///
/// Written once by the capture thread, then shared read-only behind an `Arc`.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    data: Vec<u8>,
}

impl Frame {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            bail!(
                "frame buffer is {} bytes, expected {} for {}x{} BGR",
                data.len(),
                expected,
                width,
                height
            );
        }
        Ok(Self { width, height, data })
    }

    /// Uniform frame published when the camera cannot be opened.
    pub fn placeholder(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![PLACEHOLDER_LEVEL; width as usize * height as usize * 3],
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// BGR / BGRA の Mat からコピーして生成
    #[cfg(feature = "desktop")]
    pub fn from_mat(mat: &Mat) -> Result<Self> {
        let bgr = match mat.channels() {
            3 => mat.try_clone()?,
            4 => {
                let mut bgr = Mat::default();
                imgproc::cvt_color_def(mat, &mut bgr, imgproc::COLOR_BGRA2BGR)?;
                bgr
            }
            n => bail!("unsupported channel count: {}", n),
        };
        let width = bgr.cols() as u32;
        let height = bgr.rows() as u32;
        Self::new(width, height, bgr.data_bytes()?.to_vec())
    }

    #[cfg(feature = "desktop")]
    pub fn to_mat(&self) -> Result<Mat> {
        let mut mat = Mat::new_rows_cols_with_default(
            self.height as i32,
            self.width as i32,
            CV_8UC3,
            Scalar::all(0.0),
        )?;
        mat.data_bytes_mut()?.copy_from_slice(&self.data);
        Ok(mat)
    }
}
