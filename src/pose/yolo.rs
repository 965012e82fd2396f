use anyhow::{Context, Result};
use ndarray::Array4;
use opencv::{
    core::{Mat, Size, CV_32FC3},
    imgproc,
    prelude::*,
};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;

use super::{BBox, DetectionResult, InferenceEngine, KeypointIndex, Subject};
use crate::camera::Frame;
use crate::config::InferenceConfig;

/// Rows per candidate in the YOLOv8-pose output: 4 box + 1 score + 17*3 keypoints
const ROWS_PER_CANDIDATE: usize = 5 + KeypointIndex::COUNT * 3;

/// YOLOv8-pose (ONNX) multi-person pose engine.
///
/// Subjects carry boxes and the person class but no track ids; wrap it in a
/// `TrackingEngine` to number them.
pub struct YoloPoseEngine {
    session: Session,
    input_size: i32,
    confidence: f32,
    iou: f32,
    max_detections: usize,
}

struct Candidate {
    score: f32,
    bbox: BBox,
    rows: Vec<[f64; 3]>,
}

impl YoloPoseEngine {
    pub fn new(config: &InferenceConfig) -> Result<Self> {
        let builder = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?;

        #[cfg(feature = "cuda")]
        let builder = {
            tracing::info!("[ort] attempting CUDA execution provider");
            builder.with_execution_providers([ort::execution_providers::CUDAExecutionProvider::default().build()])?
        };

        let session = builder
            .commit_from_file(&config.model)
            .with_context(|| format!("failed to load pose model {}", config.model))?;

        Ok(Self {
            session,
            input_size: config.input_size,
            confidence: config.confidence,
            iou: config.iou,
            max_detections: config.max_detections,
        })
    }

    /// BGR Mat → NCHW [1, 3, input_size, input_size] テンソルに変換
    fn preprocess(&self, frame: &Mat) -> Result<Array4<f32>> {
        let size = self.input_size;

        let mut rgb = Mat::default();
        imgproc::cvt_color_def(frame, &mut rgb, imgproc::COLOR_BGR2RGB)?;

        let mut resized = Mat::default();
        imgproc::resize(
            &rgb,
            &mut resized,
            Size::new(size, size),
            0.0,
            0.0,
            imgproc::INTER_LINEAR,
        )?;

        let mut float_mat = Mat::default();
        resized.convert_to(&mut float_mat, CV_32FC3, 1.0 / 255.0, 0.0)?;

        let s = size as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, s, s));
        for y in 0..size {
            for x in 0..size {
                let pixel = float_mat.at_2d::<opencv::core::Vec3f>(y, x)?;
                for c in 0..3 {
                    tensor[[0, c, y as usize, x as usize]] = pixel[c];
                }
            }
        }
        Ok(tensor)
    }
}

impl InferenceEngine for YoloPoseEngine {
    fn infer(&mut self, frame: &Frame) -> Result<DetectionResult> {
        let mat = frame.to_mat()?;
        let input = self.preprocess(&mat)?;

        let input_tensor = Tensor::from_array(input)?;
        let outputs = self
            .session
            .run(ort::inputs!["images" => input_tensor])
            .context("pose inference failed")?;

        // 出力: [1, 56, N]
        let output: ndarray::ArrayViewD<f32> = outputs["output0"]
            .try_extract_array()
            .context("failed to extract pose output")?;

        if output.shape().len() != 3 || output.shape()[1] < ROWS_PER_CANDIDATE {
            anyhow::bail!("unexpected pose output shape {:?}", output.shape());
        }

        let scale_x = frame.width as f64 / self.input_size as f64;
        let scale_y = frame.height as f64 / self.input_size as f64;

        let mut candidates = Vec::new();
        for i in 0..output.shape()[2] {
            let score = output[[0, 4, i]];
            if score < self.confidence {
                continue;
            }
            let cx = output[[0, 0, i]] as f64;
            let cy = output[[0, 1, i]] as f64;
            let w = output[[0, 2, i]] as f64;
            let h = output[[0, 3, i]] as f64;
            let bbox = BBox::new(
                (cx - w / 2.0) * scale_x,
                (cy - h / 2.0) * scale_y,
                (cx + w / 2.0) * scale_x,
                (cy + h / 2.0) * scale_y,
            );
            let rows = (0..KeypointIndex::COUNT)
                .map(|k| {
                    let base = 5 + k * 3;
                    [
                        output[[0, base, i]] as f64 * scale_x,
                        output[[0, base + 1, i]] as f64 * scale_y,
                        output[[0, base + 2, i]] as f64,
                    ]
                })
                .collect();
            candidates.push(Candidate { score, bbox, rows });
        }

        let subjects = non_max_suppression(candidates, self.iou, self.max_detections)
            .into_iter()
            .filter_map(|c| Subject::from_rows(&c.rows).map(|s| s.with_class_id(0).with_bbox(c.bbox)))
            .collect();

        Ok(DetectionResult::new(frame.width, frame.height, subjects))
    }
}

fn non_max_suppression(mut candidates: Vec<Candidate>, threshold: f32, max_keep: usize) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<Candidate> = Vec::new();
    for c in candidates {
        if kept.len() >= max_keep {
            break;
        }
        if kept.iter().all(|k| k.bbox.iou(&c.bbox) < threshold as f64) {
            kept.push(c);
        }
    }
    kept
}
