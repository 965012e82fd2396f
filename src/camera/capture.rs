use anyhow::{Context, Result};
use opencv::{
    core::Mat,
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureAPIs, VideoCaptureTrait},
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::Frame;
use crate::cache::FrameCache;
use crate::config::CameraConfig;

/// 起動直後の読み捨てフレーム数（露出が安定するまで）
const WARMUP_READS: usize = 12;
const PLACEHOLDER_WIDTH: u32 = 640;
const PLACEHOLDER_HEIGHT: u32 = 480;

/// OpenCVを使用したカメラキャプチャ
pub struct OpenCvCamera {
    capture: VideoCapture,
    width: u32,
    height: u32,
}

impl OpenCvCamera {
    /// 解像度とFPSを指定してカメラを開く
    pub fn open(config: &CameraConfig) -> Result<Self> {
        let mut capture = VideoCapture::new(config.index, VideoCaptureAPIs::CAP_ANY as i32)
            .with_context(|| format!("failed to open camera {}", config.index))?;

        if !capture.is_opened()? {
            anyhow::bail!("camera {} is not available", config.index);
        }

        capture.set(videoio::CAP_PROP_FRAME_WIDTH, config.width as f64)?;
        capture.set(videoio::CAP_PROP_FRAME_HEIGHT, config.height as f64)?;
        capture.set(videoio::CAP_PROP_FPS, config.fps as f64)?;
        capture.set(videoio::CAP_PROP_BUFFERSIZE, 1.0)?;

        let width = capture.get(videoio::CAP_PROP_FRAME_WIDTH)? as u32;
        let height = capture.get(videoio::CAP_PROP_FRAME_HEIGHT)? as u32;
        let fps = capture.get(videoio::CAP_PROP_FPS)?;
        info!(index = config.index, width, height, fps, "camera opened");

        let mut camera = Self { capture, width, height };
        camera.warm_up()?;
        Ok(camera)
    }

    pub fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// フレームを読み込む（BGR形式）
    pub fn read_frame(&mut self) -> Result<Mat> {
        let mut frame = Mat::default();
        self.capture
            .read(&mut frame)
            .context("failed to read frame")?;

        if frame.empty() {
            anyhow::bail!("empty frame received");
        }

        Ok(frame)
    }

    fn warm_up(&mut self) -> Result<()> {
        for _ in 0..WARMUP_READS {
            if self.read_frame().is_ok() {
                return Ok(());
            }
            thread::sleep(Duration::from_millis(50));
        }
        anyhow::bail!("camera produced no frames during warm-up")
    }
}

/// 別スレッドでキャプチャし、最新フレームだけを `FrameCache` に書き込む。
///
/// If the camera cannot be opened a placeholder frame is published at the
/// configured rate instead, so subscribers still see a video stream.
pub fn spawn_capture(
    config: CameraConfig,
    frames: Arc<FrameCache>,
    cancel: CancellationToken,
) -> thread::JoinHandle<()> {
    thread::spawn(move || match OpenCvCamera::open(&config) {
        Ok(camera) => run_camera(camera, &frames, &cancel),
        Err(e) => {
            warn!("camera unavailable ({e:#}), publishing placeholder frames");
            run_placeholder(&config, &frames, &cancel);
        }
    })
}

fn run_camera(mut camera: OpenCvCamera, frames: &FrameCache, cancel: &CancellationToken) {
    let (width, height) = camera.resolution();
    info!(width, height, "capture thread started");
    while !cancel.is_cancelled() {
        match camera.read_frame().and_then(|mat| Frame::from_mat(&mat)) {
            Ok(frame) => {
                frames.update(frame);
            }
            Err(e) => {
                warn!("[camera] read error: {e:#}");
                thread::sleep(Duration::from_millis(5));
            }
        }
    }
    info!("capture thread stopped");
}

fn run_placeholder(config: &CameraConfig, frames: &FrameCache, cancel: &CancellationToken) {
    let interval = Duration::from_secs_f64(1.0 / config.fps.max(1) as f64);
    let placeholder = Frame::placeholder(PLACEHOLDER_WIDTH, PLACEHOLDER_HEIGHT);
    while !cancel.is_cancelled() {
        frames.update(placeholder.clone());
        thread::sleep(interval);
    }
}
