use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub recorder: RecorderConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// 1接続あたりの送信タイムアウト（ミリ秒）
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
}

fn default_listen_addr() -> String { "0.0.0.0:3000".to_string() }
fn default_send_timeout_ms() -> u64 { 1000 }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            send_timeout_ms: default_send_timeout_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StreamConfig {
    /// Broadcast rate (messages per second)
    #[serde(default = "default_stream_fps")]
    pub fps: f64,
    #[serde(default = "default_send_video")]
    pub send_video: bool,
    /// JPEG quality 1-100
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: i32,
}

fn default_stream_fps() -> f64 { 30.0 }
fn default_send_video() -> bool { true }
fn default_jpeg_quality() -> i32 { 85 }

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            fps: default_stream_fps(),
            send_video: default_send_video(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TrackingConfig {
    /// Consecutive cycles the primary track may be missing before reselection
    #[serde(default = "default_missing_reset_threshold")]
    pub missing_reset_threshold: u32,
    #[serde(default)]
    pub person_class_id: u32,
}

fn default_missing_reset_threshold() -> u32 { 15 }

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            missing_reset_threshold: default_missing_reset_threshold(),
            person_class_id: 0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilterConfig {
    /// Nominal sample rate, used when two samples share a timestamp
    #[serde(default = "default_filter_freq")]
    pub freq: f64,
    #[serde(default = "default_min_cutoff")]
    pub min_cutoff: f64,
    #[serde(default = "default_beta")]
    pub beta: f64,
    #[serde(default = "default_d_cutoff")]
    pub d_cutoff: f64,
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// Weight of the One Euro output in the final blend (rest is the moving average)
    #[serde(default = "default_filtered_weight")]
    pub filtered_weight: f64,
}

fn default_filter_freq() -> f64 { 30.0 }
fn default_min_cutoff() -> f64 { 0.001 }
fn default_beta() -> f64 { 0.01 }
fn default_d_cutoff() -> f64 { 1.0 }
fn default_window_size() -> usize { 3 }
fn default_filtered_weight() -> f64 { 0.7 }

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            freq: default_filter_freq(),
            min_cutoff: default_min_cutoff(),
            beta: default_beta(),
            d_cutoff: default_d_cutoff(),
            window_size: default_window_size(),
            filtered_weight: default_filtered_weight(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RecorderConfig {
    /// 保存先ディレクトリ
    #[serde(default = "default_recorder_root")]
    pub root_dir: String,
}

fn default_recorder_root() -> String { "training/dataset/raw".to_string() }

impl Default for RecorderConfig {
    fn default() -> Self {
        Self { root_dir: default_recorder_root() }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CameraConfig {
    #[serde(default)]
    pub index: i32,
    #[serde(default = "default_camera_width")]
    pub width: u32,
    #[serde(default = "default_camera_height")]
    pub height: u32,
    #[serde(default = "default_camera_fps")]
    pub fps: u32,
}

fn default_camera_width() -> u32 { 1280 }
fn default_camera_height() -> u32 { 720 }
fn default_camera_fps() -> u32 { 30 }

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            index: 0,
            width: default_camera_width(),
            height: default_camera_height(),
            fps: default_camera_fps(),
        }
    }
}

/// `track` assigns persistent ids across frames; `predict` leaves subjects
/// unnumbered.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum InferenceMode {
    #[default]
    Track,
    Predict,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InferenceConfig {
    #[serde(default)]
    pub mode: InferenceMode,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_input_size")]
    pub input_size: i32,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    #[serde(default = "default_iou")]
    pub iou: f32,
    #[serde(default = "default_max_detections")]
    pub max_detections: usize,
    /// Minimum box overlap for a detection to continue a track
    #[serde(default = "default_track_iou")]
    pub track_iou: f64,
    /// Inference cycles a track survives without a matching detection
    #[serde(default = "default_track_max_age")]
    pub track_max_age: u32,
}

fn default_model() -> String { "models/yolov8n-pose.onnx".to_string() }
fn default_input_size() -> i32 { 640 }
fn default_confidence() -> f32 { 0.25 }
fn default_iou() -> f32 { 0.5 }
fn default_max_detections() -> usize { 50 }
fn default_track_iou() -> f64 { 0.3 }
fn default_track_max_age() -> u32 { 30 }

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            mode: InferenceMode::default(),
            model: default_model(),
            input_size: default_input_size(),
            confidence: default_confidence(),
            iou: default_iou(),
            max_detections: default_max_detections(),
            track_iou: default_track_iou(),
            track_max_age: default_track_max_age(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Logging is not initialized yet when this runs, so problems go to stderr.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::load(&path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("config: {e:#}, using defaults");
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.listen_addr, "0.0.0.0:3000");
        assert_eq!(config.stream.fps, 30.0);
        assert!(config.stream.send_video);
        assert_eq!(config.tracking.missing_reset_threshold, 15);
        assert_eq!(config.filter.window_size, 3);
        assert_eq!(config.recorder.root_dir, "training/dataset/raw");
        assert!(!config.verbose);
        assert_eq!(config.inference.mode, InferenceMode::Track);
        assert_eq!(config.inference.track_max_age, 30);
    }

    #[test]
    fn test_inference_mode_parsing() {
        let config: Config = toml::from_str("[inference]\nmode = \"predict\"\ntrack_iou = 0.5").unwrap();
        assert_eq!(config.inference.mode, InferenceMode::Predict);
        assert_eq!(config.inference.track_iou, 0.5);
        assert!(toml::from_str::<Config>("[inference]\nmode = \"segment\"").is_err());
    }

    #[test]
    fn test_partial_section_override() {
        let config: Config = toml::from_str(
            r#"
            verbose = true
            [stream]
            fps = 15.0
            [filter]
            beta = 0.5
            "#,
        )
        .unwrap();
        assert!(config.verbose);
        assert_eq!(config.stream.fps, 15.0);
        assert_eq!(config.stream.jpeg_quality, 85);
        assert_eq!(config.filter.beta, 0.5);
        assert_eq!(config.filter.min_cutoff, 0.001);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = Config::load_or_default("/nonexistent/pose_relay.toml");
        assert_eq!(config.tracking.person_class_id, 0);
    }
}
