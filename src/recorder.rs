//! Append-only keypoint sequence recorder (JSON Lines).
//!
//! One session at a time. Every transition and every append runs under the
//! same lock, so a line is never written to a file that is being closed or
//! deleted.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::fs::{self, File, OpenOptions};
use std::io::{LineWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::RecorderConfig;
use crate::pose::{Keypoint, KeypointIndex};

#[derive(Default)]
struct Session {
    file: Option<LineWriter<File>>,
    path: Option<PathBuf>,
    seq_id: Option<String>,
    frame_id: u64,
    active: bool,
}

pub struct Recorder {
    root_dir: PathBuf,
    session: Mutex<Session>,
}

impl Recorder {
    pub fn new<P: AsRef<Path>>(root_dir: P) -> Result<Self> {
        let root_dir = root_dir.as_ref().to_path_buf();
        fs::create_dir_all(&root_dir)
            .with_context(|| format!("failed to create {}", root_dir.display()))?;
        Ok(Self {
            root_dir,
            session: Mutex::new(Session::default()),
        })
    }

    pub fn from_config(config: &RecorderConfig) -> Result<Self> {
        Self::new(&config.root_dir)
    }

    /// 記録開始。既に記録中なら現在のシーケンスIDをそのまま返す
    pub fn start(&self) -> Result<String> {
        let mut s = self.session.lock();
        if s.active {
            if let Some(id) = &s.seq_id {
                return Ok(id.clone());
            }
        }

        let seq_id = format!("seq-{}", chrono::Utc::now().timestamp_millis());
        let path = self.root_dir.join(format!("{seq_id}.jsonl"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;

        info!(seq_id = %seq_id, path = %path.display(), "recording started");
        *s = Session {
            file: Some(LineWriter::new(file)),
            path: Some(path),
            seq_id: Some(seq_id.clone()),
            frame_id: 0,
            active: true,
        };
        Ok(seq_id)
    }

    /// Writes one normalized record. Does nothing while inactive; write
    /// failures are logged and dropped.
    pub fn append(
        &self,
        keypoints: &[Keypoint],
        width: u32,
        height: u32,
        fps: Option<f64>,
        extra: Option<&Map<String, Value>>,
    ) {
        let mut s = self.session.lock();
        if !s.active {
            return;
        }
        if keypoints.len() < KeypointIndex::COUNT {
            warn!(count = keypoints.len(), "recorder: need 17 keypoints, record skipped");
            return;
        }

        let w = width.max(1) as f64;
        let h = height.max(1) as f64;
        let kpts: Vec<[f64; 3]> = keypoints
            .iter()
            .take(KeypointIndex::COUNT)
            .map(|k| [unit(k.x / w), unit(k.y / h), unit(k.confidence)])
            .collect();

        let mut record = Map::new();
        record.insert("ts".into(), json!(chrono::Utc::now().timestamp_millis()));
        record.insert("width".into(), json!(width));
        record.insert("height".into(), json!(height));
        record.insert("seq_id".into(), json!(s.seq_id));
        record.insert("frame_id".into(), json!(s.frame_id));
        record.insert("fps".into(), json!(fps.filter(|f| f.is_finite())));
        record.insert("kpts".into(), json!(kpts));
        if let Some(extra) = extra {
            for (k, v) in extra {
                record.insert(k.clone(), v.clone());
            }
        }

        let line = match serde_json::to_string(&Value::Object(record)) {
            Ok(line) => line,
            Err(e) => {
                warn!("recorder: serialize failed: {e}");
                return;
            }
        };

        let Some(file) = s.file.as_mut() else {
            return;
        };
        match writeln!(file, "{line}") {
            Ok(()) => s.frame_id += 1,
            Err(e) => warn!("recorder: write failed: {e}"),
        }
    }

    /// 記録停止（ファイルは残す）
    pub fn stop(&self) -> Option<String> {
        let mut s = self.session.lock();
        if !s.active {
            return s.seq_id.clone();
        }
        if let Some(mut file) = s.file.take() {
            if let Err(e) = file.flush() {
                warn!("recorder: flush failed: {e}");
            }
        }
        s.active = false;
        info!(seq_id = ?s.seq_id, frames = s.frame_id, "recording stopped");
        s.seq_id.clone()
    }

    /// Stops the session and deletes its file.
    pub fn cancel(&self) -> Option<String> {
        let mut s = self.session.lock();
        if !s.active {
            return None;
        }
        drop(s.file.take());
        if let Some(path) = s.path.take() {
            if let Err(e) = fs::remove_file(&path) {
                warn!("recorder: failed to delete {}: {e}", path.display());
            }
        }
        s.active = false;
        s.frame_id = 0;
        let seq_id = s.seq_id.take();
        info!(seq_id = ?seq_id, "recording cancelled");
        seq_id
    }

    pub fn is_active(&self) -> bool {
        self.session.lock().active
    }

    pub fn current_seq_id(&self) -> Option<String> {
        self.session.lock().seq_id.clone()
    }

    pub fn current_path(&self) -> Option<PathBuf> {
        self.session.lock().path.clone()
    }
}

/// Clamp to [0, 1]; non-finite becomes 0.
fn unit(v: f64) -> f64 {
    if v.is_finite() {
        v.clamp(0.0, 1.0)
    } else {
        0.0
    }
}
