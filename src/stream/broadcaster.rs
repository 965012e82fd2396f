use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::encode::FrameEncoder;
use super::registry::{BroadcastReport, Connection, ConnectionRegistry};
use crate::cache::{FrameCache, ResultCache};
use crate::config::Config;
use crate::protocol::{FramePart, KeypointsPart, StreamMessage};
use crate::recorder::Recorder;
use crate::tracker::{NoiseFilter, TrackSelector};

/// Pause after a failed cycle before trying again.
const ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("broadcast loop cancelled")]
    Cancelled,
    #[error("frame encode failed: {0:#}")]
    Encode(anyhow::Error),
    #[error("message serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// What one cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The send period has not elapsed yet
    Throttled,
    /// No selected subject and no new frame
    Idle,
    Sent {
        kind: &'static str,
        report: BroadcastReport,
    },
}

/// 固定周期でフレームとキーポイントを全接続へ配信するループ
pub struct Broadcaster<C: Connection> {
    frames: Arc<FrameCache>,
    results: Arc<ResultCache>,
    registry: Arc<ConnectionRegistry<C>>,
    recorder: Arc<Recorder>,
    encoder: Option<Box<dyn FrameEncoder>>,
    selector: TrackSelector,
    filter: NoiseFilter,
    fps: f64,
    period: Duration,
    last_send: Option<Instant>,
    last_frame_seq: u64,
    /// Origin of the filter timestamps
    epoch: Instant,
}

impl<C: Connection> Broadcaster<C> {
    /// `encoder` is `None` when video is not streamed.
    pub fn new(
        config: &Config,
        frames: Arc<FrameCache>,
        results: Arc<ResultCache>,
        registry: Arc<ConnectionRegistry<C>>,
        recorder: Arc<Recorder>,
        encoder: Option<Box<dyn FrameEncoder>>,
    ) -> Self {
        let fps = if config.stream.fps > 0.0 { config.stream.fps } else { 30.0 };
        Self {
            frames,
            results,
            registry,
            recorder,
            encoder,
            selector: TrackSelector::from_config(&config.tracking),
            filter: NoiseFilter::new(config.filter.clone()),
            fps,
            period: Duration::from_secs_f64(1.0 / fps),
            last_send: None,
            last_frame_seq: 0,
            epoch: Instant::now(),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Runs until `cancel` fires, which is reported as
    /// `Err(StreamError::Cancelled)`. Per-cycle failures are logged and the
    /// loop carries on after a short backoff.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), StreamError> {
        info!(fps = self.fps, "broadcaster started");
        loop {
            if cancel.is_cancelled() {
                info!("broadcaster stopped");
                return Err(StreamError::Cancelled);
            }

            let t0 = Instant::now();
            let pause = match self.cycle().await {
                Ok(_) => self.period.saturating_sub(t0.elapsed()),
                Err(e) => {
                    warn!("broadcast cycle failed: {e}");
                    ERROR_BACKOFF
                }
            };

            if pause.is_zero() {
                tokio::task::yield_now().await;
                continue;
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("broadcaster stopped");
                    return Err(StreamError::Cancelled);
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// One send step: pull the newest frame and detection, build a message,
    /// fan it out, and record the raw keypoints of every keypoint send.
    ///
    /// Idle when no subject is selected and no new frame exists.
    pub async fn cycle(&mut self) -> Result<CycleOutcome, StreamError> {
        let (frame, frame_seq) = self.frames.latest();
        let (detection, _) = self.results.latest();

        let now = Instant::now();
        if let Some(last) = self.last_send {
            if now.duration_since(last) < self.period {
                return Ok(CycleOutcome::Throttled);
            }
        }

        // Keypoints: every due cycle while a detection exists, so a slow
        // model resends its last result instead of dropping the skeleton
        let mut raw = None;
        let mut kpts = None;
        if let Some(det) = detection {
            if let Some(selection) = self.selector.select(&det) {
                if selection.reassigned {
                    self.filter.reset();
                }
                let ts = now.duration_since(self.epoch).as_secs_f64();
                let stabilized = self.filter.filter(&selection.pose.keypoints, ts);
                raw = Some((selection.pose, det.width, det.height));
                kpts = Some(KeypointsPart {
                    keypoints: stabilized,
                    width: det.width,
                    height: det.height,
                    hands: (!det.hands.is_empty()).then(|| det.hands.clone()),
                });
            }
        }

        // Frame: only when a new one was captured
        let mut frame_part = None;
        if let (Some(encoder), Some(frame)) = (self.encoder.as_deref(), frame.as_ref()) {
            if frame_seq != self.last_frame_seq {
                match encoder.encode(frame).map_err(StreamError::Encode) {
                    Ok(text) => {
                        self.last_frame_seq = frame_seq;
                        frame_part = Some(FramePart {
                            frame: text,
                            seq: frame_seq,
                            width: frame.width,
                            height: frame.height,
                        });
                    }
                    Err(e) => warn!(frame_seq, "{e}"),
                }
            }
        }

        let Some(message) = StreamMessage::from_parts(kpts, frame_part) else {
            return Ok(CycleOutcome::Idle);
        };

        let report = self.registry.broadcast(&message).await?;
        self.last_send = Some(now);
        debug!(
            kind = message.kind(),
            delivered = report.delivered,
            dropped = report.dropped,
            "broadcast"
        );

        if let Some((pose, width, height)) = raw {
            self.recorder
                .append(&pose.keypoints, width, height, Some(self.fps), None);
        }

        Ok(CycleOutcome::Sent {
            kind: message.kind(),
            report,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Frame;
    use crate::pose::{BBox, DetectionResult, Keypoint, Pose, Subject};
    use crate::stream::registry::tests::{addr, MemoryConnection};
    use anyhow::Result;

    struct SizeEncoder;

    impl FrameEncoder for SizeEncoder {
        fn encode(&self, frame: &Frame) -> Result<String> {
            Ok(format!("{}x{}", frame.width, frame.height))
        }
    }

    struct BrokenEncoder;

    impl FrameEncoder for BrokenEncoder {
        fn encode(&self, _frame: &Frame) -> Result<String> {
            anyhow::bail!("codec unavailable")
        }
    }

    struct Fixture {
        frames: Arc<FrameCache>,
        results: Arc<ResultCache>,
        recorder: Arc<Recorder>,
        conn: Arc<MemoryConnection>,
        broadcaster: Broadcaster<MemoryConnection>,
        _dir: tempfile::TempDir,
    }

    fn fixture(fps: f64, encoder: Option<Box<dyn FrameEncoder>>) -> Fixture {
        let mut config = Config::default();
        config.stream.fps = fps;
        fixture_with(config, encoder)
    }

    fn fixture_with(config: Config, encoder: Option<Box<dyn FrameEncoder>>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let frames = Arc::new(FrameCache::new());
        let results = Arc::new(ResultCache::new());
        let registry = Arc::new(ConnectionRegistry::new(Duration::from_millis(50)));
        let conn = Arc::new(MemoryConnection::default());
        registry.register(Arc::clone(&conn), addr());
        let recorder = Arc::new(Recorder::new(dir.path()).unwrap());
        let broadcaster = Broadcaster::new(
            &config,
            Arc::clone(&frames),
            Arc::clone(&results),
            registry,
            Arc::clone(&recorder),
            encoder,
        );
        Fixture { frames, results, recorder, conn, broadcaster, _dir: dir }
    }

    fn detection(track_id: i64) -> DetectionResult {
        detection_at(track_id, 100.0, 50.0)
    }

    fn detection_at(track_id: i64, x: f64, y: f64) -> DetectionResult {
        let pose = Pose::new([Keypoint::new(x, y, 0.9); 17]);
        let subject = Subject::new(pose)
            .with_track_id(track_id)
            .with_class_id(0)
            .with_bbox(BBox::new(0.0, 0.0, 200.0, 300.0));
        DetectionResult::new(640, 480, vec![subject])
    }

    fn last_message(conn: &MemoryConnection) -> serde_json::Value {
        let received = conn.received.lock();
        serde_json::from_str(received.last().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_idle_without_data() {
        let mut f = fixture(1000.0, Some(Box::new(SizeEncoder)));
        assert_eq!(f.broadcaster.cycle().await.unwrap(), CycleOutcome::Idle);
        assert!(f.conn.received.lock().is_empty());
    }

    #[tokio::test]
    async fn test_frame_sent_once_per_sequence() {
        let mut f = fixture(1000.0, Some(Box::new(SizeEncoder)));
        f.frames.update(Frame::placeholder(320, 240));

        let out = f.broadcaster.cycle().await.unwrap();
        assert!(matches!(out, CycleOutcome::Sent { kind: "frame", .. }), "{:?}", out);
        let msg = last_message(&f.conn);
        assert_eq!(msg["frame"], "320x240");
        assert_eq!(msg["frameSeq"], 1);
        assert_eq!(msg["W"], 320);

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(f.broadcaster.cycle().await.unwrap(), CycleOutcome::Idle);
    }

    #[tokio::test]
    async fn test_second_cycle_throttled() {
        let mut f = fixture(1.0, Some(Box::new(SizeEncoder)));
        f.frames.update(Frame::placeholder(4, 4));
        f.broadcaster.cycle().await.unwrap();
        f.frames.update(Frame::placeholder(4, 4));
        assert_eq!(f.broadcaster.cycle().await.unwrap(), CycleOutcome::Throttled);
        assert_eq!(f.conn.received.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_keypoints_recorded_raw() {
        let mut f = fixture(1000.0, None);
        f.recorder.start().unwrap();
        f.results.update(detection(7));

        let out = f.broadcaster.cycle().await.unwrap();
        assert!(matches!(out, CycleOutcome::Sent { kind: "kpts", .. }), "{:?}", out);
        let msg = last_message(&f.conn);
        assert_eq!(msg["kpts"].as_array().unwrap().len(), 17);
        assert_eq!(msg["kpts"][0][0], 100);
        assert_eq!(msg["W"], 640);

        // Same detection again: resent and recorded again
        tokio::time::sleep(Duration::from_millis(5)).await;
        let out = f.broadcaster.cycle().await.unwrap();
        assert!(matches!(out, CycleOutcome::Sent { kind: "kpts", .. }), "{:?}", out);

        let path = f.recorder.current_path().unwrap();
        f.recorder.stop();
        let text = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let row: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(row["kpts"][0][0].as_f64().unwrap(), 100.0 / 640.0);
        assert_eq!(row["fps"].as_f64().unwrap(), 1000.0);
        let row: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(row["frame_id"], 1);
    }

    #[tokio::test]
    async fn test_stale_detection_resent_with_new_frames() {
        let mut f = fixture(1000.0, Some(Box::new(SizeEncoder)));
        f.results.update(detection(3));

        f.frames.update(Frame::placeholder(640, 480));
        let out = f.broadcaster.cycle().await.unwrap();
        assert!(matches!(out, CycleOutcome::Sent { kind: "frame_kpts", .. }), "{:?}", out);

        // Inference has not produced anything new, the camera has
        tokio::time::sleep(Duration::from_millis(5)).await;
        f.frames.update(Frame::placeholder(640, 480));
        let out = f.broadcaster.cycle().await.unwrap();
        assert!(matches!(out, CycleOutcome::Sent { kind: "frame_kpts", .. }), "{:?}", out);
        let msg = last_message(&f.conn);
        assert_eq!(msg["frameSeq"], 2);
        assert_eq!(msg["kpts"].as_array().unwrap().len(), 17);
    }

    #[tokio::test]
    async fn test_missing_frames_counted_per_cycle() {
        let mut f = fixture(1000.0, None);
        f.results.update(detection(1));
        f.broadcaster.cycle().await.unwrap();

        // One stale result without the primary, seen on three cycles
        let mut other = detection(2);
        other.subjects[0].bbox = Some(BBox::new(0.0, 0.0, 10.0, 10.0));
        f.results.update(other);
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(2)).await;
            assert_eq!(f.broadcaster.cycle().await.unwrap(), CycleOutcome::Idle);
        }
        assert_eq!(f.broadcaster.selector.state().missing_frames, 3);
    }

    #[tokio::test]
    async fn test_reassignment_resets_filter() {
        let mut config = Config::default();
        config.stream.fps = 1000.0;
        config.tracking.missing_reset_threshold = 1;
        let mut f = fixture_with(config, None);

        f.results.update(detection_at(1, 100.0, 50.0));
        f.broadcaster.cycle().await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        f.broadcaster.cycle().await.unwrap();

        // Primary id 1 vanishes; id 2 takes over on the first miss
        f.results.update(detection_at(2, 400.0, 300.0));
        tokio::time::sleep(Duration::from_millis(2)).await;
        f.broadcaster.cycle().await.unwrap();
        assert_eq!(f.broadcaster.selector.state().primary_track_id, Some(2));

        let msg = last_message(&f.conn);
        for row in msg["kpts"].as_array().unwrap() {
            assert_eq!(row[0], 400, "smoothed across identities: {}", row);
            assert_eq!(row[1], 300, "smoothed across identities: {}", row);
        }
    }

    #[tokio::test]
    async fn test_encode_failure_still_sends_keypoints() {
        let mut f = fixture(1000.0, Some(Box::new(BrokenEncoder)));
        f.frames.update(Frame::placeholder(640, 480));
        f.results.update(detection(1));
        let out = f.broadcaster.cycle().await.unwrap();
        assert!(matches!(out, CycleOutcome::Sent { kind: "kpts", .. }), "{:?}", out);
        assert!(last_message(&f.conn).get("frame").is_none());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let f = fixture(30.0, Some(Box::new(SizeEncoder)));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(f.broadcaster.run(cancel.clone()));
        f.frames.update(Frame::placeholder(8, 8));
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("broadcaster did not stop")
            .unwrap();
        assert!(matches!(result, Err(StreamError::Cancelled)));
        assert_eq!(f.conn.received.lock().len(), 1);
    }
}
