use anyhow::Result;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pose_relay::cache::{FrameCache, ResultCache};
use pose_relay::camera::Frame;
use pose_relay::config::Config;
use pose_relay::pose::{BBox, DetectionResult, Keypoint, Pose, Subject};
use pose_relay::recorder::Recorder;
use pose_relay::stream::{Broadcaster, Connection, ConnectionRegistry, CycleOutcome, FrameEncoder};

#[derive(Default)]
struct Viewer {
    closed: AtomicBool,
    received: Mutex<Vec<String>>,
}

impl Connection for Viewer {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn send_text(&self, text: Arc<str>) -> Result<()> {
        self.received.lock().push(text.to_string());
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct StubEncoder;

impl FrameEncoder for StubEncoder {
    fn encode(&self, frame: &Frame) -> Result<String> {
        Ok(format!("stub-{}x{}", frame.width, frame.height))
    }
}

fn addr() -> SocketAddr {
    "127.0.0.1:40000".parse().unwrap()
}

fn tracked_subject(track_id: i64) -> Subject {
    let rows: Vec<[f64; 3]> = (0..17).map(|i| [100.0 + i as f64 * 10.0, 200.0, 0.9]).collect();
    Subject::new(Pose::from_rows(&rows).unwrap())
        .with_track_id(track_id)
        .with_class_id(0)
        .with_bbox(BBox::new(50.0, 50.0, 350.0, 450.0))
}

#[tokio::test]
async fn test_single_cycle_sends_frame_kpts_and_records() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.stream.fps = 30.0;

    let frames = Arc::new(FrameCache::new());
    let results = Arc::new(ResultCache::new());
    let registry = Arc::new(ConnectionRegistry::new(Duration::from_millis(200)));
    let recorder = Arc::new(Recorder::new(dir.path()).unwrap());

    let viewers: Vec<Arc<Viewer>> = (0..2).map(|_| Arc::new(Viewer::default())).collect();
    for v in &viewers {
        registry.register(Arc::clone(v), addr());
    }

    recorder.start().unwrap();
    frames.update(Frame::placeholder(640, 480));
    results.update(DetectionResult::new(640, 480, vec![tracked_subject(7)]));

    let mut broadcaster = Broadcaster::new(
        &config,
        Arc::clone(&frames),
        Arc::clone(&results),
        Arc::clone(&registry),
        Arc::clone(&recorder),
        Some(Box::new(StubEncoder)),
    );

    let outcome = broadcaster.cycle().await.unwrap();
    match outcome {
        CycleOutcome::Sent { kind, report } => {
            assert_eq!(kind, "frame_kpts");
            assert_eq!(report.delivered, 2);
            assert_eq!(report.dropped, 0);
        }
        other => panic!("expected a send, got {:?}", other),
    }

    for v in &viewers {
        let received = v.received.lock();
        assert_eq!(received.len(), 1, "each viewer gets exactly one message");
        let msg: serde_json::Value = serde_json::from_str(&received[0]).unwrap();
        assert_eq!(msg["type"], "frame_kpts");
        assert_eq!(msg["W"], 640);
        assert_eq!(msg["H"], 480);
        assert_eq!(msg["frame"], "stub-640x480");
        assert_eq!(msg["frameSeq"], 1);
        let kpts = msg["kpts"].as_array().unwrap();
        assert_eq!(kpts.len(), 17);
        assert_eq!(kpts[3][0], 130);
        assert_eq!(kpts[3][2], 0.9);
    }

    let path = recorder.current_path().unwrap();
    recorder.stop();
    let text = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 1);
    let row: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(row["width"], 640);
    assert_eq!(row["height"], 480);
    assert_eq!(row["frame_id"], 0);
    assert_eq!(row["kpts"].as_array().unwrap().len(), 17);
    for r in row["kpts"].as_array().unwrap() {
        for v in r.as_array().unwrap() {
            let v = v.as_f64().unwrap();
            assert!((0.0..=1.0).contains(&v), "not normalized: {}", v);
        }
    }
}

#[tokio::test]
async fn test_closed_viewer_is_dropped_during_stream() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::default();
    let frames = Arc::new(FrameCache::new());
    let results = Arc::new(ResultCache::new());
    let registry = Arc::new(ConnectionRegistry::new(Duration::from_millis(200)));
    let recorder = Arc::new(Recorder::new(dir.path()).unwrap());

    let viewers: Vec<Arc<Viewer>> = (0..3).map(|_| Arc::new(Viewer::default())).collect();
    for v in &viewers {
        registry.register(Arc::clone(v), addr());
    }
    viewers[1].closed.store(true, Ordering::SeqCst);

    results.update(DetectionResult::new(
        320,
        240,
        vec![Subject::new(Pose::new([Keypoint::new(1.0, 2.0, 0.5); 17]))],
    ));

    let mut broadcaster = Broadcaster::new(
        &config,
        Arc::clone(&frames),
        Arc::clone(&results),
        Arc::clone(&registry),
        recorder,
        None,
    );
    broadcaster.cycle().await.unwrap();

    assert_eq!(viewers[0].received.lock().len(), 1);
    assert!(viewers[1].received.lock().is_empty());
    assert_eq!(viewers[2].received.lock().len(), 1);
    assert_eq!(registry.len(), 2);
}
