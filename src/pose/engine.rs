use anyhow::Result;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::DetectionResult;
use crate::cache::{FrameCache, ResultCache};
use crate::camera::Frame;

/// Idle poll interval while waiting for a frame the engine has not seen yet.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Pose model contract. Implementations own whatever session/tracker state
/// they need; `infer` is only ever called from one thread.
pub trait InferenceEngine: Send {
    fn infer(&mut self, frame: &Frame) -> Result<DetectionResult>;
}

/// Runs `engine` on its own thread over the newest frames in `frames`,
/// publishing every result into `results`.
///
/// Frames whose sequence was already processed are skipped, so a slow model
/// just drops intermediate frames.
pub fn spawn_inference<E>(
    mut engine: E,
    frames: Arc<FrameCache>,
    results: Arc<ResultCache>,
    cancel: CancellationToken,
) -> thread::JoinHandle<()>
where
    E: InferenceEngine + 'static,
{
    thread::spawn(move || {
        let mut last_seq = 0;
        let mut count: u32 = 0;
        let mut timer = Instant::now();

        while !cancel.is_cancelled() {
            let (frame, seq) = frames.latest();
            let frame = match frame {
                Some(f) if seq != last_seq => f,
                _ => {
                    thread::sleep(POLL_INTERVAL);
                    continue;
                }
            };
            last_seq = seq;

            let start = Instant::now();
            match engine.infer(&frame) {
                Ok(result) => {
                    debug!(
                        frame_seq = seq,
                        subjects = result.subjects.len(),
                        infer_ms = start.elapsed().as_secs_f64() * 1000.0,
                        "inference done"
                    );
                    results.update(result);
                    count += 1;
                }
                Err(e) => warn!("inference error: {e:#}"),
            }

            if timer.elapsed() >= Duration::from_secs(5) {
                let fps = count as f64 / timer.elapsed().as_secs_f64();
                info!("[inference] {:.1} fps", fps);
                count = 0;
                timer = Instant::now();
            }
        }
        info!("inference thread stopped");
    })
}
