use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

use pose_relay::camera::spawn_capture;
use pose_relay::config::{Config, InferenceMode};
use pose_relay::context::AppContext;
use pose_relay::logging;
use pose_relay::pose::{spawn_inference, IouTracker, TrackingEngine, YoloPoseEngine};
use pose_relay::server;
use pose_relay::stream::{FrameEncoder, JpegEncoder, StreamError};

const CONFIG_PATH: &str = "pose_relay.toml";
const LOG_DIR: &str = "logs";

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| CONFIG_PATH.to_string());
    let config = Config::load_or_default(&config_path);
    logging::init(LOG_DIR, config.verbose)?;
    info!(version = env!("GIT_VERSION"), config = %config_path, "pose-relay starting");

    let ctx = Arc::new(AppContext::new(config)?);

    // ========================================================================
    // Capture + inference threads
    // ========================================================================

    let capture = spawn_capture(
        ctx.config.camera.clone(),
        Arc::clone(&ctx.frames),
        ctx.cancel.clone(),
    );

    let engine = YoloPoseEngine::new(&ctx.config.inference)?;
    let mode = ctx.config.inference.mode;
    info!(model = %ctx.config.inference.model, ?mode, "pose model loaded");
    let inference = match mode {
        InferenceMode::Track => spawn_inference(
            TrackingEngine::new(engine, IouTracker::from_config(&ctx.config.inference)),
            Arc::clone(&ctx.frames),
            Arc::clone(&ctx.results),
            ctx.cancel.clone(),
        ),
        InferenceMode::Predict => spawn_inference(
            engine,
            Arc::clone(&ctx.frames),
            Arc::clone(&ctx.results),
            ctx.cancel.clone(),
        ),
    };

    // ========================================================================
    // Broadcaster + HTTP/WebSocket server
    // ========================================================================

    let encoder: Option<Box<dyn FrameEncoder>> = if ctx.config.stream.send_video {
        Some(Box::new(JpegEncoder::new(ctx.config.stream.jpeg_quality)))
    } else {
        None
    };
    let broadcaster = tokio::spawn(ctx.broadcaster(encoder).run(ctx.cancel.clone()));
    let mut server = tokio::spawn(server::serve(Arc::clone(&ctx)));

    let early_exit = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            info!("Ctrl-C received");
            None
        }
        result = &mut server => Some(result),
    };

    ctx.shutdown().await;

    match broadcaster.await {
        Ok(Ok(())) | Ok(Err(StreamError::Cancelled)) => {}
        Ok(Err(e)) => warn!("broadcaster ended: {e}"),
        Err(e) => warn!("broadcaster task failed: {e}"),
    }

    let server_result = match early_exit {
        Some(result) => result,
        None => server.await,
    };

    tokio::task::spawn_blocking(move || {
        if capture.join().is_err() {
            warn!("capture thread panicked");
        }
        if inference.join().is_err() {
            warn!("inference thread panicked");
        }
    })
    .await
    .context("failed to join worker threads")?;

    server_result.context("server task failed")??;
    info!("bye");
    Ok(())
}
