use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cache::{FrameCache, ResultCache};
use crate::config::Config;
use crate::recorder::Recorder;
use crate::server::WsConnection;
use crate::stream::{Broadcaster, ConnectionRegistry, FrameEncoder};

/// Shared state built once at startup and handed to every task.
pub struct AppContext {
    pub config: Config,
    pub frames: Arc<FrameCache>,
    pub results: Arc<ResultCache>,
    pub registry: Arc<ConnectionRegistry<WsConnection>>,
    pub recorder: Arc<Recorder>,
    pub cancel: CancellationToken,
}

impl AppContext {
    pub fn new(config: Config) -> Result<Self> {
        let recorder = Recorder::from_config(&config.recorder)?;
        let send_timeout = Duration::from_millis(config.server.send_timeout_ms);
        Ok(Self {
            frames: Arc::new(FrameCache::new()),
            results: Arc::new(ResultCache::new()),
            registry: Arc::new(ConnectionRegistry::new(send_timeout)),
            recorder: Arc::new(recorder),
            cancel: CancellationToken::new(),
            config,
        })
    }

    pub fn broadcaster(&self, encoder: Option<Box<dyn FrameEncoder>>) -> Broadcaster<WsConnection> {
        Broadcaster::new(
            &self.config,
            Arc::clone(&self.frames),
            Arc::clone(&self.results),
            Arc::clone(&self.registry),
            Arc::clone(&self.recorder),
            encoder,
        )
    }

    /// Cancels every task, stops an active recording (the file is kept) and
    /// closes all subscriber connections.
    pub async fn shutdown(&self) {
        info!("shutting down");
        self.cancel.cancel();
        if self.recorder.is_active() {
            self.recorder.stop();
        }
        self.registry.close_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(dir: &tempfile::TempDir) -> AppContext {
        let mut config = Config::default();
        config.recorder.root_dir = dir.path().join("raw").display().to_string();
        AppContext::new(config).unwrap()
    }

    #[test]
    fn test_new_creates_recorder_dir() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir);
        assert!(dir.path().join("raw").is_dir());
        assert!(ctx.registry.is_empty());
        assert!(!ctx.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_shutdown_stops_recording_and_cancels() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir);
        ctx.recorder.start().unwrap();
        let path = ctx.recorder.current_path().unwrap();

        ctx.shutdown().await;
        assert!(ctx.cancel.is_cancelled());
        assert!(!ctx.recorder.is_active());
        assert!(path.exists());
    }
}
