//! WebSocket subscribers and the recording control endpoints.

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::context::AppContext;
use crate::protocol::RecordingStatus;
use crate::recorder::Recorder;
use crate::stream::Connection;

// ===========================================================================
// Connection
// ===========================================================================

/// Write half of an accepted WebSocket.
pub struct WsConnection {
    sink: tokio::sync::Mutex<SplitSink<WebSocket, Message>>,
    closed: AtomicBool,
}

impl WsConnection {
    pub fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self {
            sink: tokio::sync::Mutex::new(sink),
            closed: AtomicBool::new(false),
        }
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl Connection for WsConnection {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn send_text(&self, text: Arc<str>) -> Result<()> {
        let mut sink = self.sink.lock().await;
        let sent = sink.send(Message::Text(text.as_ref().into())).await;
        if sent.is_err() {
            self.mark_closed();
        }
        sent.context("websocket send failed")
    }

    async fn close(&self) {
        self.mark_closed();
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.close().await {
            debug!("websocket close: {e}");
        }
    }
}

// ===========================================================================
// Routes
// ===========================================================================

pub fn router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/websocket/toggle-recording", post(toggle_handler))
        .route("/websocket/cancel-recording", post(cancel_handler))
        .route("/websocket/recording-status", get(status_handler))
        .with_state(ctx)
}

/// Serves until the context's cancellation token fires.
pub async fn serve(ctx: Arc<AppContext>) -> Result<()> {
    let addr = ctx.config.server.listen_addr.clone();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("listening on {}", addr);

    let cancel = ctx.cancel.clone();
    axum::serve(
        listener,
        router(ctx).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { cancel.cancelled().await })
    .await
    .context("http server failed")?;
    info!("http server stopped");
    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(ctx): State<Arc<AppContext>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, addr, ctx))
}

async fn handle_socket(socket: WebSocket, addr: SocketAddr, ctx: Arc<AppContext>) {
    let (sink, mut stream) = socket.split();
    let conn = Arc::new(WsConnection::new(sink));
    let id = ctx.registry.register(Arc::clone(&conn), addr);

    // Viewers only listen; incoming messages are drained until close.
    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(id, "websocket read error: {e}");
                    break;
                }
                Some(Ok(_)) => {}
            },
            _ = ctx.cancel.cancelled() => break,
        }
    }

    conn.mark_closed();
    ctx.registry.unregister(id);
}

async fn toggle_handler(State(ctx): State<Arc<AppContext>>) -> Json<RecordingStatus> {
    Json(toggle_recording(&ctx.recorder))
}

async fn cancel_handler(State(ctx): State<Arc<AppContext>>) -> Json<RecordingStatus> {
    Json(cancel_recording(&ctx.recorder))
}

async fn status_handler(State(ctx): State<Arc<AppContext>>) -> Json<RecordingStatus> {
    Json(recording_status(&ctx.recorder))
}

// ===========================================================================
// Recording control
// ===========================================================================

fn status(recorder: &Recorder, status: &str, message: Option<String>) -> RecordingStatus {
    RecordingStatus {
        status: status.to_string(),
        is_recording: recorder.is_active(),
        seq_id: recorder.current_seq_id(),
        path: recorder.current_path().map(|p| p.display().to_string()),
        message,
    }
}

/// 記録中なら停止、停止中なら開始
pub fn toggle_recording(recorder: &Recorder) -> RecordingStatus {
    if recorder.is_active() {
        recorder.stop();
        return status(recorder, "stopped", None);
    }
    match recorder.start() {
        Ok(_) => status(recorder, "started", None),
        Err(e) => {
            warn!("failed to start recording: {e:#}");
            status(recorder, "error", Some(format!("{e:#}")))
        }
    }
}

pub fn cancel_recording(recorder: &Recorder) -> RecordingStatus {
    match recorder.cancel() {
        Some(seq_id) => status(recorder, "cancelled", Some(format!("{seq_id} discarded"))),
        None => status(recorder, "idle", Some("not recording".to_string())),
    }
}

pub fn recording_status(recorder: &Recorder) -> RecordingStatus {
    let label = if recorder.is_active() { "recording" } else { "idle" };
    status(recorder, label, None)
}
