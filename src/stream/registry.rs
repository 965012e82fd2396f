//! Live subscriber connections and resilient fan-out.
//!
//! The lock only guards the map. Sends run outside it, concurrently, each
//! bounded by the configured timeout. Connections that were already closed
//! or whose send failed are unregistered after the whole scan.

use anyhow::Result;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// A subscriber the registry can push text to.
pub trait Connection: Send + Sync + 'static {
    fn is_closed(&self) -> bool;
    fn send_text(&self, text: Arc<str>) -> impl Future<Output = Result<()>> + Send;
    fn close(&self) -> impl Future<Output = ()> + Send;
}

pub type ConnectionId = u64;

#[derive(Debug, Clone, Copy)]
pub struct ConnectionInfo {
    pub remote_addr: SocketAddr,
    pub connected_at: Instant,
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
}

struct Entry<C> {
    conn: Arc<C>,
    info: ConnectionInfo,
}

struct Inner<C> {
    next_id: ConnectionId,
    entries: HashMap<ConnectionId, Entry<C>>,
}

pub struct ConnectionRegistry<C> {
    inner: Mutex<Inner<C>>,
    send_timeout: Duration,
}

impl<C: Connection> ConnectionRegistry<C> {
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                entries: HashMap::new(),
            }),
            send_timeout,
        }
    }

    pub fn register(&self, conn: Arc<C>, remote_addr: SocketAddr) -> ConnectionId {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.insert(
            id,
            Entry {
                conn,
                info: ConnectionInfo {
                    remote_addr,
                    connected_at: Instant::now(),
                },
            },
        );
        info!(id, %remote_addr, total = inner.entries.len(), "subscriber connected");
        id
    }

    /// Returns false when `id` was not registered.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.remove(&id) {
            Some(entry) => {
                info!(
                    id,
                    remote_addr = %entry.info.remote_addr,
                    connected_secs = entry.info.connected_at.elapsed().as_secs_f64(),
                    total = inner.entries.len(),
                    "subscriber disconnected"
                );
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn info(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.inner.lock().entries.get(&id).map(|e| e.info)
    }

    pub async fn broadcast<M: Serialize>(&self, message: &M) -> serde_json::Result<BroadcastReport> {
        self.broadcast_except(message, None).await
    }

    /// Serializes `message` once and sends it to every connection except
    /// `exclude`.
    pub async fn broadcast_except<M: Serialize>(
        &self,
        message: &M,
        exclude: Option<ConnectionId>,
    ) -> serde_json::Result<BroadcastReport> {
        let text: Arc<str> = serde_json::to_string(message)?.into();
        Ok(self.broadcast_text(text, exclude).await)
    }

    pub async fn broadcast_text(&self, text: Arc<str>, exclude: Option<ConnectionId>) -> BroadcastReport {
        let targets = self.snapshot(exclude);
        if targets.is_empty() {
            return BroadcastReport::default();
        }

        let timeout = self.send_timeout;
        let sends = targets.iter().map(|(id, conn)| {
            let text = Arc::clone(&text);
            async move {
                if conn.is_closed() {
                    return (*id, false);
                }
                let ok = match tokio::time::timeout(timeout, conn.send_text(text)).await {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        debug!(id, "send failed: {e:#}");
                        false
                    }
                    Err(_) => {
                        debug!(id, "send timed out");
                        false
                    }
                };
                (*id, ok)
            }
        });

        let mut report = BroadcastReport::default();
        let mut failed = Vec::new();
        for (id, ok) in join_all(sends).await {
            if ok {
                report.delivered += 1;
            } else {
                report.dropped += 1;
                failed.push(id);
            }
        }

        for id in failed {
            self.unregister(id);
        }
        report
    }

    /// Closes and unregisters every connection.
    pub async fn close_all(&self) {
        let targets = self.snapshot(None);
        join_all(targets.iter().map(|(_, conn)| conn.close())).await;
        for (id, _) in targets {
            self.unregister(id);
        }
    }

    fn snapshot(&self, exclude: Option<ConnectionId>) -> Vec<(ConnectionId, Arc<C>)> {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|(id, _)| Some(**id) != exclude)
            .map(|(id, e)| (*id, Arc::clone(&e.conn)))
            .collect()
    }
}
