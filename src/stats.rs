use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Statistics for a single listener
#[derive(Debug, Clone, Default, Serialize)]
pub struct ListenerStats {
    /// Listener name (`server`, `client`, `autoproxy`)
    pub name: String,
    /// Total number of accepted connections
    pub total_connections: u64,
    /// Currently active connections
    pub active_connections: u64,
    /// Total bytes sent to clients
    pub bytes_sent: u64,
    /// Total bytes received from clients
    pub bytes_received: u64,
}

/// Statistics tracker for a single listener
#[derive(Debug, Clone)]
pub struct ListenerStatsTracker {
    name: String,
    total_connections: Arc<AtomicU64>,
    active_connections: Arc<AtomicU64>,
    bytes_sent: Arc<AtomicU64>,
    bytes_received: Arc<AtomicU64>,
}

impl ListenerStatsTracker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            total_connections: Arc::new(AtomicU64::new(0)),
            active_connections: Arc::new(AtomicU64::new(0)),
            bytes_sent: Arc::new(AtomicU64::new(0)),
            bytes_received: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Increment active connections (called when connection starts)
    pub fn connection_started(&self) -> ConnectionGuard {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            tracker: self.clone(),
        }
    }

    pub fn add_bytes_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Get current snapshot of stats
    pub fn get_stats(&self) -> ListenerStats {
        ListenerStats {
            name: self.name.clone(),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }

    /// Wrap an inbound stream so every byte moved through it is counted
    pub fn wrap<S>(&self, stream: S) -> CountedStream<S> {
        CountedStream {
            inner: stream,
            tracker: self.clone(),
        }
    }
}

/// Decrements the active connection count on drop
#[derive(Debug)]
pub struct ConnectionGuard {
    tracker: ListenerStatsTracker,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.tracker
            .active_connections
            .fetch_sub(1, Ordering::Relaxed);
    }
}

/// Global statistics manager
#[derive(Debug, Clone, Default)]
pub struct StatsManager {
    listeners: Arc<Mutex<BTreeMap<String, ListenerStatsTracker>>>,
}

impl StatsManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener, returning the existing tracker if the name is taken
    pub fn register_listener(&self, name: &str) -> ListenerStatsTracker {
        self.listeners
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| ListenerStatsTracker::new(name))
            .clone()
    }

    /// Get stats for all listeners
    pub fn get_all_stats(&self) -> Vec<ListenerStats> {
        self.listeners
            .lock()
            .values()
            .map(|tracker| tracker.get_stats())
            .collect()
    }

    /// Sum of all listeners
    pub fn aggregate(&self) -> ListenerStats {
        self.get_all_stats()
            .into_iter()
            .fold(ListenerStats::default(), |mut acc, s| {
                acc.total_connections += s.total_connections;
                acc.active_connections += s.active_connections;
                acc.bytes_sent += s.bytes_sent;
                acc.bytes_received += s.bytes_received;
                acc
            })
    }
}

/// Inbound stream wrapper counting bytes in both directions
pub struct CountedStream<S> {
    inner: S,
    tracker: ListenerStatsTracker,
}

impl<S> CountedStream<S> {
    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for CountedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let this = &mut *self;
        let res = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = res {
            let n = buf.filled().len() - before;
            if n > 0 {
                this.tracker.add_bytes_received(n as u64);
            }
        }
        res
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CountedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let res = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = res {
            this.tracker.add_bytes_sent(n as u64);
        }
        res
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
