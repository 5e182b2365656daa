use super::{write_error, Exchange};
use crate::error::{ProxyError, Result};
use http::StatusCode;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, warn};

/// 连接空闲超时时间
pub(crate) const CONNECTION_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// 数据复制缓冲区大小
const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// 复制数据直到读端结束，连接空闲超过 [`CONNECTION_IDLE_TIMEOUT`] 时返回错误
pub(crate) async fn copy_with_idle_timeout<R, W>(reader: &mut R, writer: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = match tokio::time::timeout(CONNECTION_IDLE_TIMEOUT, reader.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "Connection idle timeout",
                ))
            }
        };
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }

    writer.flush().await?;
    Ok(total)
}

/// 隧道两个方向共享的最近活动时刻
struct Activity {
    start: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        self.last_ms
            .store(self.start.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn deadline(&self) -> Instant {
        self.start
            + Duration::from_millis(self.last_ms.load(Ordering::Relaxed))
            + CONNECTION_IDLE_TIMEOUT
    }

    /// 两个方向都空闲超过 [`CONNECTION_IDLE_TIMEOUT`] 时返回
    async fn idle(&self) {
        loop {
            let deadline = self.deadline();
            if Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep_until(deadline).await;
        }
    }
}

/// 复制一个方向直到读端结束
async fn copy_tracked<R, W>(reader: &mut R, writer: &mut W, activity: &Activity) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        activity.touch();
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        total += n as u64;
    }
}

/// 隧道的结束原因
#[derive(Debug)]
enum Closed {
    Client(io::Result<u64>),
    Target(io::Result<u64>),
    Idle,
}

/// 双向复制，任一方向结束、出错或整体空闲超时后关闭两端
async fn bridge<CR, CW, TR, TW>(
    mut client_r: CR,
    mut client_w: CW,
    mut target_r: TR,
    mut target_w: TW,
) -> Closed
where
    CR: AsyncRead + Unpin,
    CW: AsyncWrite + Unpin,
    TR: AsyncRead + Unpin,
    TW: AsyncWrite + Unpin,
{
    let activity = Activity::new();
    let closed = tokio::select! {
        up = copy_tracked(&mut client_r, &mut target_w, &activity) => Closed::Client(up),
        down = copy_tracked(&mut target_r, &mut client_w, &activity) => Closed::Target(down),
        _ = activity.idle() => Closed::Idle,
    };
    let _ = target_w.shutdown().await;
    let _ = client_w.shutdown().await;
    closed
}

/// `host:port` 且端口有效
pub(crate) fn has_port(target: &str) -> bool {
    match target.rsplit_once(':') {
        Some((host, port)) => {
            !host.is_empty()
                && port.parse::<u16>().is_ok()
                && (!host.contains(':') || host.ends_with(']'))
        }
        None => false,
    }
}

/// CONNECT 隧道
pub(super) async fn connect<S>(
    ctx: Exchange<'_>,
    mut inbound: S,
    leftover: Vec<u8>,
    target: &str,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    if !has_port(target) {
        let msg = format!("invalid CONNECT target: {}", target);
        write_error(&mut inbound, StatusCode::BAD_REQUEST, &msg, None)
            .await
            .ok();
        return Err(ProxyError::protocol_error(msg));
    }

    let tagged = match ctx.outbound.dial(ctx.cancel, target).await {
        Ok(tagged) => tagged,
        Err(e) => {
            warn!("CONNECT {}: {}", target, e);
            write_error(
                &mut inbound,
                StatusCode::SERVICE_UNAVAILABLE,
                &e.to_string(),
                None,
            )
            .await
            .ok();
            return Ok(());
        }
    };

    inbound
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;
    inbound.flush().await?;

    let metered = ctx.outbound.is_metered(tagged.leg);
    let (client_r, client_w) = tokio::io::split(inbound);
    let (target_r, mut target_w) = tokio::io::split(tagged.stream);

    // 请求头之后客户端已经发出的数据属于隧道
    if !leftover.is_empty() {
        target_w.write_all(&leftover).await?;
    }

    let closed = if metered {
        let grant = ctx.grant;
        let writer = ctx
            .gate
            .ledger()
            .writer(&grant.principal, grant.limiter.writer(client_w));
        bridge(client_r, writer, target_r, target_w).await
    } else {
        bridge(client_r, client_w, target_r, target_w).await
    };
    match closed {
        Closed::Client(result) => debug!("[{}] {} closed by client: {:?}", tagged.leg, target, result),
        Closed::Target(result) => debug!("[{}] {} closed by target: {:?}", tagged.leg, target, result),
        Closed::Idle => debug!("[{}] {} idle timeout", tagged.leg, target),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_port() {
        assert!(has_port("example.com:443"));
        assert!(has_port("[::1]:443"));
        assert!(has_port("127.0.0.1:80"));
        assert!(!has_port("example.com"));
        assert!(!has_port("example.com:"));
        assert!(!has_port("example.com:99999"));
        assert!(!has_port(":443"));
        assert!(!has_port("::1"));
    }

    #[tokio::test]
    async fn test_copy_with_idle_timeout() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let mut out = Vec::new();
        let writer = tokio::spawn(async move {
            b.write_all(b"hello tunnel").await.unwrap();
            b.shutdown().await.unwrap();
        });
        let n = copy_with_idle_timeout(&mut a, &mut out).await.unwrap();
        writer.await.unwrap();
        assert_eq!(n, 12);
        assert_eq!(out, b"hello tunnel");
    }

    #[tokio::test]
    async fn test_bridge_closes_client_when_target_closes() {
        let (client, mut client_peer) = tokio::io::duplex(64);
        let (target, target_peer) = tokio::io::duplex(64);
        drop(target_peer);

        let (client_r, client_w) = tokio::io::split(client);
        let (target_r, target_w) = tokio::io::split(target);
        let closed = tokio::time::timeout(
            Duration::from_secs(2),
            bridge(client_r, client_w, target_r, target_w),
        )
        .await
        .unwrap();
        assert!(matches!(closed, Closed::Target(Ok(0))));

        // 客户端一侧读到 EOF
        let mut buf = [0u8; 8];
        assert_eq!(client_peer.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bridge_relays_both_directions() {
        let (client, mut client_peer) = tokio::io::duplex(64);
        let (target, mut target_peer) = tokio::io::duplex(64);
        let (client_r, client_w) = tokio::io::split(client);
        let (target_r, target_w) = tokio::io::split(target);
        let handle = tokio::spawn(bridge(client_r, client_w, target_r, target_w));

        client_peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        target_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        target_peer.write_all(b"pong").await.unwrap();
        client_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(client_peer);
        assert!(matches!(handle.await.unwrap(), Closed::Client(Ok(4))));
    }
}
