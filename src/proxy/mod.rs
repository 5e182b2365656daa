//! 代理服务
//!
//! 每个入站连接读取一个请求头，经访问控制授权后按方法分发：
//! CONNECT 建立隧道，其余方法作为普通 HTTP 请求转发。
//! 发往客户端的下行数据经过身份的限速器和计数写入器。

mod relay;
mod tunnel;

use crate::dialer::{DialError, Leg, LegDialer, TaggedStream};
use crate::error::{ProxyError, Result};
use crate::gate::{AccessGate, Grant};
use crate::protocol::{read_head, RequestHead, HEAD_READ_TIMEOUT};
use crate::router::RoutedDialer;
use crate::stats::ListenerStatsTracker;
use http::StatusCode;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 每个监听器的最大并发连接数
pub const MAX_CONCURRENT_CONNECTIONS: usize = 1000;

/// 出站方式
#[derive(Clone)]
pub enum Outbound {
    /// 服务端：直接连接目标
    Origin(LegDialer),
    /// 客户端：总是经由上游代理
    Upstream(LegDialer),
    /// 客户端自动代理：按路由表选择直连或上游代理
    Autoproxy(RoutedDialer),
}

impl Outbound {
    /// 访问日志标记
    pub fn tag(&self) -> &'static str {
        match self {
            Outbound::Origin(_) => "S",
            Outbound::Upstream(_) => "C",
            Outbound::Autoproxy(_) => "A",
        }
    }

    /// 拨号，`cancel` 触发时（监听器关闭）放弃进行中的拨号
    pub async fn dial(
        &self,
        cancel: &CancellationToken,
        addr: &str,
    ) -> std::result::Result<TaggedStream, DialError> {
        match self {
            Outbound::Origin(dialer) | Outbound::Upstream(dialer) => {
                dialer.dial_with_cancel(cancel, addr).await
            }
            Outbound::Autoproxy(router) => router.dial(cancel, addr).await,
        }
    }

    /// 经由该线路的流量是否计费限速
    ///
    /// 只有自动代理选择直连的流量不计费
    pub fn is_metered(&self, leg: Leg) -> bool {
        !matches!((self, leg), (Outbound::Autoproxy(_), Leg::Direct))
    }
}

/// 写出一个简单的文本响应并关闭连接
pub(crate) async fn write_error<W>(
    writer: &mut W,
    status: StatusCode,
    message: &str,
    challenge: Option<&str>,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = format!("{}\n", message);
    let mut response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Unknown"),
        body.len()
    );
    if let Some(challenge) = challenge {
        response.push_str(&format!("Proxy-Authenticate: {}\r\n", challenge));
    }
    response.push_str("\r\n");
    response.push_str(&body);
    writer.write_all(response.as_bytes()).await?;
    writer.flush().await
}

/// 代理服务
pub struct ProxyService {
    gate: Arc<AccessGate>,
    outbound: Outbound,
}

impl ProxyService {
    pub fn new(gate: Arc<AccessGate>, outbound: Outbound) -> Self {
        Self { gate, outbound }
    }

    pub fn outbound(&self) -> &Outbound {
        &self.outbound
    }

    /// 处理一个入站连接
    pub async fn handle<S>(
        &self,
        mut inbound: S,
        peer: SocketAddr,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (head, leftover) = match tokio::time::timeout(HEAD_READ_TIMEOUT, read_head(&mut inbound)).await {
            Err(_) => return Err(ProxyError::timeout(HEAD_READ_TIMEOUT)),
            Ok(Ok(None)) => return Ok(()),
            Ok(Ok(Some(head))) => head,
            Ok(Err(e)) => {
                write_error(&mut inbound, StatusCode::BAD_REQUEST, &e.to_string(), None)
                    .await
                    .ok();
                return Err(e);
            }
        };

        let request = match RequestHead::parse(&head) {
            Ok(request) => request,
            Err(e) => {
                write_error(&mut inbound, StatusCode::BAD_REQUEST, &e.to_string(), None)
                    .await
                    .ok();
                return Err(e);
            }
        };

        let grant = match self
            .gate
            .authorize(peer, request.headers.get("proxy-authorization"))
        {
            Ok(grant) => grant,
            Err(denial) => {
                write_error(
                    &mut inbound,
                    denial.status(),
                    denial.message(),
                    denial.challenge(),
                )
                .await
                .ok();
                return Ok(());
            }
        };

        info!(
            "[{}]{}[{}] {} {}",
            self.outbound.tag(),
            peer,
            grant.principal,
            request.method,
            request.target
        );

        let ctx = Exchange {
            outbound: &self.outbound,
            gate: &self.gate,
            grant: &grant,
            cancel,
        };
        if request.is_connect() {
            tunnel::connect(ctx, inbound, leftover, &request.target).await
        } else {
            relay::forward(ctx, inbound, leftover, &request).await
        }
    }
}

/// 一次请求处理所需的上下文
#[derive(Clone, Copy)]
pub(crate) struct Exchange<'a> {
    outbound: &'a Outbound,
    gate: &'a AccessGate,
    grant: &'a Grant,
    cancel: &'a CancellationToken,
}

/// 接受连接直到 `cancel` 被触发
///
/// 提供 `tls` 时先完成 TLS 握手，握手也受请求头超时约束
pub async fn serve(
    listener: TcpListener,
    service: Arc<ProxyService>,
    tls: Option<TlsAcceptor>,
    stats: ListenerStatsTracker,
    cancel: CancellationToken,
) -> Result<()> {
    let local = listener.local_addr()?;
    let limiter = Arc::new(Semaphore::new(MAX_CONCURRENT_CONNECTIONS));
    info!(
        "[{}] Listening on {}{}",
        service.outbound().tag(),
        local,
        if tls.is_some() { " (TLS)" } else { "" }
    );

    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => {
                info!("[{}] Listener {} stopped", service.outbound().tag(), local);
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Accept error on {}: {}", local, e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
        };

        let permit = match limiter.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(
                    "Connection limit reached ({}), rejecting {}",
                    MAX_CONCURRENT_CONNECTIONS, peer
                );
                continue;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }

        let service = service.clone();
        let tls = tls.clone();
        let stats = stats.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let _guard = stats.connection_started();
            let result = match tls {
                Some(acceptor) => {
                    match tokio::time::timeout(HEAD_READ_TIMEOUT, acceptor.accept(stream)).await {
                        Ok(Ok(stream)) => service.handle(stats.wrap(stream), peer, &cancel).await,
                        Ok(Err(e)) => Err(ProxyError::TlsError(e.to_string())),
                        Err(_) => Err(ProxyError::timeout(HEAD_READ_TIMEOUT)),
                    }
                }
                None => service.handle(stats.wrap(stream), peer, &cancel).await,
            };
            if let Err(e) = result {
                debug!("{} connection closed: {}", peer, e);
            }
        });
    }
}
