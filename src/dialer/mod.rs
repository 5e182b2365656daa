//! 拨号器
//!
//! 直连拨号器和上游 HTTP(S) 代理拨号器都实现 [`Dial`]；
//! 上游代理拨号器通过另一个 [`Dial`] 连接代理本身，从而可以串联多级代理。
//! [`LegDialer`] 给每个连接和拨号错误打上所用线路（直连/代理）的标记。

mod chain;
mod direct;
mod http_proxy;

pub use chain::{build_chain, Upstream};
pub use direct::DirectDialer;
pub use http_proxy::{connect_handshake, Authorization, BasicAuth, HttpProxyDialer};

use crate::error::{ProxyError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// 双向字节流
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Stream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// 拨号得到的连接
pub type BoxedStream = Pin<Box<dyn Stream>>;

/// 拨号接口
#[async_trait]
pub trait Dial: Send + Sync {
    /// 连接 `addr`（`host:port`）
    async fn dial(&self, addr: &str) -> Result<BoxedStream>;

    /// 丢弃 `dial` 返回的 future 是否会中止进行中的连接
    fn cancel_on_drop(&self) -> bool {
        false
    }
}

/// 可取消的拨号
///
/// 支持原生取消的拨号器直接与取消信号竞争；其余拨号器在后台任务中拨号，
/// 取消信号先到时立即返回 [`ProxyError::Cancelled`]，之后完成的连接会被立即关闭。
/// 后台进行中的网络操作本身不会被中止
pub async fn dial_with_cancel(
    dialer: Arc<dyn Dial>,
    cancel: &CancellationToken,
    addr: &str,
) -> Result<BoxedStream> {
    if cancel.is_cancelled() {
        return Err(ProxyError::Cancelled);
    }

    if dialer.cancel_on_drop() {
        return tokio::select! {
            _ = cancel.cancelled() => Err(ProxyError::Cancelled),
            result = dialer.dial(addr) => result,
        };
    }

    let (tx, rx) = oneshot::channel();
    let target = addr.to_string();
    tokio::spawn(async move {
        let result = dialer.dial(&target).await;
        // 接收方已放弃，关闭迟到的连接
        if let Err(Ok(stream)) = tx.send(result) {
            drop(stream);
        }
    });

    tokio::select! {
        _ = cancel.cancelled() => Err(ProxyError::Cancelled),
        result = rx => result.unwrap_or(Err(ProxyError::Cancelled)),
    }
}

/// 连接所经过的线路
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Leg {
    Direct,
    Proxy,
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Leg::Direct => write!(f, "direct"),
            Leg::Proxy => write!(f, "proxy"),
        }
    }
}

/// 带线路标记的连接
pub struct TaggedStream {
    pub leg: Leg,
    pub stream: BoxedStream,
}

impl fmt::Debug for TaggedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaggedStream").field("leg", &self.leg).finish()
    }
}

/// 带线路标记的拨号错误
#[derive(Debug, thiserror::Error)]
#[error("{leg} dial failed: {source}")]
pub struct DialError {
    pub leg: Leg,
    #[source]
    pub source: ProxyError,
}

/// 带线路标记的拨号器
#[derive(Clone)]
pub struct LegDialer {
    leg: Leg,
    inner: Arc<dyn Dial>,
}

impl LegDialer {
    pub fn new(leg: Leg, inner: Arc<dyn Dial>) -> Self {
        Self { leg, inner }
    }

    pub fn leg(&self) -> Leg {
        self.leg
    }

    pub async fn dial_with_cancel(
        &self,
        cancel: &CancellationToken,
        addr: &str,
    ) -> std::result::Result<TaggedStream, DialError> {
        self.tag(dial_with_cancel(self.inner.clone(), cancel, addr).await)
    }

    fn tag(&self, result: Result<BoxedStream>) -> std::result::Result<TaggedStream, DialError> {
        match result {
            Ok(stream) => Ok(TaggedStream {
                leg: self.leg,
                stream,
            }),
            Err(source) => Err(DialError {
                leg: self.leg,
                source,
            }),
        }
    }
}

impl fmt::Debug for LegDialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LegDialer").field("leg", &self.leg).finish()
    }
}
