use super::{BoxedStream, Dial};
use crate::error::{ProxyError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// 默认连接超时
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// 直连拨号器
#[derive(Debug, Clone)]
pub struct DirectDialer {
    connect_timeout: Duration,
}

impl Default for DirectDialer {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl DirectDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// 建立 TCP 连接
    pub async fn connect(&self, addr: &str) -> Result<TcpStream> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ProxyError::timeout(self.connect_timeout))?
            .map_err(|e| ProxyError::connection_failed(addr, e))?;

        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }
        debug!("Connected to {} directly", addr);
        Ok(stream)
    }
}

#[async_trait]
impl Dial for DirectDialer {
    async fn dial(&self, addr: &str) -> Result<BoxedStream> {
        Ok(Box::pin(self.connect(addr).await?))
    }

    fn cancel_on_drop(&self) -> bool {
        true
    }
}
