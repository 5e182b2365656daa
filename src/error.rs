/// 自定义错误类型
///
/// 使用 thiserror 定义精确的错误类型，调用方可以按类别处理：
/// 拨号失败返回 503，握手被拒绝带上上游状态行，配置错误直接跳过该行
use std::io;
use thiserror::Error;

/// 代理的主要错误类型
#[derive(Error, Debug)]
pub enum ProxyError {
    /// 连接失败
    #[error("Failed to connect to {addr}: {source}")]
    ConnectionFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 上游代理拒绝 CONNECT 请求
    #[error("Upstream proxy refused CONNECT {addr}: {status}{}", body_suffix(.body))]
    UpstreamRefused {
        addr: String,
        status: String,
        body: String,
    },

    /// 配置错误（账号、白名单、限额格式等）
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// 协议错误（请求头或响应头格式错误）
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// TLS 握手错误
    #[error("TLS error: {0}")]
    TlsError(String),

    /// 超时错误
    #[error("Operation timeout after {duration:?}")]
    Timeout { duration: std::time::Duration },

    /// 拨号被取消
    #[error("Dial cancelled")]
    Cancelled,

    /// 持久化错误
    #[error("Persistence error: {0}")]
    PersistenceError(String),

    /// 远程列表获取失败
    #[error("Fetch error: {0}")]
    FetchError(String),

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// 其他错误（保留与 anyhow 的兼容性）
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn body_suffix(body: &str) -> String {
    let body = body.trim();
    if body.is_empty() {
        String::new()
    } else {
        format!(" ({})", body)
    }
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// 创建连接失败错误
    pub fn connection_failed(addr: impl Into<String>, source: io::Error) -> Self {
        Self::ConnectionFailed {
            addr: addr.into(),
            source,
        }
    }

    /// 创建上游拒绝错误
    pub fn upstream_refused(
        addr: impl Into<String>,
        status: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self::UpstreamRefused {
            addr: addr.into(),
            status: status.into(),
            body: body.into(),
        }
    }

    /// 创建配置错误
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// 创建协议错误
    pub fn protocol_error(msg: impl Into<String>) -> Self {
        Self::ProtocolError(msg.into())
    }

    /// 创建超时错误
    pub fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout { duration }
    }

    /// 检查是否为超时错误
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// 检查是否为取消
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// 检查是否为配置错误
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::ConfigError(_))
    }

    /// 检查是否为上游拒绝
    pub fn is_upstream_refused(&self) -> bool {
        matches!(self, Self::UpstreamRefused { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_upstream_refused_message() {
        let err = ProxyError::upstream_refused(
            "example.com:443",
            "HTTP/1.1 407 Proxy Authentication Required",
            "bad credentials\n",
        );
        assert!(err.is_upstream_refused());
        assert_eq!(
            err.to_string(),
            "Upstream proxy refused CONNECT example.com:443: \
             HTTP/1.1 407 Proxy Authentication Required (bad credentials)"
        );
    }

    #[test]
    fn test_upstream_refused_without_body() {
        let err = ProxyError::upstream_refused("a:1", "HTTP/1.1 502 Bad Gateway", "  ");
        assert_eq!(
            err.to_string(),
            "Upstream proxy refused CONNECT a:1: HTTP/1.1 502 Bad Gateway"
        );
    }

    #[test]
    fn test_connection_failed() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let err = ProxyError::connection_failed("127.0.0.1:8080", io_err);
        assert!(err.to_string().contains("Failed to connect"));
        assert!(err.to_string().contains("127.0.0.1:8080"));
    }

    #[test]
    fn test_error_is_checks() {
        let config_err = ProxyError::config_error("bad limit");
        let timeout_err = ProxyError::timeout(Duration::from_secs(1));

        assert!(config_err.is_config_error());
        assert!(!config_err.is_timeout());
        assert!(timeout_err.is_timeout());
        assert!(!timeout_err.is_cancelled());
        assert!(ProxyError::Cancelled.is_cancelled());
    }
}
