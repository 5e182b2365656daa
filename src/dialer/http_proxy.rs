use super::{BoxedStream, Dial};
use crate::error::{ProxyError, Result};
use crate::protocol::{read_head_exact, Headers, RequestHead, ResponseHead};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rustls::pki_types::ServerName;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::TlsConnector;
use tracing::debug;

/// 握手失败时读取的响应正文上限
const MAX_ERROR_BODY: u64 = 4096;
const ERROR_BODY_TIMEOUT: Duration = Duration::from_secs(2);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// 向 CONNECT 请求添加认证信息
pub trait Authorization: Send + Sync + fmt::Debug {
    fn authorize(&self, headers: &mut Headers);
}

/// Basic 认证
#[derive(Clone, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl BasicAuth {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl Authorization for BasicAuth {
    fn authorize(&self, headers: &mut Headers) {
        let token = STANDARD.encode(format!("{}:{}", self.username, self.password));
        headers.set("Proxy-Authorization", format!("Basic {}", token));
    }
}

/// 在已连接到上游代理的流上执行 CONNECT 握手
///
/// 非 200 响应返回包含状态行和响应正文的错误
pub async fn connect_handshake<S>(
    stream: &mut S,
    addr: &str,
    auth: Option<&dyn Authorization>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = RequestHead {
        method: "CONNECT".to_string(),
        target: addr.to_string(),
        version: "HTTP/1.1".to_string(),
        headers: Headers::new(),
    };
    request.headers.append("Host", addr);
    if let Some(auth) = auth {
        auth.authorize(&mut request.headers);
    }

    stream.write_all(&request.encode()).await?;
    stream.flush().await?;

    let response = ResponseHead::parse(&read_head_exact(stream).await?)?;
    if response.status != 200 {
        let body = read_error_body(stream, &response).await;
        return Err(ProxyError::upstream_refused(
            addr,
            response.status_line(),
            body,
        ));
    }
    Ok(())
}

async fn read_error_body<S>(stream: &mut S, response: &ResponseHead) -> String
where
    S: AsyncRead + Unpin,
{
    let limit = response
        .headers
        .get("content-length")
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(MAX_ERROR_BODY)
        .min(MAX_ERROR_BODY);
    if limit == 0 {
        return String::new();
    }

    let mut body = Vec::new();
    let mut reader = (&mut *stream).take(limit);
    let _ = tokio::time::timeout(ERROR_BODY_TIMEOUT, reader.read_to_end(&mut body)).await;
    String::from_utf8_lossy(&body).into_owned()
}

/// 上游 HTTP(S) 代理拨号器
pub struct HttpProxyDialer {
    proxy_addr: String,
    tls: Option<(TlsConnector, ServerName<'static>)>,
    auth: Option<Arc<dyn Authorization>>,
    forward: Arc<dyn Dial>,
}

impl HttpProxyDialer {
    /// `forward` 用于连接代理本身
    pub fn new(proxy_addr: impl Into<String>, forward: Arc<dyn Dial>) -> Self {
        Self {
            proxy_addr: proxy_addr.into(),
            tls: None,
            auth: None,
            forward,
        }
    }

    /// 与代理之间使用 TLS
    pub fn with_tls(mut self, connector: TlsConnector, server_name: ServerName<'static>) -> Self {
        self.tls = Some((connector, server_name));
        self
    }

    pub fn with_auth(mut self, auth: Option<Arc<dyn Authorization>>) -> Self {
        self.auth = auth;
        self
    }

    pub fn proxy_addr(&self) -> &str {
        &self.proxy_addr
    }
}

impl fmt::Debug for HttpProxyDialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpProxyDialer")
            .field("proxy_addr", &self.proxy_addr)
            .field("tls", &self.tls.is_some())
            .field("auth", &self.auth)
            .finish()
    }
}

#[async_trait]
impl Dial for HttpProxyDialer {
    async fn dial(&self, addr: &str) -> Result<BoxedStream> {
        let stream = self.forward.dial(&self.proxy_addr).await?;

        let mut stream: BoxedStream = match &self.tls {
            Some((connector, server_name)) => Box::pin(
                connector
                    .connect(server_name.clone(), stream)
                    .await
                    .map_err(|e| {
                        ProxyError::TlsError(format!(
                            "TLS handshake with {} failed: {}",
                            self.proxy_addr, e
                        ))
                    })?,
            ),
            None => stream,
        };

        tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            connect_handshake(&mut stream, addr, self.auth.as_deref()),
        )
        .await
        .map_err(|_| ProxyError::timeout(HANDSHAKE_TIMEOUT))??;

        debug!("Connected to {} via {}", addr, self.proxy_addr);
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialer::DirectDialer;
    use crate::protocol::read_head;
    use tokio::net::TcpListener;

    /// 模拟上游代理：校验认证后回复 `status`，成功时回显隧道数据
    async fn fake_proxy(reply: &'static str) -> (String, tokio::task::JoinHandle<RequestHead>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (head, _) = read_head(&mut stream).await.unwrap().unwrap();
            let request = RequestHead::parse(&head).unwrap();
            stream.write_all(reply.as_bytes()).await.unwrap();
            if reply.starts_with("HTTP/1.1 200") {
                let mut buf = [0u8; 4];
                stream.read_exact(&mut buf).await.unwrap();
                stream.write_all(&buf).await.unwrap();
            }
            request
        });
        (addr, handle)
    }

    #[test]
    fn test_basic_auth_header() {
        let mut headers = Headers::new();
        BasicAuth::new("user", "pass").authorize(&mut headers);
        assert_eq!(headers.get("proxy-authorization"), Some("Basic dXNlcjpwYXNz"));
        assert!(!format!("{:?}", BasicAuth::new("u", "secret")).contains("secret"));
    }

    #[tokio::test]
    async fn test_connect_through_proxy() {
        let (proxy, handle) = fake_proxy("HTTP/1.1 200 Connection Established\r\n\r\n").await;
        let dialer = HttpProxyDialer::new(proxy, Arc::new(DirectDialer::default()))
            .with_auth(Some(Arc::new(BasicAuth::new("user", "pass"))));

        let mut stream = dialer.dial("example.com:443").await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        let request = handle.await.unwrap();
        assert!(request.is_connect());
        assert_eq!(request.target, "example.com:443");
        assert_eq!(request.headers.get("host"), Some("example.com:443"));
        assert_eq!(
            request.headers.get("proxy-authorization"),
            Some("Basic dXNlcjpwYXNz")
        );
    }

    #[tokio::test]
    async fn test_refused_carries_status_and_body() {
        let (proxy, _handle) = fake_proxy(
            "HTTP/1.1 407 Proxy Authentication Required\r\nContent-Length: 11\r\n\r\nbad account",
        )
        .await;
        let dialer = HttpProxyDialer::new(proxy, Arc::new(DirectDialer::default()));

        let err = dialer.dial("example.com:443").await.err().unwrap();
        assert!(err.is_upstream_refused());
        let text = err.to_string();
        assert!(text.contains("407 Proxy Authentication Required"));
        assert!(text.contains("bad account"));
    }
}
