use crate::dialer::Upstream;
use crate::error::{ProxyError, Result};
use async_trait::async_trait;
use futures::future::{select_ok, BoxFuture, FutureExt};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

/// 默认远程域名列表
pub const DEFAULT_LIST_URL: &str =
    "https://raw.githubusercontent.com/v2fly/domain-list-community/release/geolocation-!cn.txt";

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(60);

pub const DEFAULT_FETCH_RETRIES: u32 = 3;

/// 远程列表来源
#[async_trait]
pub trait ListSource: Send + Sync {
    async fn fetch(&self) -> Result<String>;
}

/// 经由 https 上游代理获取时的证书校验方式
#[derive(Debug, Clone, Default)]
pub struct UpstreamTls {
    /// 不校验证书
    pub skip_verify: bool,
    /// 额外信任的 CA 证书（PEM）
    pub ca_cert_path: Option<PathBuf>,
}

impl UpstreamTls {
    fn apply(&self, mut builder: reqwest::ClientBuilder) -> Result<reqwest::ClientBuilder> {
        if let Some(path) = &self.ca_cert_path {
            let pem = std::fs::read(path).map_err(|e| {
                ProxyError::FetchError(format!("failed to read CA cert {}: {}", path.display(), e))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                ProxyError::FetchError(format!("invalid CA cert {}: {}", path.display(), e))
            })?;
            builder = builder.add_root_certificate(cert);
        }
        if self.skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        Ok(builder)
    }
}

/// 通过 HTTP 获取远程列表
///
/// 同时使用三个客户端（不使用代理、经由上游代理、使用环境变量中的代理）请求，
/// 第一个成功的结果胜出
pub struct RemoteListSource {
    url: String,
    clients: Vec<(&'static str, reqwest::Client)>,
    timeout: Duration,
    retries: u32,
}

impl RemoteListSource {
    pub fn new(
        url: impl Into<String>,
        upstream: Option<&Upstream>,
        upstream_tls: &UpstreamTls,
        timeout: Duration,
        retries: u32,
    ) -> Result<Self> {
        let build = |builder: reqwest::ClientBuilder| {
            builder
                .build()
                .map_err(|e| ProxyError::FetchError(format!("failed to build client: {}", e)))
        };

        let mut clients = vec![("no-proxy", build(reqwest::Client::builder().no_proxy())?)];
        if let Some(upstream) = upstream {
            let mut proxy = reqwest::Proxy::all(upstream.display())
                .map_err(|e| ProxyError::FetchError(format!("invalid upstream proxy: {}", e)))?;
            if let Some(auth) = upstream.credentials() {
                proxy = proxy.basic_auth(&auth.username, &auth.password);
            }
            let builder = upstream_tls.apply(reqwest::Client::builder().proxy(proxy))?;
            clients.push(("upstream", build(builder)?));
        }
        clients.push(("environment", build(reqwest::Client::builder())?));

        Ok(Self {
            url: url.into(),
            clients,
            timeout,
            retries: retries.max(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn fetch_once(&self) -> Result<String> {
        let attempts: Vec<BoxFuture<'_, Result<String>>> = self
            .clients
            .iter()
            .map(|(name, client)| {
                let url = self.url.as_str();
                async move {
                    let text = client
                        .get(url)
                        .send()
                        .await
                        .and_then(|r| r.error_for_status())
                        .map_err(|e| ProxyError::FetchError(format!("{}: {}", name, e)))?
                        .text()
                        .await
                        .map_err(|e| ProxyError::FetchError(format!("{}: {}", name, e)))?;
                    debug!("Fetched {} bytes from {} ({})", text.len(), url, name);
                    Ok(text)
                }
                .boxed()
            })
            .collect();

        match tokio::time::timeout(self.timeout, select_ok(attempts)).await {
            Ok(Ok((text, _))) => Ok(text),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ProxyError::timeout(self.timeout)),
        }
    }
}

#[async_trait]
impl ListSource for RemoteListSource {
    async fn fetch(&self) -> Result<String> {
        let mut last = ProxyError::FetchError("no attempt made".to_string());
        for attempt in 1..=self.retries {
            match self.fetch_once().await {
                Ok(text) => return Ok(text),
                Err(e) => {
                    warn!(
                        "Fetch {} failed (attempt {}/{}): {}",
                        self.url, attempt, self.retries, e
                    );
                    last = e;
                }
            }
        }
        Err(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve_once(body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let resp = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(resp.as_bytes()).await;
            }
        });
        format!("http://{}/list.txt", addr)
    }

    #[tokio::test]
    async fn test_fetch_first_success_wins() {
        let url = serve_once("domain:example.com\n").await;
        let source =
            RemoteListSource::new(url, None, &UpstreamTls::default(), Duration::from_secs(5), 1)
                .unwrap();
        assert_eq!(source.fetch().await.unwrap(), "domain:example.com\n");
    }

    #[tokio::test]
    async fn test_fetch_failure_after_retries() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let source = RemoteListSource::new(
            format!("http://{}/list.txt", addr),
            None,
            &UpstreamTls::default(),
            Duration::from_secs(5),
            2,
        )
        .unwrap();
        assert!(source.fetch().await.is_err());
    }

    #[test]
    fn test_upstream_tls_options() {
        let upstream = Upstream::parse("https://alice:pw@127.0.0.1:8443").unwrap();
        let url = "http://127.0.0.1/list.txt";
        let timeout = Duration::from_secs(5);

        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("ca.pem");
        let key = dir.path().join("ca.key");
        crate::tls::generate_self_signed_cert("proxy.local", &[], &cert, &key).unwrap();
        let trusted = UpstreamTls {
            skip_verify: false,
            ca_cert_path: Some(cert),
        };
        let source = RemoteListSource::new(url, Some(&upstream), &trusted, timeout, 1).unwrap();
        assert_eq!(source.clients.len(), 3);

        let insecure = UpstreamTls {
            skip_verify: true,
            ca_cert_path: None,
        };
        assert!(RemoteListSource::new(url, Some(&upstream), &insecure, timeout, 1).is_ok());

        let missing = UpstreamTls {
            skip_verify: false,
            ca_cert_path: Some(dir.path().join("missing.pem")),
        };
        let err = RemoteListSource::new(url, Some(&upstream), &missing, timeout, 1)
            .err()
            .unwrap();
        assert!(err.to_string().contains("missing.pem"));
    }
}
