use super::{BasicAuth, Dial, DirectDialer, HttpProxyDialer};
use crate::error::{ProxyError, Result};
use percent_encoding::percent_decode_str;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::TlsConnector;
use tracing::info;
use url::Url;

/// 上游代理
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    url: Url,
    username: Option<String>,
    password: Option<String>,
}

impl Upstream {
    /// 解析 `http://[user:pass@]host[:port]` 或 `https://...`
    pub fn parse(s: &str) -> Result<Self> {
        let url = Url::parse(s)
            .map_err(|e| ProxyError::config_error(format!("invalid upstream {}: {}", s, e)))?;
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(ProxyError::config_error(format!(
                    "unsupported upstream scheme {}: {}",
                    other, s
                )))
            }
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(ProxyError::config_error(format!(
                "upstream has no host: {}",
                s
            )));
        }

        let decode = |v: &str| percent_decode_str(v).decode_utf8_lossy().into_owned();
        let username = Some(decode(url.username())).filter(|u| !u.is_empty());
        let password = url.password().map(decode);
        Ok(Self {
            url,
            username,
            password,
        })
    }

    /// 覆盖 URL 中的认证信息
    pub fn with_credentials(mut self, username: Option<String>, password: Option<String>) -> Self {
        if username.is_some() || password.is_some() {
            self.username = username;
            self.password = password;
        }
        self
    }

    pub fn is_tls(&self) -> bool {
        self.url.scheme() == "https"
    }

    /// 主机名（IPv6 地址不带方括号）
    pub fn host(&self) -> &str {
        self.url
            .host_str()
            .unwrap_or_default()
            .trim_start_matches('[')
            .trim_end_matches(']')
    }

    pub fn port(&self) -> u16 {
        self.url
            .port_or_known_default()
            .unwrap_or(if self.is_tls() { 443 } else { 80 })
    }

    /// `host:port`
    pub fn addr(&self) -> String {
        format!("{}:{}", self.url.host_str().unwrap_or_default(), self.port())
    }

    pub fn credentials(&self) -> Option<BasicAuth> {
        match (&self.username, &self.password) {
            (None, None) => None,
            (user, pass) => Some(BasicAuth::new(
                user.clone().unwrap_or_default(),
                pass.clone().unwrap_or_default(),
            )),
        }
    }

    /// 日志中显示的地址，不含认证信息
    pub fn display(&self) -> String {
        format!("{}://{}", self.url.scheme(), self.addr())
    }
}

/// 按顺序串联上游代理，第一个代理最先连接
///
/// 列表为空时返回直连拨号器
pub fn build_chain(
    upstreams: &[Upstream],
    connect_timeout: Duration,
    tls: Option<&TlsConnector>,
) -> Result<Arc<dyn Dial>> {
    let mut dialer: Arc<dyn Dial> = Arc::new(DirectDialer::new(connect_timeout));

    for upstream in upstreams {
        let mut proxy = HttpProxyDialer::new(upstream.addr(), dialer).with_auth(
            upstream
                .credentials()
                .map(|a| Arc::new(a) as Arc<dyn super::Authorization>),
        );

        if upstream.is_tls() {
            let connector = tls.ok_or_else(|| {
                ProxyError::config_error(format!(
                    "{} requires a TLS client configuration",
                    upstream.display()
                ))
            })?;
            let server_name = ServerName::try_from(upstream.host().to_string()).map_err(|e| {
                ProxyError::config_error(format!(
                    "invalid server name {}: {}",
                    upstream.host(),
                    e
                ))
            })?;
            proxy = proxy.with_tls(connector.clone(), server_name);
        }

        info!("Upstream hop: {}", upstream.display());
        dialer = Arc::new(proxy);
    }

    Ok(dialer)
}
