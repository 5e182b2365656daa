// Builder 模式实现

use super::{
    default_bind_addr, default_client_port, default_connect_timeout, default_server_port,
    ClientConfig, ConfigValidator, ServerConfig,
};
use anyhow::Result;
use std::path::PathBuf;

/// ServerConfig Builder
#[derive(Debug)]
pub struct ServerConfigBuilder {
    bind_addr: String,
    bind_port: u16,
    https: bool,
    cert_path: Option<PathBuf>,
    key_path: Option<PathBuf>,
    connect_timeout_secs: u64,
}

impl Default for ServerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerConfigBuilder {
    /// 创建新的 Builder
    pub fn new() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            bind_port: default_server_port(),
            https: false,
            cert_path: None,
            key_path: None,
            connect_timeout_secs: default_connect_timeout(),
        }
    }

    /// 设置绑定地址
    pub fn bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }

    /// 设置绑定端口
    pub fn bind_port(mut self, port: u16) -> Self {
        self.bind_port = port;
        self
    }

    /// 启用 HTTPS 监听
    pub fn https(mut self, https: bool) -> Self {
        self.https = https;
        self
    }

    /// 设置证书和私钥路径
    pub fn tls_files(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.cert_path = Some(cert.into());
        self.key_path = Some(key.into());
        self
    }

    pub fn connect_timeout_secs(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = secs;
        self
    }

    /// 构建 ServerConfig 并验证
    pub fn build(self) -> Result<ServerConfig> {
        let config = ServerConfig {
            bind_addr: self.bind_addr,
            bind_port: self.bind_port,
            https: self.https,
            cert_path: self.cert_path,
            key_path: self.key_path,
            connect_timeout_secs: self.connect_timeout_secs,
        };

        ConfigValidator::validate_server_config(&config)?;

        Ok(config)
    }
}

/// ClientConfig Builder
#[derive(Debug)]
pub struct ClientConfigBuilder {
    bind_addr: String,
    bind_port: u16,
    upstream: Vec<String>,
    username: Option<String>,
    password: Option<String>,
    skip_verify: bool,
    ca_cert_path: Option<PathBuf>,
    connect_timeout_secs: u64,
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientConfigBuilder {
    /// 创建新的 Builder
    pub fn new() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            bind_port: default_client_port(),
            upstream: Vec::new(),
            username: None,
            password: None,
            skip_verify: false,
            ca_cert_path: None,
            connect_timeout_secs: default_connect_timeout(),
        }
    }

    pub fn bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }

    pub fn bind_port(mut self, port: u16) -> Self {
        self.bind_port = port;
        self
    }

    /// 追加一个上游代理，按追加顺序串联
    pub fn upstream(mut self, url: impl Into<String>) -> Self {
        self.upstream.push(url.into());
        self
    }

    /// 设置上游认证信息
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// 设置是否跳过证书验证
    pub fn skip_verify(mut self, skip: bool) -> Self {
        self.skip_verify = skip;
        self
    }

    /// 设置 CA 证书路径
    pub fn ca_cert_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    pub fn connect_timeout_secs(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = secs;
        self
    }

    /// 构建 ClientConfig 并验证
    pub fn build(self) -> Result<ClientConfig> {
        let config = ClientConfig {
            bind_addr: self.bind_addr,
            bind_port: self.bind_port,
            upstream: self.upstream,
            username: self.username,
            password: self.password,
            skip_verify: self.skip_verify,
            ca_cert_path: self.ca_cert_path,
            connect_timeout_secs: self.connect_timeout_secs,
        };

        ConfigValidator::validate_client_config(&config)?;

        Ok(config)
    }
}
