// 配置管理模块

mod builder;
mod validator;

pub use builder::{ClientConfigBuilder, ServerConfigBuilder};
pub use validator::ConfigValidator;

use crate::dialer::Leg;
use crate::router::{DEFAULT_FETCH_RETRIES, DEFAULT_LIST_URL, DEFAULT_REFRESH_HOUR};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_SERVER_PORT: u16 = 8000;
pub const DEFAULT_CLIENT_PORT: u16 = 8888;

pub(crate) fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

pub(crate) fn default_server_port() -> u16 {
    DEFAULT_SERVER_PORT
}

pub(crate) fn default_client_port() -> u16 {
    DEFAULT_CLIENT_PORT
}

pub(crate) fn default_connect_timeout() -> u64 {
    15
}

/// 服务器端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 监听地址
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// 监听端口
    #[serde(default = "default_server_port")]
    pub bind_port: u16,
    /// 是否以 HTTPS 提供代理服务
    #[serde(default)]
    pub https: bool,
    /// TLS 证书路径（未配置时自动生成自签名证书）
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    /// TLS 私钥路径
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    /// 直连目标的超时时间（秒）
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ConfigValidator::validate_server_config(self)
    }
}

/// 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// 监听地址
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// 监听端口
    #[serde(default = "default_client_port")]
    pub bind_port: u16,
    /// 上游代理列表，按顺序串联，第一个最先连接
    pub upstream: Vec<String>,
    /// 上游代理用户名（覆盖 URL 中的认证信息）
    #[serde(default)]
    pub username: Option<String>,
    /// 上游代理密码
    #[serde(default)]
    pub password: Option<String>,
    /// 是否跳过 https 上游的证书验证（仅用于测试）
    #[serde(default)]
    pub skip_verify: bool,
    /// CA 证书路径（可选）
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
    /// 连接超时时间（秒）
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }
}

fn default_secrets() -> PathBuf {
    PathBuf::from("secrets")
}

fn default_whitelist() -> PathBuf {
    PathBuf::from("whitelist")
}

fn default_status() -> PathBuf {
    PathBuf::from("status")
}

fn default_record() -> PathBuf {
    PathBuf::from("database")
}

fn default_keep() -> usize {
    100
}

/// 账号、白名单和流量记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountingConfig {
    /// 账号文件
    #[serde(default = "default_secrets")]
    pub secrets: PathBuf,
    /// 白名单文件
    #[serde(default = "default_whitelist")]
    pub whitelist: PathBuf,
    /// 状态文件
    #[serde(default = "default_status")]
    pub status: PathBuf,
    /// 流量快照文件
    #[serde(default = "default_record")]
    pub record: PathBuf,
    /// 保留的历史状态文件数量
    #[serde(default = "default_keep")]
    pub keep: usize,
}

impl Default for AccountingConfig {
    fn default() -> Self {
        Self {
            secrets: default_secrets(),
            whitelist: default_whitelist(),
            status: default_status(),
            record: default_record(),
            keep: default_keep(),
        }
    }
}

impl AccountingConfig {
    fn resolve(&mut self, base: &Path) {
        self.secrets = resolve_path(base, &self.secrets);
        self.whitelist = resolve_path(base, &self.whitelist);
        self.status = resolve_path(base, &self.status);
        self.record = resolve_path(base, &self.record);
    }
}

fn default_list_url() -> String {
    DEFAULT_LIST_URL.to_string()
}

fn default_refresh_hour() -> u32 {
    DEFAULT_REFRESH_HOUR
}

fn default_fetch_timeout() -> u64 {
    60
}

fn default_fetch_retries() -> u32 {
    DEFAULT_FETCH_RETRIES
}

fn default_route() -> Leg {
    Leg::Proxy
}

/// 自动代理配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoproxyConfig {
    /// 监听地址（默认与客户端相同）
    #[serde(default)]
    pub bind_addr: Option<String>,
    /// 监听端口
    pub bind_port: u16,
    /// 远程域名列表地址
    #[serde(default = "default_list_url")]
    pub list_url: String,
    /// 本地覆盖文件
    #[serde(default)]
    pub custom: Option<PathBuf>,
    /// 每天刷新远程列表的时刻
    #[serde(default = "default_refresh_hour")]
    pub refresh_hour: u32,
    /// 获取远程列表的超时时间（秒）
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
    /// 获取远程列表的重试次数
    #[serde(default = "default_fetch_retries")]
    pub fetch_retries: u32,
    /// 没有规则匹配时的线路
    #[serde(default = "default_route")]
    pub default_route: Leg,
}

/// 服务器完整配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerFullConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub accounting: AccountingConfig,
}

impl ServerFullConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.server.validate()?;
        ConfigValidator::validate_accounting_config(&self.accounting)
    }
}

/// 客户端完整配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFullConfig {
    pub client: ClientConfig,
    #[serde(default)]
    pub accounting: AccountingConfig,
    #[serde(default)]
    pub autoproxy: Option<AutoproxyConfig>,
}

impl ClientFullConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        ConfigValidator::validate_client_full_config(self)
    }
}

/// 展开 `~` 并把相对路径解析到 `base` 目录下
pub fn resolve_path(base: &Path, path: &Path) -> PathBuf {
    let expanded = PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref());
    if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    }
}

fn config_dir(path: &Path) -> PathBuf {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// 配置文件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKind {
    Server,
    Client,
}

impl std::fmt::Display for ConfigKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigKind::Server => write!(f, "server"),
            ConfigKind::Client => write!(f, "client"),
        }
    }
}

/// 应用配置
#[derive(Debug, Clone)]
pub enum AppConfig {
    Server(ServerFullConfig),
    Client(ClientFullConfig),
}

impl AppConfig {
    /// 根据顶层表判断配置类型
    pub fn detect(content: &str) -> anyhow::Result<ConfigKind> {
        let value: toml::Table = toml::from_str(content).context("Failed to parse TOML")?;
        match (value.contains_key("server"), value.contains_key("client")) {
            (true, false) => Ok(ConfigKind::Server),
            (false, true) => Ok(ConfigKind::Client),
            (true, true) => anyhow::bail!("Configuration has both [server] and [client] sections"),
            (false, false) => anyhow::bail!("Configuration has neither [server] nor [client] section"),
        }
    }

    /// 从文件加载配置（自动检测类型）
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        match Self::detect(&content)? {
            ConfigKind::Server => Ok(Self::Server(Self::parse_server(&content, path)?)),
            ConfigKind::Client => Ok(Self::Client(Self::parse_client(&content, path)?)),
        }
    }

    pub fn kind(&self) -> ConfigKind {
        match self {
            AppConfig::Server(_) => ConfigKind::Server,
            AppConfig::Client(_) => ConfigKind::Client,
        }
    }

    fn parse_server(content: &str, path: &Path) -> anyhow::Result<ServerFullConfig> {
        let mut config: ServerFullConfig =
            toml::from_str(content).context("Failed to parse server configuration")?;
        let base = config_dir(path);
        config.accounting.resolve(&base);
        config.server.cert_path = config.server.cert_path.map(|p| resolve_path(&base, &p));
        config.server.key_path = config.server.key_path.map(|p| resolve_path(&base, &p));
        config
            .validate()
            .context("Server configuration validation failed")?;
        Ok(config)
    }

    fn parse_client(content: &str, path: &Path) -> anyhow::Result<ClientFullConfig> {
        let mut config: ClientFullConfig =
            toml::from_str(content).context("Failed to parse client configuration")?;
        let base = config_dir(path);
        config.accounting.resolve(&base);
        config.client.ca_cert_path = config.client.ca_cert_path.map(|p| resolve_path(&base, &p));
        if let Some(autoproxy) = config.autoproxy.as_mut() {
            autoproxy.custom = autoproxy.custom.as_ref().map(|p| resolve_path(&base, p));
        }
        config
            .validate()
            .context("Client configuration validation failed")?;
        Ok(config)
    }

    /// 从文件加载服务器配置
    pub fn load_server_config(path: &Path) -> anyhow::Result<ServerFullConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse_server(&content, path)
    }

    /// 从文件加载客户端配置
    pub fn load_client_config(path: &Path) -> anyhow::Result<ClientFullConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse_client(&content, path)
    }
}
