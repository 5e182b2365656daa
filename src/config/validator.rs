use anyhow::{bail, Result};
use std::collections::HashSet;
use std::net::IpAddr;
use tracing::warn;

use super::{AccountingConfig, AutoproxyConfig, ClientConfig, ClientFullConfig, ServerConfig};
use crate::dialer::Upstream;

/// 配置验证器 - 负责所有配置验证逻辑
pub struct ConfigValidator;

impl ConfigValidator {
    /// 验证端口号
    pub fn validate_port(port: u16, context: &str) -> Result<()> {
        if port == 0 {
            bail!("{}: port cannot be 0", context);
        }
        Ok(())
    }

    /// 验证监听地址：不能为空，且必须是 IP 地址或 `localhost`
    pub fn validate_address(addr: &str, context: &str) -> Result<()> {
        let addr = addr.trim();
        if addr.is_empty() {
            bail!("{}: address cannot be empty", context);
        }
        if addr != "localhost" && addr.parse::<IpAddr>().is_err() {
            bail!("{}: '{}' is not an IP address", context, addr);
        }
        Ok(())
    }

    /// 验证超时时间
    pub fn validate_timeout(secs: u64, context: &str) -> Result<()> {
        if secs == 0 {
            bail!("{}: timeout must be greater than 0", context);
        }
        Ok(())
    }

    /// 验证服务器配置
    pub fn validate_server_config(config: &ServerConfig) -> Result<()> {
        Self::validate_address(&config.bind_addr, "Server bind_addr")?;
        Self::validate_port(config.bind_port, "Server bind_port")?;
        Self::validate_timeout(config.connect_timeout_secs, "Server connect_timeout_secs")?;

        match (&config.cert_path, &config.key_path) {
            (Some(_), Some(_)) | (None, None) => {}
            _ => bail!("cert_path and key_path must both be set, or both omitted to auto-generate"),
        }

        if !config.https && config.cert_path.is_some() {
            warn!("cert_path/key_path are ignored because https is disabled");
        }

        Ok(())
    }

    /// 验证客户端配置
    pub fn validate_client_config(config: &ClientConfig) -> Result<()> {
        Self::validate_address(&config.bind_addr, "Client bind_addr")?;
        Self::validate_port(config.bind_port, "Client bind_port")?;
        Self::validate_timeout(config.connect_timeout_secs, "Client connect_timeout_secs")?;

        if config.upstream.is_empty() {
            bail!("Client upstream cannot be empty");
        }
        for upstream in &config.upstream {
            Upstream::parse(upstream)?;
        }

        if config.skip_verify {
            warn!("skip_verify is enabled: upstream certificates will not be verified");
        }
        Ok(())
    }

    /// 验证自动代理配置
    pub fn validate_autoproxy_config(config: &AutoproxyConfig) -> Result<()> {
        if let Some(addr) = &config.bind_addr {
            Self::validate_address(addr, "Autoproxy bind_addr")?;
        }
        Self::validate_port(config.bind_port, "Autoproxy bind_port")?;
        Self::validate_timeout(config.fetch_timeout_secs, "Autoproxy fetch_timeout_secs")?;

        if config.refresh_hour > 23 {
            bail!(
                "Autoproxy refresh_hour must be between 0 and 23 (got {})",
                config.refresh_hour
            );
        }
        if config.fetch_retries == 0 {
            bail!("Autoproxy fetch_retries must be greater than 0");
        }

        let url = url::Url::parse(&config.list_url)
            .map_err(|e| anyhow::anyhow!("Autoproxy list_url '{}': {}", config.list_url, e))?;
        if !matches!(url.scheme(), "http" | "https") {
            bail!("Autoproxy list_url must be http or https: {}", config.list_url);
        }
        Ok(())
    }

    /// 验证账号和记录配置
    pub fn validate_accounting_config(config: &AccountingConfig) -> Result<()> {
        let mut seen = HashSet::new();
        for (name, path) in [
            ("secrets", &config.secrets),
            ("whitelist", &config.whitelist),
            ("status", &config.status),
            ("record", &config.record),
        ] {
            if path.as_os_str().is_empty() {
                bail!("accounting.{} cannot be empty", name);
            }
            if !seen.insert(path) {
                bail!(
                    "accounting.{} uses the same file as another entry: {}",
                    name,
                    path.display()
                );
            }
        }
        Ok(())
    }

    /// 验证客户端完整配置
    pub fn validate_client_full_config(config: &ClientFullConfig) -> Result<()> {
        Self::validate_client_config(&config.client)?;
        Self::validate_accounting_config(&config.accounting)?;

        if let Some(autoproxy) = &config.autoproxy {
            Self::validate_autoproxy_config(autoproxy)?;
            let bind_addr = autoproxy
                .bind_addr
                .as_deref()
                .unwrap_or(&config.client.bind_addr);
            if autoproxy.bind_port == config.client.bind_port
                && bind_addr == config.client.bind_addr
            {
                bail!(
                    "Autoproxy listener {}:{} conflicts with the client listener",
                    bind_addr,
                    autoproxy.bind_port
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialer::Leg;
    use std::path::PathBuf;

    fn client(upstream: &[&str]) -> ClientConfig {
        ClientConfig {
            bind_addr: "127.0.0.1".to_string(),
            bind_port: 8888,
            upstream: upstream.iter().map(|s| s.to_string()).collect(),
            username: None,
            password: None,
            skip_verify: false,
            ca_cert_path: None,
            connect_timeout_secs: 15,
        }
    }

    fn autoproxy(port: u16) -> AutoproxyConfig {
        AutoproxyConfig {
            bind_addr: None,
            bind_port: port,
            list_url: "https://example.com/list.txt".to_string(),
            custom: None,
            refresh_hour: 12,
            fetch_timeout_secs: 60,
            fetch_retries: 3,
            default_route: Leg::Proxy,
        }
    }

    #[test]
    fn test_validate_port_and_address() {
        assert!(ConfigValidator::validate_port(0, "test").is_err());
        assert!(ConfigValidator::validate_port(8000, "test").is_ok());
        assert!(ConfigValidator::validate_address("", "test").is_err());
        assert!(ConfigValidator::validate_address("0.0.0.0", "test").is_ok());
        assert!(ConfigValidator::validate_address("::", "test").is_ok());
        assert!(ConfigValidator::validate_address("localhost", "test").is_ok());
        assert!(ConfigValidator::validate_address("example.com", "test").is_err());
    }

    #[test]
    fn test_server_cert_pairing() {
        let mut config = ServerConfig::builder().https(true).build().unwrap();
        config.cert_path = Some(PathBuf::from("/cert.pem"));
        assert!(ConfigValidator::validate_server_config(&config).is_err());
        config.key_path = Some(PathBuf::from("/key.pem"));
        assert!(ConfigValidator::validate_server_config(&config).is_ok());
    }

    #[test]
    fn test_client_upstreams() {
        assert!(ConfigValidator::validate_client_config(&client(&[])).is_err());
        assert!(ConfigValidator::validate_client_config(&client(&["socks5://a:1080"])).is_err());
        assert!(ConfigValidator::validate_client_config(&client(&[
            "http://a:3128",
            "https://u:p@b:443"
        ]))
        .is_ok());
    }

    #[test]
    fn test_autoproxy_checks() {
        assert!(ConfigValidator::validate_autoproxy_config(&autoproxy(8889)).is_ok());

        let mut bad = autoproxy(8889);
        bad.refresh_hour = 24;
        assert!(ConfigValidator::validate_autoproxy_config(&bad).is_err());

        let mut bad = autoproxy(8889);
        bad.list_url = "ftp://example.com/list".to_string();
        assert!(ConfigValidator::validate_autoproxy_config(&bad).is_err());

        let full = ClientFullConfig {
            client: client(&["http://a:3128"]),
            accounting: AccountingConfig::default(),
            autoproxy: Some(autoproxy(8888)),
        };
        assert!(ConfigValidator::validate_client_full_config(&full).is_err());
    }

    #[test]
    fn test_accounting_distinct_files() {
        let mut config = AccountingConfig::default();
        assert!(ConfigValidator::validate_accounting_config(&config).is_ok());
        config.status = config.record.clone();
        assert!(ConfigValidator::validate_accounting_config(&config).is_err());
    }
}
