use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::client::upstreams;
use crate::config::{AppConfig, ClientFullConfig, ServerFullConfig};

/// 检查配置文件权限（仅Unix系统）
///
/// 客户端配置中可能含有上游代理的密码
#[cfg(unix)]
pub fn check_config_file_permissions(config_path: &str) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    use tracing::warn;

    let metadata = std::fs::metadata(config_path)
        .with_context(|| format!("Failed to read metadata for config file: {}", config_path))?;
    let mode = metadata.permissions().mode();

    if mode & 0o044 != 0 {
        warn!(
            "Config file '{}' is readable by group or others (permissions: {:o}), it may contain upstream credentials. Consider: chmod 600 {}",
            config_path,
            mode & 0o777,
            config_path
        );
    }

    Ok(())
}

/// Windows系统不进行权限检查
#[cfg(not(unix))]
pub fn check_config_file_permissions(_config_path: &str) -> Result<()> {
    Ok(())
}

#[derive(Serialize)]
struct CheckResult {
    valid: bool,
    config_type: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    details: serde_json::Value,
}

/// Expand path with tilde (~) and make it absolute
pub fn expand_path(path: &str) -> Result<String> {
    let expanded = shellexpand::tilde(path);
    let path_buf = PathBuf::from(expanded.as_ref());

    if path_buf.is_absolute() {
        Ok(expanded.into_owned())
    } else {
        std::env::current_dir()
            .context("Failed to get current directory")?
            .join(&path_buf)
            .to_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("Invalid path: {}", path))
    }
}

fn missing(path: &Path, what: &str, warnings: &mut Vec<String>) {
    if !path.exists() {
        warnings.push(format!("{} not found: {}", what, path.display()));
    }
}

fn server_details(config: &ServerFullConfig, warnings: &mut Vec<String>) -> serde_json::Value {
    let server = &config.server;
    let mut details = serde_json::json!({
        "bind_addr": server.bind_addr,
        "bind_port": server.bind_port,
        "https": server.https,
        "accounting": config.accounting,
    });
    if server.https {
        match (&server.cert_path, &server.key_path) {
            (Some(cert), Some(key)) => {
                details["cert_path"] = serde_json::json!(cert);
                details["key_path"] = serde_json::json!(key);
                missing(cert, "Certificate file", warnings);
                missing(key, "Key file", warnings);
            }
            _ => details["cert_mode"] = serde_json::json!("auto-generate"),
        }
    }
    missing(&config.accounting.secrets, "Secrets file", warnings);
    missing(&config.accounting.whitelist, "Whitelist file", warnings);
    details
}

fn client_details(
    config: &ClientFullConfig,
    warnings: &mut Vec<String>,
) -> Result<serde_json::Value> {
    let client = &config.client;
    let chain: Vec<String> = upstreams(config)?.iter().map(|u| u.display()).collect();
    let mut details = serde_json::json!({
        "bind_addr": client.bind_addr,
        "bind_port": client.bind_port,
        "upstream": chain,
        "skip_verify": client.skip_verify,
        "accounting": config.accounting,
    });
    if let Some(ca) = &client.ca_cert_path {
        details["ca_cert_path"] = serde_json::json!(ca);
        missing(ca, "CA certificate file", warnings);
    }
    if let Some(autoproxy) = &config.autoproxy {
        details["autoproxy"] = serde_json::json!(autoproxy);
        if let Some(custom) = &autoproxy.custom {
            missing(custom, "Autoproxy override file", warnings);
        }
    }
    if client.skip_verify {
        warnings.push("skip_verify is enabled".to_string());
    }
    Ok(details)
}

fn print_text(result: &CheckResult) {
    match &result.error {
        Some(error) => {
            println!("✗ Configuration validation failed!");
            println!("\nError details:");
            println!("{}", error);
        }
        None => {
            println!("✓ Configuration type: {}", result.config_type);
            if let serde_json::Value::Object(map) = &result.details {
                for (key, value) in map {
                    println!("✓ {}: {}", key, value);
                }
            }
            for warning in &result.warnings {
                println!("⚠ Warning: {}", warning);
            }
            println!("\n✓ {} configuration is valid!", result.config_type);
        }
    }
}

fn inspect(path: &Path) -> CheckResult {
    let mut warnings = Vec::new();
    let checked = AppConfig::from_file(path).and_then(|config| {
        let details = match &config {
            AppConfig::Server(server) => server_details(server, &mut warnings),
            AppConfig::Client(client) => client_details(client, &mut warnings)?,
        };
        Ok((config.kind().to_string(), details))
    });

    match checked {
        Ok((config_type, details)) => CheckResult {
            valid: true,
            config_type,
            warnings,
            error: None,
            details,
        },
        Err(e) => CheckResult {
            valid: false,
            config_type: std::fs::read_to_string(path)
                .ok()
                .and_then(|content| AppConfig::detect(&content).ok())
                .map(|kind| kind.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            warnings,
            error: Some(format!("{:#}", e)),
            details: serde_json::json!({}),
        },
    }
}

/// Check configuration file format
pub fn check_config(config_path: &str, format: &str) -> Result<()> {
    let path = Path::new(config_path);
    if format == "text" {
        println!("Checking configuration file: {}\n", config_path);
    }

    let result = inspect(path);
    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_text(&result);
    }

    match result.error {
        Some(error) => anyhow::bail!("Invalid configuration {}: {}", config_path, error),
        None => Ok(()),
    }
}
