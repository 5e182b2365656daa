use anyhow::Result;
use std::path::Path;
use tracing::info;

use crate::{client, config::AppConfig, server};

use super::cert;
use super::config::{check_config, check_config_file_permissions, expand_path};
use super::template;

/// Execute CLI commands
pub async fn execute_command(cli: &super::Cli) -> Result<()> {
    use super::Commands;

    match &cli.command {
        Commands::Check { config, format } => {
            let config_path = expand_path(config)?;
            check_config(&config_path, format)?;
        }
        Commands::Template {
            template_type,
            output,
        } => {
            template::generate_config_template(template_type, output.as_deref())?;
        }
        Commands::Cert {
            cert_out,
            key_out,
            common_name,
            alt_names,
        } => {
            cert::generate_certificate(cert_out, key_out, common_name, alt_names)?;
        }
        Commands::Server { config } => {
            run_server(config).await?;
        }
        Commands::Client { config } => {
            run_client(config).await?;
        }
    }

    Ok(())
}

/// Run proxy server
async fn run_server(config: &str) -> Result<()> {
    let config_path = expand_path(config)?;
    check_config_file_permissions(&config_path)?;

    info!("Loading server configuration from: {}", config_path);
    let server_config = AppConfig::load_server_config(Path::new(&config_path))?;

    server::run_server(server_config).await
}

/// Run proxy client
async fn run_client(config: &str) -> Result<()> {
    let config_path = expand_path(config)?;
    check_config_file_permissions(&config_path)?;

    info!("Loading client configuration from: {}", config_path);
    let client_config = AppConfig::load_client_config(Path::new(&config_path))?;

    client::run_client(client_config).await
}
