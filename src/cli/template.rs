use anyhow::{bail, Context, Result};

pub const SERVER_TEMPLATE: &str = include_str!("../../templates/server.toml");
pub const CLIENT_TEMPLATE: &str = include_str!("../../templates/client.toml");

/// Generate configuration template
pub fn generate_config_template(template_type: &str, output: Option<&str>) -> Result<()> {
    let content = match template_type {
        "server" => SERVER_TEMPLATE,
        "client" => CLIENT_TEMPLATE,
        other => bail!("Unknown template type: {}", other),
    };

    if let Some(path) = output {
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config template to {}", path))?;
        println!(
            "Generated {} configuration template: {}",
            template_type, path
        );
    } else {
        println!("{}", content);
    }

    Ok(())
}
