use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "meter-proxy")]
#[command(author, version, about = "Metered HTTP(S) forward proxy", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 日志级别 (trace, debug, info, warn, error)，RUST_LOG 优先
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 运行服务器模式
    Server {
        /// 配置文件路径
        #[arg(short, long, default_value = "server.toml")]
        config: String,
    },
    /// 运行客户端模式
    Client {
        /// 配置文件路径
        #[arg(short, long, default_value = "client.toml")]
        config: String,
    },
    /// 检查配置文件
    Check {
        /// 配置文件路径
        #[arg(short, long)]
        config: String,

        /// 输出格式
        #[arg(short, long, default_value = "text", value_parser = ["text", "json"])]
        format: String,
    },
    /// 生成配置模板
    Template {
        /// 模板类型
        #[arg(value_parser = ["server", "client"])]
        template_type: String,

        /// 输出文件路径（默认打印到标准输出）
        #[arg(short, long)]
        output: Option<String>,
    },
    /// 生成自签名证书
    Cert {
        /// 证书输出路径
        #[arg(long, default_value = "cert.pem")]
        cert_out: String,

        /// 私钥输出路径
        #[arg(long, default_value = "key.pem")]
        key_out: String,

        /// 证书的 Common Name
        #[arg(long, default_value = "localhost")]
        common_name: String,

        /// 证书的 SubjectAltName（用逗号分隔多个）
        #[arg(long, value_delimiter = ',', value_name = "DNS,...")]
        alt_names: Vec<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_server() {
        let cli = Cli::try_parse_from(["meter-proxy", "server", "-c", "/etc/proxy.toml"]).unwrap();
        assert_eq!(cli.log_level, "info");
        match cli.command {
            Commands::Server { config } => assert_eq!(config, "/etc/proxy.toml"),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_check_json() {
        let cli = Cli::try_parse_from([
            "meter-proxy",
            "--log-level",
            "debug",
            "check",
            "-c",
            "client.toml",
            "--format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.log_level, "debug");
        assert!(matches!(cli.command, Commands::Check { ref format, .. } if format == "json"));
        assert!(Cli::try_parse_from(["meter-proxy", "check", "-c", "x", "--format", "xml"]).is_err());
    }

    #[test]
    fn test_parse_cert_alt_names() {
        let cli = Cli::try_parse_from([
            "meter-proxy",
            "cert",
            "--alt-names",
            "a.example,b.example",
        ])
        .unwrap();
        match cli.command {
            Commands::Cert {
                alt_names,
                common_name,
                ..
            } => {
                assert_eq!(alt_names, vec!["a.example", "b.example"]);
                assert_eq!(common_name, "localhost");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
