//! 服务器模式
//!
//! 单个监听器，授权后直接连接目标；可选以 HTTPS 提供代理服务

use crate::accounting::Accounting;
use crate::config::ServerFullConfig;
use crate::dialer::{DirectDialer, Leg, LegDialer};
use crate::proxy::{serve, Outbound, ProxyService};
use crate::schedule::{Clock, SystemClock};
use crate::tls;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 已绑定端口、尚未开始服务的代理服务器
pub struct Server {
    config: ServerFullConfig,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    accounting: Arc<Accounting>,
}

impl Server {
    /// 加载计量状态并绑定监听端口
    pub async fn bind(config: ServerFullConfig) -> Result<Self> {
        Self::bind_with_clock(config, Arc::new(SystemClock)).await
    }

    pub async fn bind_with_clock(config: ServerFullConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let server = &config.server;
        let tls = if server.https {
            // 使用绑定地址作为 CN（若为 0.0.0.0 则回退 localhost）
            let cn = match server.bind_addr.as_str() {
                "0.0.0.0" | "::" => "localhost",
                addr => addr,
            };
            Some(tls::server_acceptor(
                server.cert_path.as_deref(),
                server.key_path.as_deref(),
                cn,
            )?)
        } else {
            None
        };

        let listener = TcpListener::bind((server.bind_addr.as_str(), server.bind_port))
            .await
            .with_context(|| {
                format!("Failed to bind {}:{}", server.bind_addr, server.bind_port)
            })?;

        let accounting = Arc::new(Accounting::open(&config.accounting, clock));
        Ok(Self {
            config,
            listener,
            tls,
            accounting,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn accounting(&self) -> &Arc<Accounting> {
        &self.accounting
    }

    /// 服务直到 `cancel` 被触发，之后保存账本和状态
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let jobs = self.accounting.spawn_jobs(
            &self.config.accounting.secrets,
            &self.config.accounting.whitelist,
            cancel.clone(),
        );

        let timeout = Duration::from_secs(self.config.server.connect_timeout_secs);
        let outbound = Outbound::Origin(LegDialer::new(
            Leg::Direct,
            Arc::new(DirectDialer::new(timeout)),
        ));
        let service = Arc::new(ProxyService::new(self.accounting.gate(), outbound));
        let stats = self.accounting.listener("server");

        let result = serve(self.listener, service, self.tls, stats, cancel.clone()).await;

        cancel.cancel();
        for job in jobs {
            let _ = job.await;
        }
        self.accounting.shutdown();
        result.context("Server listener failed")
    }
}

/// 运行服务器直到收到 Ctrl+C
pub async fn run_server(config: ServerFullConfig) -> Result<()> {
    info!(
        "Starting proxy server on {}:{}{}",
        config.server.bind_addr,
        config.server.bind_port,
        if config.server.https { " (https)" } else { "" }
    );
    let server = Server::bind(config).await?;
    let cancel = CancellationToken::new();
    spawn_ctrl_c(cancel.clone());
    info!("Waiting for connections... (Press Ctrl+C to stop)");
    server.run(cancel).await?;
    info!("Server stopped gracefully");
    Ok(())
}

/// Ctrl+C 时触发 `cancel`
pub(crate) fn spawn_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal, stopping...");
                cancel.cancel();
            }
            Err(e) => warn!("Failed to listen for Ctrl+C: {}", e),
        }
    });
}
