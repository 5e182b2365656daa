//! 客户端模式
//!
//! 客户端监听器的所有请求都经由上游代理链；配置了 `[autoproxy]` 时
//! 另开一个监听器，按域名路由表选择直连或上游代理

use crate::accounting::Accounting;
use crate::config::{AutoproxyConfig, ClientFullConfig};
use crate::dialer::{build_chain, DirectDialer, Leg, LegDialer, Upstream};
use crate::proxy::{serve, Outbound, ProxyService};
use crate::router::{Autoproxy, ListSource, RemoteListSource, RoutedDialer, UpstreamTls};
use crate::schedule::{Clock, SystemClock};
use crate::server::spawn_ctrl_c;
use crate::tls;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// 自动代理监听器
struct AutoproxyListener {
    listener: TcpListener,
    router: Arc<Autoproxy>,
    refresh_hour: u32,
}

/// 已绑定端口、尚未开始服务的客户端
pub struct Client {
    config: ClientFullConfig,
    listener: TcpListener,
    autoproxy: Option<AutoproxyListener>,
    chain: LegDialer,
    direct: LegDialer,
    accounting: Arc<Accounting>,
    clock: Arc<dyn Clock>,
}

/// 解析上游代理列表，显式配置的用户名和密码覆盖 URL 中的认证信息
pub fn upstreams(config: &ClientFullConfig) -> Result<Vec<Upstream>> {
    config
        .client
        .upstream
        .iter()
        .map(|url| {
            Upstream::parse(url)
                .map(|u| {
                    u.with_credentials(
                        config.client.username.clone(),
                        config.client.password.clone(),
                    )
                })
                .with_context(|| format!("Invalid upstream {}", url))
        })
        .collect()
}

async fn bind(addr: &str, port: u16) -> Result<TcpListener> {
    TcpListener::bind((addr, port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", addr, port))
}

impl Client {
    /// 加载计量状态、构建上游代理链并绑定监听端口
    pub async fn bind(config: ClientFullConfig) -> Result<Self> {
        let upstreams = upstreams(&config)?;
        let source: Option<Arc<dyn ListSource>> = match &config.autoproxy {
            Some(autoproxy) => Some(Arc::new(remote_source(
                autoproxy,
                upstreams.first(),
                &UpstreamTls {
                    skip_verify: config.client.skip_verify,
                    ca_cert_path: config.client.ca_cert_path.clone(),
                },
            )?)),
            None => None,
        };
        Self::bind_with_source(config, source, Arc::new(SystemClock)).await
    }

    /// 使用给定的域名列表来源（未配置 `[autoproxy]` 时忽略）
    pub async fn bind_with_source(
        config: ClientFullConfig,
        source: Option<Arc<dyn ListSource>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let client = &config.client;
        let upstreams = upstreams(&config)?;
        let connector = if upstreams.iter().any(Upstream::is_tls) {
            Some(tls::client_connector(
                client.ca_cert_path.as_deref(),
                client.skip_verify,
            )?)
        } else {
            None
        };

        let timeout = Duration::from_secs(client.connect_timeout_secs);
        let chain = LegDialer::new(
            Leg::Proxy,
            build_chain(&upstreams, timeout, connector.as_ref())?,
        );
        let direct = LegDialer::new(Leg::Direct, Arc::new(DirectDialer::new(timeout)));

        let listener = bind(&client.bind_addr, client.bind_port).await?;

        let autoproxy = match (&config.autoproxy, source) {
            (Some(autoproxy), Some(source)) => {
                let addr = autoproxy.bind_addr.as_deref().unwrap_or(&client.bind_addr);
                Some(AutoproxyListener {
                    listener: bind(addr, autoproxy.bind_port).await?,
                    router: Arc::new(Autoproxy::new(
                        source,
                        autoproxy.custom.clone(),
                        autoproxy.default_route,
                    )),
                    refresh_hour: autoproxy.refresh_hour,
                })
            }
            _ => None,
        };

        let accounting = Arc::new(Accounting::open(&config.accounting, clock.clone()));
        Ok(Self {
            config,
            listener,
            autoproxy,
            chain,
            direct,
            accounting,
            clock,
        })
    }

    /// 客户端监听地址
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// 自动代理监听地址
    pub fn autoproxy_addr(&self) -> Option<SocketAddr> {
        self.autoproxy
            .as_ref()
            .and_then(|a| a.listener.local_addr().ok())
    }

    pub fn router(&self) -> Option<&Arc<Autoproxy>> {
        self.autoproxy.as_ref().map(|a| &a.router)
    }

    pub fn accounting(&self) -> &Arc<Accounting> {
        &self.accounting
    }

    /// 服务直到 `cancel` 被触发，之后保存账本和状态
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let mut jobs = self.accounting.spawn_jobs(
            &self.config.accounting.secrets,
            &self.config.accounting.whitelist,
            cancel.clone(),
        );
        let gate = self.accounting.gate();

        let mut listeners = Vec::new();
        let service = Arc::new(ProxyService::new(
            gate.clone(),
            Outbound::Upstream(self.chain.clone()),
        ));
        listeners.push(tokio::spawn(serve(
            self.listener,
            service,
            None,
            self.accounting.listener("client"),
            cancel.clone(),
        )));

        if let Some(autoproxy) = self.autoproxy {
            jobs.extend(autoproxy.router.spawn_jobs(
                autoproxy.refresh_hour,
                self.clock.clone(),
                cancel.clone(),
            ));
            let routed = RoutedDialer::new(autoproxy.router, self.direct, self.chain);
            let service = Arc::new(ProxyService::new(gate, Outbound::Autoproxy(routed)));
            listeners.push(tokio::spawn(serve(
                autoproxy.listener,
                service,
                None,
                self.accounting.listener("autoproxy"),
                cancel.clone(),
            )));
        }

        let mut result = Ok(());
        for listener in listeners {
            match listener.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    result = Err(anyhow::Error::new(e).context("Client listener failed"));
                    cancel.cancel();
                }
                Err(e) => {
                    result = Err(anyhow::Error::new(e).context("Client listener panicked"));
                    cancel.cancel();
                }
            }
        }

        cancel.cancel();
        for job in jobs {
            let _ = job.await;
        }
        self.accounting.shutdown();
        result
    }
}

fn remote_source(
    config: &AutoproxyConfig,
    upstream: Option<&Upstream>,
    upstream_tls: &UpstreamTls,
) -> Result<RemoteListSource> {
    RemoteListSource::new(
        config.list_url.clone(),
        upstream,
        upstream_tls,
        Duration::from_secs(config.fetch_timeout_secs),
        config.fetch_retries,
    )
    .context("Failed to create autoproxy list source")
}

/// 运行客户端直到收到 Ctrl+C
pub async fn run_client(config: ClientFullConfig) -> Result<()> {
    info!(
        "Starting proxy client on {}:{} via {} upstream(s)",
        config.client.bind_addr,
        config.client.bind_port,
        config.client.upstream.len()
    );
    let client = Client::bind(config).await?;
    let cancel = CancellationToken::new();
    spawn_ctrl_c(cancel.clone());
    info!("Waiting for connections... (Press Ctrl+C to stop)");
    client.run(cancel).await?;
    info!("Client stopped gracefully");
    Ok(())
}
