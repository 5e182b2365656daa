//! 自动代理路由
//!
//! 根据远程域名列表和本地覆盖文件为每个目标选择直连或上游代理。
//! 远程列表每天刷新一次，内容未变化时不重建；覆盖文件变更时用上次的远程列表重建。

mod fetch;
mod table;

pub use fetch::{
    ListSource, RemoteListSource, UpstreamTls, DEFAULT_FETCH_RETRIES, DEFAULT_FETCH_TIMEOUT, DEFAULT_LIST_URL,
};
pub use table::{
    host_of, normalize_host, parse_overrides, parse_remote, HostMatcher, Overrides, RouteTable,
};

use crate::dialer::{DialError, Leg, LegDialer, TaggedStream};
use crate::error::Result;
use crate::schedule::{spawn_job, Clock, Schedule};
use crate::watcher::{spawn_file_reloader, FileEvent};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 默认在每天 12 点刷新远程列表
pub const DEFAULT_REFRESH_HOUR: u32 = 12;

/// 刷新结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Updated,
    Unchanged,
}

struct RouterState {
    table: Arc<RouteTable>,
    payload: Option<String>,
    overrides: Overrides,
}

/// 自动代理路由器
pub struct Autoproxy {
    source: Arc<dyn ListSource>,
    custom: Option<PathBuf>,
    default_leg: Leg,
    state: RwLock<RouterState>,
}

impl Autoproxy {
    pub fn new(source: Arc<dyn ListSource>, custom: Option<PathBuf>, default_leg: Leg) -> Self {
        let overrides = custom.as_deref().map(read_overrides).unwrap_or_default();
        let table = Arc::new(RouteTable::new(
            overrides.clone(),
            HostMatcher::new(),
            default_leg,
        ));
        Self {
            source,
            custom,
            default_leg,
            state: RwLock::new(RouterState {
                table,
                payload: None,
                overrides,
            }),
        }
    }

    /// 选择线路
    pub fn route(&self, host: &str) -> Leg {
        self.state.read().table.route(host)
    }

    /// 当前路由表
    pub fn table(&self) -> Arc<RouteTable> {
        self.state.read().table.clone()
    }

    /// 是否已成功加载过远程列表
    pub fn is_loaded(&self) -> bool {
        self.state.read().payload.is_some()
    }

    /// 获取远程列表并在内容变化时重建路由表
    ///
    /// 获取失败时保留当前路由表
    pub async fn refresh(&self) -> Result<RefreshOutcome> {
        let payload = self.source.fetch().await?;

        if self.state.read().payload.as_deref() == Some(payload.as_str()) {
            info!("autoproxy: no update available");
            return Ok(RefreshOutcome::Unchanged);
        }

        let remote = parse_remote(&payload);
        let mut state = self.state.write();
        info!(
            "autoproxy: loaded {} remote entries, {} overrides",
            remote.len(),
            state.overrides.len()
        );
        state.table = Arc::new(RouteTable::new(
            state.overrides.clone(),
            remote,
            self.default_leg,
        ));
        state.payload = Some(payload);
        Ok(RefreshOutcome::Updated)
    }

    /// 重新读取覆盖文件，文件不存在时清空覆盖规则
    pub fn reload_custom(&self) {
        let overrides = self
            .custom
            .as_deref()
            .map(read_overrides)
            .unwrap_or_default();
        self.apply_overrides(overrides);
    }

    fn apply_overrides(&self, overrides: Overrides) {
        let mut state = self.state.write();
        info!("autoproxy: {} overrides active", overrides.len());
        state.table = Arc::new(RouteTable::new(
            overrides.clone(),
            state.table.remote().clone(),
            self.default_leg,
        ));
        state.overrides = overrides;
    }

    /// 启动初次加载、每日刷新和覆盖文件监视
    pub fn spawn_jobs(
        self: &Arc<Self>,
        refresh_hour: u32,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let router = self.clone();
        let initial_cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            tokio::select! {
                _ = initial_cancel.cancelled() => {}
                result = router.refresh() => {
                    if let Err(e) = result {
                        error!("autoproxy: initial load failed: {}", e);
                    }
                }
            }
        }));

        let router = self.clone();
        handles.push(spawn_job(
            "autoproxy-refresh",
            Schedule::Daily {
                hour: refresh_hour,
                minute: 0,
            },
            clock,
            cancel.clone(),
            move || {
                let router = router.clone();
                async move {
                    if let Err(e) = router.refresh().await {
                        warn!("autoproxy: refresh failed, keeping current table: {}", e);
                    }
                }
            },
        ));

        if let Some(path) = &self.custom {
            let router = self.clone();
            match spawn_file_reloader(path, cancel, move |event| match event {
                FileEvent::Changed => router.reload_custom(),
                FileEvent::Removed => router.apply_overrides(Overrides::default()),
            }) {
                Ok(handle) => handles.push(handle),
                Err(e) => warn!("autoproxy: cannot watch {}: {:#}", path.display(), e),
            }
        }

        handles
    }
}

fn read_overrides(path: &Path) -> Overrides {
    match std::fs::read_to_string(path) {
        Ok(text) => parse_overrides(&text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Overrides::default(),
        Err(e) => {
            error!("autoproxy: failed to read {}: {}", path.display(), e);
            Overrides::default()
        }
    }
}

/// 按路由结果选择直连或上游代理拨号器
#[derive(Clone)]
pub struct RoutedDialer {
    router: Arc<Autoproxy>,
    direct: LegDialer,
    proxy: LegDialer,
}

impl RoutedDialer {
    pub fn new(router: Arc<Autoproxy>, direct: LegDialer, proxy: LegDialer) -> Self {
        Self {
            router,
            direct,
            proxy,
        }
    }

    pub fn route(&self, addr: &str) -> Leg {
        self.router.route(addr)
    }

    pub async fn dial(
        &self,
        cancel: &CancellationToken,
        addr: &str,
    ) -> std::result::Result<TaggedStream, DialError> {
        let leg = self.route(addr);
        debug!("[{}] {}", leg, addr);
        match leg {
            Leg::Direct => self.direct.dial_with_cancel(cancel, addr).await,
            Leg::Proxy => self.proxy.dial_with_cancel(cancel, addr).await,
        }
    }
}
