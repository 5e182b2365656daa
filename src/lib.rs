/// Meter Proxy 库入口
///
/// 将核心模块导出为库，方便测试和复用
pub mod accounting;
pub mod cli;
pub mod client;
pub mod config;
pub mod dialer;
pub mod error;
pub mod gate;
pub mod ledger;
pub mod limit;
pub mod protocol;
pub mod proxy;
pub mod rate_limiter;
pub mod router;
pub mod schedule;
pub mod server;
pub mod stats;
pub mod status;
pub mod store;
pub mod tls;
pub mod watcher;

// 重新导出常用类型
pub use accounting::Accounting;
pub use client::{run_client, Client};
pub use config::{AppConfig, ClientFullConfig, ServerFullConfig};
pub use error::{ProxyError, Result};
pub use gate::{AccessGate, Denial, Grant};
pub use ledger::{Ledger, Principal};
pub use limit::Limit;
pub use rate_limiter::SpeedLimiter;
pub use server::{run_server, Server};
