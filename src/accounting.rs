//! 账号、账本和状态文件的装配
//!
//! 服务器和客户端共用：加载并监视账号与白名单文件，从快照恢复账本，
//! 启动日切、快照保存和状态写入三个周期任务，退出时做最后一次保存。

use crate::config::AccountingConfig;
use crate::gate::AccessGate;
use crate::ledger::{self, Ledger};
use crate::schedule::{spawn_job, Clock, Schedule};
use crate::stats::{ListenerStatsTracker, StatsManager};
use crate::status::{self, StatusWriter};
use crate::store::{load_and_watch, AccountStore, WhitelistStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 状态文件写入间隔
pub const STATUS_INTERVAL: Duration = Duration::from_secs(60);

/// 运行期的计量状态
pub struct Accounting {
    accounts: Arc<AccountStore>,
    whitelist: Arc<WhitelistStore>,
    ledger: Arc<Ledger>,
    stats: StatsManager,
    status: StatusWriter,
    record: PathBuf,
    clock: Arc<dyn Clock>,
}

impl Accounting {
    /// 加载存储并恢复账本，不启动任何任务
    pub fn open(config: &AccountingConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        let accounts = Arc::new(AccountStore::new());
        let whitelist = Arc::new(WhitelistStore::new());
        let ledger = Arc::new(Ledger::new(now.date_naive()));
        let stats = StatsManager::new();

        restore_ledger(&config.record, &ledger, &clock);

        if let Err(e) = status::rotate(&config.status, config.keep) {
            warn!("Failed to rotate {}: {}", config.status.display(), e);
        }

        let status = StatusWriter::new(
            &config.status,
            now,
            ledger.clone(),
            accounts.clone(),
            whitelist.clone(),
            stats.clone(),
        );

        Self {
            accounts,
            whitelist,
            ledger,
            stats,
            status,
            record: config.record.clone(),
            clock,
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn accounts(&self) -> &Arc<AccountStore> {
        &self.accounts
    }

    pub fn whitelist(&self) -> &Arc<WhitelistStore> {
        &self.whitelist
    }

    /// 以当前存储和账本构造访问控制
    pub fn gate(&self) -> Arc<AccessGate> {
        Arc::new(AccessGate::new(
            self.accounts.clone(),
            self.whitelist.clone(),
            self.ledger.clone(),
        ))
    }

    /// 为一个监听器注册吞吐量统计
    pub fn listener(&self, name: &str) -> ListenerStatsTracker {
        self.stats.register_listener(name)
    }

    /// 保存账本快照，失败只记录日志
    pub fn save_record(&self) {
        if let Err(e) = ledger::save(
            &self.record,
            &self.ledger,
            &self.accounts,
            &self.whitelist,
            self.clock.now(),
        ) {
            error!("Failed to save usage record: {}", e);
        }
    }

    /// 写出状态文件，失败只记录日志
    pub fn write_status(&self) {
        if let Err(e) = self.status.write(self.clock.now()) {
            error!("Failed to write status: {}", e);
        }
    }

    /// 监视账号和白名单文件，并启动日切、快照和状态任务
    pub fn spawn_jobs(
        self: &Arc<Self>,
        secrets: &Path,
        whitelist: &Path,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        handles.extend(load_and_watch(self.accounts.clone(), secrets, cancel.clone()));
        handles.extend(load_and_watch(
            self.whitelist.clone(),
            whitelist,
            cancel.clone(),
        ));

        let this = self.clone();
        handles.push(spawn_job(
            "day-change",
            Schedule::MIDNIGHT,
            self.clock.clone(),
            cancel.clone(),
            move || {
                let this = this.clone();
                async move {
                    this.ledger.check_day_change(this.clock.now());
                }
            },
        ));

        let this = self.clone();
        handles.push(spawn_job(
            "save-record",
            Schedule::Hourly { minute: 0 },
            self.clock.clone(),
            cancel.clone(),
            move || {
                let this = this.clone();
                async move { this.save_record() }
            },
        ));

        // 启动时先写一次，之后每分钟更新
        self.write_status();
        let this = self.clone();
        handles.push(spawn_job(
            "write-status",
            Schedule::Every(STATUS_INTERVAL),
            self.clock.clone(),
            cancel,
            move || {
                let this = this.clone();
                async move { this.write_status() }
            },
        ));

        handles
    }

    /// 退出前最后一次保存
    pub fn shutdown(&self) {
        info!("Saving usage record and status before exit");
        self.save_record();
        self.write_status();
    }
}

fn restore_ledger(path: &Path, ledger: &Ledger, clock: &Arc<dyn Clock>) {
    if !path.exists() {
        info!("No usage record at {}, starting empty", path.display());
        return;
    }
    match ledger::restore(path, ledger, clock.now()) {
        Ok(n) => info!("Restored {} usage records from {}", n, path.display()),
        Err(e) => error!("Failed to restore usage record, starting empty: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Principal;
    use crate::schedule::SystemClock;
    use crate::store::FileBacked;

    fn config(dir: &Path) -> AccountingConfig {
        AccountingConfig {
            secrets: dir.join("secrets"),
            whitelist: dir.join("whitelist"),
            status: dir.join("status"),
            record: dir.join("database"),
            keep: 3,
        }
    }

    #[test]
    fn test_record_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());

        let first = Accounting::open(&config, Arc::new(SystemClock));
        first.accounts().load_str("alice:pw\n");
        first
            .ledger()
            .count(&Principal::Account("alice".into()), 1234);
        first.shutdown();
        assert!(config.record.exists());
        assert!(config.status.exists());

        let second = Accounting::open(&config, Arc::new(SystemClock));
        let usage = second
            .ledger()
            .usage(&Principal::Account("alice".into()))
            .unwrap();
        assert_eq!(usage.total, 1234);
        assert_eq!(usage.today, 1234);

        // 上次的状态文件已轮转
        assert!(!config.status.exists());
        assert!(dir.path().join("status.1").exists());
    }

    #[test]
    fn test_corrupt_record_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        std::fs::write(&config.record, b"not gzip").unwrap();

        let accounting = Accounting::open(&config, Arc::new(SystemClock));
        assert!(accounting.ledger().is_empty());
    }

    #[tokio::test]
    async fn test_jobs_load_stores() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        std::fs::write(&config.secrets, "alice:pw\nbob:pw\n").unwrap();
        std::fs::write(&config.whitelist, "127.0.0.1\n").unwrap();

        let accounting = Arc::new(Accounting::open(&config, Arc::new(SystemClock)));
        let cancel = CancellationToken::new();
        let handles = accounting.spawn_jobs(&config.secrets, &config.whitelist, cancel.clone());
        assert_eq!(accounting.accounts().len(), 2);
        assert_eq!(accounting.whitelist().len(), 1);
        assert!(config.status.exists());

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
