/// 状态文件
///
/// 每分钟写出一次运行状态：启动时间、最后更新时间、入站吞吐量和各身份的用量表。
/// 启动时把上次的状态文件依次后移为 `status.1`、`status.2`……，超出保留数量的删除
use crate::error::{ProxyError, Result};
use crate::ledger::{Ledger, Principal, Usage};
use crate::limit::format_bytes;
use crate::stats::StatsManager;
use crate::store::{AccountStore, WhitelistStore};
use chrono::{DateTime, Local};
use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn numbered(path: &Path, n: usize) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{}", n));
    PathBuf::from(name)
}

/// 轮转状态文件
///
/// `path` 移到 `path.1`，已有的编号文件依次后移直到第一个空位；
/// 编号 `keep` 之内没有空位时删除最旧的 `path.keep`
pub fn rotate(path: &Path, keep: usize) -> io::Result<()> {
    if !path.exists() {
        return Ok(());
    }
    if keep == 0 {
        return std::fs::remove_file(path);
    }

    let gap = (1..=keep).find(|&n| !numbered(path, n).exists());
    let last = match gap {
        Some(n) => n,
        None => {
            std::fs::remove_file(numbered(path, keep))?;
            keep
        }
    };

    for n in (1..last).rev() {
        std::fs::rename(numbered(path, n), numbered(path, n + 1))?;
    }
    std::fs::rename(path, numbered(path, 1))
}

/// 状态写入器
pub struct StatusWriter {
    path: PathBuf,
    started: DateTime<Local>,
    ledger: Arc<Ledger>,
    accounts: Arc<AccountStore>,
    whitelist: Arc<WhitelistStore>,
    stats: StatsManager,
}

impl StatusWriter {
    pub fn new(
        path: impl Into<PathBuf>,
        started: DateTime<Local>,
        ledger: Arc<Ledger>,
        accounts: Arc<AccountStore>,
        whitelist: Arc<WhitelistStore>,
        stats: StatsManager,
    ) -> Self {
        Self {
            path: path.into(),
            started,
            ledger,
            accounts,
            whitelist,
            stats,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 收集当前账号和白名单条目的用量，按 (今日, 本月, 总计) 降序
    fn usages(&self) -> Vec<(String, Usage)> {
        let mut rows = Vec::new();
        self.accounts.range(|account| {
            let principal = Principal::Account(account.username.clone());
            if let Some(usage) = self.ledger.usage(&principal) {
                rows.push((principal.to_string(), usage));
            }
        });
        self.whitelist.range(|entry| {
            let principal = Principal::Whitelist(entry.text.clone());
            if let Some(usage) = self.ledger.usage(&principal) {
                rows.push((principal.to_string(), usage));
            }
        });
        rows.sort_by(|(_, a), (_, b)| {
            (b.today, b.monthly, b.total).cmp(&(a.today, a.monthly, a.total))
        });
        rows
    }

    /// 生成状态文本
    pub fn render(&self, now: DateTime<Local>) -> String {
        let throughput = self.stats.aggregate();
        let mut out = String::new();
        let _ = writeln!(out, "Start Time: {}", self.started.format(TIME_FORMAT));
        let _ = writeln!(out, "Last Update: {}", now.format(TIME_FORMAT));
        let _ = writeln!(out);
        let _ = writeln!(out, "Throughput:");
        let _ = writeln!(
            out,
            "Send: {}   Receive: {}",
            format_bytes(throughput.bytes_sent),
            format_bytes(throughput.bytes_received)
        );
        let _ = writeln!(out);

        let rows: Vec<[String; 4]> = self
            .usages()
            .into_iter()
            .map(|(name, u)| {
                [
                    name,
                    format_bytes(u.today.max(0) as u64),
                    format_bytes(u.monthly.max(0) as u64),
                    format_bytes(u.total.max(0) as u64),
                ]
            })
            .collect();

        let mut widths = [4, 5, 7];
        for row in &rows {
            for (width, cell) in widths.iter_mut().zip(row.iter()) {
                *width = (*width).max(cell.len());
            }
        }

        let _ = writeln!(
            out,
            "{:<w0$}   {:<w1$}   {:<w2$}   total",
            "user",
            "today",
            "monthly",
            w0 = widths[0],
            w1 = widths[1],
            w2 = widths[2]
        );
        for [name, today, monthly, total] in &rows {
            let _ = writeln!(
                out,
                "{:<w0$}   {:<w1$}   {:<w2$}   {}",
                name,
                today,
                monthly,
                total,
                w0 = widths[0],
                w1 = widths[1],
                w2 = widths[2]
            );
        }
        out
    }

    /// 写出状态文件，先做日切检查
    pub fn write(&self, now: DateTime<Local>) -> Result<()> {
        self.ledger.check_day_change(now);
        std::fs::write(&self.path, self.render(now)).map_err(|e| {
            ProxyError::PersistenceError(format!("{}: {}", self.path.display(), e))
        })?;
        debug!("Status written to {}", self.path.display());
        Ok(())
    }
}
