//! 流量账本
//!
//! 每个身份一条记录，包含今日、本月、累计三个计数器。
//! 记录在第一次产生流量时创建，进程存活期间不会删除；
//! 匿名访问没有身份，不记账。

mod snapshot;

pub use snapshot::{restore, save};

use crate::limit::Limit;
use chrono::{DateTime, Datelike, Local, NaiveDate};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::AsyncWrite;
use tracing::info;

/// 连接归属的身份
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Principal {
    /// 未配置账号和白名单时的匿名访问
    Anonymous,
    /// 白名单条目（原文）
    Whitelist(String),
    /// 账号（用户名）
    Account(String),
}

impl Principal {
    /// 账本中的名称，白名单条目不带 `[w]` 后缀
    pub fn name(&self) -> &str {
        match self {
            Principal::Anonymous => "",
            Principal::Whitelist(entry) => entry,
            Principal::Account(user) => user,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Principal::Anonymous)
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Principal::Anonymous => write!(f, "anonymous"),
            Principal::Whitelist(entry) => write!(f, "{}[w]", entry),
            Principal::Account(user) => write!(f, "{}", user),
        }
    }
}

/// 单个身份的用量计数器
#[derive(Debug, Default)]
pub struct UsageRecord {
    today: AtomicI64,
    monthly: AtomicI64,
    total: AtomicI64,
}

impl UsageRecord {
    fn with_values(today: i64, monthly: i64, total: i64) -> Self {
        Self {
            today: AtomicI64::new(today),
            monthly: AtomicI64::new(monthly),
            total: AtomicI64::new(total),
        }
    }

    /// 三个计数器同时增加
    pub fn add(&self, n: i64) {
        self.today.fetch_add(n, Ordering::Relaxed);
        self.monthly.fetch_add(n, Ordering::Relaxed);
        self.total.fetch_add(n, Ordering::Relaxed);
    }

    pub fn usage(&self) -> Usage {
        Usage {
            today: self.today.load(Ordering::Relaxed),
            monthly: self.monthly.load(Ordering::Relaxed),
            total: self.total.load(Ordering::Relaxed),
        }
    }
}

/// 用量快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub today: i64,
    pub monthly: i64,
    pub total: i64,
}

/// 流量账本
#[derive(Debug)]
pub struct Ledger {
    records: DashMap<Principal, Arc<UsageRecord>>,
    last_check: Mutex<NaiveDate>,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new(Local::now().date_naive())
    }
}

impl Ledger {
    /// 创建账本，`today` 为日切检查的起始日期
    pub fn new(today: NaiveDate) -> Self {
        Self {
            records: DashMap::new(),
            last_check: Mutex::new(today),
        }
    }

    fn record(&self, principal: &Principal) -> Option<Arc<UsageRecord>> {
        if principal.is_anonymous() {
            return None;
        }
        if let Some(record) = self.records.get(principal) {
            return Some(record.clone());
        }
        Some(
            self.records
                .entry(principal.clone())
                .or_default()
                .value()
                .clone(),
        )
    }

    /// 记录 `n` 字节
    pub fn count(&self, principal: &Principal, n: u64) {
        if let Some(record) = self.record(principal) {
            record.add(n as i64);
        }
    }

    /// 以给定的值写入一条记录（恢复快照时使用）
    pub fn store(&self, principal: Principal, today: i64, monthly: i64, total: i64) {
        if principal.is_anonymous() {
            return;
        }
        self.records.insert(
            principal,
            Arc::new(UsageRecord::with_values(today, monthly, total)),
        );
    }

    /// 查询用量
    pub fn usage(&self, principal: &Principal) -> Option<Usage> {
        self.records.get(principal).map(|r| r.usage())
    }

    /// 判断身份是否超出限额，没有记录视为未超出
    pub fn is_exceeded(&self, principal: &Principal, limit: &Limit) -> bool {
        if !limit.is_metered() {
            return false;
        }
        match self.usage(principal) {
            Some(usage) => limit.is_exceeded(usage.today, usage.monthly),
            None => false,
        }
    }

    /// 包装写入器，成功写出的字节计入该身份
    pub fn writer<W>(&self, principal: &Principal, inner: W) -> CountingWriter<W> {
        CountingWriter {
            inner,
            record: self.record(principal),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// 日切检查
    ///
    /// 日期变化时清零所有今日用量；新日期为 1 号或月份变化时同时清零本月用量。
    /// 返回是否发生了日切
    pub fn check_day_change(&self, now: DateTime<Local>) -> bool {
        let date = now.date_naive();
        let mut last = self.last_check.lock();
        if *last == date {
            return false;
        }

        let new_month =
            date.day() == 1 || date.month() != last.month() || date.year() != last.year();
        for entry in self.records.iter() {
            entry.today.store(0, Ordering::Relaxed);
            if new_month {
                entry.monthly.store(0, Ordering::Relaxed);
            }
        }
        info!(
            "Day changed {} -> {}, reset {} records{}",
            *last,
            date,
            self.records.len(),
            if new_month { " (monthly included)" } else { "" }
        );
        *last = date;
        true
    }
}

/// 计数写入器
pub struct CountingWriter<W> {
    inner: W,
    record: Option<Arc<UsageRecord>>,
}

impl<W> CountingWriter<W> {
    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for CountingWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let res = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let (Poll::Ready(Ok(n)), Some(record)) = (&res, &this.record) {
            record.add(*n as i64);
        }
        res
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
