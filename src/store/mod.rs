//! 账号与白名单存储
//!
//! 两种存储都从文本文件整体加载，文件变更时整体重建并原子替换，
//! 文件被删除时清空。
//!
//! 文件格式：`#` 之后为注释，空行忽略，每行 `<key> [limit-spec]`。
//! 重复的 key 只保留第一次出现的行，其余记录错误日志。

mod accounts;
mod whitelist;

pub use accounts::{Account, AccountStore};
pub use whitelist::{Allow, WhitelistEntry, WhitelistStore};

use crate::limit::{parse_limit, Limit};
use crate::watcher::{spawn_file_reloader, FileEvent};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// 可以从文件加载的存储
pub trait FileBacked: Send + Sync + 'static {
    /// 日志中使用的名称
    const KIND: &'static str;

    /// 解析文本并整体替换当前内容，返回加载的条目数
    fn load_str(&self, text: &str) -> usize;

    /// 清空
    fn clear(&self);
}

/// 一行有效内容：key 和可选的限额
pub(crate) struct Row<'a> {
    pub line: usize,
    pub key: &'a str,
    pub limit: Limit,
}

/// 按行解析，格式错误的行记录日志后跳过
pub(crate) fn parse_rows<'a>(kind: &str, text: &'a str) -> Vec<Row<'a>> {
    let mut rows = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let content = match raw.find('#') {
            Some(i) => &raw[..i],
            None => raw,
        };
        let fields: Vec<&str> = content.split_whitespace().collect();
        match fields.as_slice() {
            [] => continue,
            [key] => rows.push(Row {
                line,
                key,
                limit: Limit::unlimited(),
            }),
            [key, spec] => match parse_limit(spec) {
                Ok(limit) => rows.push(Row { line, key, limit }),
                Err(e) => error!("{} line {}: invalid limit {}: {}", kind, line, spec, e),
            },
            _ => error!("{} line {}: too many fields: {}", kind, line, content.trim()),
        }
    }
    rows
}

/// 从文件加载，读取失败时记录错误并保留当前内容
pub fn load_file<S: FileBacked>(store: &S, path: &Path) -> usize {
    match std::fs::read_to_string(path) {
        Ok(text) => {
            let n = store.load_str(&text);
            info!("Loaded {} {} from {}", n, S::KIND, path.display());
            n
        }
        Err(e) => {
            error!("Failed to load {} file {}: {}", S::KIND, path.display(), e);
            0
        }
    }
}

/// 加载文件并在文件变更时重新加载，直到 `cancel` 被触发
pub fn load_and_watch<S: FileBacked>(
    store: Arc<S>,
    path: &Path,
    cancel: CancellationToken,
) -> Option<JoinHandle<()>> {
    load_file(store.as_ref(), path);

    let watched: PathBuf = path.to_path_buf();
    let result = spawn_file_reloader(path, cancel, move |event| match event {
        FileEvent::Changed => {
            load_file(store.as_ref(), &watched);
        }
        FileEvent::Removed => {
            info!("{} file {} removed, clearing", S::KIND, watched.display());
            store.clear();
        }
    });

    match result {
        Ok(handle) => Some(handle),
        Err(e) => {
            error!("Failed to watch {} file {}: {:#}", S::KIND, path.display(), e);
            None
        }
    }
}
