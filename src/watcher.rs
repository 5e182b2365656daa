/// 文件监视
///
/// 监视文件所在目录（编辑器常用"写临时文件再改名"的方式保存），
/// 按文件名过滤事件，去抖后向调用方报告"已变更"或"已删除"
use anyhow::{Context, Result};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const DEBOUNCE: Duration = Duration::from_millis(200);

/// 文件事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEvent {
    /// 文件被创建或修改
    Changed,
    /// 文件被删除或移走
    Removed,
}

/// 文件监视器，drop 后停止监视
pub struct FileWatcher {
    _watcher: RecommendedWatcher,
    path: PathBuf,
}

impl FileWatcher {
    /// 开始监视 `path`，事件通过返回的通道送出
    pub fn watch(path: &Path) -> Result<(Self, mpsc::UnboundedReceiver<FileEvent>)> {
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .context("Failed to resolve current directory")?
                .join(path)
        };
        let watch_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let file_name = path.file_name().map(|f| f.to_owned());

        let (tx, rx) = mpsc::unbounded_channel();
        let target = path.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let ours = event
                    .paths
                    .iter()
                    .any(|p| p.file_name() == file_name.as_deref());
                if !ours || event.kind.is_access() {
                    return;
                }
                let kind = if target.exists() {
                    FileEvent::Changed
                } else {
                    FileEvent::Removed
                };
                let _ = tx.send(kind);
            }
            Err(e) => warn!("File watch error for {}: {}", target.display(), e),
        })
        .context("Failed to create file watcher")?;

        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch directory {}", watch_dir.display()))?;

        debug!("Watching {} for changes", path.display());
        Ok((
            Self {
                _watcher: watcher,
                path,
            },
            rx,
        ))
    }

    /// 被监视的文件
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// 监视文件并在事件到来时调用 `on_event`，直到 `cancel` 被触发
///
/// 一次保存通常产生多个事件，去抖窗口内只回调最后一个
pub fn spawn_file_reloader<F>(
    path: &Path,
    cancel: CancellationToken,
    mut on_event: F,
) -> Result<tokio::task::JoinHandle<()>>
where
    F: FnMut(FileEvent) + Send + 'static,
{
    let (watcher, mut rx) = FileWatcher::watch(path)?;

    Ok(tokio::spawn(async move {
        loop {
            let mut event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            while let Ok(Some(next)) = tokio::time::timeout(DEBOUNCE, rx.recv()).await {
                event = next;
            }

            debug!("{} {:?}", watcher.path().display(), event);
            on_event(event);
        }
        // 任务结束前一直持有监视器
        drop(watcher);
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    async fn wait_for(events: &Arc<Mutex<Vec<FileEvent>>>, want: FileEvent) -> bool {
        for _ in 0..50 {
            if events.lock().unwrap().last() == Some(&want) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_reloader_reports_change_and_removal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets");
        std::fs::write(&path, "alice:pw\n").unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let cancel = CancellationToken::new();
        let handle = spawn_file_reloader(&path, cancel.clone(), move |e| {
            sink.lock().unwrap().push(e);
        })
        .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::write(&path, "alice:pw\nbob:pw\n").unwrap();
        assert!(wait_for(&events, FileEvent::Changed).await);

        std::fs::remove_file(&path).unwrap();
        assert!(wait_for(&events, FileEvent::Removed).await);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_other_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("whitelist");
        std::fs::write(&path, "").unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let cancel = CancellationToken::new();
        let _handle = spawn_file_reloader(&path, cancel.clone(), move |e| {
            sink.lock().unwrap().push(e);
        })
        .unwrap();

        std::fs::write(dir.path().join("unrelated"), "x").unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(events.lock().unwrap().is_empty());
        cancel.cancel();
    }
}
