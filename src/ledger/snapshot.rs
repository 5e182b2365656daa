//! 账本快照
//!
//! gzip 压缩的文本文件：第一行是 RFC3339（纳秒）时间戳，
//! 其后每行 `identity:today:monthly:total`，白名单身份带 `[w]` 后缀。

use super::{Ledger, Principal};
use crate::error::{ProxyError, Result};
use crate::store::{AccountStore, WhitelistStore};
use chrono::{DateTime, Datelike, FixedOffset, Local, SecondsFormat, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use tracing::{debug, error};

const WHITELIST_SUFFIX: &str = "[w]";

fn persistence_error(path: &Path, e: impl std::fmt::Display) -> ProxyError {
    ProxyError::PersistenceError(format!("{}: {}", path.display(), e))
}

/// 保存快照
///
/// 只写出当前账号和白名单中存在的身份；先写同目录下的临时文件再改名
pub fn save(
    path: &Path,
    ledger: &Ledger,
    accounts: &AccountStore,
    whitelist: &WhitelistStore,
    now: DateTime<Local>,
) -> Result<usize> {
    let mut rows = Vec::new();
    accounts.range(|account| {
        let principal = Principal::Account(account.username.clone());
        if let Some(u) = ledger.usage(&principal) {
            rows.push(format!(
                "{}:{}:{}:{}",
                account.username, u.today, u.monthly, u.total
            ));
        }
    });
    whitelist.range(|entry| {
        let principal = Principal::Whitelist(entry.text.clone());
        if let Some(u) = ledger.usage(&principal) {
            rows.push(format!(
                "{}{}:{}:{}:{}",
                entry.text, WHITELIST_SUFFIX, u.today, u.monthly, u.total
            ));
        }
    });

    let file_name = path
        .file_name()
        .ok_or_else(|| persistence_error(path, "not a file path"))?;
    let mut tmp_name = std::ffi::OsString::from(".");
    tmp_name.push(file_name);
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let write = || -> std::io::Result<()> {
        let file = File::create(&tmp)?;
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        writeln!(encoder, "{}", now.to_rfc3339_opts(SecondsFormat::Nanos, true))?;
        for row in &rows {
            writeln!(encoder, "{}", row)?;
        }
        let mut writer = encoder.finish()?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    };

    if let Err(e) = write() {
        let _ = std::fs::remove_file(&tmp);
        return Err(persistence_error(&tmp, e));
    }
    std::fs::rename(&tmp, path).map_err(|e| persistence_error(path, e))?;

    debug!("Saved {} usage records to {}", rows.len(), path.display());
    Ok(rows.len())
}

/// 从快照恢复
///
/// 与快照同一天（UTC）恢复今日用量，同一月恢复本月用量，累计用量总是恢复；
/// 格式错误的行记录日志后跳过。返回恢复的记录数
pub fn restore(path: &Path, ledger: &Ledger, now: DateTime<Local>) -> Result<usize> {
    let file = File::open(path).map_err(|e| persistence_error(path, e))?;
    let mut lines = BufReader::new(GzDecoder::new(file)).lines();

    let header = match lines.next() {
        Some(line) => line.map_err(|e| persistence_error(path, e))?,
        None => return Ok(0),
    };
    let saved_at: DateTime<FixedOffset> = DateTime::parse_from_rfc3339(header.trim())
        .map_err(|e| persistence_error(path, format!("invalid timestamp {:?}: {}", header, e)))?;

    let saved = saved_at.with_timezone(&Utc).date_naive();
    let today = now.with_timezone(&Utc).date_naive();
    let same_day = saved == today;
    let same_month = saved.year() == today.year() && saved.month() == today.month();

    let mut restored = 0;
    for (idx, line) in lines.enumerate() {
        let line = line.map_err(|e| persistence_error(path, e))?;
        let row = line.trim();
        if row.is_empty() {
            continue;
        }
        match parse_row(row, same_day, same_month) {
            Some((principal, t, m, total)) => {
                ledger.store(principal, t, m, total);
                restored += 1;
            }
            None => error!("{} line {}: invalid record: {}", path.display(), idx + 2, row),
        }
    }
    Ok(restored)
}

/// 从右侧拆分，身份中可以包含 `:`（IPv6 白名单条目）
fn parse_row(row: &str, same_day: bool, same_month: bool) -> Option<(Principal, i64, i64, i64)> {
    let mut fields = row.rsplitn(4, ':');
    let total = fields.next()?.parse::<i64>().ok()?;
    let monthly = fields.next()?;
    let today = fields.next()?;
    let id = fields.next()?;
    if id.is_empty() {
        return None;
    }

    let monthly = if same_month {
        monthly.parse::<i64>().ok()?
    } else {
        0
    };
    let today = if same_day {
        today.parse::<i64>().ok()?
    } else {
        0
    };

    let principal = match id.strip_suffix(WHITELIST_SUFFIX) {
        Some(entry) => Principal::Whitelist(entry.to_string()),
        None => Principal::Account(id.to_string()),
    };
    Some((principal, today, monthly, total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Usage;
    use crate::store::FileBacked;
    use chrono::TimeZone;
    use std::io::Read;

    fn stores() -> (AccountStore, WhitelistStore) {
        let accounts = AccountStore::new();
        accounts.load_str("alice:pw\nbob:pw\n");
        let whitelist = WhitelistStore::new();
        whitelist.load_str("10.0.0.0/8\nfd00::1\n");
        (accounts, whitelist)
    }

    fn noon(y: i32, m: u32, d: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, m, d, 12, 0, 0).earliest().unwrap()
    }

    #[test]
    fn test_round_trip_same_day() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("database");
        let (accounts, whitelist) = stores();

        let ledger = Ledger::default();
        ledger.store(Principal::Account("alice".into()), 10, 20, 30);
        ledger.store(Principal::Whitelist("10.0.0.0/8".into()), 1, 2, 3);
        ledger.store(Principal::Whitelist("fd00::1".into()), 4, 5, 6);
        // 不在当前账号列表中的记录不保存
        ledger.store(Principal::Account("ghost".into()), 7, 8, 9);

        let now = noon(2024, 6, 15);
        assert_eq!(save(&path, &ledger, &accounts, &whitelist, now).unwrap(), 3);

        let restored = Ledger::default();
        assert_eq!(restore(&path, &restored, now).unwrap(), 3);
        assert_eq!(
            restored.usage(&Principal::Account("alice".into())),
            Some(Usage {
                today: 10,
                monthly: 20,
                total: 30
            })
        );
        assert_eq!(
            restored.usage(&Principal::Whitelist("fd00::1".into())),
            Some(Usage {
                today: 4,
                monthly: 5,
                total: 6
            })
        );
        assert!(restored.usage(&Principal::Account("ghost".into())).is_none());
        assert!(!dir.path().join(".database.tmp").exists());
    }

    #[test]
    fn test_restore_next_month_keeps_total_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("database");
        let (accounts, whitelist) = stores();

        let ledger = Ledger::default();
        ledger.store(Principal::Account("bob".into()), 10, 20, 30);
        save(&path, &ledger, &accounts, &whitelist, noon(2024, 5, 10)).unwrap();

        let restored = Ledger::default();
        restore(&path, &restored, noon(2024, 6, 10)).unwrap();
        assert_eq!(
            restored.usage(&Principal::Account("bob".into())),
            Some(Usage {
                today: 0,
                monthly: 0,
                total: 30
            })
        );
    }

    #[test]
    fn test_restore_next_day_keeps_monthly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("database");
        let (accounts, whitelist) = stores();

        let ledger = Ledger::default();
        ledger.store(Principal::Account("bob".into()), 10, 20, 30);
        save(&path, &ledger, &accounts, &whitelist, noon(2024, 5, 10)).unwrap();

        let restored = Ledger::default();
        restore(&path, &restored, noon(2024, 5, 11)).unwrap();
        assert_eq!(
            restored.usage(&Principal::Account("bob".into())).unwrap(),
            Usage {
                today: 0,
                monthly: 20,
                total: 30
            }
        );
    }

    #[test]
    fn test_file_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("database");
        let (accounts, whitelist) = stores();

        let ledger = Ledger::default();
        ledger.store(Principal::Whitelist("10.0.0.0/8".into()), 1, 2, 3);
        save(&path, &ledger, &accounts, &whitelist, noon(2024, 5, 10)).unwrap();

        let mut text = String::new();
        GzDecoder::new(File::open(&path).unwrap())
            .read_to_string(&mut text)
            .unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert!(DateTime::parse_from_rfc3339(lines[0]).is_ok());
        assert_eq!(lines[1], "10.0.0.0/8[w]:1:2:3");
    }

    #[test]
    fn test_malformed_rows_skipped() {
        assert!(parse_row("alice:1:2", true, true).is_none());
        assert!(parse_row("alice:1:2:x", true, true).is_none());
        assert!(parse_row(":1:2:3", true, true).is_none());
        assert!(parse_row("alice:x:2:3", true, true).is_none());
        // 不需要恢复的字段不做校验
        assert_eq!(
            parse_row("alice:x:2:3", false, true),
            Some((Principal::Account("alice".into()), 0, 2, 3))
        );
    }

    #[test]
    fn test_restore_missing_file() {
        let ledger = Ledger::default();
        let err = restore(Path::new("/nonexistent/database"), &ledger, Local::now()).unwrap_err();
        assert!(matches!(err, ProxyError::PersistenceError(_)));
    }
}
