/// 流量限额模块
///
/// 限额语法：`[daily:]monthly[|speed]`，单位支持 B/K/KB/M/MB/G/GB/T/TB（1024 进制）
use crate::error::{ProxyError, Result};
use crate::rate_limiter::SpeedLimiter;

const UNITS: &[(&str, u64)] = &[
    ("TB", 1 << 40),
    ("T", 1 << 40),
    ("GB", 1 << 30),
    ("G", 1 << 30),
    ("MB", 1 << 20),
    ("M", 1 << 20),
    ("KB", 1 << 10),
    ("K", 1 << 10),
    ("B", 1),
];

/// 解析人类可读的字节数，如 `500M`、`1.5G`、`1024`
pub fn parse_byte_size(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(ProxyError::config_error("empty byte size"));
    }

    let upper = s.to_ascii_uppercase();
    let (number, multiplier) = UNITS
        .iter()
        .find_map(|(suffix, mul)| upper.strip_suffix(suffix).map(|n| (n.trim(), *mul)))
        .unwrap_or((upper.as_str(), 1));

    let value: f64 = number
        .parse()
        .map_err(|_| ProxyError::config_error(format!("invalid byte size: {}", s)))?;
    if !value.is_finite() || value < 0.0 {
        return Err(ProxyError::config_error(format!("invalid byte size: {}", s)));
    }

    Ok((value * multiplier as f64).round() as u64)
}

/// 格式化字节数为人类可读格式
pub fn format_bytes(bytes: u64) -> String {
    const NAMES: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < NAMES.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", bytes, NAMES[unit_idx])
    } else {
        format!("{:.2} {}", size, NAMES[unit_idx])
    }
}

/// 附加在账号或白名单条目上的限额
#[derive(Debug, Clone, Default)]
pub struct Limit {
    /// 每日流量上限（0 表示不限）
    pub daily: u64,
    /// 每月流量上限（0 表示不限）
    pub monthly: u64,
    /// 速度上限
    pub speed: SpeedLimiter,
}

impl Limit {
    /// 不限额、不限速
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// 是否需要检查配额
    pub fn is_metered(&self) -> bool {
        self.daily != 0 || self.monthly != 0
    }

    /// 判断用量是否超出限额
    ///
    /// 保留原有的判断顺序：日限额未设置或尚未用完时按月限额判断，
    /// 日限额用完后按日限额判断
    pub fn is_exceeded(&self, today: i64, monthly: i64) -> bool {
        if !self.is_metered() {
            return false;
        }
        if self.daily == 0 || today < self.daily as i64 {
            return monthly >= self.monthly as i64;
        }
        today >= self.daily as i64
    }
}

impl std::str::FromStr for Limit {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        parse_limit(s)
    }
}

/// 解析限额描述
pub fn parse_limit(s: &str) -> Result<Limit> {
    let (quota, speed) = match s.split('|').collect::<Vec<_>>().as_slice() {
        [quota] => (*quota, SpeedLimiter::unlimited()),
        [quota, speed] => {
            let speed = speed.trim();
            if speed.is_empty() {
                (*quota, SpeedLimiter::unlimited())
            } else {
                (*quota, SpeedLimiter::new(parse_byte_size(speed)?))
            }
        }
        _ => return Err(ProxyError::config_error(format!("invalid limit: {}", s))),
    };

    match quota.split(':').collect::<Vec<_>>().as_slice() {
        [monthly] => {
            let monthly = monthly.trim();
            let monthly = if monthly.is_empty() {
                0
            } else {
                parse_byte_size(monthly)?
            };
            Ok(Limit {
                daily: 0,
                monthly,
                speed,
            })
        }
        [daily, monthly] => Ok(Limit {
            daily: parse_byte_size(daily)?,
            monthly: parse_byte_size(monthly)?,
            speed,
        }),
        _ => Err(ProxyError::config_error(format!("invalid limit: {}", s))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_byte_size() {
        assert_eq!(parse_byte_size("1024").unwrap(), 1024);
        assert_eq!(parse_byte_size("10K").unwrap(), 10 * 1024);
        assert_eq!(parse_byte_size("10kb").unwrap(), 10 * 1024);
        assert_eq!(parse_byte_size("500M").unwrap(), 500 << 20);
        assert_eq!(parse_byte_size("1.5G").unwrap(), 3 << 29);
        assert_eq!(parse_byte_size("2 GB").unwrap(), 2 << 30);
        assert_eq!(parse_byte_size("1T").unwrap(), 1 << 40);
        assert_eq!(parse_byte_size("7B").unwrap(), 7);
        assert!(parse_byte_size("").is_err());
        assert!(parse_byte_size("abc").is_err());
        assert!(parse_byte_size("-1M").is_err());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(3 << 30), "3.00 GB");
    }

    #[test]
    fn test_parse_limit_monthly_only() {
        let limit = parse_limit("10G").unwrap();
        assert_eq!(limit.daily, 0);
        assert_eq!(limit.monthly, 10 << 30);
        assert!(limit.speed.is_unlimited());
    }

    #[test]
    fn test_parse_limit_daily_monthly_speed() {
        let limit = parse_limit("1G:20G|512K").unwrap();
        assert_eq!(limit.daily, 1 << 30);
        assert_eq!(limit.monthly, 20 << 30);
        assert_eq!(limit.speed.bytes_per_second(), Some(512 * 1024));
    }

    #[test]
    fn test_parse_limit_speed_only() {
        let limit = parse_limit("|1M").unwrap();
        assert!(!limit.is_metered());
        assert_eq!(limit.speed.bytes_per_second(), Some(1 << 20));

        let limit = parse_limit("5G|").unwrap();
        assert!(limit.speed.is_unlimited());
    }

    #[test]
    fn test_parse_limit_invalid() {
        assert!(parse_limit("1G:2G:3G").is_err());
        assert!(parse_limit("1G|2M|3M").is_err());
        assert!(parse_limit("lots").is_err());
        assert!("1G:xx".parse::<Limit>().is_err());
    }

    #[test]
    fn test_is_exceeded() {
        let limit = Limit {
            daily: 100,
            monthly: 1000,
            speed: SpeedLimiter::unlimited(),
        };
        assert!(limit.is_exceeded(100, 100));
        assert!(limit.is_exceeded(50, 1000));
        assert!(!limit.is_exceeded(50, 500));
    }

    #[test]
    fn test_is_exceeded_unmetered() {
        let limit = Limit::unlimited();
        assert!(!limit.is_exceeded(i64::MAX, i64::MAX));
    }

    #[test]
    fn test_is_exceeded_monthly_only() {
        let limit = Limit {
            daily: 0,
            monthly: 1000,
            speed: SpeedLimiter::unlimited(),
        };
        assert!(!limit.is_exceeded(999_999, 999));
        assert!(limit.is_exceeded(0, 1000));
    }

    #[test]
    fn test_is_exceeded_daily_only() {
        // 月限额为 0 时，日限额未用完也会被月限额分支判定为超限
        let limit = Limit {
            daily: 100,
            monthly: 0,
            speed: SpeedLimiter::unlimited(),
        };
        assert!(limit.is_exceeded(10, 0));
        assert!(limit.is_exceeded(100, 0));
    }
}
