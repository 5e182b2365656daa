use super::{parse_rows, FileBacked};
use crate::limit::Limit;
use ipnetwork::IpNetwork;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use tracing::error;

/// 白名单匹配规则
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Allow {
    /// 单个地址
    Addr(IpAddr),
    /// 网段
    Net(IpNetwork),
}

impl Allow {
    /// 判断客户端地址是否匹配
    pub fn contains(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        match self {
            Allow::Addr(addr) => *addr == ip,
            Allow::Net(net) => net.contains(ip),
        }
    }
}

impl FromStr for Allow {
    type Err = ipnetwork::IpNetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<IpAddr>() {
            return Ok(Allow::Addr(addr));
        }
        s.parse::<IpNetwork>().map(Allow::Net)
    }
}

impl fmt::Display for Allow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Allow::Addr(addr) => write!(f, "{}", addr),
            Allow::Net(net) => write!(f, "{}", net),
        }
    }
}

/// 白名单条目
#[derive(Debug)]
pub struct WhitelistEntry {
    /// 文件中书写的原文，作为账本中的身份
    pub text: String,
    pub allow: Allow,
    pub limit: Arc<Limit>,
}

/// 白名单存储，按文件顺序匹配
#[derive(Debug, Default)]
pub struct WhitelistStore {
    entries: RwLock<Arc<Vec<Arc<WhitelistEntry>>>>,
}

impl WhitelistStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 解析白名单文件内容
    pub fn parse(text: &str) -> Vec<Arc<WhitelistEntry>> {
        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        for row in parse_rows(Self::KIND, text) {
            let allow = match row.key.parse::<Allow>() {
                Ok(allow) => allow,
                Err(_) => {
                    error!(
                        "{} line {}: invalid whitelist record: {}",
                        Self::KIND,
                        row.line,
                        row.key
                    );
                    continue;
                }
            };
            if !seen.insert(row.key.to_string()) {
                error!(
                    "{} line {}: duplicate whitelist record: {}",
                    Self::KIND,
                    row.line,
                    row.key
                );
                continue;
            }
            entries.push(Arc::new(WhitelistEntry {
                text: row.key.to_string(),
                allow,
                limit: Arc::new(row.limit),
            }));
        }
        entries
    }

    /// 整体替换
    pub fn swap(&self, entries: Vec<Arc<WhitelistEntry>>) {
        *self.entries.write() = Arc::new(entries);
    }

    /// 查找第一个匹配客户端地址的条目
    pub fn find(&self, ip: IpAddr) -> Option<Arc<WhitelistEntry>> {
        self.entries
            .read()
            .iter()
            .find(|e| e.allow.contains(ip))
            .cloned()
    }

    /// 遍历所有条目
    pub fn range<F: FnMut(&WhitelistEntry)>(&self, mut f: F) {
        let entries = self.entries.read().clone();
        for entry in entries.iter() {
            f(entry);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl FileBacked for WhitelistStore {
    const KIND: &'static str = "whitelist";

    fn load_str(&self, text: &str) -> usize {
        let entries = Self::parse(text);
        let n = entries.len();
        self.swap(entries);
        n
    }

    fn clear(&self) {
        self.swap(Vec::new());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_cidr_match() {
        let allow: Allow = "10.0.0.0/8".parse().unwrap();
        assert!(allow.contains(ip("10.1.2.3")));
        assert!(!allow.contains(ip("11.0.0.0")));
    }

    #[test]
    fn test_exact_match() {
        let allow: Allow = "192.168.1.10".parse().unwrap();
        assert!(matches!(allow, Allow::Addr(_)));
        assert!(allow.contains(ip("192.168.1.10")));
        assert!(!allow.contains(ip("192.168.1.11")));
    }

    #[test]
    fn test_ipv4_mapped_client() {
        let allow: Allow = "127.0.0.1".parse().unwrap();
        assert!(allow.contains(ip("::ffff:127.0.0.1")));
    }

    #[test]
    fn test_ipv6() {
        let allow: Allow = "fd00::/8".parse().unwrap();
        assert!(allow.contains(ip("fd12::1")));
        assert!(!allow.contains(ip("fe80::1")));
    }

    #[test]
    fn test_parse_skips_invalid_and_duplicates() {
        let store = WhitelistStore::new();
        let n = store.load_str(
            "10.0.0.0/8 1G\nnot-an-ip\n10.0.0.0/8 2G\n127.0.0.1\n",
        );
        assert_eq!(n, 2);

        let entry = store.find(ip("10.9.9.9")).unwrap();
        assert_eq!(entry.text, "10.0.0.0/8");
        assert_eq!(entry.limit.monthly, 1 << 30);
        assert!(store.find(ip("8.8.8.8")).is_none());
    }

    #[test]
    fn test_first_match_in_file_order() {
        let store = WhitelistStore::new();
        store.load_str("10.1.0.0/16 1G\n10.0.0.0/8 2G\n");
        assert_eq!(store.find(ip("10.1.2.3")).unwrap().text, "10.1.0.0/16");
        assert_eq!(store.find(ip("10.2.2.3")).unwrap().text, "10.0.0.0/8");
    }
}
