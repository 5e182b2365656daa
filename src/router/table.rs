use crate::dialer::Leg;
use ipnetwork::IpNetwork;
use std::collections::HashSet;
use std::net::IpAddr;
use tracing::warn;

/// 匹配的精确程度，数值越大越精确
///
/// 精确主机和单个地址为最大值，域名后缀按后缀长度，网段按前缀长度
pub type Specificity = u32;

const EXACT: Specificity = u32::MAX;

/// 规范化主机名：小写、去掉末尾的点和 IPv6 方括号
pub fn normalize_host(host: &str) -> String {
    host.trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase()
}

/// 从 `host:port` 中取出主机部分
pub fn host_of(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match addr.rsplit_once(':') {
        // 不带方括号的 IPv6 地址没有端口
        Some((host, _)) if !host.contains(':') => host,
        Some(_) => addr,
        None => addr,
    }
}

/// 主机匹配表
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostMatcher {
    hosts: HashSet<String>,
    zones: HashSet<String>,
    addrs: HashSet<IpAddr>,
    nets: Vec<IpNetwork>,
}

impl HostMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加精确主机
    pub fn add_host(&mut self, host: &str) {
        let host = normalize_host(host);
        if !host.is_empty() {
            self.hosts.insert(host);
        }
    }

    /// 添加域名（匹配自身及所有子域名）
    pub fn add_zone(&mut self, zone: &str) {
        let zone = normalize_host(zone.trim_start_matches("*.").trim_start_matches('.'));
        if !zone.is_empty() {
            self.zones.insert(zone);
        }
    }

    pub fn add_addr(&mut self, addr: IpAddr) {
        self.addrs.insert(addr.to_canonical());
    }

    pub fn add_net(&mut self, net: IpNetwork) {
        if !self.nets.contains(&net) {
            self.nets.push(net);
        }
    }

    pub fn len(&self) -> usize {
        self.hosts.len() + self.zones.len() + self.addrs.len() + self.nets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 查找最精确的匹配
    pub fn lookup(&self, host: &str) -> Option<Specificity> {
        let host = normalize_host(host);
        if let Ok(ip) = host.parse::<IpAddr>() {
            let ip = ip.to_canonical();
            if self.addrs.contains(&ip) {
                return Some(EXACT);
            }
            return self
                .nets
                .iter()
                .filter(|n| n.contains(ip))
                .map(|n| n.prefix() as Specificity)
                .max();
        }

        if self.hosts.contains(&host) {
            return Some(EXACT);
        }

        // 从最长的后缀开始检查
        let mut suffix = host.as_str();
        loop {
            if self.zones.contains(suffix) {
                return Some(suffix.len() as Specificity);
            }
            match suffix.split_once('.') {
                Some((_, rest)) if !rest.is_empty() => suffix = rest,
                _ => return None,
            }
        }
    }
}

/// 解析远程域名列表
///
/// `domain:X` 为域名，`full:X` 为精确主机；以 `@cn` 结尾的行丢弃，
/// `:@ads` 标记去掉；其余行（`regexp:`、`keyword:`、`include:`、注释）忽略
pub fn parse_remote(text: &str) -> HostMatcher {
    let mut matcher = HostMatcher::new();
    for line in text.lines() {
        let line = line.trim();
        if line.ends_with("@cn") {
            continue;
        }
        let line = line.replace(":@ads", "");
        if let Some(zone) = line.strip_prefix("domain:") {
            matcher.add_zone(zone.trim());
        } else if let Some(host) = line.strip_prefix("full:") {
            matcher.add_host(host.trim());
        }
    }
    matcher
}

/// 本地覆盖规则
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    pub direct: HostMatcher,
    pub proxy: HostMatcher,
}

impl Overrides {
    pub fn is_empty(&self) -> bool {
        self.direct.is_empty() && self.proxy.is_empty()
    }

    pub fn len(&self) -> usize {
        self.direct.len() + self.proxy.len()
    }

    /// 覆盖规则的路由结果，同样精确时选择代理
    pub fn lookup(&self, host: &str) -> Option<Leg> {
        match (self.direct.lookup(host), self.proxy.lookup(host)) {
            (Some(d), Some(p)) if d > p => Some(Leg::Direct),
            (_, Some(_)) => Some(Leg::Proxy),
            (Some(_), None) => Some(Leg::Direct),
            (None, None) => None,
        }
    }
}

fn add_pattern(matcher: &mut HostMatcher, pattern: &str) -> bool {
    if let Ok(ip) = pattern.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
        matcher.add_addr(ip);
        return true;
    }
    if pattern.contains('/') {
        return match pattern.parse::<IpNetwork>() {
            Ok(net) => {
                matcher.add_net(net);
                true
            }
            Err(_) => false,
        };
    }
    if pattern.contains(|c: char| c.is_whitespace() || c == ':') {
        return false;
    }
    if pattern.starts_with("*.") || pattern.starts_with('.') {
        matcher.add_zone(pattern);
    } else {
        matcher.add_host(pattern);
    }
    true
}

/// 解析本地覆盖文件
///
/// 每行 `[direct|proxy] <pattern>`，省略动作时为 `direct`；
/// `*.example.com`、`.example.com` 为域名，其余为精确主机、IP 地址或网段
pub fn parse_overrides(text: &str) -> Overrides {
    let mut overrides = Overrides::default();
    for (idx, raw) in text.lines().enumerate() {
        let line = match raw.find('#') {
            Some(i) => &raw[..i],
            None => raw,
        };
        let fields: Vec<&str> = line.split_whitespace().collect();
        let (leg, pattern) = match fields.as_slice() {
            [] => continue,
            [pattern] => (Leg::Direct, *pattern),
            [action, pattern] if action.eq_ignore_ascii_case("direct") => (Leg::Direct, *pattern),
            [action, pattern] if action.eq_ignore_ascii_case("proxy") => (Leg::Proxy, *pattern),
            _ => {
                warn!("autoproxy override line {}: cannot parse: {}", idx + 1, line.trim());
                continue;
            }
        };
        let matcher = match leg {
            Leg::Direct => &mut overrides.direct,
            Leg::Proxy => &mut overrides.proxy,
        };
        if !add_pattern(matcher, pattern) {
            warn!("autoproxy override line {}: invalid pattern: {}", idx + 1, pattern);
        }
    }
    overrides
}

/// 路由表：覆盖规则优先，其次远程列表，都不匹配时使用默认线路
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTable {
    overrides: Overrides,
    remote: HostMatcher,
    default: Leg,
}

impl RouteTable {
    pub fn new(overrides: Overrides, remote: HostMatcher, default: Leg) -> Self {
        Self {
            overrides,
            remote,
            default,
        }
    }

    /// 选择线路，`host` 可以带端口
    pub fn route(&self, host: &str) -> Leg {
        let host = host_of(host);
        if let Some(leg) = self.overrides.lookup(host) {
            return leg;
        }
        if self.remote.lookup(host).is_some() {
            return Leg::Proxy;
        }
        self.default
    }

    pub fn overrides(&self) -> &Overrides {
        &self.overrides
    }

    pub fn remote(&self) -> &HostMatcher {
        &self.remote
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("example.com:443"), "example.com");
        assert_eq!(host_of("example.com"), "example.com");
        assert_eq!(host_of("[::1]:8080"), "::1");
        assert_eq!(host_of("::1"), "::1");
    }

    #[test]
    fn test_zone_and_exact() {
        let mut m = HostMatcher::new();
        m.add_zone("example.com");
        m.add_zone("a.example.com");
        m.add_host("exact.org");

        assert_eq!(m.lookup("example.com"), Some(11));
        assert_eq!(m.lookup("sub.example.com"), Some(11));
        assert_eq!(m.lookup("x.a.example.com"), Some(13));
        assert_eq!(m.lookup("EXACT.org."), Some(EXACT));
        assert_eq!(m.lookup("sub.exact.org"), None);
        assert_eq!(m.lookup("notexample.com"), None);
    }

    #[test]
    fn test_ip_matching() {
        let mut m = HostMatcher::new();
        m.add_net("10.0.0.0/8".parse().unwrap());
        m.add_net("10.1.0.0/16".parse().unwrap());
        m.add_addr("192.168.1.1".parse().unwrap());

        assert_eq!(m.lookup("10.1.2.3"), Some(16));
        assert_eq!(m.lookup("10.2.2.3"), Some(8));
        assert_eq!(m.lookup("11.0.0.0"), None);
        assert_eq!(m.lookup("192.168.1.1"), Some(EXACT));
    }

    #[test]
    fn test_parse_remote() {
        let text = "\
# comment
domain:example.com
full:www.exact.org
domain:baidu.com:@cn
domain:ads.net:@ads
regexp:.*\\.google\\..*
keyword:foo
include:other
";
        let m = parse_remote(text);
        assert!(m.lookup("sub.example.com").is_some());
        assert!(m.lookup("www.exact.org").is_some());
        assert!(m.lookup("exact.org").is_none());
        assert!(m.lookup("baidu.com").is_none());
        assert!(m.lookup("x.ads.net").is_some());
        assert!(m.lookup("foo").is_none());
        assert_eq!(m.len(), 3);
    }

    #[test]
    fn test_parse_overrides() {
        let text = "\
# local overrides
unrelated.org
direct *.corp.local
proxy .blocked.com
direct 192.168.0.0/16
proxy 8.8.8.8
bogus action here
direct bad/pattern
";
        let o = parse_overrides(text);
        assert_eq!(o.lookup("unrelated.org"), Some(Leg::Direct));
        assert_eq!(o.lookup("git.corp.local"), Some(Leg::Direct));
        assert_eq!(o.lookup("www.blocked.com"), Some(Leg::Proxy));
        assert_eq!(o.lookup("192.168.3.4"), Some(Leg::Direct));
        assert_eq!(o.lookup("8.8.8.8"), Some(Leg::Proxy));
        assert_eq!(o.lookup("other.org"), None);
        assert_eq!(o.len(), 5);
    }

    #[test]
    fn test_override_specificity() {
        let o = parse_overrides("proxy *.example.com\ndirect internal.example.com\n");
        assert_eq!(o.lookup("internal.example.com"), Some(Leg::Direct));
        assert_eq!(o.lookup("www.example.com"), Some(Leg::Proxy));
    }

    #[test]
    fn test_route_table() {
        let remote = parse_remote("domain:example.com\n");
        let table = RouteTable::new(Overrides::default(), remote.clone(), Leg::Proxy);
        assert_eq!(table.route("sub.example.com:443"), Leg::Proxy);
        assert_eq!(table.route("unrelated.org:80"), Leg::Proxy);

        let table = RouteTable::new(
            parse_overrides("direct unrelated.org\ndirect sub.example.com\n"),
            remote.clone(),
            Leg::Proxy,
        );
        assert_eq!(table.route("unrelated.org:80"), Leg::Direct);
        // 覆盖规则优先于远程列表
        assert_eq!(table.route("sub.example.com:443"), Leg::Direct);
        assert_eq!(table.route("www.example.com:443"), Leg::Proxy);

        let table = RouteTable::new(Overrides::default(), remote, Leg::Direct);
        assert_eq!(table.route("unrelated.org:80"), Leg::Direct);
        assert_eq!(table.route("example.com:80"), Leg::Proxy);
    }
}
