/// 访问控制
///
/// 把入站请求转换为已授权的身份和对应的限速器：
/// 未配置账号和白名单时允许匿名访问；白名单优先于账号；
/// 账号通过 `Proxy-Authorization: Basic` 校验；超出配额返回 403
use crate::ledger::{Ledger, Principal};
use crate::rate_limiter::SpeedLimiter;
use crate::store::{AccountStore, WhitelistStore};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use http::StatusCode;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

/// 407 响应附带的认证质询
pub const PROXY_AUTHENTICATE: &str = r#"Basic realm="HTTP(S) Proxy Server""#;

/// 授权结果
#[derive(Debug, Clone)]
pub struct Grant {
    pub principal: Principal,
    pub limiter: SpeedLimiter,
}

impl Grant {
    pub fn anonymous() -> Self {
        Self {
            principal: Principal::Anonymous,
            limiter: SpeedLimiter::unlimited(),
        }
    }
}

/// 拒绝原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denial {
    /// 不在白名单中且未配置账号
    NotAllowed,
    /// 缺少或无法解析认证信息
    AuthRequired,
    /// 用户名或密码错误
    AuthFailed,
    /// 超出流量配额
    QuotaExceeded,
}

impl Denial {
    pub fn status(&self) -> StatusCode {
        match self {
            Denial::NotAllowed | Denial::QuotaExceeded => StatusCode::FORBIDDEN,
            Denial::AuthRequired | Denial::AuthFailed => StatusCode::PROXY_AUTHENTICATION_REQUIRED,
        }
    }

    /// 响应正文
    pub fn message(&self) -> &'static str {
        match self {
            Denial::NotAllowed => "access not allowed",
            Denial::AuthRequired => "authentication required",
            Denial::AuthFailed => "authentication failed",
            Denial::QuotaExceeded => "exceeded traffic limit",
        }
    }

    /// 是否需要附带 `Proxy-Authenticate`
    pub fn challenge(&self) -> Option<&'static str> {
        match self.status() {
            StatusCode::PROXY_AUTHENTICATION_REQUIRED => Some(PROXY_AUTHENTICATE),
            _ => None,
        }
    }

    fn index(&self) -> usize {
        match self {
            Denial::NotAllowed => 0,
            Denial::AuthRequired => 1,
            Denial::AuthFailed => 2,
            Denial::QuotaExceeded => 3,
        }
    }
}

/// 在一个时间窗口内最多执行一次
#[derive(Debug)]
pub struct Sometimes {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl Sometimes {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    /// 距上次执行已超过窗口时执行 `f`，返回是否执行
    pub fn run<F: FnOnce()>(&self, f: F) -> bool {
        let now = Instant::now();
        {
            let mut last = self.last.lock();
            match *last {
                Some(t) if now.duration_since(t) < self.interval => return false,
                _ => *last = Some(now),
            }
        }
        f();
        true
    }
}

/// 解析 `Basic <base64(user:pass)>`，前缀不区分大小写
pub fn parse_basic_auth(value: &str) -> Option<(String, String)> {
    const PREFIX: &str = "basic ";
    let value = value.trim();
    let scheme = value.get(..PREFIX.len())?;
    if !scheme.eq_ignore_ascii_case(PREFIX) {
        return None;
    }
    let decoded = STANDARD.decode(value.get(PREFIX.len()..)?.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// 访问控制
pub struct AccessGate {
    accounts: Arc<AccountStore>,
    whitelist: Arc<WhitelistStore>,
    ledger: Arc<Ledger>,
    throttles: [Sometimes; 4],
}

impl AccessGate {
    pub fn new(
        accounts: Arc<AccountStore>,
        whitelist: Arc<WhitelistStore>,
        ledger: Arc<Ledger>,
    ) -> Self {
        Self {
            accounts,
            whitelist,
            ledger,
            throttles: std::array::from_fn(|_| Sometimes::new(Duration::from_secs(60))),
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    fn deny(&self, denial: Denial, peer: SocketAddr, who: Option<&Principal>) -> Denial {
        self.throttles[denial.index()].run(|| match (denial, who) {
            (Denial::QuotaExceeded, Some(who)) => {
                info!("{}[{}] Exceeded traffic limit", peer, who)
            }
            (Denial::AuthFailed, _) => error!("{} Proxy Authentication Failed", peer),
            (Denial::AuthRequired, _) => info!("{} Proxy Authentication Required", peer),
            _ => info!("{} not allowed", peer),
        });
        denial
    }

    /// 授权
    pub fn authorize(
        &self,
        peer: SocketAddr,
        proxy_authorization: Option<&str>,
    ) -> Result<Grant, Denial> {
        let has_whitelist = !self.whitelist.is_empty();
        let has_accounts = !self.accounts.is_empty();

        if !has_whitelist && !has_accounts {
            return Ok(Grant::anonymous());
        }

        if has_whitelist {
            if let Some(entry) = self.whitelist.find(peer.ip()) {
                let principal = Principal::Whitelist(entry.text.clone());
                if self.ledger.is_exceeded(&principal, &entry.limit) {
                    return Err(self.deny(Denial::QuotaExceeded, peer, Some(&principal)));
                }
                return Ok(Grant {
                    principal,
                    limiter: entry.limit.speed.clone(),
                });
            }
        }

        if !has_accounts {
            return Err(self.deny(Denial::NotAllowed, peer, None));
        }

        let Some((user, pass)) = proxy_authorization.and_then(parse_basic_auth) else {
            return Err(self.deny(Denial::AuthRequired, peer, None));
        };
        let Some(account) = self.accounts.verify(&user, &pass) else {
            return Err(self.deny(Denial::AuthFailed, peer, None));
        };

        let principal = Principal::Account(account.username.clone());
        if self.ledger.is_exceeded(&principal, &account.limit) {
            return Err(self.deny(Denial::QuotaExceeded, peer, Some(&principal)));
        }
        Ok(Grant {
            principal,
            limiter: account.limit.speed.clone(),
        })
    }
}
