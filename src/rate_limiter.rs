/// 速率限制器模块
///
/// 使用 governor 的 token bucket 实现按字节限速：一个令牌对应一个字节，
/// 同一账号（或白名单条目）的所有连接共享同一个桶
use governor::{
    clock::{Clock, DefaultClock},
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorLimiter,
};
use std::future::Future;
use std::io;
use std::num::NonZeroU32;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::time::Sleep;

/// 字节限速器
///
/// `Unlimited` 是不限速的哨兵值，包装写入器时直接透传
#[derive(Clone, Default)]
pub enum SpeedLimiter {
    /// 不限速
    #[default]
    Unlimited,
    /// 每秒最多 `bytes_per_second` 字节
    Limited {
        inner: Arc<GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>>,
        bytes_per_second: u32,
    },
}

impl SpeedLimiter {
    /// 创建限速器，0 表示不限速
    pub fn new(bytes_per_second: u64) -> Self {
        let Some(rate) = NonZeroU32::new(bytes_per_second.min(u32::MAX as u64) as u32) else {
            return Self::Unlimited;
        };

        // 突发容量等于一秒的配额
        let quota = Quota::per_second(rate).allow_burst(rate);
        Self::Limited {
            inner: Arc::new(GovernorLimiter::direct(quota)),
            bytes_per_second: rate.get(),
        }
    }

    /// 不限速的限速器
    pub fn unlimited() -> Self {
        Self::Unlimited
    }

    /// 是否限速
    pub fn is_unlimited(&self) -> bool {
        matches!(self, Self::Unlimited)
    }

    /// 每秒字节数上限（不限速时返回 None）
    pub fn bytes_per_second(&self) -> Option<u32> {
        match self {
            Self::Unlimited => None,
            Self::Limited {
                bytes_per_second, ..
            } => Some(*bytes_per_second),
        }
    }

    /// 尝试获取 `n` 个字节的令牌（非阻塞）
    ///
    /// 返回 Err(Duration) 表示需要等待的时间；`n` 超过突发容量时按容量截断
    pub fn check_n(&self, n: usize) -> Result<usize, Duration> {
        match self {
            Self::Unlimited => Ok(n),
            Self::Limited {
                inner,
                bytes_per_second,
            } => {
                let granted = n.min(*bytes_per_second as usize).max(1);
                let tokens = NonZeroU32::new(granted as u32).unwrap_or(NonZeroU32::MIN);
                match inner.check_n(tokens) {
                    Ok(Ok(())) => Ok(granted),
                    Ok(Err(not_until)) => {
                        Err(not_until.wait_time_from(DefaultClock::default().now()))
                    }
                    // 按突发容量截断后不会出现，保守地等待一个短周期
                    Err(_) => Err(Duration::from_millis(10)),
                }
            }
        }
    }

    /// 包装写入器
    pub fn writer<W>(&self, inner: W) -> ThrottledWriter<W> {
        ThrottledWriter::new(inner, self.clone())
    }
}

impl std::fmt::Debug for SpeedLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.bytes_per_second() {
            None => write!(f, "SpeedLimiter(unlimited)"),
            Some(rate) => write!(f, "SpeedLimiter({} B/s)", rate),
        }
    }
}

/// 限速写入器
///
/// 在写入内部写入器之前先取得令牌；已取得但尚未写出的令牌保存在 `granted` 中，
/// 内部写入器返回 Pending 时不会重复扣减
pub struct ThrottledWriter<W> {
    inner: W,
    limiter: SpeedLimiter,
    granted: usize,
    delay: Option<Pin<Box<Sleep>>>,
}

impl<W> ThrottledWriter<W> {
    pub fn new(inner: W, limiter: SpeedLimiter) -> Self {
        Self {
            inner,
            limiter,
            granted: 0,
            delay: None,
        }
    }

    /// 获取内部写入器的引用
    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    /// 消费包装器，返回内部写入器
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for ThrottledWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() || self.limiter.is_unlimited() {
            return Pin::new(&mut self.inner).poll_write(cx, buf);
        }

        while self.granted == 0 {
            if let Some(delay) = self.delay.as_mut() {
                match delay.as_mut().poll(cx) {
                    Poll::Ready(()) => self.delay = None,
                    Poll::Pending => return Poll::Pending,
                }
            }

            match self.limiter.check_n(buf.len()) {
                Ok(granted) => self.granted = granted,
                Err(wait) => self.delay = Some(Box::pin(tokio::time::sleep(wait))),
            }
        }

        let len = self.granted.min(buf.len());
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_write(cx, &buf[..len]) {
            Poll::Ready(Ok(n)) => {
                this.granted = this.granted.saturating_sub(n);
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
