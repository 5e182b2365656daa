/// 周期任务
///
/// 账本日切、快照保存、状态文件写入、远程列表刷新都是独立的周期任务，
/// 各自持有一个 `CancellationToken`，时间来源由 `Clock` 提供
use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveTime, TimeZone, Timelike};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 时间来源
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

/// 系统时钟
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// 执行计划
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// 每天的 hour:minute（本地时间）
    Daily { hour: u32, minute: u32 },
    /// 每小时的第 minute 分钟
    Hourly { minute: u32 },
    /// 固定间隔
    Every(Duration),
}

impl Schedule {
    /// 每天本地午夜
    pub const MIDNIGHT: Schedule = Schedule::Daily { hour: 0, minute: 0 };

    /// 距下一次执行的等待时间
    pub fn delay_from(&self, now: DateTime<Local>) -> Duration {
        let next = match *self {
            Schedule::Every(interval) => return interval,
            Schedule::Daily { hour, minute } => next_daily(now, hour, minute),
            Schedule::Hourly { minute } => next_hourly(now, minute),
        };
        (next - now).to_std().unwrap_or(Duration::ZERO)
    }
}

fn at_local(date: chrono::NaiveDate, time: NaiveTime) -> Option<DateTime<Local>> {
    // 夏令时跳过的时刻取不到，向后顺延一小时
    Local
        .from_local_datetime(&date.and_time(time))
        .earliest()
        .or_else(|| {
            Local
                .from_local_datetime(&(date.and_time(time) + ChronoDuration::hours(1)))
                .earliest()
        })
}

fn next_daily(now: DateTime<Local>, hour: u32, minute: u32) -> DateTime<Local> {
    let time = NaiveTime::from_hms_opt(hour.min(23), minute.min(59), 0).unwrap_or_default();
    let today = now.date_naive();
    match at_local(today, time) {
        Some(t) if t > now => t,
        _ => today
            .succ_opt()
            .and_then(|d| at_local(d, time))
            .unwrap_or(now + ChronoDuration::days(1)),
    }
}

fn next_hourly(now: DateTime<Local>, minute: u32) -> DateTime<Local> {
    let minute = minute.min(59) as i64;
    let into_hour = now.minute() as i64 * 60 + now.second() as i64;
    let target = minute * 60;
    let secs = if into_hour < target {
        target - into_hour
    } else {
        3600 - into_hour + target
    };
    now + ChronoDuration::seconds(secs) - ChronoDuration::nanoseconds(now.nanosecond() as i64)
}

/// 按计划重复执行 `job`，直到 `cancel` 被触发
pub fn spawn_job<F, Fut>(
    name: &'static str,
    schedule: Schedule,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    mut job: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let delay = schedule.delay_from(clock.now());
            debug!("Job {} sleeping {:?}", name, delay);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            job().await;
        }
        debug!("Job {} stopped", name);
    })
}
