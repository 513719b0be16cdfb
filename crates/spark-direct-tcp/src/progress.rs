use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 通道级的活动时间戳。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 挂起检测需要知道“连接上最近一次写出/读入进展”的时间，而不仅是单条请求的；
///   一个大帧卡住时，排在其后的请求同样没有进展；
/// - 空闲驱逐需要最近一次业务活动（受理或完成请求）的时间。
///
/// ## 逻辑 (How)
/// - 三个时间戳均以相对 `base` 的纳秒偏移存放在 `AtomicU64` 中，
///   读写任务与计时任务无需加锁即可并发访问；
/// - 更新使用 `fetch_max`，乱序到达的旧时间戳不会让时钟倒退。
///
/// ## 契约 (What)
/// - 初始值均为创建时刻；
/// - `last_*` 返回的 `Instant` 单调不减。
///
/// ## 注意事项 (Trade-offs)
/// - 偏移以纳秒计，`u64` 可覆盖约 584 年，足够覆盖进程生命周期。
#[derive(Debug)]
pub(crate) struct ProgressClock {
    base: Instant,
    last_activity: AtomicU64,
    last_write: AtomicU64,
    last_read: AtomicU64,
}

impl ProgressClock {
    pub(crate) fn new(base: Instant) -> Self {
        Self {
            base,
            last_activity: AtomicU64::new(0),
            last_write: AtomicU64::new(0),
            last_read: AtomicU64::new(0),
        }
    }

    pub(crate) fn touch_activity(&self, now: Instant) {
        self.last_activity
            .fetch_max(self.offset(now), Ordering::AcqRel);
    }

    pub(crate) fn touch_write(&self, now: Instant) {
        self.last_write.fetch_max(self.offset(now), Ordering::AcqRel);
    }

    pub(crate) fn touch_read(&self, now: Instant) {
        self.last_read.fetch_max(self.offset(now), Ordering::AcqRel);
    }

    pub(crate) fn last_activity(&self) -> Instant {
        self.at(self.last_activity.load(Ordering::Acquire))
    }

    pub(crate) fn last_write(&self) -> Instant {
        self.at(self.last_write.load(Ordering::Acquire))
    }

    pub(crate) fn last_read(&self) -> Instant {
        self.at(self.last_read.load(Ordering::Acquire))
    }

    /// 距最近一次活动经过的时间。
    pub(crate) fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity())
    }

    fn offset(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.base).as_nanos() as u64
    }

    fn at(&self, offset: u64) -> Instant {
        self.base + Duration::from_nanos(offset)
    }
}
