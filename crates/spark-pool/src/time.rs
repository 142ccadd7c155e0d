use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 进程级单调时钟基准，所有活动时间戳都以相对该时刻的偏移存储。
fn monotonic_base() -> Instant {
    static BASE: OnceLock<Instant> = OnceLock::new();
    *BASE.get_or_init(Instant::now)
}

/// 当前时刻相对基准的毫秒偏移。
pub(crate) fn monotonic_millis() -> u64 {
    let elapsed = Instant::now().saturating_duration_since(monotonic_base());
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

/// 以原子方式记录“最近一次活动”的时间戳。
///
/// 读写均为 `Relaxed`：该值只用于空闲判断，允许与其他字段存在短暂不一致。
#[derive(Debug)]
pub(crate) struct ActivityClock {
    last_millis: AtomicU64,
}

impl ActivityClock {
    pub(crate) fn new() -> Self {
        Self {
            last_millis: AtomicU64::new(monotonic_millis()),
        }
    }

    pub(crate) fn touch(&self) {
        self.last_millis
            .fetch_max(monotonic_millis(), Ordering::Relaxed);
    }

    pub(crate) fn idle_for(&self) -> Duration {
        let last = self.last_millis.load(Ordering::Relaxed);
        Duration::from_millis(monotonic_millis().saturating_sub(last))
    }
}
