//! # heartbeat：跨连接池的空闲保活调度
//!
//! ## 契约（What）
//! - 调度器周期性枚举已登记来源（连接池或注册表）提供的连接视图，并对每条连接调用
//!   [`HeartbeatTarget::heartbeat_if_idle`]；
//! - 来源与连接都以 `Weak` 引用登记，调度器永远不会成为连接的最后持有者；
//!   枚举与调用之间连接消失视为无操作；
//! - 心跳失败不在这里处理：它与其他失败的请求一样让连接以 `ConnectionLost` 关闭。
//!
//! ## 实现（How）
//! - 一个进程通常只需要一个调度器，由应用显式创建并在各注册表间共享；
//! - 扫描周期读取 `heartbeat_tick`，每轮重新读取配置，热更新后下一轮生效。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::codec::Codec;
use crate::config::RuntimeConfig;
use crate::connection::Connection;

/// 可被心跳检查的连接。
pub trait HeartbeatTarget: Send + Sync {
    /// 空闲超过心跳间隔时发出心跳，返回是否实际发出。
    fn heartbeat_if_idle(&self) -> bool;
}

impl<C: Codec> HeartbeatTarget for Connection<C> {
    fn heartbeat_if_idle(&self) -> bool {
        Connection::heartbeat_if_idle(self)
    }
}

/// 向调度器提供当前连接的非持有视图。
pub trait ConnectionSource: Send + Sync {
    fn heartbeat_targets(&self) -> Vec<Weak<dyn HeartbeatTarget>>;
}

/// 单轮扫描的结果。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub sources: usize,
    pub inspected: usize,
    pub vanished: usize,
    pub sent: usize,
}

/// 心跳调度器。
#[derive(Clone)]
pub struct HeartbeatScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    sources: Mutex<Vec<Weak<dyn ConnectionSource>>>,
    sweeps: AtomicU64,
    stop: watch::Sender<bool>,
}

impl HeartbeatScheduler {
    /// 创建不带后台任务的调度器，由调用方自行驱动 [`HeartbeatScheduler::sweep`]。
    pub fn new() -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            inner: Arc::new(SchedulerInner {
                sources: Mutex::new(Vec::new()),
                sweeps: AtomicU64::new(0),
                stop,
            }),
        }
    }

    /// 创建调度器并在当前 Tokio 运行时上启动扫描任务。
    pub fn spawn(config: Arc<RuntimeConfig>) -> Self {
        let scheduler = Self::new();
        let weak = Arc::downgrade(&scheduler.inner);
        let mut stop = scheduler.inner.stop.subscribe();
        tokio::spawn(async move {
            loop {
                let tick = config.snapshot().heartbeat_tick;
                tokio::select! {
                    _ = stop.wait_for(|stopped| *stopped) => return,
                    _ = tokio::time::sleep(tick) => {}
                }
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let stats = inner.sweep();
                if stats.sent > 0 || stats.vanished > 0 {
                    tracing::debug!(
                        sources = stats.sources,
                        inspected = stats.inspected,
                        vanished = stats.vanished,
                        sent = stats.sent,
                        "heartbeat sweep"
                    );
                }
            }
        });
        tracing::debug!("heartbeat scheduler started");
        scheduler
    }

    /// 登记一个弱引用来源；来源被释放后在下一次扫描时自动移除。
    pub fn register(&self, source: Weak<dyn ConnectionSource>) {
        self.inner.sources.lock().push(source);
    }

    /// 执行一轮扫描。
    pub fn sweep(&self) -> SweepStats {
        self.inner.sweep()
    }

    /// 仍然存活的来源数量。
    pub fn source_count(&self) -> usize {
        let mut sources = self.inner.sources.lock();
        sources.retain(|source| source.strong_count() > 0);
        sources.len()
    }

    /// 已完成的扫描轮数。
    pub fn sweeps(&self) -> u64 {
        self.inner.sweeps.load(Ordering::Acquire)
    }

    /// 停止后台扫描任务；手动 `sweep` 仍然可用。
    pub fn stop(&self) {
        self.inner.stop.send_replace(true);
    }
}

impl Default for HeartbeatScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerInner {
    fn sweep(&self) -> SweepStats {
        let sources: Vec<_> = {
            let mut sources = self.sources.lock();
            sources.retain(|source| source.strong_count() > 0);
            sources.clone()
        };

        let mut stats = SweepStats::default();
        for source in sources {
            let Some(source) = source.upgrade() else {
                continue;
            };
            stats.sources += 1;
            for target in source.heartbeat_targets() {
                stats.inspected += 1;
                match target.upgrade() {
                    Some(target) => {
                        if target.heartbeat_if_idle() {
                            stats.sent += 1;
                        }
                    }
                    None => stats.vanished += 1,
                }
            }
        }
        self.sweeps.fetch_add(1, Ordering::AcqRel);
        stats
    }
}
