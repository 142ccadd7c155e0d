//! # pool：单节点弹性连接池
//!
//! ## 意图（Why）
//! - 把一个节点上的多条物理连接呈现为单一可借出资源，并让连接数随负载伸缩；
//! - 借出是非独占的：多个调用方可以同时持有指向同一连接的 [`Lease`]，只要其标识容量尚有剩余。
//!
//! ## 契约（What）
//! - [`ConnectionPool::acquire`] 在 `Ready` 连接中挑选剩余容量最多者并预留一个容量单位；
//!   无容量时挂起至多 `timeout`，容量释放或新连接就绪时被唤醒；`timeout` 为零时立即返回
//!   [`PoolError::Busy`]；
//! - 扩容：预留后单连接负载超过高水位，或全部 `Ready` 连接都已饱和，且连接数小于上限时，
//!   异步新建一条连接，不阻塞触发扩容的请求；
//! - 缩容：窗口内峰值总负载持续 `shrink_delay` 不高于 `low_water × (n − 1)` 且 `n > core` 时，
//!   排空一条连接：优先选择无在途请求、负载最低的连接，平局选最早建立的；
//! - 非计划关闭的连接立即移出连接池；若连接数低于核心值则异步补足。在途请求由调用方重试。
//!
//! ## 实现（How）
//! - 连接列表保存在 `ArcSwap<Vec<_>>` 中，`acquire` 无锁读取；所有结构性修改都在
//!   `parking_lot::Mutex<PoolState>` 内串行完成，并以写时复制替换列表；
//! - 等待方只在“判定 + 登记等待”期间持锁，真正的挂起依赖 `Notify` 与 `sleep_until` 竞速；
//! - 维护任务与连接关闭观察任务只持有 `Weak<PoolInner>`，连接池被丢弃后随之退出。

use std::cmp::Reverse;
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::NodeAddr;
use crate::codec::Codec;
use crate::config::{Distance, DistanceSettings, PoolConfig, RuntimeConfig};
use crate::connection::{Admission, Connection, ConnectionOptions, ResponseFuture};
use crate::error::{CloseReason, ConnectError, PoolError, SubmitError};
use crate::heartbeat::{ConnectionSource, HeartbeatTarget};
use crate::transport::Connector;

/// 单节点连接池的只读快照。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub node: NodeAddr,
    pub distance: Distance,
    /// 可被借出的连接数（含尚未被观察任务移除的已关闭连接）。
    pub open: usize,
    /// 正在建立、尚未加入的连接数。
    pub opening: usize,
    /// 已停止借出、等待在途请求完成的连接数。
    pub draining: usize,
    /// 正在等待借出的调用方数量。
    pub waiters: usize,
    /// 可借出与排空中连接上已预留与在途请求之和。
    pub in_flight: usize,
    /// 可借出连接各自标识容量之和。
    pub max_load: usize,
}

/// 对某条连接一个容量单位的借用凭证。
///
/// 丢弃未使用的租约会归还预留；[`Lease::submit`] 把预留转交给在途请求。
pub struct Lease<C: Codec> {
    connection: Arc<Connection<C>>,
    armed: bool,
}

impl<C: Codec> Lease<C> {
    /// 租约所在的连接。
    pub fn connection(&self) -> &Arc<Connection<C>> {
        &self.connection
    }

    pub fn node(&self) -> NodeAddr {
        self.connection.node()
    }

    /// 在租约对应的连接上提交请求。
    pub fn submit(mut self, request: &C::Request) -> Result<ResponseFuture<C::Response>, SubmitError> {
        self.armed = false;
        self.connection.submit_reserved(request, Admission::Caller)
    }
}

impl<C: Codec> fmt::Debug for Lease<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("connection", &self.connection)
            .field("armed", &self.armed)
            .finish()
    }
}

impl<C: Codec> Drop for Lease<C> {
    fn drop(&mut self) {
        if self.armed {
            self.connection.unreserve();
        }
    }
}

/// 单节点连接池。
pub struct ConnectionPool<C: Codec, T: Connector> {
    inner: Arc<PoolInner<C, T>>,
}

impl<C: Codec, T: Connector> Clone for ConnectionPool<C, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct PoolInner<C: Codec, T: Connector> {
    node: NodeAddr,
    codec: Arc<C>,
    connector: Arc<T>,
    config: Arc<RuntimeConfig>,
    distance: AtomicU8,
    connections: ArcSwap<Vec<Arc<Connection<C>>>>,
    state: Mutex<PoolState<C>>,
    capacity_signal: Arc<Notify>,
    window_peak: AtomicUsize,
}

struct PoolState<C: Codec> {
    opening: usize,
    draining: Vec<Arc<Connection<C>>>,
    waiters: usize,
    last_open_error: Option<ConnectError>,
    low_since: Option<Instant>,
    closed: bool,
}

impl<C: Codec, T: Connector> ConnectionPool<C, T> {
    /// 创建空连接池并启动维护任务；必须在 Tokio 运行时内调用。
    pub fn new(
        node: NodeAddr,
        distance: Distance,
        codec: Arc<C>,
        connector: Arc<T>,
        config: Arc<RuntimeConfig>,
    ) -> Self {
        let inner = Arc::new(PoolInner {
            node,
            codec,
            connector,
            config,
            distance: AtomicU8::new(encode_distance(distance)),
            connections: ArcSwap::from_pointee(Vec::new()),
            state: Mutex::new(PoolState {
                opening: 0,
                draining: Vec::new(),
                waiters: 0,
                last_open_error: None,
                low_since: None,
                closed: false,
            }),
            capacity_signal: Arc::new(Notify::new()),
            window_peak: AtomicUsize::new(0),
        });
        tokio::spawn(maintenance_loop(Arc::downgrade(&inner)));
        Self { inner }
    }

    /// 并发建立核心数量的连接，返回成功建立的条数；一条都没建成时返回最后一个错误。
    pub async fn initialize(&self) -> Result<usize, ConnectError> {
        let config = self.inner.config.snapshot();
        let Some(settings) = self.inner.settings(&config) else {
            return Ok(0);
        };
        let wanted = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Ok(0);
            }
            let current = self.inner.connections.load().len() + state.opening;
            let wanted = settings.core_connections.saturating_sub(current);
            state.opening += wanted;
            wanted
        };

        let mut opens = JoinSet::new();
        for _ in 0..wanted {
            opens.spawn(Arc::clone(&self.inner).open_one());
        }
        let mut opened = 0;
        let mut last_error = None;
        while let Some(joined) = opens.join_next().await {
            match joined {
                Ok(Ok(_)) => opened += 1,
                Ok(Err(err)) => last_error = Some(err),
                Err(join) => {
                    last_error = Some(ConnectError::Io {
                        message: join.to_string(),
                    })
                }
            }
        }
        match last_error {
            Some(err) if opened == 0 && self.inner.connections.load().is_empty() => Err(err),
            _ => Ok(opened),
        }
    }

    /// 借出一个容量单位。
    pub async fn acquire(&self, timeout: Duration) -> Result<Lease<C>, PoolError> {
        let started = Instant::now();
        if let Some(lease) = self.inner.try_lease()? {
            return Ok(lease);
        }
        if timeout.is_zero() {
            return Err(PoolError::Busy {
                waited: Duration::ZERO,
            });
        }

        let _waiter = self.inner.enter_wait(started)?;
        let deadline = started + timeout;
        loop {
            let notified = self.inner.capacity_signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(lease) = self.inner.try_lease()? {
                return Ok(lease);
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(PoolError::Busy { waited: started.elapsed() });
                }
            }
        }
    }

    pub fn node(&self) -> NodeAddr {
        self.inner.node
    }

    /// 当前距离类别。
    pub fn distance(&self) -> Distance {
        self.inner.distance()
    }

    /// 调整距离类别；新的核心/最大连接数在下一次维护评估时生效。
    pub fn set_distance(&self, distance: Distance) {
        let previous = self
            .inner
            .distance
            .swap(encode_distance(distance), Ordering::AcqRel);
        if previous != encode_distance(distance) {
            tracing::info!(node = %self.inner.node, ?distance, "pool distance changed");
        }
    }

    /// 当前可借出的连接。
    pub fn connections(&self) -> Vec<Arc<Connection<C>>> {
        self.inner.connections.load().iter().cloned().collect()
    }

    /// 监控用的只读快照；计数彼此之间不保证原子一致。
    pub fn snapshot(&self) -> PoolSnapshot {
        let state = self.inner.state.lock();
        let list = self.inner.connections.load();
        PoolSnapshot {
            node: self.inner.node,
            distance: self.inner.distance(),
            open: list.len(),
            opening: state.opening,
            draining: state.draining.len(),
            waiters: state.waiters,
            in_flight: aggregate_load(&list) + aggregate_load(&state.draining),
            // 容量在建连时确定，热更新后新旧连接可能不同。
            max_load: list.iter().map(|c| c.capacity()).sum(),
        }
    }

    /// 是否已经关闭（`shutdown` 或 `close_gracefully` 之后）。
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// 立即关闭全部连接；在途请求以 `ConnectionLost(Shutdown)` 失败。
    pub fn shutdown(&self) {
        let victims = self.inner.close_pool();
        for connection in victims {
            connection.close(CloseReason::Shutdown);
        }
    }

    /// 停止借出并排空全部连接：等待在途请求完成（至多排空宽限期）后关闭。
    pub async fn close_gracefully(&self) {
        let victims = self.inner.close_pool();
        let grace = self.inner.config.snapshot().drain_grace_period;
        let mut drains = JoinSet::new();
        for connection in victims {
            connection.begin_drain();
            drains.spawn(drain_connection(connection, grace));
        }
        while drains.join_next().await.is_some() {}
    }

    /// 供心跳调度器使用的非持有视图。
    pub fn heartbeat_source(&self) -> Weak<dyn ConnectionSource> {
        let weak: Weak<PoolInner<C, T>> = Arc::downgrade(&self.inner);
        weak
    }

    pub(crate) fn heartbeat_targets(&self) -> Vec<Weak<dyn HeartbeatTarget>> {
        self.inner.heartbeat_targets()
    }
}

impl<C: Codec, T: Connector> PoolInner<C, T> {
    fn distance(&self) -> Distance {
        decode_distance(self.distance.load(Ordering::Acquire))
    }

    fn settings(&self, config: &PoolConfig) -> Option<DistanceSettings> {
        config.distance(self.distance()).cloned()
    }

    fn try_lease(self: &Arc<Self>) -> Result<Option<Lease<C>>, PoolError> {
        let list = self.connections.load_full();
        let mut ready: Vec<_> = list.iter().filter(|c| c.is_ready()).collect();
        // 剩余容量最多者优先；各连接的容量可能因热更新而不同。
        ready.sort_by_key(|c| Reverse(c.spare_capacity()));
        for connection in ready {
            if connection.try_reserve() {
                self.window_peak
                    .fetch_max(aggregate_load(&list), Ordering::AcqRel);
                let config = self.config.snapshot();
                if let Some(settings) = self.settings(&config)
                    && connection.load() > settings.new_connection_threshold
                    && list.len() < settings.max_connections
                {
                    self.grow(&config, "high water");
                }
                return Ok(Some(Lease {
                    connection: Arc::clone(connection),
                    armed: true,
                }));
            }
        }

        let config = self.config.snapshot();
        let mut state = self.state.lock();
        if state.closed {
            return Err(PoolError::Closed);
        }
        let live = self.connections.load().iter().any(|c| !c.is_closed());
        if !live && state.opening == 0 {
            if let Some(err) = state.last_open_error.clone() {
                self.spawn_open(&mut state, &config, "reopen");
                return Err(PoolError::Unavailable {
                    reason: err.to_string(),
                });
            }
        }
        self.grow_locked(&mut state, &config, "saturated");
        Ok(None)
    }

    fn enter_wait(&self, started: Instant) -> Result<WaitSlot<'_, C, T>, PoolError> {
        let max_waiters = self.config.snapshot().max_waiters;
        let mut state = self.state.lock();
        if state.closed {
            return Err(PoolError::Closed);
        }
        if state.waiters >= max_waiters {
            tracing::debug!(node = %self.node, waiters = state.waiters, "acquire queue full");
            return Err(PoolError::Busy {
                waited: started.elapsed(),
            });
        }
        state.waiters += 1;
        Ok(WaitSlot { pool: self })
    }

    fn grow(self: &Arc<Self>, config: &PoolConfig, trigger: &'static str) {
        let mut state = self.state.lock();
        self.grow_locked(&mut state, config, trigger);
    }

    fn grow_locked(self: &Arc<Self>, state: &mut PoolState<C>, config: &PoolConfig, trigger: &'static str) {
        let Some(settings) = self.settings(config) else {
            return;
        };
        if state.closed {
            return;
        }
        let current = self.connections.load().len() + state.opening;
        if current < settings.max_connections {
            self.spawn_open(state, config, trigger);
        }
    }

    fn spawn_open(self: &Arc<Self>, state: &mut PoolState<C>, config: &PoolConfig, trigger: &'static str) {
        state.opening += 1;
        tracing::info!(
            node = %self.node,
            open = self.connections.load().len(),
            opening = state.opening,
            max = self.settings(config).map(|s| s.max_connections),
            trigger,
            "opening connection"
        );
        tokio::spawn(Arc::clone(self).open_one());
    }

    /// 调用方已在 `opening` 中登记本次建连。
    async fn open_one(self: Arc<Self>) -> Result<Arc<Connection<C>>, ConnectError> {
        let options = ConnectionOptions::from_config(&self.config.snapshot());
        let opened = Connection::open(
            self.node,
            &*self.connector,
            Arc::clone(&self.codec),
            &options,
            Arc::clone(&self.capacity_signal),
        )
        .await;

        let mut state = self.state.lock();
        state.opening = state.opening.saturating_sub(1);
        match opened {
            Ok(connection) => {
                if state.closed {
                    drop(state);
                    connection.close(CloseReason::Shutdown);
                    return Err(ConnectError::Closed(CloseReason::Shutdown));
                }
                state.last_open_error = None;
                let mut next = Vec::clone(&self.connections.load());
                next.push(Arc::clone(&connection));
                let open = next.len();
                self.connections.store(Arc::new(next));
                drop(state);

                tokio::spawn(watch_connection(Arc::downgrade(&self), Arc::clone(&connection)));
                tracing::info!(node = %self.node, conn = connection.id(), open, "connection added to pool");
                self.capacity_signal.notify_waiters();
                Ok(connection)
            }
            Err(err) => {
                tracing::warn!(node = %self.node, error = %err, code = err.code(), "failed to open connection");
                state.last_open_error = Some(err.clone());
                drop(state);
                self.capacity_signal.notify_waiters();
                Err(err)
            }
        }
    }

    fn on_connection_closed(self: &Arc<Self>, connection: &Arc<Connection<C>>, reason: CloseReason) {
        let config = self.config.snapshot();
        let mut state = self.state.lock();
        state.draining.retain(|c| !Arc::ptr_eq(c, connection));
        let list = self.connections.load_full();
        if list.iter().any(|c| Arc::ptr_eq(c, connection)) {
            let next: Vec<_> = list
                .iter()
                .filter(|c| !Arc::ptr_eq(c, connection))
                .cloned()
                .collect();
            self.connections.store(Arc::new(next));
        }
        if state.closed || reason.is_planned() {
            return;
        }
        let Some(settings) = self.settings(&config) else {
            return;
        };
        let current = self.connections.load().len() + state.opening;
        tracing::warn!(
            node = %self.node,
            conn = connection.id(),
            reason = %reason,
            remaining = current,
            "connection removed from pool"
        );
        if current < settings.core_connections {
            self.spawn_open(&mut state, &config, "replace");
        }
        drop(state);
        self.capacity_signal.notify_waiters();
    }

    fn maintain(self: &Arc<Self>) {
        let config = self.config.snapshot();
        let Some(settings) = self.settings(&config) else {
            return;
        };
        let mut state = self.state.lock();
        if state.closed {
            return;
        }

        let list = self.connections.load_full();
        let current = list.len() + state.opening;
        for _ in current..settings.core_connections {
            self.spawn_open(&mut state, &config, "core");
        }

        let mut ready: Vec<_> = list.iter().filter(|c| c.is_ready()).cloned().collect();
        while ready.len() > settings.max_connections {
            let Some(victim) = pick_shrink_victim(&ready) else {
                break;
            };
            ready.retain(|c| !Arc::ptr_eq(c, &victim));
            self.begin_drain(&mut state, &config, victim, "above max");
        }

        let load = aggregate_load(&list);
        let peak = self.window_peak.swap(load, Ordering::AcqRel).max(load);
        let n = ready.len();
        let low = n > settings.core_connections && peak <= settings.low_water_threshold * (n - 1);
        if !low {
            state.low_since = None;
            return;
        }
        let now = Instant::now();
        let since = *state.low_since.get_or_insert(now);
        if now.duration_since(since) < config.shrink_delay {
            return;
        }
        if let Some(victim) = pick_shrink_victim(&ready) {
            self.begin_drain(&mut state, &config, victim, "low water");
        }
        state.low_since = Some(now);
    }

    fn begin_drain(
        &self,
        state: &mut PoolState<C>,
        config: &PoolConfig,
        connection: Arc<Connection<C>>,
        trigger: &'static str,
    ) {
        if !connection.begin_drain() {
            return;
        }
        let next: Vec<_> = self
            .connections
            .load()
            .iter()
            .filter(|c| !Arc::ptr_eq(c, &connection))
            .cloned()
            .collect();
        let open = next.len();
        self.connections.store(Arc::new(next));
        state.draining.push(Arc::clone(&connection));
        tracing::info!(
            node = %self.node,
            conn = connection.id(),
            in_flight = connection.in_flight(),
            open,
            trigger,
            "draining connection"
        );
        tokio::spawn(drain_connection(connection, config.drain_grace_period));
    }

    fn close_pool(&self) -> Vec<Arc<Connection<C>>> {
        let mut state = self.state.lock();
        if state.closed {
            return Vec::new();
        }
        state.closed = true;
        let mut victims: Vec<_> = self.connections.swap(Arc::new(Vec::new())).iter().cloned().collect();
        victims.extend(state.draining.drain(..));
        drop(state);
        tracing::info!(node = %self.node, connections = victims.len(), "pool closed");
        self.capacity_signal.notify_waiters();
        victims
    }
}

impl<C: Codec, T: Connector> ConnectionSource for PoolInner<C, T> {
    fn heartbeat_targets(&self) -> Vec<Weak<dyn HeartbeatTarget>> {
        self.connections
            .load()
            .iter()
            .map(|connection| {
                let target: Arc<dyn HeartbeatTarget> = connection.clone();
                Arc::downgrade(&target)
            })
            .collect()
    }
}

impl<C: Codec, T: Connector> Drop for PoolInner<C, T> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for connection in self.connections.load().iter().chain(state.draining.iter()) {
            connection.close(CloseReason::Shutdown);
        }
    }
}

struct WaitSlot<'a, C: Codec, T: Connector> {
    pool: &'a PoolInner<C, T>,
}

impl<C: Codec, T: Connector> Drop for WaitSlot<'_, C, T> {
    fn drop(&mut self) {
        let mut state = self.pool.state.lock();
        state.waiters = state.waiters.saturating_sub(1);
    }
}

fn aggregate_load<C: Codec>(connections: &[Arc<Connection<C>>]) -> usize {
    connections.iter().map(|c| c.load()).sum()
}

/// 负载最低者优先，无在途请求者优先，平局取最早建立的连接。
fn pick_shrink_victim<C: Codec>(candidates: &[Arc<Connection<C>>]) -> Option<Arc<Connection<C>>> {
    candidates
        .iter()
        .min_by_key(|c| (c.load() > 0, c.load(), c.id()))
        .cloned()
}

async fn drain_connection<C: Codec>(connection: Arc<Connection<C>>, grace: Duration) {
    if tokio::time::timeout(grace, connection.wait_idle()).await.is_err() {
        tracing::warn!(
            node = %connection.node(),
            conn = connection.id(),
            in_flight = connection.in_flight(),
            "drain grace period elapsed"
        );
    }
    connection.close(CloseReason::Drained);
}

async fn watch_connection<C: Codec, T: Connector>(pool: Weak<PoolInner<C, T>>, connection: Arc<Connection<C>>) {
    let reason = connection.closed().await;
    if let Some(pool) = pool.upgrade() {
        pool.on_connection_closed(&connection, reason);
    }
}

async fn maintenance_loop<C: Codec, T: Connector>(pool: Weak<PoolInner<C, T>>) {
    loop {
        let interval = match pool.upgrade() {
            Some(pool) => pool.config.snapshot().maintenance_interval,
            None => return,
        };
        tokio::time::sleep(interval).await;
        let Some(pool) = pool.upgrade() else {
            return;
        };
        if pool.state.lock().closed {
            return;
        }
        pool.maintain();
    }
}

fn encode_distance(distance: Distance) -> u8 {
    match distance {
        Distance::Local => 0,
        Distance::Remote => 1,
        Distance::Ignored => 2,
    }
}

fn decode_distance(raw: u8) -> Distance {
    match raw {
        0 => Distance::Local,
        1 => Distance::Remote,
        _ => Distance::Ignored,
    }
}

