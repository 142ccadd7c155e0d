//! # registry：节点到连接池的注册表与跨节点路由
//!
//! ## 意图（Why）
//! - 每个可达节点持有一个连接池；请求按外部排序策略给出的候选顺序逐个尝试，
//!   直到某个节点成功写出请求；
//! - 全部候选失败时，调用方拿到的 [`NoHostAvailable`] 保留每个节点各自的原因，便于诊断。
//!
//! ## 契约（What）
//! - [`PoolRegistry::route`] 惰性消费候选序列：一旦某个节点成功写出请求就不再拉取后续候选；
//! - 借出失败（`Busy`/`Unavailable`）、没有连接池、节点被忽略或标记为下线、提交失败，
//!   都会记录原因并尝试下一个候选；
//! - 请求一旦写出，等待响应期间的失败直接返回 [`RouteError::Request`]，是否重试由调用方决定；
//! - [`PoolRegistry::add_node`] 为节点建立核心数量的连接，一条都建不成时节点不被视为可达。
//!
//! ## 实现（How）
//! - `DashMap<NodeAddr, NodeEntry>` 分片加锁；路由时只在查找期间持有分片引用，
//!   克隆出连接池句柄后再进入任何 `.await`。

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::NodeAddr;
use crate::codec::Codec;
use crate::config::{Distance, RuntimeConfig};
use crate::error::{ConnectError, HostFailure, NoHostAvailable, RouteError};
use crate::heartbeat::{ConnectionSource, HeartbeatTarget};
use crate::pool::{ConnectionPool, PoolSnapshot};
use crate::transport::Connector;

/// 成功路由的结果。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Routed<R> {
    /// 实际处理请求的节点。
    pub node: NodeAddr,
    pub response: R,
    /// 在成功之前被跳过的候选及其原因。
    pub skipped: Vec<(NodeAddr, HostFailure)>,
}

struct NodeEntry<C: Codec, T: Connector> {
    /// `Distance::Ignored` 的节点没有连接池。
    pool: Option<ConnectionPool<C, T>>,
    down_since: Option<Instant>,
}

/// 节点 → 连接池注册表。
pub struct PoolRegistry<C: Codec, T: Connector> {
    inner: Arc<RegistryInner<C, T>>,
}

impl<C: Codec, T: Connector> Clone for PoolRegistry<C, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct RegistryInner<C: Codec, T: Connector> {
    pools: DashMap<NodeAddr, NodeEntry<C, T>>,
    codec: Arc<C>,
    connector: Arc<T>,
    config: Arc<RuntimeConfig>,
}

impl<C: Codec, T: Connector> PoolRegistry<C, T> {
    /// 创建空注册表；节点通过 [`PoolRegistry::add_node`] 加入。
    pub fn new(codec: Arc<C>, connector: Arc<T>, config: Arc<RuntimeConfig>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                pools: DashMap::new(),
                codec,
                connector,
                config,
            }),
        }
    }

    /// 所有连接池共享的运行时配置。
    pub fn config(&self) -> &Arc<RuntimeConfig> {
        &self.inner.config
    }

    /// 节点变为可达：按距离建立连接池并打开核心连接。
    ///
    /// 已登记的节点保持不变。`Ignored` 节点只登记、不建池。
    pub async fn add_node(&self, node: NodeAddr, distance: Distance) -> Result<(), ConnectError> {
        if self.inner.pools.contains_key(&node) {
            return Ok(());
        }
        let pool = match distance {
            Distance::Ignored => None,
            Distance::Local | Distance::Remote => Some(self.open_pool(node, distance).await?),
        };

        match self.inner.pools.entry(node) {
            Entry::Occupied(_) => {
                if let Some(pool) = pool {
                    pool.shutdown();
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(NodeEntry {
                    pool,
                    down_since: None,
                });
                tracing::info!(node = %node, ?distance, "node added");
            }
        }
        Ok(())
    }

    async fn open_pool(&self, node: NodeAddr, distance: Distance) -> Result<ConnectionPool<C, T>, ConnectError> {
        let pool = ConnectionPool::new(
            node,
            distance,
            Arc::clone(&self.inner.codec),
            Arc::clone(&self.inner.connector),
            Arc::clone(&self.inner.config),
        );
        match pool.initialize().await {
            Ok(_) => Ok(pool),
            Err(err) => {
                tracing::warn!(node = %node, error = %err, "node unreachable, no pool created");
                pool.shutdown();
                Err(err)
            }
        }
    }

    /// 节点被永久移除：排空并关闭其全部连接。
    pub async fn remove_node(&self, node: NodeAddr) -> bool {
        let Some((_, entry)) = self.inner.pools.remove(&node) else {
            return false;
        };
        if let Some(pool) = entry.pool {
            pool.close_gracefully().await;
        }
        tracing::info!(node = %node, "node removed");
        true
    }

    /// 标记节点下线；路由会跳过它，直到 [`PoolRegistry::mark_up`]。
    pub fn mark_down(&self, node: NodeAddr) -> bool {
        let Some(mut entry) = self.inner.pools.get_mut(&node) else {
            return false;
        };
        if entry.down_since.is_none() {
            entry.down_since = Some(Instant::now());
            tracing::warn!(node = %node, "node marked down");
        }
        true
    }

    /// 清除节点的 down 标记；返回节点是否存在。
    pub fn mark_up(&self, node: NodeAddr) -> bool {
        let Some(mut entry) = self.inner.pools.get_mut(&node) else {
            return false;
        };
        if entry.down_since.take().is_some() {
            tracing::info!(node = %node, "node marked up");
        }
        true
    }

    /// 移除下线时长超过 `older_than` 的节点，返回被移除的节点。
    pub async fn evict_down(&self, older_than: Duration) -> Vec<NodeAddr> {
        let expired: Vec<NodeAddr> = self
            .inner
            .pools
            .iter()
            .filter(|entry| {
                entry
                    .down_since
                    .is_some_and(|since| since.elapsed() >= older_than)
            })
            .map(|entry| *entry.key())
            .collect();
        let mut evicted = Vec::with_capacity(expired.len());
        for node in expired {
            if self.remove_node(node).await {
                evicted.push(node);
            }
        }
        evicted
    }

    /// 调整节点距离。转为 `Ignored` 会排空并关闭其连接池；从 `Ignored` 转出会新建连接池。
    pub async fn set_distance(&self, node: NodeAddr, distance: Distance) -> Result<(), ConnectError> {
        let current = match self.inner.pools.get(&node) {
            Some(entry) => entry.pool.clone(),
            None => return Ok(()),
        };
        match (current, distance) {
            (Some(pool), Distance::Ignored) => {
                if let Some(mut entry) = self.inner.pools.get_mut(&node) {
                    entry.pool = None;
                }
                pool.close_gracefully().await;
                tracing::info!(node = %node, "node ignored, pool closed");
            }
            (Some(pool), distance) => pool.set_distance(distance),
            (None, Distance::Ignored) => {}
            (None, distance) => {
                let pool = self.open_pool(node, distance).await?;
                match self.inner.pools.get_mut(&node) {
                    Some(mut entry) if entry.pool.is_none() => entry.pool = Some(pool),
                    _ => pool.shutdown(),
                }
            }
        }
        Ok(())
    }

    /// 取出节点的连接池句柄（克隆），不持有分片引用。
    pub fn pool(&self, node: NodeAddr) -> Option<ConnectionPool<C, T>> {
        self.inner
            .pools
            .get(&node)
            .and_then(|entry| entry.pool.clone())
    }

    /// 节点是否已登记。
    pub fn contains(&self, node: NodeAddr) -> bool {
        self.inner.pools.contains_key(&node)
    }

    /// 节点是否被标记为 down。
    pub fn is_down(&self, node: NodeAddr) -> bool {
        self.inner
            .pools
            .get(&node)
            .is_some_and(|entry| entry.down_since.is_some())
    }

    /// 拥有连接池且未被标记下线的节点，按地址排序。
    pub fn up_nodes(&self) -> Vec<NodeAddr> {
        let mut nodes: Vec<_> = self
            .inner
            .pools
            .iter()
            .filter(|entry| entry.pool.is_some() && entry.down_since.is_none())
            .map(|entry| *entry.key())
            .collect();
        nodes.sort();
        nodes
    }

    /// 各节点连接池的监控快照，按节点地址排序。
    pub fn snapshot(&self) -> Vec<PoolSnapshot> {
        let pools: Vec<_> = self
            .inner
            .pools
            .iter()
            .filter_map(|entry| entry.pool.clone())
            .collect();
        let mut snapshots: Vec<_> = pools.iter().map(ConnectionPool::snapshot).collect();
        snapshots.sort_by_key(|snapshot| snapshot.node);
        snapshots
    }

    /// 依次尝试候选节点，直到某个节点成功写出请求。
    pub async fn route<I>(
        &self,
        candidates: I,
        request: &C::Request,
        per_host_timeout: Duration,
    ) -> Result<Routed<C::Response>, RouteError>
    where
        I: IntoIterator<Item = NodeAddr>,
    {
        let mut attempts = Vec::new();
        for node in candidates {
            let pool = match self.lookup(node) {
                Ok(pool) => pool,
                Err(failure) => {
                    record(&mut attempts, node, failure);
                    continue;
                }
            };
            let lease = match pool.acquire(per_host_timeout).await {
                Ok(lease) => lease,
                Err(err) => {
                    record(&mut attempts, node, err.into());
                    continue;
                }
            };
            let response = match lease.submit(request) {
                Ok(response) => response,
                Err(err) => {
                    record(&mut attempts, node, err.into());
                    continue;
                }
            };
            return match response.await {
                Ok(response) => Ok(Routed {
                    node,
                    response,
                    skipped: attempts,
                }),
                Err(error) => Err(RouteError::Request { node, error }),
            };
        }
        let exhausted = NoHostAvailable::new(attempts);
        tracing::warn!(error = %exhausted, "no host available");
        Err(exhausted.into())
    }

    fn lookup(&self, node: NodeAddr) -> Result<ConnectionPool<C, T>, HostFailure> {
        let entry = self.inner.pools.get(&node).ok_or(HostFailure::NoPool)?;
        if entry.down_since.is_some() {
            return Err(HostFailure::NodeDown);
        }
        entry.pool.clone().ok_or(HostFailure::Ignored)
    }

    /// 立即关闭全部连接池并清空注册表。
    pub fn shutdown(&self) {
        let nodes: Vec<_> = self.inner.pools.iter().map(|entry| *entry.key()).collect();
        for node in nodes {
            if let Some((_, entry)) = self.inner.pools.remove(&node)
                && let Some(pool) = entry.pool
            {
                pool.shutdown();
            }
        }
    }

    /// 供心跳调度器使用的非持有视图，覆盖注册表内全部连接池。
    pub fn heartbeat_source(&self) -> Weak<dyn ConnectionSource> {
        let weak: Weak<RegistryInner<C, T>> = Arc::downgrade(&self.inner);
        weak
    }
}

fn record(attempts: &mut Vec<(NodeAddr, HostFailure)>, node: NodeAddr, failure: HostFailure) {
    tracing::debug!(node = %node, code = failure.code(), reason = %failure, "candidate skipped");
    attempts.push((node, failure));
}

impl<C: Codec, T: Connector> ConnectionSource for RegistryInner<C, T> {
    fn heartbeat_targets(&self) -> Vec<Weak<dyn HeartbeatTarget>> {
        let pools: Vec<_> = self
            .pools
            .iter()
            .filter_map(|entry| entry.pool.clone())
            .collect();
        pools
            .iter()
            .flat_map(|pool| pool.heartbeat_targets())
            .collect()
    }
}
