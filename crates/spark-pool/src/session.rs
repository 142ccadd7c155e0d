//! # session：面向调用方的提交入口
//!
//! [`Session::submit_with_failover`] 从 [`QueryPlanner`] 取得惰性候选序列，
//! 以 `acquire_timeout` 作为单节点借出超时交给注册表路由。节点排序策略本身不在本 crate 内，
//! 这里只提供一个按在线节点轮转的 [`RoundRobinPlanner`]。

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::NodeAddr;
use crate::codec::Codec;
use crate::error::RouteError;
use crate::pool::PoolSnapshot;
use crate::registry::{PoolRegistry, Routed};
use crate::transport::Connector;

/// 候选节点的惰性序列。
pub type QueryPlan = Box<dyn Iterator<Item = NodeAddr> + Send>;

/// 节点排序策略的接缝。
pub trait QueryPlanner: Send + Sync {
    /// `live` 为注册表中拥有连接池且未下线的节点，按地址排序。
    fn plan(&self, live: Vec<NodeAddr>) -> QueryPlan;
}

/// 每次请求把起点后移一位的轮转策略。
#[derive(Debug, Default)]
pub struct RoundRobinPlanner {
    next: AtomicUsize,
}

impl RoundRobinPlanner {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QueryPlanner for RoundRobinPlanner {
    fn plan(&self, live: Vec<NodeAddr>) -> QueryPlan {
        let len = live.len();
        if len == 0 {
            return Box::new(std::iter::empty());
        }
        let start = self.next.fetch_add(1, Ordering::Relaxed) % len;
        Box::new(live.into_iter().cycle().skip(start).take(len))
    }
}

/// 调用方持有的会话。
pub struct Session<C: Codec, T: Connector> {
    registry: PoolRegistry<C, T>,
    planner: Arc<dyn QueryPlanner>,
}

impl<C: Codec, T: Connector> Session<C, T> {
    /// 以注册表与候选规划器组装会话。
    pub fn new(registry: PoolRegistry<C, T>, planner: Arc<dyn QueryPlanner>) -> Self {
        Self { registry, planner }
    }

    pub fn registry(&self) -> &PoolRegistry<C, T> {
        &self.registry
    }

    /// 提交请求，必要时依次切换到后续候选节点。
    pub async fn submit_with_failover(&self, request: &C::Request) -> Result<C::Response, RouteError> {
        self.submit_routed(request)
            .await
            .map(|routed| routed.response)
    }

    /// 与 [`Session::submit_with_failover`] 相同，但保留处理节点与被跳过候选的原因。
    pub async fn submit_routed(&self, request: &C::Request) -> Result<Routed<C::Response>, RouteError> {
        let per_host_timeout = self.registry.config().snapshot().acquire_timeout;
        let plan = self.planner.plan(self.registry.up_nodes());
        self.registry.route(plan, request, per_host_timeout).await
    }

    /// 全部连接池的快照。
    pub fn snapshot(&self) -> Vec<PoolSnapshot> {
        self.registry.snapshot()
    }
}

impl<C: Codec, T: Connector> fmt::Debug for Session<C, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("nodes", &self.registry.up_nodes())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(count: u8) -> Vec<NodeAddr> {
        (1..=count)
            .map(|i| format!("10.0.0.{i}:9042").parse().unwrap())
            .collect()
    }

    #[test]
    fn round_robin_rotates_the_starting_node() {
        let planner = RoundRobinPlanner::new();
        let live = nodes(3);

        let first: Vec<_> = planner.plan(live.clone()).collect();
        let second: Vec<_> = planner.plan(live.clone()).collect();

        assert_eq!(first, live);
        assert_eq!(second, vec![live[1], live[2], live[0]]);
    }

    #[test]
    fn empty_cluster_yields_an_empty_plan() {
        let planner = RoundRobinPlanner::new();
        assert_eq!(planner.plan(Vec::new()).count(), 0);
    }
}
