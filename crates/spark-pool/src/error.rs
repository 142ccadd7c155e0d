//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义连接层的错误分类：流标识耗尽、连接饱和、节点忙碌、连接丢失、全部候选失败与分配器故障；
//! - 每个错误都携带稳定错误码（`spark.pool.*`），便于告警与日志聚合按码检索。
//!
//! ## 传播约定（What）
//! - 连接级、池级失败在可恢复的位置就地处理（换连接、换节点）；
//! - 调用方最终只会看到 [`RouteError`]：要么是汇总了每个节点原因的 [`NoHostAvailable`]，
//!   要么是已经成功写出的请求在途中失败（[`RequestError`]），后者的重试由调用方的幂等策略决定；
//! - 心跳失败不设独立错误类型，统一体现为 [`CloseReason::HeartbeatFailed`] 导致的连接丢失。

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::NodeAddr;

/// 流标识空间已无空闲槽位。
///
/// 连接局部、可恢复：调用方应改用其他连接。
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("stream identifier space exhausted (capacity {capacity})")]
pub struct Exhausted {
    pub capacity: usize,
}

/// 分配器故障的具体类型。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocatorFaultKind {
    /// 释放了一个当前未被持有的标识。
    DoubleRelease,
    /// 标识超出了分配器容量。
    OutOfRange,
}

/// 流标识簿记被破坏，属于程序不变量违例。
///
/// 该错误不会被静默吞掉：所在连接会以 [`CloseReason::AllocatorFault`] 关闭，进程继续运行。
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("stream allocator fault: {kind:?} on stream {stream} (capacity {capacity})")]
pub struct AllocatorFault {
    pub stream: u16,
    pub capacity: usize,
    pub kind: AllocatorFaultKind,
}

/// 编解码失败。解码侧出现该错误意味着字节流已不可信，连接必须关闭。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("frame length {length} exceeds limit {limit}")]
    FrameTooLarge { length: usize, limit: usize },
    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// 服务端针对单个请求返回的错误响应，不影响连接本身。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("server error 0x{code:04x}: {message}")]
pub struct ServerError {
    pub code: u32,
    pub message: String,
}

/// 连接进入 `Closed` 的原因。
///
/// 所有在途请求都会以 [`RequestError::ConnectionLost`] 携带该原因失败。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CloseReason {
    #[error("remote peer closed the connection")]
    RemoteClosed,
    #[error("{operation} failed: {message}")]
    Io {
        operation: &'static str,
        message: String,
    },
    #[error("response received for stream {stream} with no pending request")]
    ProtocolViolation { stream: u16 },
    #[error("undecodable frame: {0}")]
    Codec(CodecError),
    #[error("heartbeat failed: {detail}")]
    HeartbeatFailed { detail: String },
    /// 启动握手被拒绝或超时，连接从未进入 `Ready`。
    #[error("startup handshake failed: {detail}")]
    HandshakeFailed { detail: String },
    #[error("{0}")]
    AllocatorFault(AllocatorFault),
    #[error("connection drained by its pool")]
    Drained,
    #[error("connection shut down")]
    Shutdown,
}

impl CloseReason {
    pub(crate) fn io(operation: &'static str, err: &std::io::Error) -> Self {
        CloseReason::Io {
            operation,
            message: err.to_string(),
        }
    }

    /// 是否为连接池主动发起的计划内关闭。
    pub fn is_planned(&self) -> bool {
        matches!(self, CloseReason::Drained | CloseReason::Shutdown)
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            CloseReason::RemoteClosed => "spark.pool.connection.remote_closed",
            CloseReason::Io { .. } => "spark.pool.connection.io",
            CloseReason::ProtocolViolation { .. } => "spark.pool.connection.protocol_violation",
            CloseReason::Codec(_) => "spark.pool.connection.codec",
            CloseReason::HeartbeatFailed { .. } => "spark.pool.connection.heartbeat_failed",
            CloseReason::HandshakeFailed { .. } => "spark.pool.connection.handshake_failed",
            CloseReason::AllocatorFault(_) => "spark.pool.connection.allocator_fault",
            CloseReason::Drained => "spark.pool.connection.drained",
            CloseReason::Shutdown => "spark.pool.connection.shutdown",
        }
    }
}

/// 向单条连接提交请求失败，请求未写出，标识未被占用。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    /// 连接已无剩余标识容量，应换一条连接。
    #[error("connection saturated ({capacity} requests in flight)")]
    Saturated { capacity: usize },
    /// 连接尚未完成握手。
    #[error("connection is not ready")]
    NotReady,
    #[error("connection closed: {0}")]
    Closed(CloseReason),
    #[error("failed to encode request: {0}")]
    Encode(CodecError),
}

impl SubmitError {
    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            SubmitError::Saturated { .. } => "spark.pool.submit.saturated",
            SubmitError::NotReady => "spark.pool.submit.not_ready",
            SubmitError::Closed(_) => "spark.pool.submit.closed",
            SubmitError::Encode(_) => "spark.pool.submit.encode",
        }
    }
}

/// 已写出的请求在等待响应期间的失败。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("connection lost: {0}")]
    ConnectionLost(CloseReason),
    #[error(transparent)]
    Server(ServerError),
}

impl RequestError {
    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            RequestError::ConnectionLost(_) => "spark.pool.request.connection_lost",
            RequestError::Server(_) => "spark.pool.request.server_error",
        }
    }
}

/// 建立连接（含握手）失败。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error("connect failed: {message}")]
    Io { message: String },
    #[error("connect timed out after {after:?}")]
    Timeout { after: Duration },
    #[error("startup handshake rejected: {detail}")]
    Handshake { detail: String },
    #[error("connection closed during startup: {0}")]
    Closed(CloseReason),
}

impl ConnectError {
    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            ConnectError::Io { .. } => "spark.pool.connect.io",
            ConnectError::Timeout { .. } => "spark.pool.connect.timeout",
            ConnectError::Handshake { .. } => "spark.pool.connect.handshake",
            ConnectError::Closed(_) => "spark.pool.connect.closed",
        }
    }
}

/// 从连接池借出连接失败。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// 在给定超时内没有任何连接释放容量。
    #[error("pool busy: no connection capacity within {waited:?}")]
    Busy { waited: Duration },
    /// 池内没有存活连接，且最近一次建连失败。
    #[error("node unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("pool is closed")]
    Closed,
}

impl PoolError {
    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            PoolError::Busy { .. } => "spark.pool.busy",
            PoolError::Unavailable { .. } => "spark.pool.unavailable",
            PoolError::Closed => "spark.pool.closed",
        }
    }
}

/// 路由过程中某个候选节点被跳过的原因。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum HostFailure {
    #[error("busy: no capacity within {waited:?}")]
    Busy { waited: Duration },
    #[error("unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("no pool registered for node")]
    NoPool,
    #[error("node distance is ignored")]
    Ignored,
    #[error("node is marked down")]
    NodeDown,
    #[error("pool closed")]
    PoolClosed,
    #[error("submit failed: {0}")]
    Submit(SubmitError),
}

impl HostFailure {
    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            HostFailure::Busy { .. } => "spark.pool.host.busy",
            HostFailure::Unavailable { .. } => "spark.pool.host.unavailable",
            HostFailure::NoPool => "spark.pool.host.no_pool",
            HostFailure::Ignored => "spark.pool.host.ignored",
            HostFailure::NodeDown => "spark.pool.host.down",
            HostFailure::PoolClosed => "spark.pool.host.pool_closed",
            HostFailure::Submit(err) => err.code(),
        }
    }
}

impl From<PoolError> for HostFailure {
    fn from(value: PoolError) -> Self {
        match value {
            PoolError::Busy { waited } => HostFailure::Busy { waited },
            PoolError::Unavailable { reason } => HostFailure::Unavailable { reason },
            PoolError::Closed => HostFailure::PoolClosed,
        }
    }
}

impl From<SubmitError> for HostFailure {
    fn from(value: SubmitError) -> Self {
        HostFailure::Submit(value)
    }
}

/// 所有候选节点均失败，携带每个被尝试节点的原因。
///
/// 原因列表按尝试顺序保存，不做合并或去重。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NoHostAvailable {
    attempts: Vec<(NodeAddr, HostFailure)>,
}

impl NoHostAvailable {
    pub(crate) fn new(attempts: Vec<(NodeAddr, HostFailure)>) -> Self {
        Self { attempts }
    }

    /// 按尝试顺序返回 `(节点, 原因)`。
    pub fn attempts(&self) -> &[(NodeAddr, HostFailure)] {
        &self.attempts
    }

    /// 查询某个节点最近一次记录的原因。
    pub fn failure_for(&self, node: NodeAddr) -> Option<&HostFailure> {
        self.attempts
            .iter()
            .rev()
            .find(|(addr, _)| *addr == node)
            .map(|(_, failure)| failure)
    }

    /// 候选序列为空时没有任何尝试记录。
    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        "spark.pool.no_host_available"
    }
}

impl fmt::Display for NoHostAvailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.attempts.is_empty() {
            return f.write_str("no host available: query plan was empty");
        }
        write!(f, "no host available ({} tried)", self.attempts.len())?;
        for (node, failure) in &self.attempts {
            write!(f, "; {node}: {failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for NoHostAvailable {}

/// 调用方可见的路由失败。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error(transparent)]
    NoHostAvailable(#[from] NoHostAvailable),
    /// 请求已写到 `node`，但等待响应时失败。
    #[error("request to {node} failed: {error}")]
    Request {
        node: NodeAddr,
        #[source]
        error: RequestError,
    },
}

impl RouteError {
    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            RouteError::NoHostAvailable(err) => err.code(),
            RouteError::Request { error, .. } => error.code(),
        }
    }
}

/// 配置解析或校验失败。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("failed to parse pool configuration: {0}")]
    Parse(String),
    #[error("invalid `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_host_available_lists_every_attempt() {
        let a: NodeAddr = "127.0.0.1:9042".parse().unwrap();
        let b: NodeAddr = "127.0.0.2:9042".parse().unwrap();
        let err = NoHostAvailable::new(vec![
            (
                a,
                HostFailure::Busy {
                    waited: Duration::ZERO,
                },
            ),
            (b, HostFailure::NodeDown),
        ]);

        let text = err.to_string();
        assert!(text.contains("127.0.0.1:9042: busy"), "{text}");
        assert!(text.contains("127.0.0.2:9042: node is marked down"), "{text}");
        assert_eq!(err.failure_for(b), Some(&HostFailure::NodeDown));
        assert_eq!(err.attempts().len(), 2);
    }

    #[test]
    fn pool_errors_map_to_host_failures() {
        let waited = Duration::from_millis(3);
        assert_eq!(
            HostFailure::from(PoolError::Busy { waited }),
            HostFailure::Busy { waited }
        );
        assert_eq!(HostFailure::from(PoolError::Closed), HostFailure::PoolClosed);
        assert_eq!(
            HostFailure::from(SubmitError::Saturated { capacity: 2 }).code(),
            "spark.pool.submit.saturated"
        );
    }
}
