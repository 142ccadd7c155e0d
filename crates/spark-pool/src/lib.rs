#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]
#![doc = "spark-pool: 面向分布式集群的多路复用连接层。"]
#![doc = ""]
#![doc = "== 组成 =="]
#![doc = "1. `stream_id`：单连接的流标识分配器，容量由协议版本决定；"]
#![doc = "2. `connection`：一条传输流上的请求多路复用与按标识分发响应；"]
#![doc = "3. `pool`：单节点弹性连接池，负责借出、扩缩容与故障替换；"]
#![doc = "4. `registry`：节点到连接池的注册表，按候选顺序路由并汇总每个节点的失败原因；"]
#![doc = "5. `heartbeat`：跨连接池的空闲保活调度器，只持有弱引用。"]
#![doc = ""]
#![doc = "== 控制流 =="]
#![doc = "调用方 → `Session` → `PoolRegistry::route` → `ConnectionPool::acquire` → `Lease::submit` → 传输 → 读任务按标识完成 `ResponseFuture`。"]

pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod heartbeat;
pub mod pool;
pub mod registry;
pub mod session;
pub mod stream_id;
pub mod transport;

mod sync;
mod time;

/// 节点标识：集群节点的套接字地址。
pub type NodeAddr = std::net::SocketAddr;

pub use codec::{BinaryFrameCodec, Codec, Frame, Message, Opcode, ResponseFrame};
pub use config::{Distance, DistanceSettings, PoolConfig, ProtocolVersion, RuntimeConfig};
pub use connection::{Connection, ConnectionOptions, ConnectionState, ResponseFuture};
pub use error::{
    AllocatorFault, AllocatorFaultKind, CloseReason, CodecError, ConfigError, ConnectError,
    Exhausted, HostFailure, NoHostAvailable, PoolError, RequestError, RouteError, ServerError,
    SubmitError,
};
pub use heartbeat::{ConnectionSource, HeartbeatScheduler, HeartbeatTarget, SweepStats};
pub use pool::{ConnectionPool, Lease, PoolSnapshot};
pub use registry::{PoolRegistry, Routed};
pub use session::{QueryPlan, QueryPlanner, RoundRobinPlanner, Session};
pub use stream_id::{MAX_STREAM_CAPACITY, StreamId, StreamIdAllocator};
pub use transport::{Connector, TcpConnector, TcpSocketConfig};
