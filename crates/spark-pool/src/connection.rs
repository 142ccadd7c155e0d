//! # connection：单条多路复用连接
//!
//! ## 意图（Why）
//! - 把一条传输字节流变成 N 个互不相干的异步请求/响应交换；
//! - 连接只属于连接池，调用方通过 [`crate::pool::Lease`] 或 [`Connection::submit`] 短暂借用。
//!
//! ## 契约（What）
//! - `submit`：占用一个流标识、登记在途请求、把编码后的帧交给写任务，立即返回 [`ResponseFuture`]；
//!   标识耗尽时返回 [`SubmitError::Saturated`]，这只表示“本连接已满”；
//! - 读任务按标识取出在途请求并完成其结果；找不到对应请求属于协议违例，连接随即关闭；
//! - 任何时刻的传输失败或对端关闭都会让连接进入 `Closed`，所有在途请求以
//!   [`RequestError::ConnectionLost`] 各失败一次，全部标识被归还；
//! - 调用方丢弃 [`ResponseFuture`] 只代表“不再等待”：标识直到响应到达或连接失败才会释放。
//!
//! ## 实现（How）
//! - 负载 `load` 统计“已预留 + 在途”的请求数，上限为标识空间容量；连接池先预留再提交，
//!   保证借出的租约一定能拿到标识；
//! - 在途表由 `parking_lot::Mutex` 串行化，插入发生在帧交给写任务之前，因此响应不可能早于登记；
//! - 读写各一个 Tokio 任务，只持有 `Weak<Connection>`，并通过 `watch` 关闭信号退出；
//!   写任务一次取空队列后统一 flush（写合并）；
//! - 心跳与普通请求走同一条提交路径，失败后以 [`CloseReason::HeartbeatFailed`] 关闭连接。

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Notify, mpsc, oneshot, watch};

use crate::NodeAddr;
use crate::codec::{Codec, ResponseFrame};
use crate::config::PoolConfig;
use crate::error::{CloseReason, ConnectError, RequestError, SubmitError};
use crate::stream_id::{StreamId, StreamIdAllocator};
use crate::time::ActivityClock;
use crate::transport::Connector;

const READ_BUFFER_CAPACITY: usize = 16 * 1024;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// 连接生命周期：`Connecting → Ready → (Draining) → Closed`。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Ready = 1,
    Draining = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Ready,
            2 => ConnectionState::Draining,
            _ => ConnectionState::Closed,
        }
    }
}

/// 建立单条连接所需的参数，通常由 [`ConnectionOptions::from_config`] 生成。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// 流标识容量。
    pub capacity: usize,
    /// 建连与握手的总时限。
    pub connect_timeout: Duration,
    /// 空闲多久发送心跳；零表示关闭。创建后不再变化。
    pub heartbeat_interval: Duration,
    /// 心跳请求等待应答的时限，超时即以 `HeartbeatFailed` 关闭连接。
    pub heartbeat_timeout: Duration,
}

impl ConnectionOptions {
    /// 从连接池配置快照中取出单条连接所需的参数；容量在此刻确定，之后的热更新不影响已建连接。
    pub fn from_config(config: &PoolConfig) -> Self {
        Self {
            capacity: config.stream_capacity(),
            connect_timeout: config.connect_timeout,
            heartbeat_interval: config.heartbeat_interval,
            heartbeat_timeout: config.heartbeat_timeout,
        }
    }
}

struct PendingRequest<R> {
    issued_at: Instant,
    tx: oneshot::Sender<Result<R, RequestError>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Startup,
    Caller,
}

/// 单条多路复用连接。
pub struct Connection<C: Codec> {
    id: u64,
    node: NodeAddr,
    codec: Arc<C>,
    allocator: StreamIdAllocator,
    load: AtomicUsize,
    pending: Mutex<HashMap<StreamId, PendingRequest<C::Response>>>,
    state: AtomicU8,
    close_reason: OnceLock<CloseReason>,
    closed_tx: watch::Sender<bool>,
    outbound: mpsc::UnboundedSender<Bytes>,
    activity: ActivityClock,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    heartbeat_in_flight: AtomicBool,
    capacity_signal: Arc<Notify>,
    idle_signal: Notify,
    this: Weak<Self>,
}

impl<C: Codec> Connection<C> {
    /// 建立一条独立于连接池的连接，完成握手后处于 `Ready`。
    pub async fn connect<T: Connector>(
        node: NodeAddr,
        connector: &T,
        codec: Arc<C>,
        options: &ConnectionOptions,
    ) -> Result<Arc<Self>, ConnectError> {
        Self::open(node, connector, codec, options, Arc::new(Notify::new())).await
    }

    pub(crate) async fn open<T: Connector>(
        node: NodeAddr,
        connector: &T,
        codec: Arc<C>,
        options: &ConnectionOptions,
        capacity_signal: Arc<Notify>,
    ) -> Result<Arc<Self>, ConnectError> {
        let deadline = tokio::time::Instant::now() + options.connect_timeout;
        let stream = match tokio::time::timeout_at(deadline, connector.connect(node)).await {
            Err(_) => {
                return Err(ConnectError::Timeout {
                    after: options.connect_timeout,
                });
            }
            Ok(Err(err)) => {
                return Err(ConnectError::Io {
                    message: err.to_string(),
                });
            }
            Ok(Ok(stream)) => stream,
        };

        let connection = Self::start(node, stream, codec, options, capacity_signal);
        if let Some(startup) = connection.codec.startup() {
            connection.handshake(&startup, deadline, options.connect_timeout).await?;
        }
        connection.mark_ready();
        Ok(connection)
    }

    fn start<S>(
        node: NodeAddr,
        stream: S,
        codec: Arc<C>,
        options: &ConnectionOptions,
        capacity_signal: Arc<Notify>,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (closed_tx, _) = watch::channel(false);
        let connection = Arc::new_cyclic(|this| Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            node,
            codec,
            allocator: StreamIdAllocator::new(options.capacity),
            load: AtomicUsize::new(0),
            pending: Mutex::new(HashMap::new()),
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            close_reason: OnceLock::new(),
            closed_tx,
            outbound,
            activity: ActivityClock::new(),
            heartbeat_interval: options.heartbeat_interval,
            heartbeat_timeout: options.heartbeat_timeout,
            heartbeat_in_flight: AtomicBool::new(false),
            capacity_signal,
            idle_signal: Notify::new(),
            this: this.clone(),
        });

        let (reader, writer) = tokio::io::split(stream);
        tokio::spawn(read_loop(
            Arc::downgrade(&connection),
            Arc::clone(&connection.codec),
            reader,
            connection.closed_tx.subscribe(),
        ));
        tokio::spawn(write_loop(
            Arc::downgrade(&connection),
            writer,
            outbound_rx,
            connection.closed_tx.subscribe(),
        ));
        tracing::debug!(node = %node, conn = connection.id, "connection transport started");
        connection
    }

    async fn handshake(
        &self,
        startup: &C::Request,
        deadline: tokio::time::Instant,
        limit: Duration,
    ) -> Result<(), ConnectError> {
        if !self.try_reserve() {
            return Err(ConnectError::Handshake {
                detail: "no stream capacity for startup request".into(),
            });
        }
        let response = self
            .submit_reserved(startup, Admission::Startup)
            .map_err(|err| match err {
                SubmitError::Closed(reason) => ConnectError::Closed(reason),
                other => ConnectError::Handshake {
                    detail: other.to_string(),
                },
            })?;
        match tokio::time::timeout_at(deadline, response).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(RequestError::ConnectionLost(reason))) => Err(ConnectError::Closed(reason)),
            Ok(Err(RequestError::Server(err))) => {
                let detail = err.to_string();
                self.close(CloseReason::HandshakeFailed {
                    detail: detail.clone(),
                });
                Err(ConnectError::Handshake { detail })
            }
            Err(_) => {
                self.close(CloseReason::HandshakeFailed {
                    detail: format!("no startup response within {limit:?}"),
                });
                Err(ConnectError::Timeout { after: limit })
            }
        }
    }

    fn mark_ready(&self) {
        let promoted = self
            .state
            .compare_exchange(
                ConnectionState::Connecting as u8,
                ConnectionState::Ready as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if promoted {
            tracing::info!(node = %self.node, conn = self.id, "connection ready");
            self.capacity_signal.notify_waiters();
        }
    }

    /// 进程内唯一的连接编号，用于日志关联。
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 对端节点地址。
    pub fn node(&self) -> NodeAddr {
        self.node
    }

    /// 当前生命周期状态。
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// 是否可以接受新的提交。
    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// 是否已进入终态 `Closed`。
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// 流标识容量。
    pub fn capacity(&self) -> usize {
        self.allocator.capacity()
    }

    /// 已预留与在途请求之和。
    pub fn load(&self) -> usize {
        self.load.load(Ordering::Acquire)
    }

    /// 已写出且尚未收到响应的请求数。
    pub fn in_flight(&self) -> usize {
        self.allocator.in_use()
    }

    /// 剩余可预留的容量。
    pub fn spare_capacity(&self) -> usize {
        self.capacity().saturating_sub(self.load())
    }

    /// 距最近一次请求或响应的时长。
    pub fn idle_duration(&self) -> Duration {
        self.activity.idle_for()
    }

    /// 已关闭时返回关闭原因。
    pub fn close_reason(&self) -> Option<CloseReason> {
        if self.is_closed() {
            self.close_reason.get().cloned()
        } else {
            None
        }
    }

    /// 等待连接进入 `Closed` 并返回关闭原因。
    pub async fn closed(&self) -> CloseReason {
        let mut closed = self.closed_tx.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
        self.close_reason
            .get()
            .cloned()
            .unwrap_or(CloseReason::Shutdown)
    }

    /// 提交一个请求，立即返回等待响应的句柄。
    ///
    /// `Draining` 状态下仍接受提交：该状态只阻止连接池继续把新租约路由到本连接。
    pub fn submit(&self, request: &C::Request) -> Result<ResponseFuture<C::Response>, SubmitError> {
        match self.state() {
            ConnectionState::Connecting => return Err(SubmitError::NotReady),
            ConnectionState::Closed => return Err(self.closed_error()),
            ConnectionState::Ready | ConnectionState::Draining => {}
        }
        if !self.try_reserve() {
            return Err(SubmitError::Saturated {
                capacity: self.capacity(),
            });
        }
        self.submit_reserved(request, Admission::Caller)
    }

    /// 预留一个容量单位；成功后必须通过 `submit_reserved` 或 `unreserve` 归还。
    pub(crate) fn try_reserve(&self) -> bool {
        let capacity = self.capacity();
        self.load
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |load| {
                (load < capacity).then_some(load + 1)
            })
            .is_ok()
    }

    pub(crate) fn unreserve(&self) {
        if self.load.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle_signal.notify_waiters();
        }
        self.capacity_signal.notify_one();
    }

    /// 等待负载归零或连接关闭。
    pub(crate) async fn wait_idle(&self) {
        loop {
            let idle = self.idle_signal.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.load() == 0 || self.is_closed() {
                return;
            }
            idle.await;
        }
    }

    /// 在已预留容量的前提下提交请求。失败时预留随之归还；成功时预留转入在途请求。
    pub(crate) fn submit_reserved(
        &self,
        request: &C::Request,
        admission: Admission,
    ) -> Result<ResponseFuture<C::Response>, SubmitError> {
        let rejected = match self.state() {
            ConnectionState::Connecting if admission == Admission::Caller => Some(SubmitError::NotReady),
            ConnectionState::Closed => Some(self.closed_error()),
            _ => None,
        };
        if let Some(err) = rejected {
            self.unreserve();
            return Err(err);
        }

        let stream = match self.allocator.acquire() {
            Ok(stream) => stream,
            Err(exhausted) => {
                self.unreserve();
                return Err(SubmitError::Saturated {
                    capacity: exhausted.capacity,
                });
            }
        };

        let mut frame = BytesMut::new();
        if let Err(err) = self.codec.encode(request, stream, &mut frame) {
            self.release_stream(stream);
            self.unreserve();
            return Err(SubmitError::Encode(err));
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if self.is_closed() {
                drop(pending);
                self.release_stream(stream);
                self.unreserve();
                return Err(self.closed_error());
            }
            pending.insert(
                stream,
                PendingRequest {
                    issued_at: Instant::now(),
                    tx,
                },
            );
        }

        self.activity.touch();
        if self.outbound.send(frame.freeze()).is_err() {
            self.close(CloseReason::Io {
                operation: "write",
                message: "writer task stopped".into(),
            });
        }
        tracing::trace!(node = %self.node, conn = self.id, stream = stream.get(), "request submitted");
        Ok(ResponseFuture { stream, rx })
    }

    fn closed_error(&self) -> SubmitError {
        SubmitError::Closed(
            self.close_reason
                .get()
                .cloned()
                .unwrap_or(CloseReason::Shutdown),
        )
    }

    fn release_stream(&self, stream: StreamId) -> bool {
        match self.allocator.release(stream) {
            Ok(()) => true,
            Err(fault) => {
                tracing::error!(
                    node = %self.node,
                    conn = self.id,
                    stream = stream.get(),
                    error = %fault,
                    "stream allocator fault"
                );
                self.close(CloseReason::AllocatorFault(fault));
                false
            }
        }
    }

    fn dispatch(&self, frame: ResponseFrame<C::Response>) {
        // 关闭后缓冲区里残留的帧没有对应的在途请求，直接丢弃。
        if self.is_closed() {
            return;
        }
        self.activity.touch();
        let stream = frame.stream;
        let Some(pending) = self.pending.lock().remove(&stream) else {
            tracing::warn!(
                node = %self.node,
                conn = self.id,
                stream = stream.get(),
                "response for unknown stream"
            );
            self.close(CloseReason::ProtocolViolation {
                stream: stream.get(),
            });
            return;
        };

        let released = self.release_stream(stream);
        self.unreserve();
        let outcome = if released {
            frame.body.map_err(RequestError::Server)
        } else {
            Err(RequestError::ConnectionLost(self.closed_reason_or_shutdown()))
        };
        tracing::trace!(
            node = %self.node,
            conn = self.id,
            stream = stream.get(),
            elapsed_us = pending.issued_at.elapsed().as_micros() as u64,
            "response dispatched"
        );
        let _ = pending.tx.send(outcome);
    }

    fn closed_reason_or_shutdown(&self) -> CloseReason {
        self.close_reason
            .get()
            .cloned()
            .unwrap_or(CloseReason::Shutdown)
    }

    /// 关闭连接：所有在途请求以 `ConnectionLost` 失败并释放其标识。
    ///
    /// 只有第一次调用生效，返回值表示本次调用是否完成了关闭。
    pub fn close(&self, reason: CloseReason) -> bool {
        let _ = self.close_reason.set(reason);
        let previous = self
            .state
            .swap(ConnectionState::Closed as u8, Ordering::AcqRel);
        if previous == ConnectionState::Closed as u8 {
            return false;
        }
        let reason = self.closed_reason_or_shutdown();

        let drained: Vec<_> = self.pending.lock().drain().collect();
        let failed = drained.len();
        for (stream, pending) in drained {
            if let Err(fault) = self.allocator.release(stream) {
                tracing::error!(
                    node = %self.node,
                    conn = self.id,
                    stream = stream.get(),
                    error = %fault,
                    "stream allocator fault while closing"
                );
            }
            self.load.fetch_sub(1, Ordering::AcqRel);
            let _ = pending
                .tx
                .send(Err(RequestError::ConnectionLost(reason.clone())));
        }
        self.closed_tx.send_replace(true);
        self.idle_signal.notify_waiters();
        self.capacity_signal.notify_waiters();

        if reason.is_planned() {
            tracing::debug!(node = %self.node, conn = self.id, reason = %reason, failed, "connection closed");
        } else {
            tracing::warn!(
                node = %self.node,
                conn = self.id,
                reason = %reason,
                code = reason.code(),
                failed,
                "connection lost"
            );
        }
        true
    }

    /// `Ready → Draining`；只有处于 `Ready` 的连接可以开始排空。
    pub(crate) fn begin_drain(&self) -> bool {
        self.state
            .compare_exchange(
                ConnectionState::Ready as u8,
                ConnectionState::Draining as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// 空闲超过心跳间隔时发出一次心跳，返回是否实际发出。
    pub fn heartbeat_if_idle(&self) -> bool {
        if self.heartbeat_interval.is_zero() || !self.is_ready() {
            return false;
        }
        if self.idle_duration() < self.heartbeat_interval {
            return false;
        }
        if self.heartbeat_in_flight.swap(true, Ordering::AcqRel) {
            return false;
        }
        if !self.try_reserve() {
            self.heartbeat_in_flight.store(false, Ordering::Release);
            return false;
        }
        let response = match self.submit_reserved(&self.codec.heartbeat(), Admission::Caller) {
            Ok(response) => response,
            Err(_) => {
                self.heartbeat_in_flight.store(false, Ordering::Release);
                return false;
            }
        };

        tracing::trace!(node = %self.node, conn = self.id, "heartbeat sent");
        let this = self.this.clone();
        let timeout = self.heartbeat_timeout;
        tokio::spawn(async move {
            let outcome = tokio::time::timeout(timeout, response).await;
            let Some(connection) = this.upgrade() else {
                return;
            };
            connection.heartbeat_in_flight.store(false, Ordering::Release);
            let detail = match outcome {
                Ok(Ok(_)) | Ok(Err(RequestError::ConnectionLost(_))) => return,
                Ok(Err(RequestError::Server(err))) => err.to_string(),
                Err(_) => format!("no response within {timeout:?}"),
            };
            tracing::warn!(node = %connection.node, conn = connection.id, detail = %detail, "heartbeat failed");
            connection.close(CloseReason::HeartbeatFailed { detail });
        });
        true
    }
}

impl<C: Codec> fmt::Debug for Connection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("node", &self.node)
            .field("state", &self.state())
            .field("load", &self.load())
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// 等待单个响应的句柄。
///
/// 丢弃句柄不会取消线上的请求，也不会提前释放其流标识。
#[derive(Debug)]
pub struct ResponseFuture<R> {
    stream: StreamId,
    rx: oneshot::Receiver<Result<R, RequestError>>,
}

impl<R> ResponseFuture<R> {
    /// 该请求占用的流标识。
    pub fn stream(&self) -> StreamId {
        self.stream
    }
}

impl<R> Future for ResponseFuture<R> {
    type Output = Result<R, RequestError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or(Err(RequestError::ConnectionLost(CloseReason::Shutdown)))
        })
    }
}

async fn read_loop<C, R>(
    connection: Weak<Connection<C>>,
    codec: Arc<C>,
    mut reader: R,
    mut closed: watch::Receiver<bool>,
) where
    C: Codec,
    R: AsyncRead + Unpin,
{
    let mut buffer = BytesMut::with_capacity(READ_BUFFER_CAPACITY);
    loop {
        loop {
            match codec.decode(&mut buffer) {
                Ok(Some(frame)) => match connection.upgrade() {
                    Some(connection) => connection.dispatch(frame),
                    None => return,
                },
                Ok(None) => break,
                Err(err) => {
                    if let Some(connection) = connection.upgrade() {
                        connection.close(CloseReason::Codec(err));
                    }
                    return;
                }
            }
        }

        let read = tokio::select! {
            _ = closed.wait_for(|closed| *closed) => return,
            read = reader.read_buf(&mut buffer) => read,
        };
        let reason = match read {
            Ok(0) => CloseReason::RemoteClosed,
            Ok(_) => continue,
            Err(err) => CloseReason::io("read", &err),
        };
        if let Some(connection) = connection.upgrade() {
            connection.close(reason);
        }
        return;
    }
}

async fn write_loop<C, W>(
    connection: Weak<Connection<C>>,
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    mut closed: watch::Receiver<bool>,
) where
    C: Codec,
    W: AsyncWrite + Unpin,
{
    let mut batch = BytesMut::new();
    loop {
        let first = tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => break,
            next = outbound.recv() => match next {
                Some(frame) => frame,
                None => break,
            },
        };
        batch.extend_from_slice(&first);
        while let Ok(frame) = outbound.try_recv() {
            batch.extend_from_slice(&frame);
        }

        let written = async {
            writer.write_all(&batch).await?;
            writer.flush().await
        }
        .await;
        batch.clear();
        if let Err(err) = written {
            if let Some(connection) = connection.upgrade() {
                connection.close(CloseReason::io("write", &err));
            }
            break;
        }
    }
    let _ = writer.shutdown().await;
}
