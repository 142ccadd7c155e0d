//! 集成测试共享设施：基于 `tokio::io::duplex` 的内存模拟节点。
//!
//! - [`MockConnector`] 为每个登记的地址建立内存管道，并在服务端运行一个说参考帧格式的 [`MockNode`]；
//! - 模拟节点可以拒绝建连、扣留查询响应、按逆序释放、以错误帧应答、忽略心跳或断开全部连接；
//! - 所有计数器都是原子量，测试线程可以随时读取。
#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use spark_pool::{
    Connector, Frame, NodeAddr, Opcode, PoolConfig, ProtocolVersion, RuntimeConfig, StreamId,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, watch};

pub const VERSION: ProtocolVersion = ProtocolVersion::V4;

pub fn node_addr(index: u8) -> NodeAddr {
    format!("127.0.0.{index}:9042").parse().expect("合法地址")
}

/// 安装测试用日志订阅器；重复调用无副作用。
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// 面向测试的短时长配置。
pub fn test_config(capacity: usize, edit: impl FnOnce(&mut PoolConfig)) -> Arc<RuntimeConfig> {
    let mut config = PoolConfig {
        protocol_version: VERSION,
        max_requests_per_connection: Some(capacity),
        heartbeat_interval: Duration::ZERO,
        heartbeat_tick: Duration::from_millis(10),
        heartbeat_timeout: Duration::from_millis(200),
        acquire_timeout: Duration::from_secs(2),
        connect_timeout: Duration::from_secs(1),
        drain_grace_period: Duration::from_millis(500),
        shrink_delay: Duration::from_millis(60),
        maintenance_interval: Duration::from_millis(10),
        max_waiters: 64,
        ..PoolConfig::default()
    };
    edit(&mut config);
    Arc::new(RuntimeConfig::new(config).expect("测试配置必须合法"))
}

/// 轮询直到条件成立，超时则 panic。
pub async fn eventually(what: &str, limit: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + limit;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "等待超时（{limit:?}）：{what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

type Responder = mpsc::UnboundedSender<Frame>;

/// 单个模拟节点的行为开关与计数。
#[derive(Default)]
pub struct MockNode {
    refuse: AtomicBool,
    hold: AtomicBool,
    ignore_heartbeats: AtomicBool,
    error_code: AtomicU32,
    held: Mutex<Vec<(Responder, Frame)>>,
    responders: Mutex<Vec<Responder>>,
    kill: Mutex<Option<watch::Sender<u64>>>,
    pub connections: AtomicUsize,
    pub live_connections: AtomicUsize,
    pub queries: AtomicUsize,
    pub heartbeats: AtomicUsize,
    pub startups: AtomicUsize,
}

impl MockNode {
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// 扣留之后到达的查询，直到 [`MockNode::release_held`]。
    pub fn hold_responses(&self, hold: bool) {
        self.hold.store(hold, Ordering::SeqCst);
    }

    pub fn ignore_heartbeats(&self, ignore: bool) {
        self.ignore_heartbeats.store(ignore, Ordering::SeqCst);
    }

    /// 以错误帧应答查询；`0` 表示正常应答。
    pub fn fail_queries_with(&self, code: u32) {
        self.error_code.store(code, Ordering::SeqCst);
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }

    /// 按到达顺序释放被扣留的查询响应，返回释放数量。
    pub fn release_held(&self) -> usize {
        let held: Vec<_> = self.held.lock().drain(..).collect();
        let released = held.len();
        for (responder, request) in held {
            let _ = responder.send(echo(&request));
        }
        released
    }

    /// 按到达的逆序释放。
    pub fn release_held_reversed(&self) -> usize {
        let held: Vec<_> = self.held.lock().drain(..).rev().collect();
        let released = held.len();
        for (responder, request) in held {
            let _ = responder.send(echo(&request));
        }
        released
    }

    /// 释放一个被扣留的查询（最早到达者）。
    pub fn release_one(&self) -> bool {
        let next = {
            let mut held = self.held.lock();
            if held.is_empty() { None } else { Some(held.remove(0)) }
        };
        match next {
            Some((responder, request)) => responder.send(echo(&request)).is_ok(),
            None => false,
        }
    }

    /// 以错误帧应答最早被扣留的查询。
    pub fn fail_one(&self, code: u32) -> bool {
        let next = {
            let mut held = self.held.lock();
            if held.is_empty() { None } else { Some(held.remove(0)) }
        };
        match next {
            Some((responder, request)) => responder
                .send(Frame::error(VERSION, request.stream, code, "mock failure"))
                .is_ok(),
            None => false,
        }
    }

    /// 丢弃被扣留的查询且不应答。
    pub fn discard_held(&self) -> usize {
        self.held.lock().drain(..).count()
    }

    /// 从服务端断开当前全部连接。
    pub fn kill_connections(&self) {
        if let Some(kill) = self.kill.lock().as_ref() {
            kill.send_modify(|generation| *generation += 1);
        }
    }

    /// 向当前全部连接注入一个帧，例如一个无人等待的响应。
    pub fn inject(&self, frame: Frame) {
        for responder in self.responders.lock().iter() {
            let _ = responder.send(frame.clone());
        }
    }

    fn subscribe_kill(&self) -> watch::Receiver<u64> {
        let mut kill = self.kill.lock();
        kill.get_or_insert_with(|| watch::channel(0).0).subscribe()
    }
}

fn echo(request: &Frame) -> Frame {
    Frame::response(VERSION, request.stream, Opcode::Result, request.body.clone())
}

/// 以内存管道连接模拟节点的建连器。
#[derive(Clone, Default)]
pub struct MockConnector {
    nodes: Arc<Mutex<HashMap<NodeAddr, Arc<MockNode>>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&self, index: u8) -> (NodeAddr, Arc<MockNode>) {
        let addr = node_addr(index);
        let node = Arc::new(MockNode::default());
        node.subscribe_kill();
        self.nodes.lock().insert(addr, Arc::clone(&node));
        (addr, node)
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Stream = DuplexStream;

    async fn connect(&self, addr: NodeAddr) -> io::Result<DuplexStream> {
        let node = self.nodes.lock().get(&addr).cloned();
        let Some(node) = node else {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "unknown node"));
        };
        if node.refuse.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "node refuses connections"));
        }
        let (client, server) = tokio::io::duplex(256 * 1024);
        node.connections.fetch_add(1, Ordering::SeqCst);
        // 建连返回前订阅，之后发出的断连信号一定会被这条连接看到。
        let kill = node.subscribe_kill();
        tokio::spawn(serve(node, server, kill));
        Ok(client)
    }
}

async fn serve(node: Arc<MockNode>, stream: DuplexStream, mut kill: watch::Receiver<u64>) {
    node.live_connections.fetch_add(1, Ordering::SeqCst);
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (responder, mut responses) = mpsc::unbounded_channel::<Frame>();
    node.responders.lock().push(responder.clone());

    let write_task = tokio::spawn(async move {
        let mut out = BytesMut::new();
        while let Some(frame) = responses.recv().await {
            out.clear();
            if frame.encode(&mut out).is_err() || writer.write_all(&out).await.is_err() {
                break;
            }
        }
    });

    let mut buffer = BytesMut::new();
    'serve: loop {
        while let Ok(Some(frame)) = Frame::decode(&mut buffer) {
            match frame.opcode {
                Opcode::Startup => {
                    node.startups.fetch_add(1, Ordering::SeqCst);
                    let _ = responder.send(Frame::response(VERSION, frame.stream, Opcode::Ready, Bytes::new()));
                }
                Opcode::Options => {
                    node.heartbeats.fetch_add(1, Ordering::SeqCst);
                    if !node.ignore_heartbeats.load(Ordering::SeqCst) {
                        let _ = responder.send(Frame::response(VERSION, frame.stream, Opcode::Supported, Bytes::new()));
                    }
                }
                _ => {
                    node.queries.fetch_add(1, Ordering::SeqCst);
                    let code = node.error_code.load(Ordering::SeqCst);
                    if node.hold.load(Ordering::SeqCst) {
                        node.held.lock().push((responder.clone(), frame));
                    } else if code != 0 {
                        let _ = responder.send(Frame::error(VERSION, frame.stream, code, "mock failure"));
                    } else {
                        let _ = responder.send(echo(&frame));
                    }
                }
            }
        }

        tokio::select! {
            _ = kill.changed() => break 'serve,
            read = reader.read_buf(&mut buffer) => match read {
                Ok(0) | Err(_) => break 'serve,
                Ok(_) => {}
            },
        }
    }

    write_task.abort();
    node.responders.lock().retain(|r| !r.same_channel(&responder));
    node.live_connections.fetch_sub(1, Ordering::SeqCst);
}

/// 针对某个流标识、却没有对应请求的响应帧。
pub fn stray_response(stream: u16) -> Frame {
    Frame::response(VERSION, StreamId::new(stream), Opcode::Result, Bytes::new())
}
