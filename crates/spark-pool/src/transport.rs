//! # transport：建立到节点的字节流
//!
//! ## 契约（What）
//! - [`Connector::connect`] 为给定节点返回一条已连通的双向字节流，超时由调用方（连接池）施加；
//! - 连接层只要求流实现 `AsyncRead + AsyncWrite`，测试可以用内存管道替代 TCP。
//!
//! ## 实现（How）
//! - [`TcpConnector`] 基于 Tokio `TcpStream`，建连后通过 `socket2::SockRef` 设置
//!   `TCP_NODELAY`、TCP keepalive 与 `SO_LINGER`。

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::NodeAddr;

/// 面向节点建立传输流的契约。
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    async fn connect(&self, node: NodeAddr) -> io::Result<Self::Stream>;
}

/// TCP 套接字选项。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TcpSocketConfig {
    pub nodelay: bool,
    /// 空闲多久后开始发送 TCP keepalive 探测；`None` 表示不开启。
    pub keepalive: Option<Duration>,
    /// `SO_LINGER`；`None` 保持系统默认。
    pub linger: Option<Duration>,
}

impl Default for TcpSocketConfig {
    fn default() -> Self {
        Self {
            nodelay: true,
            keepalive: None,
            linger: None,
        }
    }
}

impl TcpSocketConfig {
    fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.nodelay)?;
        let socket = SockRef::from(stream);
        if let Some(idle) = self.keepalive {
            socket.set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))?;
        }
        if self.linger.is_some() {
            socket.set_linger(self.linger)?;
        }
        Ok(())
    }
}

/// 基于 Tokio 的 TCP 建连器。
#[derive(Clone, Debug, Default)]
pub struct TcpConnector {
    config: TcpSocketConfig,
}

impl TcpConnector {
    pub fn new(config: TcpSocketConfig) -> Self {
        Self { config }
    }

    pub fn socket_config(&self) -> &TcpSocketConfig {
        &self.config
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, node: NodeAddr) -> io::Result<TcpStream> {
        let stream = TcpStream::connect(node).await?;
        self.config.apply(&stream)?;
        tracing::debug!(node = %node, "tcp transport established");
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn applies_socket_options_after_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.map(|(stream, _)| stream) });

        let connector = TcpConnector::new(TcpSocketConfig {
            nodelay: true,
            keepalive: Some(Duration::from_secs(30)),
            linger: Some(Duration::from_secs(1)),
        });
        let stream = connector.connect(addr).await.expect("本地监听应可连通");

        assert!(stream.nodelay().unwrap());
        assert_eq!(stream.peer_addr().unwrap(), addr);
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn refused_connection_surfaces_io_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = TcpConnector::default().connect(addr).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }
}
