//! 单条多路复用连接的行为：饱和拒绝、关闭时的在途请求失败、乱序完成与启动握手。
#![cfg(not(any(loom, spark_loom)))]

mod support;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::Bytes;
use spark_pool::{
    BinaryFrameCodec, CloseReason, ConnectError, Connection, ConnectionOptions, ConnectionState,
    Message, RequestError, SubmitError,
};
use support::{MockConnector, VERSION, eventually, init_tracing, stray_response};

fn options(capacity: usize) -> ConnectionOptions {
    ConnectionOptions {
        capacity,
        connect_timeout: Duration::from_secs(1),
        heartbeat_interval: Duration::ZERO,
        heartbeat_timeout: Duration::from_millis(200),
    }
}

async fn connect(
    connector: &MockConnector,
    node: spark_pool::NodeAddr,
    capacity: usize,
) -> Arc<Connection<BinaryFrameCodec>> {
    Connection::connect(node, connector, Arc::new(BinaryFrameCodec::new(VERSION)), &options(capacity))
        .await
        .expect("模拟节点应接受连接")
}

#[tokio::test]
async fn saturates_at_capacity_and_recovers_after_one_completion() {
    init_tracing();
    let connector = MockConnector::new();
    let (addr, node) = connector.add_node(1);
    node.hold_responses(true);
    let connection = connect(&connector, addr, 4).await;

    let mut pending: Vec<_> = (0..4)
        .map(|i| connection.submit(&Message::query(format!("q{i}"))).expect("容量内提交必须成功"))
        .collect();
    assert_eq!(
        connection.submit(&Message::query("overflow")).unwrap_err(),
        SubmitError::Saturated { capacity: 4 }
    );

    eventually("四个查询到达节点", Duration::from_secs(1), || node.held_count() == 4).await;
    assert!(node.release_one());
    let first = pending.remove(0).await.expect("被释放的查询应成功");
    assert_eq!(first.body, Bytes::from_static(b"q0"));

    let next = connection
        .submit(&Message::query("after"))
        .expect("任一请求完成后应立即接受新提交");
    eventually("新查询到达节点", Duration::from_secs(1), || node.held_count() == 4).await;
    node.release_held();
    assert_eq!(next.await.unwrap().body, Bytes::from_static(b"after"));
    for handle in pending {
        handle.await.unwrap();
    }
    assert_eq!(connection.in_flight(), 0);
}

#[tokio::test]
async fn close_fails_every_pending_request_exactly_once() {
    init_tracing();
    let connector = MockConnector::new();
    let (addr, node) = connector.add_node(1);
    node.hold_responses(true);
    let connection = connect(&connector, addr, 16).await;

    let pending: Vec<_> = (0..7)
        .map(|_| connection.submit(&Message::query("x")).unwrap())
        .collect();
    assert_eq!(connection.in_flight(), 7);

    assert!(connection.close(CloseReason::Shutdown));
    assert!(!connection.close(CloseReason::RemoteClosed), "重复关闭不生效");

    for handle in pending {
        assert_eq!(
            handle.await,
            Err(RequestError::ConnectionLost(CloseReason::Shutdown))
        );
    }
    assert_eq!(connection.in_flight(), 0, "全部标识都已归还");
    assert_eq!(connection.load(), 0);
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert_eq!(connection.close_reason(), Some(CloseReason::Shutdown));
}

#[tokio::test]
async fn remote_disconnect_surfaces_as_connection_lost() {
    init_tracing();
    let connector = MockConnector::new();
    let (addr, node) = connector.add_node(1);
    node.hold_responses(true);
    let connection = connect(&connector, addr, 8).await;

    let a = connection.submit(&Message::query("a")).unwrap();
    let b = connection.submit(&Message::query("b")).unwrap();
    eventually("查询到达节点", Duration::from_secs(1), || node.held_count() == 2).await;
    node.kill_connections();

    let reason = connection.closed().await;
    assert_eq!(reason, CloseReason::RemoteClosed);
    assert!(matches!(a.await, Err(RequestError::ConnectionLost(CloseReason::RemoteClosed))));
    assert!(matches!(b.await, Err(RequestError::ConnectionLost(CloseReason::RemoteClosed))));
    assert!(matches!(
        connection.submit(&Message::query("c")),
        Err(SubmitError::Closed(CloseReason::RemoteClosed))
    ));
}

#[tokio::test]
async fn disconnect_immediately_after_connect_is_observed() {
    let connector = MockConnector::new();
    let (addr, node) = connector.add_node(1);
    let connection = connect(&connector, addr, 8).await;
    // 不让出执行权：服务端任务尚未运行时发出的断连也必须生效。
    node.kill_connections();

    let reason = tokio::time::timeout(Duration::from_secs(2), connection.closed())
        .await
        .expect("服务端断连必须被观察到");
    assert_eq!(reason, CloseReason::RemoteClosed);
    assert_eq!(node.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn responses_may_complete_out_of_submission_order() {
    let connector = MockConnector::new();
    let (addr, node) = connector.add_node(1);
    node.hold_responses(true);
    let connection = connect(&connector, addr, 8).await;

    let handles: Vec<_> = ["a", "b", "c"]
        .into_iter()
        .map(|body| connection.submit(&Message::query(body)).unwrap())
        .collect();
    eventually("三个查询到达节点", Duration::from_secs(1), || node.held_count() == 3).await;
    assert_eq!(node.release_held_reversed(), 3);

    let bodies: Vec<_> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|response| response.unwrap().body)
        .collect();
    assert_eq!(bodies, vec![Bytes::from("a"), Bytes::from("b"), Bytes::from("c")]);
}

#[tokio::test]
async fn response_without_pending_request_faults_the_connection() {
    init_tracing();
    let connector = MockConnector::new();
    let (addr, node) = connector.add_node(1);
    node.hold_responses(true);
    let connection = connect(&connector, addr, 8).await;

    let pending = connection.submit(&Message::query("x")).unwrap();
    eventually("查询到达节点", Duration::from_secs(1), || node.held_count() == 1).await;
    node.inject(stray_response(5));

    assert_eq!(
        connection.closed().await,
        CloseReason::ProtocolViolation { stream: 5 }
    );
    assert_eq!(
        pending.await,
        Err(RequestError::ConnectionLost(CloseReason::ProtocolViolation { stream: 5 }))
    );
}

#[tokio::test]
async fn server_error_completes_only_the_affected_request() {
    let connector = MockConnector::new();
    let (addr, node) = connector.add_node(1);
    node.fail_queries_with(0x1100);
    let connection = connect(&connector, addr, 8).await;

    let err = connection.submit(&Message::query("x")).unwrap().await.unwrap_err();
    assert!(matches!(err, RequestError::Server(ref server) if server.code == 0x1100), "{err}");
    assert!(connection.is_ready());
    assert_eq!(connection.in_flight(), 0);
}

#[tokio::test]
async fn handshake_gates_readiness() {
    let connector = MockConnector::new();
    let (addr, node) = connector.add_node(1);
    let codec = Arc::new(BinaryFrameCodec::new(VERSION).with_handshake());

    let connection = Connection::connect(addr, &connector, codec, &options(8))
        .await
        .expect("握手应成功");
    assert!(connection.is_ready());
    assert_eq!(node.startups.load(Ordering::SeqCst), 1);
    assert_eq!(connection.in_flight(), 0, "握手占用的标识已归还");
}

#[tokio::test]
async fn refused_connection_reports_io_error() {
    let connector = MockConnector::new();
    let (addr, node) = connector.add_node(1);
    node.refuse_connections(true);

    let err = Connection::connect(addr, &connector, Arc::new(BinaryFrameCodec::new(VERSION)), &options(8))
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectError::Io { .. }), "{err}");
    assert_eq!(err.code(), "spark.pool.connect.io");
}

#[tokio::test]
async fn abandoned_handles_release_identifiers_only_on_response() {
    let connector = MockConnector::new();
    let (addr, node) = connector.add_node(1);
    node.hold_responses(true);
    let connection = connect(&connector, addr, 2).await;

    drop(connection.submit(&Message::query("a")).unwrap());
    drop(connection.submit(&Message::query("b")).unwrap());
    assert_eq!(connection.in_flight(), 2);
    assert!(matches!(
        connection.submit(&Message::query("c")),
        Err(SubmitError::Saturated { .. })
    ));

    eventually("查询到达节点", Duration::from_secs(1), || node.held_count() == 2).await;
    node.release_held();
    eventually("迟到的响应释放标识", Duration::from_secs(1), || connection.in_flight() == 0).await;
    assert_eq!(connection.load(), 0);
}
